//! Native transport built on russh
//!
//! Sessions and keys live in tables keyed by [`NativePtr`]; the bridge only
//! ever sees the pointers. Blocking calls run on a private tokio runtime with
//! one worker, so a connected session keeps servicing its transport (keepalive
//! replies, server messages) between calls.
//!
//! Connecting only captures the server key. Whether the key is trusted is a
//! separate, explicit step ([`NativeSsh::is_server_known`]) unless
//! `stricthostkeycheck` is set, in which case the handshake is rejected for
//! any key that does not match known_hosts.
//!
//! Cipher and compression options are checked against what russh supports
//! when set and become the algorithm preferences of the next connect.

use std::borrow::Cow;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use russh::{cipher, client, compression, Preferred};
use russh::keys::{PrivateKey, PublicKey, PublicKeyBase64};
use tokio::net::{TcpSocket, TcpStream};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use super::known_hosts::{HostKeyVerification, KnownHostsStore};
use super::proxy::{expand_command, ProxyCommandStream};
use super::{
    key_type, log_level, option_id, server_known, NativePtr, NativeSsh, NativeValue,
    OwnedNativeValue, Socket, SSH_AGAIN, SSH_EOF, SSH_ERROR, SSH_OK,
};
use crate::config::{expand_tilde, BridgeConfig};

const DEFAULT_PORT: u16 = 22;

/// Server key and handshake verdict, shared with the running handler
#[derive(Default)]
struct Captured {
    key: Option<PublicKey>,
    rejection: Option<String>,
}

/// russh client handler that records the server key
struct ServerKeyCapture {
    host: String,
    port: u16,
    /// Known hosts file to enforce during the handshake, if strict
    strict_known_hosts: Option<PathBuf>,
    captured: Arc<Mutex<Captured>>,
}

impl client::Handler for ServerKeyCapture {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let mut captured = self.captured.lock();
        captured.key = Some(server_public_key.clone());

        let Some(path) = &self.strict_known_hosts else {
            debug!("Captured server key for {}:{}", self.host, self.port);
            return Ok(true);
        };

        let code = server_known_code(path, &self.host, self.port, server_public_key);
        if code == server_known::KNOWN_OK {
            return Ok(true);
        }
        let reason = format!(
            "Host key verification failed for {}:{} ({})",
            self.host,
            self.port,
            match code {
                server_known::KNOWN_CHANGED => "key changed",
                server_known::FOUND_OTHER => "known with another key type",
                server_known::FILE_NOT_FOUND => "known_hosts file not found",
                _ => "unknown host",
            }
        );
        warn!("{}", reason);
        captured.rejection = Some(reason);
        Ok(false)
    }
}

/// Check `key` for `host:port` against the known_hosts file at `path`
fn server_known_code(path: &Path, host: &str, port: u16, key: &PublicKey) -> i32 {
    let store = match KnownHostsStore::open(path) {
        Ok(store) => store,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Known hosts file {} does not exist", path.display());
            return server_known::FILE_NOT_FOUND;
        }
        Err(e) => {
            warn!("Failed to read known hosts {}: {}", path.display(), e);
            return server_known::ERROR;
        }
    };

    match store.verify(host, port, key) {
        HostKeyVerification::Verified => server_known::KNOWN_OK,
        HostKeyVerification::Unknown { .. } => server_known::NOT_KNOWN,
        HostKeyVerification::Changed { .. } => server_known::KNOWN_CHANGED,
        HostKeyVerification::FoundOther { .. } => server_known::FOUND_OTHER,
    }
}

#[derive(Default)]
struct SessionSlot {
    options: HashMap<i32, OwnedNativeValue>,
    handle: Option<client::Handle<ServerKeyCapture>>,
    server_key: Option<PublicKey>,
    last_error: String,
}

impl SessionSlot {
    fn string(&self, option: i32) -> Option<String> {
        match self.options.get(&option) {
            Some(OwnedNativeValue::Str(s)) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        }
    }

    fn int(&self, option: i32) -> Option<i64> {
        match self.options.get(&option)? {
            OwnedNativeValue::UInt32(v) => Some(i64::from(*v)),
            OwnedNativeValue::Int32(v) => Some(i64::from(*v)),
            OwnedNativeValue::UInt64(v) => i64::try_from(*v).ok(),
            OwnedNativeValue::Socket(fd) => Some(i64::from(*fd)),
            OwnedNativeValue::Str(_) => None,
        }
    }

    fn flag(&self, option: i32) -> Option<bool> {
        self.int(option).map(|v| v != 0)
    }

    fn port(&self) -> u16 {
        self.int(option_id::PORT)
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(DEFAULT_PORT)
    }

    fn known_hosts_path(&self, config: &BridgeConfig) -> PathBuf {
        if let Some(path) = self.string(option_id::KNOWNHOSTS) {
            return expand_tilde(Path::new(&path));
        }
        if let Some(dir) = self.string(option_id::SSH_DIR) {
            return expand_tilde(Path::new(&dir)).join("known_hosts");
        }
        config.known_hosts_path()
    }
}

enum KeySlot {
    Private(PrivateKey),
    Public(PublicKey),
}

impl KeySlot {
    fn public(&self) -> &PublicKey {
        match self {
            KeySlot::Private(key) => key.public_key(),
            KeySlot::Public(key) => key,
        }
    }
}

enum Transport {
    Tcp { bindaddr: Option<String> },
    Socket(Socket),
    Proxy(String),
}

/// Everything `connect` needs, read out of the session options
struct ConnectPlan {
    host: String,
    port: u16,
    timeout: Duration,
    transport: Transport,
    strict_known_hosts: Option<PathBuf>,
    preferred: Preferred,
}

impl ConnectPlan {
    fn from_slot(slot: &SessionSlot, config: &BridgeConfig) -> Result<Self, String> {
        let host = slot
            .string(option_id::HOST)
            .ok_or_else(|| "Hostname required".to_string())?;
        let port = slot.port();

        if slot.flag(option_id::SSH2) == Some(false) {
            return Err("No version of SSH protocol usable (SSH1 is not supported)".to_string());
        }

        let secs = slot.int(option_id::TIMEOUT).unwrap_or(0).max(0) as u64;
        let usecs = slot.int(option_id::TIMEOUT_USEC).unwrap_or(0).max(0) as u64;
        let timeout = match Duration::from_secs(secs) + Duration::from_micros(usecs) {
            d if d.is_zero() => Duration::from_secs(config.connect_timeout_secs),
            d => d,
        };

        let transport = if let Some(fd) = slot.int(option_id::FD) {
            Transport::Socket(fd as Socket)
        } else if let Some(command) = slot.string(option_id::PROXYCOMMAND) {
            let user = slot
                .string(option_id::USER)
                .or_else(|| std::env::var("USER").ok())
                .or_else(|| std::env::var("USERNAME").ok())
                .unwrap_or_default();
            Transport::Proxy(expand_command(&command, &host, port, &user))
        } else {
            Transport::Tcp {
                bindaddr: slot.string(option_id::BINDADDR),
            }
        };

        let strict_known_hosts = slot
            .flag(option_id::STRICTHOSTKEYCHECK)
            .unwrap_or(false)
            .then(|| slot.known_hosts_path(config));

        let list = |option: i32| slot.string(option);
        let mut preferred = Preferred::default();
        if let Some(ciphers) = both_directions(
            "cipher",
            list(option_id::CIPHERS_C_S).map(|l| cipher_list(&l)).transpose()?,
            list(option_id::CIPHERS_S_C).map(|l| cipher_list(&l)).transpose()?,
        )? {
            preferred.cipher = Cow::Owned(ciphers);
        }
        if let Some(compressions) = both_directions(
            "compression algorithm",
            list(option_id::COMPRESSION_C_S).map(|l| compression_list(&l)).transpose()?,
            list(option_id::COMPRESSION_S_C).map(|l| compression_list(&l)).transpose()?,
        )? {
            preferred.compression = Cow::Owned(compressions);
        }

        Ok(Self {
            host,
            port,
            timeout,
            transport,
            strict_known_hosts,
            preferred,
        })
    }
}

async fn tcp_connect(host: &str, port: u16, bindaddr: Option<&str>) -> std::io::Result<TcpStream> {
    let bind_ip = match bindaddr {
        Some(addr) => Some(addr.parse::<IpAddr>().map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid bind address {}", addr),
            )
        })?),
        None => None,
    };

    let mut last_error = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
        let attempt = match bind_ip {
            Some(ip) => {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.bind(SocketAddr::new(ip, 0))?;
                socket.connect(addr).await
            }
            None => TcpStream::connect(addr).await,
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Connection to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("No address found for {}", host),
        )
    }))
}

#[cfg(unix)]
fn socket_stream(fd: Socket) -> std::io::Result<TcpStream> {
    use std::os::fd::BorrowedFd;

    if fd < 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Invalid socket descriptor {}", fd),
        ));
    }
    // SAFETY: the caller keeps the port (and its descriptor) open while the
    // option is set; we only borrow it long enough to duplicate it.
    let owned = unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()?;
    let stream = std::net::TcpStream::from(owned);
    stream.set_nonblocking(true)?;
    TcpStream::from_std(stream)
}

#[cfg(not(unix))]
fn socket_stream(_fd: Socket) -> std::io::Result<TcpStream> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "Connecting over a caller supplied socket is not supported on this platform",
    ))
}

async fn establish(
    plan: &ConnectPlan,
    config: Arc<client::Config>,
    handler: ServerKeyCapture,
) -> Result<client::Handle<ServerKeyCapture>, String> {
    let target = format!("{}:{}", plan.host, plan.port);
    match &plan.transport {
        Transport::Tcp { bindaddr } => {
            let stream = tcp_connect(&plan.host, plan.port, bindaddr.as_deref())
                .await
                .map_err(|e| format!("Failed to connect to {}: {}", target, e))?;
            client::connect_stream(config, stream, handler)
                .await
                .map_err(|e| e.to_string())
        }
        Transport::Socket(fd) => {
            let stream = socket_stream(*fd)
                .map_err(|e| format!("Failed to use socket {}: {}", fd, e))?;
            client::connect_stream(config, stream, handler)
                .await
                .map_err(|e| e.to_string())
        }
        Transport::Proxy(command) => {
            let stream = ProxyCommandStream::spawn(command)
                .map_err(|e| format!("Failed to start ProxyCommand '{}': {}", command, e))?;
            client::connect_stream(config, stream, handler)
                .await
                .map_err(|e| e.to_string())
        }
    }
}

/// Rewrite an option to its stored form, or explain why it is rejected
fn normalize_option(option: i32, value: NativeValue<'_>) -> Result<Vec<(i32, OwnedNativeValue)>, String> {
    fn text(value: NativeValue<'_>) -> Result<String, String> {
        match value {
            NativeValue::Str(s) => s
                .to_str()
                .map(str::to_string)
                .map_err(|_| "Option value is not valid UTF-8".to_string()),
            _ => Err("Option expects a string".to_string()),
        }
    }

    let stored = match (option, value) {
        (option_id::HOST, v) => {
            let host = text(v)?;
            return match host.rsplit_once('@') {
                Some((user, host)) if !user.is_empty() && !host.is_empty() => Ok(vec![
                    (option_id::USER, OwnedNativeValue::Str(cstring(user)?)),
                    (option_id::HOST, OwnedNativeValue::Str(cstring(host)?)),
                ]),
                _ if host.is_empty() => Err("Hostname must not be empty".to_string()),
                _ => Ok(vec![(option_id::HOST, OwnedNativeValue::Str(cstring(&host)?))]),
            };
        }
        (option_id::PORT, NativeValue::UInt32(p)) => {
            if p == 0 || p > u32::from(u16::MAX) {
                return Err(format!("Port {} out of range", p));
            }
            (option_id::PORT, OwnedNativeValue::UInt32(p))
        }
        (option_id::PORT_STR, v) => {
            let port: u16 = text(v)?
                .trim()
                .parse()
                .map_err(|_| "Invalid port string".to_string())?;
            return normalize_option(option_id::PORT, NativeValue::UInt32(u32::from(port)));
        }
        (option_id::FD, NativeValue::Socket(fd)) if fd >= 0 => {
            (option_id::FD, OwnedNativeValue::Socket(fd))
        }
        (option_id::LOG_VERBOSITY, NativeValue::Int32(level))
            if (log_level::NOLOG..=log_level::FUNCTIONS).contains(&level) =>
        {
            (option_id::LOG_VERBOSITY, OwnedNativeValue::Int32(level))
        }
        (option_id::LOG_VERBOSITY_STR, v) => {
            let level: i32 = text(v)?
                .trim()
                .parse()
                .map_err(|_| "Invalid log verbosity string".to_string())?;
            return normalize_option(option_id::LOG_VERBOSITY, NativeValue::Int32(level));
        }
        (option_id::COMPRESSION_LEVEL, NativeValue::Int32(level)) => {
            if !(1..=9).contains(&level) {
                return Err("Compression level must be between 1 and 9".to_string());
            }
            (option_id::COMPRESSION_LEVEL, OwnedNativeValue::Int32(level))
        }
        (option_id::ADD_IDENTITY, v) => (option_id::IDENTITY, OwnedNativeValue::Str(cstring(&text(v)?)?)),
        (option_id::TIMEOUT | option_id::TIMEOUT_USEC, NativeValue::UInt64(v)) => {
            (option, OwnedNativeValue::UInt64(v))
        }
        (option_id::SSH1 | option_id::SSH2 | option_id::STRICTHOSTKEYCHECK, NativeValue::Int32(v)) => {
            (option, OwnedNativeValue::Int32(v))
        }
        (option_id::CIPHERS_C_S | option_id::CIPHERS_S_C, v) => {
            let list = text(v)?;
            cipher_list(&list)?;
            (option, OwnedNativeValue::Str(cstring(&list)?))
        }
        (option_id::COMPRESSION_C_S | option_id::COMPRESSION_S_C, v) => {
            let list = text(v)?;
            compression_list(&list)?;
            (option, OwnedNativeValue::Str(cstring(&list)?))
        }
        // Both directions at once
        (option_id::COMPRESSION, v) => {
            let list = text(v)?;
            compression_list(&list)?;
            let stored = cstring(&list)?;
            return Ok(vec![
                (option_id::COMPRESSION_C_S, OwnedNativeValue::Str(stored.clone())),
                (option_id::COMPRESSION_S_C, OwnedNativeValue::Str(stored.clone())),
                (option_id::COMPRESSION, OwnedNativeValue::Str(stored)),
            ]);
        }
        (
            option_id::USER
            | option_id::SSH_DIR
            | option_id::IDENTITY
            | option_id::KNOWNHOSTS
            | option_id::PROXYCOMMAND
            | option_id::BINDADDR,
            NativeValue::Str(s),
        ) => (option, OwnedNativeValue::Str(s.to_owned())),
        (option_id::HOST..=option_id::COMPRESSION_LEVEL, _) => {
            return Err(format!("Invalid value for option {}", option));
        }
        _ => return Err(format!("Unknown ssh option {}", option)),
    };
    Ok(vec![stored])
}

fn cstring(s: &str) -> Result<std::ffi::CString, String> {
    std::ffi::CString::new(s).map_err(|_| "Option value contains a NUL byte".to_string())
}

/// Names in a comma separated algorithm list
fn algorithm_names(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|name| !name.is_empty())
}

/// Parse a cipher list, rejecting names russh cannot negotiate
fn cipher_list(list: &str) -> Result<Vec<cipher::Name>, String> {
    let names = algorithm_names(list)
        .map(|name| cipher::Name::try_from(name).map_err(|_| format!("Unsupported cipher '{}'", name)))
        .collect::<Result<Vec<_>, _>>()?;
    if names.is_empty() {
        return Err("Empty cipher list".to_string());
    }
    Ok(names)
}

/// Parse a compression setting: `yes`, `no` or an algorithm list
fn compression_list(value: &str) -> Result<Vec<compression::Name>, String> {
    match value.trim() {
        "no" => Ok(vec![compression::NONE]),
        "yes" => {
            let names: Vec<compression::Name> = ["zlib@openssh.com", "zlib", "none"]
                .into_iter()
                .filter_map(|name| compression::Name::try_from(name).ok())
                .collect();
            if names.len() == 1 {
                warn!("zlib compression is not available, falling back to none");
            }
            Ok(names)
        }
        list => {
            let names = algorithm_names(list)
                .map(|name| {
                    compression::Name::try_from(name)
                        .map_err(|_| format!("Unsupported compression algorithm '{}'", name))
                })
                .collect::<Result<Vec<_>, _>>()?;
            if names.is_empty() {
                return Err("Empty compression list".to_string());
            }
            Ok(names)
        }
    }
}

/// Algorithms one direction accepts, narrowed by what the other accepts
///
/// russh negotiates a single list for both directions, so a name has to be
/// allowed both ways to be offered.
fn both_directions<T: PartialEq>(
    what: &str,
    client_to_server: Option<Vec<T>>,
    server_to_client: Option<Vec<T>>,
) -> Result<Option<Vec<T>>, String> {
    match (client_to_server, server_to_client) {
        (Some(c_s), Some(s_c)) => {
            let common: Vec<T> = c_s.into_iter().filter(|name| s_c.contains(name)).collect();
            if common.is_empty() {
                return Err(format!("No {} allowed in both directions", what));
            }
            Ok(Some(common))
        }
        (one, other) => Ok(one.or(other)),
    }
}

/// Key type code for an OpenSSH algorithm name
fn key_type_code(algorithm: &str) -> i32 {
    match algorithm {
        "ssh-ed25519" => key_type::ED25519,
        "ssh-rsa" | "rsa-sha2-256" | "rsa-sha2-512" => key_type::RSA,
        "ssh-dss" => key_type::DSS,
        a if a.starts_with("ecdsa-sha2-") => key_type::ECDSA,
        _ => key_type::UNKNOWN,
    }
}

/// Read a key file as text
///
/// Failing to open or read the file is `SSH_EOF`; a file that exists but is
/// not text cannot be a key and is `SSH_ERROR`.
fn read_key_file(path: &Path) -> Result<String, i32> {
    let bytes = std::fs::read(path).map_err(|e| {
        debug!("Cannot read key file {}: {}", path.display(), e);
        SSH_EOF
    })?;
    String::from_utf8(bytes).map_err(|_| {
        warn!("Key file {} is not a text key", path.display());
        SSH_ERROR
    })
}

/// Production [`NativeSsh`] implementation
pub struct RusshNative {
    config: BridgeConfig,
    runtime: Runtime,
    next_ptr: AtomicU64,
    sessions: Mutex<HashMap<NativePtr, SessionSlot>>,
    keys: Mutex<HashMap<NativePtr, KeySlot>>,
}

impl RusshNative {
    /// Create the transport and its private runtime
    ///
    /// Must not be called from inside another tokio runtime; every method
    /// blocks on the private one.
    pub fn new(config: BridgeConfig) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ssh-bridge")
            .enable_all()
            .build()?;

        Ok(Self {
            config,
            runtime,
            next_ptr: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
        })
    }

    fn alloc(&self) -> Option<NativePtr> {
        NativePtr::from_raw(self.next_ptr.fetch_add(1, Ordering::Relaxed))
    }

    /// Record `message` as the session's last error and return `SSH_ERROR`
    fn fail(&self, session: NativePtr, message: impl Into<String>) -> i32 {
        let message = message.into();
        debug!("Session {}: {}", session, message);
        if let Some(slot) = self.sessions.lock().get_mut(&session) {
            slot.last_error = message;
        }
        SSH_ERROR
    }

    fn client_config(&self, preferred: &Preferred) -> Arc<client::Config> {
        let keepalive = self.config.keepalive_interval_secs;
        Arc::new(client::Config {
            preferred: preferred.clone(),
            inactivity_timeout: None,
            keepalive_interval: (keepalive > 0).then(|| Duration::from_secs(keepalive)),
            keepalive_max: 3,
            ..Default::default()
        })
    }

    fn insert_key(&self, slot: KeySlot) -> Result<NativePtr, i32> {
        let ptr = self.alloc().ok_or(SSH_ERROR)?;
        self.keys.lock().insert(ptr, slot);
        Ok(ptr)
    }

    fn with_key<T>(&self, key: NativePtr, f: impl FnOnce(&KeySlot) -> T) -> Option<T> {
        self.keys.lock().get(&key).map(f)
    }

    /// Host, port and captured server key of a session
    fn server_identity(&self, session: NativePtr) -> Result<(String, u16, PublicKey, PathBuf), String> {
        let sessions = self.sessions.lock();
        let slot = sessions
            .get(&session)
            .ok_or_else(|| "Invalid session".to_string())?;
        let key = slot
            .server_key
            .clone()
            .ok_or_else(|| "No public key available (session not connected)".to_string())?;
        let host = slot
            .string(option_id::HOST)
            .ok_or_else(|| "Hostname required".to_string())?;
        Ok((host, slot.port(), key, slot.known_hosts_path(&self.config)))
    }
}

impl NativeSsh for RusshNative {
    fn new_session(&self) -> Option<NativePtr> {
        let ptr = self.alloc()?;
        self.sessions.lock().insert(ptr, SessionSlot::default());
        debug!("Allocated session {}", ptr);
        Some(ptr)
    }

    fn free_session(&self, session: NativePtr) {
        self.disconnect(session);
        self.sessions.lock().remove(&session);
        debug!("Freed session {}", session);
    }

    fn options_set(&self, session: NativePtr, option: i32, value: NativeValue<'_>) -> i32 {
        match normalize_option(option, value) {
            Ok(entries) => {
                let verbosity = entries.iter().find_map(|(id, value)| match (*id, value) {
                    (option_id::LOG_VERBOSITY, OwnedNativeValue::Int32(level)) => Some(*level),
                    _ => None,
                });
                {
                    let mut sessions = self.sessions.lock();
                    let Some(slot) = sessions.get_mut(&session) else {
                        return SSH_ERROR;
                    };
                    slot.options.extend(entries);
                }
                if let Some(level) = verbosity {
                    crate::logging::set_transport_verbosity(level);
                }
                SSH_OK
            }
            Err(message) => self.fail(session, message),
        }
    }

    fn options_get(&self, session: NativePtr, option: i32) -> Result<OwnedNativeValue, i32> {
        let sessions = self.sessions.lock();
        let slot = sessions.get(&session).ok_or(SSH_ERROR)?;
        match option {
            option_id::PORT => Ok(OwnedNativeValue::UInt32(u32::from(slot.port()))),
            _ => slot.options.get(&option).cloned().ok_or(SSH_ERROR),
        }
    }

    fn connect(&self, session: NativePtr) -> i32 {
        let plan = {
            let sessions = self.sessions.lock();
            let Some(slot) = sessions.get(&session) else {
                return SSH_ERROR;
            };
            if slot.handle.is_some() {
                Err("Session is already connected".to_string())
            } else {
                ConnectPlan::from_slot(slot, &self.config)
            }
        };
        let plan = match plan {
            Ok(plan) => plan,
            Err(message) => return self.fail(session, message),
        };

        info!("Connecting to {}:{}", plan.host, plan.port);
        let captured = Arc::new(Mutex::new(Captured::default()));
        let handler = ServerKeyCapture {
            host: plan.host.clone(),
            port: plan.port,
            strict_known_hosts: plan.strict_known_hosts.clone(),
            captured: captured.clone(),
        };
        let config = self.client_config(&plan.preferred);
        let outcome = self
            .runtime
            .block_on(async { tokio::time::timeout(plan.timeout, establish(&plan, config, handler)).await });
        let captured = std::mem::take(&mut *captured.lock());

        match outcome {
            Ok(Ok(handle)) => {
                let mut sessions = self.sessions.lock();
                let Some(slot) = sessions.get_mut(&session) else {
                    return SSH_ERROR;
                };
                slot.handle = Some(handle);
                slot.server_key = captured.key;
                info!("Connected to {}:{}", plan.host, plan.port);
                SSH_OK
            }
            Ok(Err(message)) => {
                warn!("Connection to {}:{} failed: {}", plan.host, plan.port, message);
                self.fail(session, captured.rejection.unwrap_or(message))
            }
            Err(_) => self.fail(
                session,
                format!(
                    "Timeout connecting to {}:{} after {:?}",
                    plan.host, plan.port, plan.timeout
                ),
            ),
        }
    }

    fn disconnect(&self, session: NativePtr) {
        let handle = self
            .sessions
            .lock()
            .get_mut(&session)
            .and_then(|slot| slot.handle.take());
        if let Some(handle) = handle {
            let result = self.runtime.block_on(handle.disconnect(
                russh::Disconnect::ByApplication,
                "",
                "en",
            ));
            match result {
                Ok(()) => info!("Disconnected session {}", session),
                Err(e) => debug!("Disconnect of session {} reported: {}", session, e),
            }
        }
    }

    fn blocking_flush(&self, session: NativePtr, timeout_ms: i32) -> i32 {
        let handle = match self.sessions.lock().get_mut(&session) {
            Some(slot) => slot.handle.take(),
            None => return SSH_ERROR,
        };
        let Some(handle) = handle else {
            return self.fail(session, "Session is not connected");
        };

        let result = self.runtime.block_on(async {
            let keepalive = handle.send_keepalive(true);
            match u64::try_from(timeout_ms) {
                Ok(ms) => tokio::time::timeout(Duration::from_millis(ms), keepalive)
                    .await
                    .ok(),
                Err(_) => Some(keepalive.await),
            }
        });

        if let Some(slot) = self.sessions.lock().get_mut(&session) {
            slot.handle = Some(handle);
        }

        match result {
            Some(Ok(())) => SSH_OK,
            Some(Err(e)) => self.fail(session, format!("Flush failed: {}", e)),
            None => {
                debug!("Flush of session {} timed out after {}ms", session, timeout_ms);
                SSH_AGAIN
            }
        }
    }

    fn is_server_known(&self, session: NativePtr) -> i32 {
        match self.server_identity(session) {
            Ok((host, port, key, path)) => {
                let code = server_known_code(&path, &host, port, &key);
                if code == server_known::ERROR {
                    self.fail(session, format!("Failed to read {}", path.display()));
                }
                code
            }
            Err(message) => {
                self.fail(session, message);
                server_known::ERROR
            }
        }
    }

    fn get_pubkey_hash(&self, session: NativePtr) -> Result<Vec<u8>, i32> {
        match self.server_identity(session) {
            Ok((_, _, key, _)) => Ok(KnownHostsStore::md5_hash(&key)),
            Err(message) => Err(self.fail(session, message)),
        }
    }

    fn write_knownhost(&self, session: NativePtr) -> i32 {
        let (host, port, key, path) = match self.server_identity(session) {
            Ok(identity) => identity,
            Err(message) => return self.fail(session, message),
        };
        match KnownHostsStore::open_or_empty(&path).add_host(&host, port, &key) {
            Ok(()) => SSH_OK,
            Err(e) => self.fail(session, format!("Couldn't write {}: {}", path.display(), e)),
        }
    }

    fn is_connected(&self, session: NativePtr) -> bool {
        self.sessions
            .lock()
            .get(&session)
            .and_then(|slot| slot.handle.as_ref())
            .is_some_and(|handle| !handle.is_closed())
    }

    fn get_version(&self, session: NativePtr) -> i32 {
        if self.is_connected(session) {
            2
        } else {
            -1
        }
    }

    fn get_error(&self, session: NativePtr) -> String {
        self.sessions
            .lock()
            .get(&session)
            .map(|slot| slot.last_error.clone())
            .unwrap_or_default()
    }

    fn import_privkey_file(&self, path: &Path, passphrase: Option<&str>) -> Result<NativePtr, i32> {
        let expanded = expand_tilde(path);
        let data = read_key_file(&expanded)?;
        let key = russh::keys::decode_secret_key(&data, passphrase).map_err(|e| {
            warn!("Failed to parse private key {}: {}", expanded.display(), e);
            SSH_ERROR
        })?;
        debug!("Imported {} private key from {}", key.algorithm(), expanded.display());
        self.insert_key(KeySlot::Private(key))
    }

    fn import_pubkey_file(&self, path: &Path) -> Result<NativePtr, i32> {
        let expanded = expand_tilde(path);
        let data = read_key_file(&expanded)?;

        // First non-comment line: <algorithm> <base64> [comment]
        let line = data
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#'))
            .ok_or(SSH_ERROR)?;
        let b64 = line.split_whitespace().nth(1).ok_or(SSH_ERROR)?;
        let key = russh::keys::parse_public_key_base64(b64).map_err(|e| {
            warn!("Failed to parse public key {}: {}", expanded.display(), e);
            SSH_ERROR
        })?;
        self.insert_key(KeySlot::Public(key))
    }

    fn export_privkey_to_pubkey(&self, key: NativePtr) -> Result<NativePtr, i32> {
        let public = self
            .with_key(key, |slot| match slot {
                KeySlot::Private(private) => Some(private.public_key().clone()),
                KeySlot::Public(_) => None,
            })
            .flatten()
            .ok_or(SSH_ERROR)?;
        self.insert_key(KeySlot::Public(public))
    }

    fn export_pubkey(&self, key: NativePtr) -> Result<String, i32> {
        self.with_key(key, |slot| {
            let public = slot.public();
            format!(
                "{} {}",
                public.algorithm().as_str(),
                BASE64.encode(public.public_key_bytes())
            )
        })
        .ok_or(SSH_ERROR)
    }

    fn key_type(&self, key: NativePtr) -> i32 {
        self.with_key(key, |slot| key_type_code(slot.public().algorithm().as_str()))
            .unwrap_or(key_type::UNKNOWN)
    }

    fn free_key(&self, key: NativePtr) {
        if self.keys.lock().remove(&key).is_some() {
            debug!("Freed key {}", key);
        }
    }
}

impl Drop for RusshNative {
    fn drop(&mut self) {
        let sessions: Vec<NativePtr> = self.sessions.lock().keys().copied().collect();
        for session in sessions {
            self.disconnect(session);
        }
    }
}
