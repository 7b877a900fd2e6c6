//! Native transport boundary
//!
//! Everything below this trait belongs to the SSH transport: key exchange,
//! channels, key file formats, known_hosts files. The bridge only ever talks
//! to it through opaque [`NativePtr`]s and libssh-style integer status codes.
//!
//! # Implementations
//! - [`RusshNative`] - production transport built on russh
//! - `mock::MockNative` - call-counting stand-in used by the unit tests

#[cfg(test)]
pub(crate) mod fixtures;
mod known_hosts;
#[cfg(test)]
pub(crate) mod mock;
mod proxy;
mod russh_backend;

pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use russh_backend::RusshNative;

use std::ffi::{CStr, CString};
use std::fmt;
use std::path::Path;

/// OS socket descriptor as passed to the `fd` option
pub type Socket = i32;

/// Generic status codes
pub const SSH_OK: i32 = 0;
pub const SSH_ERROR: i32 = -1;
pub const SSH_AGAIN: i32 = -2;
pub const SSH_EOF: i32 = -127;

/// Results of the server-known check
pub mod server_known {
    pub const ERROR: i32 = -1;
    pub const NOT_KNOWN: i32 = 0;
    pub const KNOWN_OK: i32 = 1;
    pub const KNOWN_CHANGED: i32 = 2;
    pub const FOUND_OTHER: i32 = 3;
    pub const FILE_NOT_FOUND: i32 = 4;
}

/// Session option identities
pub mod option_id {
    pub const HOST: i32 = 0;
    pub const PORT: i32 = 1;
    pub const PORT_STR: i32 = 2;
    pub const FD: i32 = 3;
    pub const USER: i32 = 4;
    pub const SSH_DIR: i32 = 5;
    pub const IDENTITY: i32 = 6;
    pub const ADD_IDENTITY: i32 = 7;
    pub const KNOWNHOSTS: i32 = 8;
    pub const TIMEOUT: i32 = 9;
    pub const TIMEOUT_USEC: i32 = 10;
    pub const SSH1: i32 = 11;
    pub const SSH2: i32 = 12;
    pub const LOG_VERBOSITY: i32 = 13;
    pub const LOG_VERBOSITY_STR: i32 = 14;
    pub const CIPHERS_C_S: i32 = 15;
    pub const CIPHERS_S_C: i32 = 16;
    pub const COMPRESSION_C_S: i32 = 17;
    pub const COMPRESSION_S_C: i32 = 18;
    pub const PROXYCOMMAND: i32 = 19;
    pub const BINDADDR: i32 = 20;
    pub const STRICTHOSTKEYCHECK: i32 = 21;
    pub const COMPRESSION: i32 = 22;
    pub const COMPRESSION_LEVEL: i32 = 23;
}

/// Log verbosity levels
pub mod log_level {
    pub const NOLOG: i32 = 0;
    pub const RARE: i32 = 1;
    pub const PROTOCOL: i32 = 2;
    pub const PACKET: i32 = 3;
    pub const FUNCTIONS: i32 = 4;
}

/// Key algorithm identities
pub mod key_type {
    pub const UNKNOWN: i32 = 0;
    pub const DSS: i32 = 1;
    pub const RSA: i32 = 2;
    pub const RSA1: i32 = 3;
    pub const ECDSA: i32 = 4;
    pub const ED25519: i32 = 5;
}

/// Opaque pointer to a native session or key
///
/// Zero is reserved as the "already released" tombstone; the native layer
/// never hands it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativePtr(u64);

impl NativePtr {
    pub const RELEASED: NativePtr = NativePtr(0);

    /// Wrap a raw address; `None` for the null/tombstone value
    pub fn from_raw(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }

    pub fn is_released(self) -> bool {
        self == Self::RELEASED
    }
}

impl fmt::Display for NativePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Binary form of an option value as handed to `options_set`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeValue<'a> {
    Str(&'a CStr),
    UInt32(u32),
    UInt64(u64),
    Int32(i32),
    Socket(Socket),
}

/// Owned option value as returned by `options_get`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnedNativeValue {
    Str(CString),
    UInt32(u32),
    UInt64(u64),
    Int32(i32),
    Socket(Socket),
}

impl OwnedNativeValue {
    pub fn as_native(&self) -> NativeValue<'_> {
        match self {
            OwnedNativeValue::Str(s) => NativeValue::Str(s.as_c_str()),
            OwnedNativeValue::UInt32(v) => NativeValue::UInt32(*v),
            OwnedNativeValue::UInt64(v) => NativeValue::UInt64(*v),
            OwnedNativeValue::Int32(v) => NativeValue::Int32(*v),
            OwnedNativeValue::Socket(fd) => NativeValue::Socket(*fd),
        }
    }
}

impl From<NativeValue<'_>> for OwnedNativeValue {
    fn from(value: NativeValue<'_>) -> Self {
        match value {
            NativeValue::Str(s) => OwnedNativeValue::Str(s.to_owned()),
            NativeValue::UInt32(v) => OwnedNativeValue::UInt32(v),
            NativeValue::UInt64(v) => OwnedNativeValue::UInt64(v),
            NativeValue::Int32(v) => OwnedNativeValue::Int32(v),
            NativeValue::Socket(fd) => OwnedNativeValue::Socket(fd),
        }
    }
}

/// The native SSH transport as seen by the bridge
///
/// Calls are synchronous and may block up to the session timeout. Methods
/// take `&self`; implementations keep their own tables behind locks, the way a
/// C library keeps state behind its pointers. Freed pointers must not be
/// passed back in; the registry guarantees that.
pub trait NativeSsh {
    /// Allocate a new, unconnected session
    fn new_session(&self) -> Option<NativePtr>;

    fn free_session(&self, session: NativePtr);

    /// Set one option; returns `SSH_OK` or `SSH_ERROR`
    fn options_set(&self, session: NativePtr, option: i32, value: NativeValue<'_>) -> i32;

    /// Read back an option; `Err` carries a status code when unset or unknown
    fn options_get(&self, session: NativePtr, option: i32) -> Result<OwnedNativeValue, i32>;

    fn connect(&self, session: NativePtr) -> i32;

    fn disconnect(&self, session: NativePtr);

    /// Flush outgoing data; negative timeout waits forever
    fn blocking_flush(&self, session: NativePtr, timeout_ms: i32) -> i32;

    /// One of the [`server_known`] codes
    fn is_server_known(&self, session: NativePtr) -> i32;

    /// MD5 hash of the server public key
    fn get_pubkey_hash(&self, session: NativePtr) -> Result<Vec<u8>, i32>;

    fn write_knownhost(&self, session: NativePtr) -> i32;

    fn is_connected(&self, session: NativePtr) -> bool;

    /// Protocol version, or a negative value when unknown
    fn get_version(&self, session: NativePtr) -> i32;

    /// Diagnostic for the last failed call on `session`
    fn get_error(&self, session: NativePtr) -> String;

    /// `Err(SSH_EOF)` when the file is missing or unreadable, `Err(SSH_ERROR)`
    /// when it is not a key
    fn import_privkey_file(&self, path: &Path, passphrase: Option<&str>) -> Result<NativePtr, i32>;

    /// Same error convention as [`NativeSsh::import_privkey_file`]
    fn import_pubkey_file(&self, path: &Path) -> Result<NativePtr, i32>;

    /// Allocate the public half of a private key as a new key
    fn export_privkey_to_pubkey(&self, key: NativePtr) -> Result<NativePtr, i32>;

    /// Printable OpenSSH form: `<algorithm> <base64>`
    fn export_pubkey(&self, key: NativePtr) -> Result<String, i32>;

    /// One of the [`key_type`] codes
    fn key_type(&self, key: NativePtr) -> i32;

    fn free_key(&self, key: NativePtr);
}
