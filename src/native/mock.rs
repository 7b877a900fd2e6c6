//! Call-counting native transport for unit tests

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    key_type, server_known, NativePtr, NativeSsh, NativeValue, OwnedNativeValue, SSH_EOF,
    SSH_ERROR, SSH_OK,
};

#[derive(Default)]
struct MockSession {
    options: HashMap<i32, OwnedNativeValue>,
    connected: bool,
    last_error: String,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MockKey {
    Private,
    Public,
}

struct MockState {
    next_ptr: u64,
    sessions: HashMap<NativePtr, MockSession>,
    keys: HashMap<NativePtr, MockKey>,
    set_option_calls: usize,
    session_frees: HashMap<NativePtr, usize>,
    key_frees: HashMap<NativePtr, usize>,
    fail_next_set_option: Option<String>,
    connect_code: i32,
    flush_code: i32,
    server_known_code: i32,
    write_knownhost_code: i32,
    pubkey_hash: Option<Vec<u8>>,
    scripted_error: String,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            next_ptr: 0x1000,
            sessions: HashMap::new(),
            keys: HashMap::new(),
            set_option_calls: 0,
            session_frees: HashMap::new(),
            key_frees: HashMap::new(),
            fail_next_set_option: None,
            connect_code: SSH_OK,
            flush_code: SSH_OK,
            server_known_code: server_known::KNOWN_OK,
            write_knownhost_code: SSH_OK,
            pubkey_hash: None,
            scripted_error: String::new(),
        }
    }
}

/// Scriptable stand-in for the native layer
///
/// Clones share state, so a test can keep one copy for assertions while the
/// bridge owns the other.
#[derive(Clone, Default)]
pub struct MockNative {
    state: Arc<Mutex<MockState>>,
}

impl MockNative {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(state: &mut MockState) -> NativePtr {
        state.next_ptr += 0x10;
        NativePtr::from_raw(state.next_ptr).expect("mock pointers are non-zero")
    }

    pub fn set_option_calls(&self) -> usize {
        self.state.lock().set_option_calls
    }

    pub fn session_free_count(&self, ptr: NativePtr) -> usize {
        self.state.lock().session_frees.get(&ptr).copied().unwrap_or(0)
    }

    pub fn key_free_count(&self, ptr: NativePtr) -> usize {
        self.state.lock().key_frees.get(&ptr).copied().unwrap_or(0)
    }

    pub fn total_key_frees(&self) -> usize {
        self.state.lock().key_frees.values().sum()
    }

    pub fn fail_next_set_option(&self, message: &str) {
        self.state.lock().fail_next_set_option = Some(message.to_string());
    }

    /// Next connect/flush/check returns `code` with `error` as diagnostic
    pub fn script_connect(&self, code: i32, error: &str) {
        let mut state = self.state.lock();
        state.connect_code = code;
        state.scripted_error = error.to_string();
    }

    pub fn script_flush(&self, code: i32, error: &str) {
        let mut state = self.state.lock();
        state.flush_code = code;
        state.scripted_error = error.to_string();
    }

    pub fn script_server_known(&self, code: i32, error: &str) {
        let mut state = self.state.lock();
        state.server_known_code = code;
        state.scripted_error = error.to_string();
    }

    pub fn script_write_knownhost(&self, code: i32, error: &str) {
        let mut state = self.state.lock();
        state.write_knownhost_code = code;
        state.scripted_error = error.to_string();
    }

    pub fn script_pubkey_hash(&self, hash: Option<Vec<u8>>) {
        self.state.lock().pubkey_hash = hash;
    }

    fn scripted(&self, session: NativePtr, code: i32) -> i32 {
        let mut state = self.state.lock();
        let error = state.scripted_error.clone();
        if let Some(s) = state.sessions.get_mut(&session) {
            if code != SSH_OK && code != server_known::KNOWN_OK {
                s.last_error = error;
            }
        }
        code
    }
}

impl NativeSsh for MockNative {
    fn new_session(&self) -> Option<NativePtr> {
        let mut state = self.state.lock();
        let ptr = Self::alloc(&mut state);
        state.sessions.insert(ptr, MockSession::default());
        Some(ptr)
    }

    fn free_session(&self, session: NativePtr) {
        let mut state = self.state.lock();
        state.sessions.remove(&session);
        *state.session_frees.entry(session).or_default() += 1;
    }

    fn options_set(&self, session: NativePtr, option: i32, value: NativeValue<'_>) -> i32 {
        let mut state = self.state.lock();
        state.set_option_calls += 1;
        let failure = state.fail_next_set_option.take();
        let Some(s) = state.sessions.get_mut(&session) else {
            return SSH_ERROR;
        };
        if let Some(message) = failure {
            s.last_error = message;
            return SSH_ERROR;
        }
        s.options.insert(option, value.into());
        SSH_OK
    }

    fn options_get(&self, session: NativePtr, option: i32) -> Result<OwnedNativeValue, i32> {
        let state = self.state.lock();
        state
            .sessions
            .get(&session)
            .and_then(|s| s.options.get(&option).cloned())
            .ok_or(SSH_ERROR)
    }

    fn connect(&self, session: NativePtr) -> i32 {
        let code = self.state.lock().connect_code;
        if code == SSH_OK {
            if let Some(s) = self.state.lock().sessions.get_mut(&session) {
                s.connected = true;
            }
        }
        self.scripted(session, code)
    }

    fn disconnect(&self, session: NativePtr) {
        if let Some(s) = self.state.lock().sessions.get_mut(&session) {
            s.connected = false;
        }
    }

    fn blocking_flush(&self, session: NativePtr, _timeout_ms: i32) -> i32 {
        let code = self.state.lock().flush_code;
        self.scripted(session, code)
    }

    fn is_server_known(&self, session: NativePtr) -> i32 {
        let code = self.state.lock().server_known_code;
        self.scripted(session, code)
    }

    fn get_pubkey_hash(&self, _session: NativePtr) -> Result<Vec<u8>, i32> {
        self.state.lock().pubkey_hash.clone().ok_or(SSH_ERROR)
    }

    fn write_knownhost(&self, session: NativePtr) -> i32 {
        let code = self.state.lock().write_knownhost_code;
        self.scripted(session, code)
    }

    fn is_connected(&self, session: NativePtr) -> bool {
        self.state
            .lock()
            .sessions
            .get(&session)
            .map(|s| s.connected)
            .unwrap_or(false)
    }

    fn get_version(&self, session: NativePtr) -> i32 {
        if self.is_connected(session) {
            2
        } else {
            -1
        }
    }

    fn get_error(&self, session: NativePtr) -> String {
        self.state
            .lock()
            .sessions
            .get(&session)
            .map(|s| s.last_error.clone())
            .unwrap_or_default()
    }

    fn import_privkey_file(&self, path: &Path, _passphrase: Option<&str>) -> Result<NativePtr, i32> {
        let text = std::fs::read_to_string(path).map_err(|_| SSH_EOF)?;
        if !text.contains("PRIVATE KEY") {
            return Err(SSH_ERROR);
        }
        let mut state = self.state.lock();
        let ptr = Self::alloc(&mut state);
        state.keys.insert(ptr, MockKey::Private);
        Ok(ptr)
    }

    fn import_pubkey_file(&self, path: &Path) -> Result<NativePtr, i32> {
        let text = std::fs::read_to_string(path).map_err(|_| SSH_EOF)?;
        if !text.starts_with("ssh-") {
            return Err(SSH_ERROR);
        }
        let mut state = self.state.lock();
        let ptr = Self::alloc(&mut state);
        state.keys.insert(ptr, MockKey::Public);
        Ok(ptr)
    }

    fn export_privkey_to_pubkey(&self, key: NativePtr) -> Result<NativePtr, i32> {
        let mut state = self.state.lock();
        if state.keys.get(&key) != Some(&MockKey::Private) {
            return Err(SSH_ERROR);
        }
        let ptr = Self::alloc(&mut state);
        state.keys.insert(ptr, MockKey::Public);
        Ok(ptr)
    }

    fn export_pubkey(&self, key: NativePtr) -> Result<String, i32> {
        match self.state.lock().keys.get(&key) {
            Some(_) => Ok("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIG1vY2s=".to_string()),
            None => Err(SSH_ERROR),
        }
    }

    fn key_type(&self, key: NativePtr) -> i32 {
        if self.state.lock().keys.contains_key(&key) {
            key_type::ED25519
        } else {
            key_type::UNKNOWN
        }
    }

    fn free_key(&self, key: NativePtr) {
        let mut state = self.state.lock();
        state.keys.remove(&key);
        *state.key_frees.entry(key).or_default() += 1;
    }
}
