//! Session operations
//!
//! Thin façade: every operation resolves the session handle, makes one
//! native call and translates its status. Session state moves
//! Unconnected -> Connected -> Disconnected; it is tracked for the host but
//! not enforced, the native layer reports misuse itself.

use tracing::{debug, info};

use super::Bridge;
use crate::codec::{self, HostValue, OptionDescriptor};
use crate::error::BridgeError;
use crate::handle::{HandleId, ResourceHandle, SessionState};
use crate::native::SSH_ERROR;
use crate::translate::{
    expect_ok, translate_connect, translate_flush, translate_server_known, ConnectResult,
    FlushResult, ServerTrust, SessionDiagnostics,
};

impl Bridge {
    /// Allocate a new, unconnected session
    pub fn make_session(&mut self) -> Result<HandleId, BridgeError> {
        let ptr = self.native.new_session().ok_or(BridgeError::Native {
            operation: "make-session",
            code: SSH_ERROR,
            message: "Failed to allocate a session".to_string(),
        })?;
        let id = self.registry.register(ResourceHandle::session(ptr));
        debug!("Created session {}", id);
        Ok(id)
    }

    /// Set a session option by its symbol
    pub fn session_set(
        &mut self,
        session: HandleId,
        option: &str,
        value: &HostValue,
    ) -> Result<(), BridgeError> {
        let descriptor = OptionDescriptor::lookup(option)?;
        let ptr = self.registry.session_ptr(session)?;
        codec::set_option(self.native.as_ref(), ptr, &descriptor, value)
    }

    /// Read a session option back
    pub fn session_get(&self, session: HandleId, option: &str) -> Result<HostValue, BridgeError> {
        let descriptor = OptionDescriptor::lookup(option)?;
        let ptr = self.registry.session_ptr(session)?;
        codec::get_option(self.native.as_ref(), ptr, &descriptor)
    }

    pub fn connect(&mut self, session: HandleId) -> Result<ConnectResult, BridgeError> {
        let ptr = self.registry.session_ptr(session)?;
        let code = self.native.connect(ptr);
        let result = translate_connect(code, &SessionDiagnostics::new(self.native.as_ref(), ptr))?;
        if result == ConnectResult::Ok {
            self.registry.set_session_state(session, SessionState::Connected);
            info!("Session {} connected", session);
        }
        Ok(result)
    }

    /// Disconnect; harmless on a session that is not connected
    pub fn disconnect(&mut self, session: HandleId) -> Result<(), BridgeError> {
        let ptr = self.registry.session_ptr(session)?;
        self.native.disconnect(ptr);
        if self.session_state(session)? == SessionState::Connected {
            self.registry.set_session_state(session, SessionState::Disconnected);
            info!("Session {} disconnected", session);
        }
        Ok(())
    }

    /// Flush pending output, waiting at most `timeout_ms` (negative: forever)
    ///
    /// Native failures come back as [`FlushResult::Error`], never as `Err`.
    pub fn blocking_flush(
        &mut self,
        session: HandleId,
        timeout_ms: i32,
    ) -> Result<FlushResult, BridgeError> {
        let ptr = self.registry.session_ptr(session)?;
        let code = self.native.blocking_flush(ptr, timeout_ms);
        Ok(translate_flush(code, &SessionDiagnostics::new(self.native.as_ref(), ptr)))
    }

    /// Check the server key against known_hosts
    pub fn authenticate_server(&mut self, session: HandleId) -> Result<ServerTrust, BridgeError> {
        let ptr = self.registry.session_ptr(session)?;
        let code = self.native.is_server_known(ptr);
        let trust = translate_server_known(code, &SessionDiagnostics::new(self.native.as_ref(), ptr))?;
        info!("Server trust for session {}: {}", session, trust);
        Ok(trust)
    }

    /// MD5 hash of the server public key; `None` when unavailable
    pub fn get_public_key_hash(&self, session: HandleId) -> Result<Option<Vec<u8>>, BridgeError> {
        let ptr = self.registry.session_ptr(session)?;
        match self.native.get_pubkey_hash(ptr) {
            Ok(hash) => Ok(Some(hash)),
            Err(code) => {
                debug!("No public key hash for session {} (code {})", session, code);
                Ok(None)
            }
        }
    }

    /// Append the server key to known_hosts
    pub fn write_known_host(&mut self, session: HandleId) -> Result<(), BridgeError> {
        let ptr = self.registry.session_ptr(session)?;
        let code = self.native.write_knownhost(ptr);
        expect_ok(code, "write-known-host!", &SessionDiagnostics::new(self.native.as_ref(), ptr))
    }

    pub fn is_connected(&self, session: HandleId) -> Result<bool, BridgeError> {
        let ptr = self.registry.session_ptr(session)?;
        Ok(self.native.is_connected(ptr))
    }

    /// Protocol version in use; `None` when not known
    pub fn get_protocol_version(&self, session: HandleId) -> Result<Option<i32>, BridgeError> {
        let ptr = self.registry.session_ptr(session)?;
        let version = self.native.get_version(ptr);
        Ok((version >= 0).then_some(version))
    }

    /// Last native diagnostic for the session
    pub fn get_error(&self, session: HandleId) -> Result<String, BridgeError> {
        let ptr = self.registry.session_ptr(session)?;
        Ok(self.native.get_error(ptr))
    }

    pub fn session_state(&self, session: HandleId) -> Result<SessionState, BridgeError> {
        self.registry
            .get(session)?
            .session_state()
            .ok_or_else(|| BridgeError::TypeError(format!("{} is not a session", session)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::HostPort;
    use crate::config::BridgeConfig;
    use crate::native::fixtures::{LoopbackServer, OTHER_PUB};
    use crate::native::mock::MockNative;
    use crate::native::{server_known, SSH_AGAIN, SSH_OK};

    fn bridge() -> (Bridge, MockNative, HandleId) {
        let native = MockNative::new();
        let mut bridge = Bridge::new(native.clone());
        let session = bridge.make_session().unwrap();
        (bridge, native, session)
    }

    #[test]
    fn test_option_round_trip() {
        let (mut bridge, _, session) = bridge();
        let cases = [
            ("host", HostValue::from("example.org")),
            ("user", HostValue::from("alice")),
            ("port", HostValue::from(2222_i64)),
            ("timeout", HostValue::from(15_i64)),
            ("compression-level", HostValue::from(6_i64)),
            ("stricthostkeycheck", HostValue::Bool(true)),
            ("log-verbosity", HostValue::symbol("packet")),
            ("fd", HostValue::Port(HostPort::file(9))),
        ];
        for (option, value) in cases {
            bridge.session_set(session, option, &value).unwrap();
            assert_eq!(bridge.session_get(session, option).unwrap(), value, "{}", option);
        }
    }

    #[test]
    fn test_port_out_of_range_keeps_previous_value() {
        let (mut bridge, native, session) = bridge();
        bridge.session_set(session, "port", &HostValue::from(22_i64)).unwrap();
        let calls = native.set_option_calls();

        let err = bridge
            .session_set(session, "port", &HostValue::Integer(1 << 32))
            .unwrap_err();
        assert_eq!(err.kind(), "range-error");
        assert_eq!(native.set_option_calls(), calls);
        assert_eq!(bridge.session_get(session, "port").unwrap(), HostValue::from(22_i64));
    }

    #[test]
    fn test_type_mismatch_makes_no_native_call() {
        let (mut bridge, native, session) = bridge();
        let err = bridge
            .session_set(session, "host", &HostValue::from(42_i64))
            .unwrap_err();
        assert!(matches!(err, BridgeError::TypeMismatch { ref option, .. } if option == "host"));

        let err = bridge
            .session_set(session, "log-verbosity", &HostValue::symbol("chatty"))
            .unwrap_err();
        assert_eq!(err.kind(), "unknown-constant");

        let err = bridge
            .session_set(session, "no-such-option", &HostValue::Bool(true))
            .unwrap_err();
        assert_eq!(err.kind(), "unknown-option");
        assert_eq!(native.set_option_calls(), 0);
    }

    #[test]
    fn test_native_set_failure_raises_with_diagnostic() {
        let (mut bridge, native, session) = bridge();
        native.fail_next_set_option("Invalid argument in ssh_options_set");
        let err = bridge
            .session_set(session, "host", &HostValue::from("example.org"))
            .unwrap_err();
        assert_eq!(err.to_string(), "session-set!: Invalid argument in ssh_options_set");
    }

    #[test]
    fn test_connect_and_state() {
        let (mut bridge, native, session) = bridge();
        assert_eq!(bridge.session_state(session).unwrap(), SessionState::Unconnected);
        assert_eq!(bridge.get_protocol_version(session).unwrap(), None);

        native.script_connect(SSH_AGAIN, "");
        assert_eq!(bridge.connect(session).unwrap(), ConnectResult::Again);
        assert_eq!(bridge.session_state(session).unwrap(), SessionState::Unconnected);

        native.script_connect(SSH_OK, "");
        assert_eq!(bridge.connect(session).unwrap(), ConnectResult::Ok);
        assert_eq!(bridge.session_state(session).unwrap(), SessionState::Connected);
        assert!(bridge.is_connected(session).unwrap());
        assert_eq!(bridge.get_protocol_version(session).unwrap(), Some(2));

        bridge.disconnect(session).unwrap();
        bridge.disconnect(session).unwrap();
        assert_eq!(bridge.session_state(session).unwrap(), SessionState::Disconnected);
        assert!(!bridge.is_connected(session).unwrap());
    }

    #[test]
    fn test_connect_error_raises() {
        let (mut bridge, native, session) = bridge();
        native.script_connect(SSH_ERROR, "Connection refused");
        match bridge.connect(session) {
            Err(BridgeError::Native { operation, message, .. }) => {
                assert_eq!(operation, "connect!");
                assert_eq!(message, "Connection refused");
            }
            other => panic!("expected native error, got {:?}", other),
        }
        assert_eq!(bridge.get_error(session).unwrap(), "Connection refused");
    }

    #[test]
    fn test_flush_outcomes() {
        let (mut bridge, native, session) = bridge();
        native.script_flush(SSH_AGAIN, "");
        assert_eq!(bridge.blocking_flush(session, 100).unwrap(), FlushResult::Again);

        native.script_flush(SSH_ERROR, "Socket error: disconnected");
        assert_eq!(
            bridge.blocking_flush(session, 100).unwrap(),
            FlushResult::Error("Socket error: disconnected".to_string())
        );

        native.script_flush(SSH_OK, "");
        assert_eq!(bridge.blocking_flush(session, -1).unwrap(), FlushResult::Ok);
    }

    #[test]
    fn test_authenticate_server() {
        let (mut bridge, native, session) = bridge();
        native.script_server_known(server_known::KNOWN_OK, "");
        assert_eq!(bridge.authenticate_server(session).unwrap(), ServerTrust::Ok);

        native.script_server_known(server_known::KNOWN_CHANGED, "");
        assert_eq!(
            bridge.authenticate_server(session).unwrap(),
            ServerTrust::KnownChanged
        );

        native.script_server_known(server_known::ERROR, "No public key available");
        let err = bridge.authenticate_server(session).unwrap_err();
        assert_eq!(err.to_string(), "authenticate-server: No public key available");
    }

    #[test]
    fn test_public_key_hash_and_known_host() {
        let (mut bridge, native, session) = bridge();
        assert_eq!(bridge.get_public_key_hash(session).unwrap(), None);

        native.script_pubkey_hash(Some(vec![0xde, 0xad]));
        assert_eq!(bridge.get_public_key_hash(session).unwrap(), Some(vec![0xde, 0xad]));

        bridge.write_known_host(session).unwrap();
        native.script_write_knownhost(SSH_ERROR, "");
        let err = bridge.write_known_host(session).unwrap_err();
        assert_eq!(err.kind(), "native-error");
        assert!(!err.to_string().ends_with(": "));
    }

    #[test]
    fn test_released_session_is_rejected() {
        let (mut bridge, native, session) = bridge();
        assert!(bridge.release(session));
        assert!(!bridge.release(session));

        assert!(matches!(bridge.connect(session), Err(BridgeError::Released(_))));
        assert!(matches!(
            bridge.session_set(session, "host", &HostValue::from("x")),
            Err(BridgeError::Released(_))
        ));
        assert_eq!(native.set_option_calls(), 0);
    }

    #[test]
    fn test_authenticate_server_over_russh() {
        let server = LoopbackServer::start();
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = dir.path().join("known_hosts");

        let mut bridge = Bridge::with_russh(BridgeConfig::default()).unwrap();
        let session = bridge.make_session().unwrap();
        bridge.session_set(session, "host", &HostValue::from("127.0.0.1")).unwrap();
        bridge
            .session_set(session, "port", &HostValue::from(i64::from(server.port)))
            .unwrap();
        bridge
            .session_set(session, "knownhosts", &HostValue::from(known_hosts.to_str().unwrap()))
            .unwrap();

        assert_eq!(bridge.connect(session).unwrap(), ConnectResult::Ok);
        assert_eq!(bridge.session_state(session).unwrap(), SessionState::Connected);
        assert_eq!(bridge.get_protocol_version(session).unwrap(), Some(2));
        assert_eq!(bridge.authenticate_server(session).unwrap(), ServerTrust::FileNotFound);

        bridge.write_known_host(session).unwrap();
        assert_eq!(bridge.authenticate_server(session).unwrap(), ServerTrust::Ok);
        let hash = bridge.get_public_key_hash(session).unwrap().unwrap();
        assert_eq!(hash.len(), 16);
        assert_eq!(bridge.blocking_flush(session, 5000).unwrap(), FlushResult::Ok);

        std::fs::write(&known_hosts, format!("[127.0.0.1]:{} {}\n", server.port, OTHER_PUB)).unwrap();
        assert_eq!(bridge.authenticate_server(session).unwrap(), ServerTrust::KnownChanged);

        bridge.disconnect(session).unwrap();
        assert_eq!(bridge.session_state(session).unwrap(), SessionState::Disconnected);
        assert!(!bridge.is_connected(session).unwrap());

        // With strict checking the changed key fails the connect itself
        let strict = bridge.make_session().unwrap();
        for (option, value) in [
            ("host", HostValue::from("127.0.0.1")),
            ("port", HostValue::from(i64::from(server.port))),
            ("knownhosts", HostValue::from(known_hosts.to_str().unwrap())),
            ("stricthostkeycheck", HostValue::Bool(true)),
        ] {
            bridge.session_set(strict, option, &value).unwrap();
        }
        match bridge.connect(strict) {
            Err(BridgeError::Native { message, .. }) => assert!(message.contains("key changed"), "{}", message),
            other => panic!("expected native error, got {:?}", other),
        }
        assert_eq!(bridge.session_state(strict).unwrap(), SessionState::Unconnected);
    }

    #[test]
    fn test_unsupported_cipher_is_rejected_by_russh() {
        let mut bridge = Bridge::with_russh(BridgeConfig::default()).unwrap();
        let session = bridge.make_session().unwrap();

        match bridge.session_set(session, "ciphers-c-s", &HostValue::from("rot13-cbc")) {
            Err(BridgeError::Native { operation, message, .. }) => {
                assert_eq!(operation, "session-set!");
                assert_eq!(message, "Unsupported cipher 'rot13-cbc'");
            }
            other => panic!("expected native error, got {:?}", other),
        }

        bridge
            .session_set(session, "ciphers-c-s", &HostValue::from("aes256-ctr"))
            .unwrap();
        assert_eq!(
            bridge.session_get(session, "ciphers-c-s").unwrap(),
            HostValue::from("aes256-ctr")
        );
        assert!(bridge
            .session_set(session, "compression", &HostValue::from("zstd"))
            .is_err());
    }
}
