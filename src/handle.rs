//! Resource handles
//!
//! A [`ResourceHandle`] is the bridge-side record behind every host reference:
//! the native pointer, whether this handle is the one that frees it, and what
//! kind of resource it is.

use std::fmt;

use serde::Serialize;

use crate::native::NativePtr;

/// Host-visible reference to a registered handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Public or private half of a key pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    Public,
    Private,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Public => f.write_str("public key"),
            KeyKind::Private => f.write_str("private key"),
        }
    }
}

/// Adapter-level view of a session's connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unconnected,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceKind {
    Session { state: SessionState },
    Key { kind: KeyKind },
}

/// Native pointer plus ownership metadata
#[derive(Debug)]
pub struct ResourceHandle {
    ptr: NativePtr,
    owns_memory: bool,
    resource: ResourceKind,
    /// Session that frees this handle's memory when `owns_memory` is false
    owner: Option<HandleId>,
}

impl ResourceHandle {
    /// Sessions always own their native memory
    pub fn session(ptr: NativePtr) -> Self {
        Self {
            ptr,
            owns_memory: true,
            resource: ResourceKind::Session {
                state: SessionState::Unconnected,
            },
            owner: None,
        }
    }

    /// Key whose memory this handle frees
    pub fn owned_key(ptr: NativePtr, kind: KeyKind) -> Self {
        Self {
            ptr,
            owns_memory: true,
            resource: ResourceKind::Key { kind },
            owner: None,
        }
    }

    /// Key freed by `owner` (a session), or by the bridge when `owner` is `None`
    pub fn borrowed_key(ptr: NativePtr, kind: KeyKind, owner: Option<HandleId>) -> Self {
        Self {
            ptr,
            owns_memory: false,
            resource: ResourceKind::Key { kind },
            owner,
        }
    }

    pub fn owns_memory(&self) -> bool {
        self.owns_memory
    }

    pub fn resource(&self) -> ResourceKind {
        self.resource
    }

    pub fn owner(&self) -> Option<HandleId> {
        self.owner
    }

    /// Live native pointer, `None` once released
    pub fn native_ptr(&self) -> Option<NativePtr> {
        (!self.ptr.is_released()).then_some(self.ptr)
    }

    pub fn is_released(&self) -> bool {
        self.ptr.is_released()
    }

    pub fn key_kind(&self) -> Option<KeyKind> {
        match self.resource {
            ResourceKind::Key { kind } => Some(kind),
            ResourceKind::Session { .. } => None,
        }
    }

    pub fn session_state(&self) -> Option<SessionState> {
        match self.resource {
            ResourceKind::Session { state } => Some(state),
            ResourceKind::Key { .. } => None,
        }
    }

    pub(crate) fn set_session_state(&mut self, new_state: SessionState) {
        if let ResourceKind::Session { state } = &mut self.resource {
            *state = new_state;
        }
    }

    /// Tombstone the pointer and hand back the live value exactly once
    pub(crate) fn take_ptr(&mut self) -> Option<NativePtr> {
        let ptr = self.native_ptr()?;
        self.ptr = NativePtr::RELEASED;
        Some(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(raw: u64) -> NativePtr {
        NativePtr::from_raw(raw).unwrap()
    }

    #[test]
    fn test_take_ptr_tombstones_once() {
        let mut handle = ResourceHandle::owned_key(ptr(9), KeyKind::Public);
        assert_eq!(handle.take_ptr(), Some(ptr(9)));
        assert!(handle.is_released());
        assert_eq!(handle.take_ptr(), None);
        assert_eq!(handle.native_ptr(), None);
    }

    #[test]
    fn test_provenance_flags() {
        let session = ResourceHandle::session(ptr(1));
        assert!(session.owns_memory());
        assert_eq!(session.session_state(), Some(SessionState::Unconnected));

        let private = ResourceHandle::borrowed_key(ptr(2), KeyKind::Private, Some(HandleId::new(1)));
        assert!(!private.owns_memory());
        assert_eq!(private.owner(), Some(HandleId::new(1)));
        assert_eq!(private.key_kind(), Some(KeyKind::Private));
        assert_eq!(private.session_state(), None);
    }

    #[test]
    fn test_session_state_only_applies_to_sessions() {
        let mut key = ResourceHandle::owned_key(ptr(3), KeyKind::Public);
        key.set_session_state(SessionState::Connected);
        assert_eq!(key.resource(), ResourceKind::Key { kind: KeyKind::Public });

        let mut session = ResourceHandle::session(ptr(4));
        session.set_session_state(SessionState::Connected);
        assert_eq!(session.session_state(), Some(SessionState::Connected));
    }
}
