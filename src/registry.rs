//! Handle Registry - the bridge between the host collector and native memory
//!
//! Every handle handed to the host is registered here at creation. The host
//! calls [`HandleRegistry::finalize`] from its collector and may call
//! [`HandleRegistry::release`] explicitly; both are idempotent.
//!
//! # Ownership groups
//!
//! ```text
//!   session #1 (owns_memory)
//!    ├── private key #2 (borrowed, group member)
//!    └── private key #3 (borrowed, group member)
//!   public key #4 (owned, derived from #2)       -> freed by its own release
//!   public key #5 (borrowed, no session)         -> freed at registry teardown
//! ```
//!
//! A borrowed handle never frees native memory. Its pointer is recorded in
//! the group of its owner, and the owner frees every member when it is
//! released. Members that are still registered at that point are tombstoned
//! so the host cannot reach freed memory through them.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::error::BridgeError;
use crate::handle::{HandleId, KeyKind, ResourceHandle, ResourceKind, SessionState};
use crate::native::{NativePtr, NativeSsh};

#[derive(Debug, Default)]
pub struct HandleRegistry {
    entries: HashMap<HandleId, ResourceHandle>,
    /// Session -> borrowed key members (handle, native pointer)
    groups: HashMap<HandleId, Vec<(HandleId, NativePtr)>>,
    /// Borrowed keys with no owning session, freed only by `release_all`
    detached: Vec<(HandleId, NativePtr)>,
    next_id: u64,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new handle and return the reference the host keeps
    pub fn register(&mut self, handle: ResourceHandle) -> HandleId {
        self.next_id += 1;
        let id = HandleId::new(self.next_id);

        if !handle.owns_memory() {
            if let Some(ptr) = handle.native_ptr() {
                match handle.owner() {
                    Some(owner) => self.groups.entry(owner).or_default().push((id, ptr)),
                    None => self.detached.push((id, ptr)),
                }
            }
        }

        debug!(
            "Registered handle {} ({:?}, owns_memory={})",
            id,
            handle.resource(),
            handle.owns_memory()
        );
        self.entries.insert(id, handle);
        id
    }

    /// Look up a live handle
    pub fn get(&self, id: HandleId) -> Result<&ResourceHandle, BridgeError> {
        let handle = self.entries.get(&id).ok_or(BridgeError::InvalidHandle(id))?;
        if handle.is_released() {
            return Err(BridgeError::Released(id));
        }
        Ok(handle)
    }

    /// Look up a handle whether or not it has been released
    pub fn entry(&self, id: HandleId) -> Option<&ResourceHandle> {
        self.entries.get(&id)
    }

    /// Native pointer of a live session handle
    pub fn session_ptr(&self, id: HandleId) -> Result<NativePtr, BridgeError> {
        let handle = self.get(id)?;
        match (handle.resource(), handle.native_ptr()) {
            (ResourceKind::Session { .. }, Some(ptr)) => Ok(ptr),
            (ResourceKind::Session { .. }, None) => Err(BridgeError::Released(id)),
            (ResourceKind::Key { .. }, _) => {
                Err(BridgeError::TypeError(format!("{} is not a session", id)))
            }
        }
    }

    /// Native pointer and kind of a live key handle
    pub fn key_ptr(&self, id: HandleId) -> Result<(NativePtr, KeyKind), BridgeError> {
        let handle = self.get(id)?;
        match (handle.resource(), handle.native_ptr()) {
            (ResourceKind::Key { kind }, Some(ptr)) => Ok((ptr, kind)),
            (ResourceKind::Key { .. }, None) => Err(BridgeError::Released(id)),
            (ResourceKind::Session { .. }, _) => {
                Err(BridgeError::TypeError(format!("{} is not a key", id)))
            }
        }
    }

    pub(crate) fn set_session_state(&mut self, id: HandleId, state: SessionState) {
        if let Some(handle) = self.entries.get_mut(&id) {
            handle.set_session_state(state);
        }
    }

    /// Explicit release
    ///
    /// Returns `true` if this call freed native memory. Releasing an unknown
    /// or already released handle is a no-op.
    pub fn release(&mut self, id: HandleId, native: &dyn NativeSsh) -> bool {
        let Some(handle) = self.entries.get_mut(&id) else {
            return false;
        };
        let resource = handle.resource();
        let owns_memory = handle.owns_memory();
        let Some(ptr) = handle.take_ptr() else {
            debug!("Handle {} already released", id);
            return false;
        };

        match resource {
            ResourceKind::Session { .. } => {
                self.release_group(id, native);
                native.free_session(ptr);
                info!("Released session {}", id);
                true
            }
            ResourceKind::Key { .. } if owns_memory => {
                native.free_key(ptr);
                debug!("Released key {}", id);
                true
            }
            ResourceKind::Key { .. } => {
                // Memory stays with the group owner
                debug!("Dropped borrowed key {}", id);
                false
            }
        }
    }

    /// Collector finalization: release, then forget the handle
    pub fn finalize(&mut self, id: HandleId, native: &dyn NativeSsh) {
        self.release(id, native);
        self.entries.remove(&id);
    }

    /// Release everything still live, sessions first
    pub fn release_all(&mut self, native: &dyn NativeSsh) {
        let mut ids: Vec<HandleId> = self.entries.keys().copied().collect();
        ids.sort_by_key(|id| {
            let is_key = matches!(
                self.entries.get(id).map(|h| h.resource()),
                Some(ResourceKind::Key { .. })
            );
            (is_key, *id)
        });
        for id in ids {
            self.release(id, native);
        }

        for (member, ptr) in std::mem::take(&mut self.detached) {
            native.free_key(ptr);
            debug!("Freed detached key {} at teardown", member);
        }
        self.entries.clear();
    }

    /// Number of handles the host can still use
    pub fn live_count(&self) -> usize {
        self.entries.values().filter(|h| !h.is_released()).count()
    }

    fn release_group(&mut self, owner: HandleId, native: &dyn NativeSsh) {
        for (member, ptr) in self.groups.remove(&owner).unwrap_or_default() {
            native.free_key(ptr);
            if let Some(handle) = self.entries.get_mut(&member) {
                handle.take_ptr();
            }
            debug!("Freed key {} with session {}", member, owner);
        }
    }
}
