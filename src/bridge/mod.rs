//! Bridge - the host-facing API
//!
//! One [`Bridge`] per host runtime. It owns the native transport and the
//! handle registry; session operations live in [`session`], key operations
//! in [`key`]. All methods take `&mut self`: calls are synchronous and are
//! expected from the host's single thread.

mod key;
mod session;

use serde::Serialize;
use tracing::info;

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::handle::{HandleId, ResourceKind};
use crate::native::{NativeSsh, RusshNative};
use crate::registry::HandleRegistry;

/// Host-facing snapshot of a handle
#[derive(Debug, Clone, Serialize)]
pub struct HandleInfo {
    pub id: HandleId,
    #[serde(flatten)]
    pub resource: ResourceKind,
    pub owns_memory: bool,
    pub owner: Option<HandleId>,
    pub released: bool,
}

pub struct Bridge {
    native: Box<dyn NativeSsh>,
    registry: HandleRegistry,
}

impl Bridge {
    pub fn new(native: impl NativeSsh + 'static) -> Self {
        Self {
            native: Box::new(native),
            registry: HandleRegistry::new(),
        }
    }

    /// Bridge over the russh transport
    pub fn with_russh(config: BridgeConfig) -> Result<Self, BridgeError> {
        Ok(Self::new(RusshNative::new(config)?))
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    /// Explicit release from the host; idempotent
    ///
    /// Returns `true` if native memory was freed by this call.
    pub fn release(&mut self, id: HandleId) -> bool {
        self.registry.release(id, self.native.as_ref())
    }

    /// Collector hook: the host object behind `id` is unreachable
    pub fn finalize(&mut self, id: HandleId) {
        self.registry.finalize(id, self.native.as_ref());
    }

    pub fn handle_info(&self, id: HandleId) -> Result<HandleInfo, BridgeError> {
        let handle = self
            .registry
            .entry(id)
            .ok_or(BridgeError::InvalidHandle(id))?;
        Ok(HandleInfo {
            id,
            resource: handle.resource(),
            owns_memory: handle.owns_memory(),
            owner: handle.owner(),
            released: handle.is_released(),
        })
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        let live = self.registry.live_count();
        self.registry.release_all(self.native.as_ref());
        info!("Bridge shut down, released {} live handles", live);
    }
}
