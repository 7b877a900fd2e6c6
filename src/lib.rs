//! OxideTerm SSH Bridge - ownership-safe SSH handles for embedding hosts
//!
//! Exposes SSH session and key management to a garbage-collected host
//! (a scripting runtime) through opaque handles. The host holds [`HandleId`]s;
//! the [`Bridge`] owns the native resources behind them and releases each one
//! exactly once, whichever of explicit release, session teardown or collector
//! finalization comes first.
//!
//! # Layers
//! - [`symbols`] - static symbol <-> native constant tables
//! - [`codec`] - typed marshalling of host values into native option values
//! - [`handle`] / [`registry`] - resource handles and the GC bridge
//! - [`translate`] - native status codes to per-operation result enums
//! - [`bridge`] - session and key operations built on the layers above
//! - [`native`] - the native transport boundary and its russh implementation
//! - [`config`] - transport defaults loaded from the OxideTerm config dir
//! - [`logging`] - subscriber setup and the `log-verbosity` option

pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod handle;
pub mod logging;
pub mod native;
pub mod registry;
pub mod symbols;
pub mod translate;

pub use bridge::{Bridge, HandleInfo};
pub use codec::{HostPort, HostValue, OptionDescriptor, ValueKind};
pub use config::{BridgeConfig, ConfigError};
pub use error::BridgeError;
pub use handle::{HandleId, KeyKind, ResourceHandle, ResourceKind, SessionState};
pub use logging::{init_logging, set_transport_verbosity};
pub use native::{NativePtr, NativeSsh, RusshNative};
pub use registry::HandleRegistry;
pub use translate::{ConnectResult, FlushResult, ServerTrust};
