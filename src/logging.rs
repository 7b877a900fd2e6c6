//! Logging setup
//!
//! One process-wide `tracing` subscriber. The session `log-verbosity` option
//! drives how much of russh's own transport logging gets through; like
//! libssh's verbosity it is global, the last session to set it wins.

use std::sync::OnceLock;

use tracing::debug;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

use crate::native::log_level;

/// Reload handle for the installed filter
struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
    default_filter: String,
}

static LOG_CONTROL: OnceLock<LogControl> = OnceLock::new();

fn base_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Initialize logging
///
/// `RUST_LOG` takes precedence over `default_filter`. Safe to call more than
/// once; only the first call installs a subscriber.
pub fn init_logging(default_filter: &str) {
    let (filter, handle) = reload::Layer::new(base_filter(default_filter));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
    if installed.is_ok() {
        let _ = LOG_CONTROL.set(LogControl {
            handle,
            default_filter: default_filter.to_string(),
        });
    }
}

/// Filter directive for russh at a `log-verbosity` level
fn transport_directive(level: i32) -> Option<Directive> {
    let level = match level {
        log_level::NOLOG => "off",
        log_level::RARE => "warn",
        log_level::PROTOCOL => "info",
        log_level::PACKET => "debug",
        log_level::FUNCTIONS => "trace",
        _ => return None,
    };
    format!("russh={}", level).parse().ok()
}

/// Apply a `log-verbosity` level to russh's logging
///
/// Returns `false` if there is nothing to apply it to: no subscriber was
/// installed by [`init_logging`], or the level is out of range.
pub fn set_transport_verbosity(level: i32) -> bool {
    let (Some(control), Some(directive)) = (LOG_CONTROL.get(), transport_directive(level)) else {
        debug!("Log verbosity {} not applied", level);
        return false;
    };
    let filter = base_filter(&control.default_filter).add_directive(directive);
    control.handle.reload(filter).is_ok()
}
