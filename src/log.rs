//! Logging Infrastructure
//!
//! The collector emits `tracing` events:
//!
//! - **trace**: every refcount change and registration
//! - **debug**: sweeps that freed something, registry shutdown, enrolment
//! - **info**: teardown summaries
//! - **warn**: outstanding allocations at teardown, conflicting re-registration
//! - **error**: lookup failures, right before the panic
//!
//! Libraries embedding the collector usually install their own subscriber.
//! [`init`] is a convenience for binaries and tests that do not.

use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogLevel};

/// Install a formatting subscriber on stderr.
///
/// `RUST_LOG` takes precedence over the configured level. Returns `false` if
/// a global subscriber was already installed, in which case nothing changes.
pub fn init(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directive(config.level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Install a formatting subscriber with the given level.
pub fn init_with_level(level: LogLevel) -> bool {
    init(&LogConfig { level })
}

/// Filter directive for a level.
fn directive(level: LogLevel) -> String {
    format!("{}={}", env!("CARGO_CRATE_NAME"), level.as_str())
}
