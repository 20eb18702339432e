//! # refgc
//!
//! Deterministic reference counting layered over manual allocation.
//!
//! - **Handles**: [`Gc<T>`] wraps a managed object or array and keeps its
//!   allocation's count in step with construction, cloning, reassignment and drop
//! - **Registries**: [`Registry<T>`] maps addresses to allocation entries and
//!   frees every entry whose count reaches zero, synchronously
//! - **Lifecycle**: registries enrol on first use and are reclaimed in one pass
//!   at process teardown
//!
//! There is no background collector and no cycle detection: a reference cycle
//! between handles is never reclaimed before teardown.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                          REFGC                            │
//! ├───────────────────────────────────────────────────────────┤
//! │                                                           │
//! │   ┌──────────────┐  construct / clone / assign / drop     │
//! │   │    Gc<T>     │──────────────────────┐                 │
//! │   │ (handle.rs)  │                      ▼                 │
//! │   └──────────────┘             ┌──────────────────┐       │
//! │                                │   Registry<T>    │       │
//! │   ┌──────────────┐  teardown   │  (registry.rs)   │       │
//! │   │  Lifecycle   │────────────▶│ AllocationEntry  │       │
//! │   │(lifecycle.rs)│             │    (entry.rs)    │       │
//! │   └──────────────┘             └──────────────────┘       │
//! │                                                           │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use refgc::{Gc, Registry};
//!
//! let registry = Arc::new(Registry::new());
//!
//! let a = Gc::new(&registry, 123);
//! let b = a.clone();
//! assert_eq!(registry.refcount(a.address()), Some(2));
//!
//! let c = Gc::from_vec(&registry, vec![1, 2, 3, 4, 5]);
//! assert_eq!(c.iter().sum::<i32>(), 15);
//!
//! drop((a, b, c));
//! assert!(registry.is_empty());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod entry;
pub mod handle;
pub mod lifecycle;
pub mod log;
pub mod registry;

// Re-exports
pub use config::{ConfigError, DiagnosticsConfig, GcConfig, GcConfigBuilder, LifecycleConfig, LogLevel};
pub use entry::{Address, AllocKind, AllocationEntry, RefCount};
pub use handle::Gc;
pub use lifecycle::{TeardownGuard, TeardownReport};
pub use registry::{Registry, RegistryError, RegistryStats};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging and the process lifecycle.
///
/// Call once at the start of `main` and keep the guard alive until exit.
///
/// # Safety
/// Dropping the guard reclaims every enrolled registry; see
/// [`lifecycle::teardown`].
#[must_use = "dropping the guard immediately tears down every enrolled registry"]
pub unsafe fn init(config: &GcConfig) -> TeardownGuard {
    log::init(&config.log);
    lifecycle::install(config.lifecycle)
}

/// Initialize from `REFGC_*` environment variables.
///
/// # Safety
/// Same contract as [`init`].
#[must_use = "dropping the guard immediately tears down every enrolled registry"]
pub unsafe fn init_from_env() -> TeardownGuard {
    init(&GcConfig::from_env())
}

/// Create a registry with the given configuration, ready to share with handles.
pub fn registry<T>(config: &GcConfig) -> std::sync::Arc<Registry<T>> {
    std::sync::Arc::new(Registry::with_config(config.diagnostics))
}
