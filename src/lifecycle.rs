//! # Process Lifecycle
//!
//! Registries enrol here the first time a handle is constructed against them.
//! At shutdown the host runs [`teardown`] (directly, or by dropping the
//! [`TeardownGuard`] returned from [`install`]), which forces every enrolled
//! registry to zero and sweeps it. Allocations held by handles that are never
//! dropped, such as handles parked in long-lived structures, are therefore
//! released deterministically instead of being reported as leaks.
//!
//! Enrolment is per thread, matching the single-threaded handle model: handles
//! cannot leave the thread they were created on, so the thread that builds
//! them is the one that tears them down. A registry shared across threads
//! enrols only on the thread that constructs its first handle, and only that
//! thread's [`teardown`] reclaims it. Other threads have to shut it down
//! with [`Registry::shutdown`] themselves.
//!
//! ```rust
//! use std::sync::Arc;
//! use refgc::config::LifecycleConfig;
//! use refgc::{lifecycle, Gc, Registry};
//!
//! // Safety: no handle is dereferenced after the guard drops.
//! let guard = unsafe { lifecycle::install(LifecycleConfig::default()) };
//!
//! let registry = Arc::new(Registry::new());
//! let value = Gc::new(&registry, 42);
//! assert_eq!(*value, 42);
//! std::mem::forget(value);
//!
//! drop(guard);
//! assert!(registry.is_empty());
//! ```

use std::any;
use std::cell::RefCell;
use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use crate::config::LifecycleConfig;
use crate::registry::Registry;

/// Type-erased view of a registry for teardown.
trait Reclaim {
    /// Name of the element type, for reports.
    fn type_name(&self) -> &'static str;

    /// Number of live entries.
    fn live_entries(&self) -> usize;

    /// Force-reclaim everything.
    ///
    /// # Safety
    /// See [`Registry::shutdown`].
    unsafe fn reclaim(&self) -> usize;
}

impl<T> Reclaim for Registry<T> {
    fn type_name(&self) -> &'static str {
        any::type_name::<T>()
    }

    fn live_entries(&self) -> usize {
        self.len()
    }

    unsafe fn reclaim(&self) -> usize {
        self.shutdown()
    }
}

thread_local! {
    static ENROLLED: RefCell<Vec<Weak<dyn Reclaim>>> = const { RefCell::new(Vec::new()) };
}

/// Summary of a teardown pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Registries still alive at teardown.
    pub registries: usize,
    /// Registries that still held entries.
    pub outstanding: usize,
    /// Entries reclaimed across all registries.
    pub reclaimed: usize,
}

/// Enrol a registry with the process lifecycle.
///
/// Only the first call for a given registry has an effect. Handles call this
/// on construction; calling it directly is only needed for registries
/// populated through [`Registry::register_or_increment`].
pub fn enroll<T: 'static>(registry: &Arc<Registry<T>>) {
    if !registry.mark_enrolled() {
        return;
    }

    let weak: Weak<Registry<T>> = Arc::downgrade(registry);
    let weak: Weak<dyn Reclaim> = weak;
    ENROLLED.with(|enrolled| enrolled.borrow_mut().push(weak));
    debug!(registry = any::type_name::<T>(), "registry enrolled for teardown");
}

/// Number of enrolled registries that are still alive on this thread.
pub fn enrolled_count() -> usize {
    ENROLLED.with(|enrolled| {
        let mut enrolled = enrolled.borrow_mut();
        enrolled.retain(|weak| weak.strong_count() > 0);
        enrolled.len()
    })
}

/// Reclaim every enrolled registry on this thread.
///
/// Registries enrolled only on other threads are skipped.
///
/// # Safety
/// Every handle of every enrolled registry becomes dangling. None of them may
/// be dereferenced, indexed, iterated or cloned afterwards; dropping them is
/// fine.
pub unsafe fn teardown(config: &LifecycleConfig) -> TeardownReport {
    // Taken out first: destructors run during reclamation may construct new
    // handles and enrol further registries.
    let enrolled = ENROLLED.with(|enrolled| std::mem::take(&mut *enrolled.borrow_mut()));

    let mut report = TeardownReport::default();
    for registry in enrolled.iter().filter_map(Weak::upgrade) {
        report.registries += 1;

        let live = registry.live_entries();
        if live > 0 {
            report.outstanding += 1;
            if config.report_outstanding {
                warn!(
                    registry = registry.type_name(),
                    entries = live,
                    "allocations still referenced at teardown"
                );
            }
        }
        report.reclaimed += registry.reclaim();
    }

    info!(
        registries = report.registries,
        outstanding = report.outstanding,
        reclaimed = report.reclaimed,
        "teardown complete"
    );
    report
}

/// Set up the process lifecycle.
///
/// The returned guard runs [`teardown`] when dropped if
/// `config.teardown_on_exit` is set. Keep it alive in `main` so it drops on
/// every exit path, including unwinding.
///
/// # Safety
/// Dropping the guard has the same contract as [`teardown`].
#[must_use = "dropping the guard immediately tears down every enrolled registry"]
pub unsafe fn install(config: LifecycleConfig) -> TeardownGuard {
    debug!(?config, "process lifecycle installed");
    TeardownGuard {
        config,
        armed: true,
    }
}

/// Runs [`teardown`] when dropped.
#[derive(Debug)]
pub struct TeardownGuard {
    config: LifecycleConfig,
    armed: bool,
}

impl TeardownGuard {
    /// Get the lifecycle configuration.
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Tear down now and disarm the guard.
    pub fn finish(mut self) -> TeardownReport {
        self.armed = false;
        // Safety: contract accepted by `install`.
        unsafe { teardown(&self.config) }
    }

    /// Disarm the guard without tearing down.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if self.armed && self.config.teardown_on_exit {
            // Safety: contract accepted by `install`.
            unsafe { teardown(&self.config) };
        }
    }
}
