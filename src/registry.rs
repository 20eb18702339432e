//! # Allocation Registry
//!
//! A [`Registry`] tracks every managed allocation of one element type, keyed by
//! address. Handles drive it: each construction or clone adds a reference,
//! each drop or reassignment removes one and then runs [`Registry::sweep`],
//! which frees whatever reached zero.
//!
//! ## Invariants
//!
//! - An address appears at most once.
//! - A live entry's refcount equals the number of live handles bound to it.
//! - Sweep removes an entry from the map before releasing it, so an
//!   allocation is never freed twice, and never frees an entry that still
//!   has references.
//!
//! ## Failure policy
//!
//! Decrementing or incrementing an address the registry never saw means some
//! handle lost track of its allocation. Continuing would corrupt counts and
//! risk a double free, so the plain operations panic. The `try_*` forms return
//! the same condition as a [`RegistryError`] for callers that want to inspect
//! it before failing.

use std::any;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::config::DiagnosticsConfig;
use crate::entry::{Address, AllocKind, AllocationEntry, RefCount};

/// Contract violations detected by a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The address has no entry in the registry.
    #[error("lookup failure: address {address:#x} is not registered")]
    LookupFailure {
        /// The unregistered address.
        address: Address,
    },
    /// The entry already had no references left.
    #[error("refcount underflow: address {address:#x} has no references left")]
    RefcountUnderflow {
        /// The address whose count would go negative.
        address: Address,
    },
    /// The registry was shut down and takes no new allocations.
    #[error("registry closed: address {address:#x} registered after shutdown")]
    Closed {
        /// The address that was offered.
        address: Address,
    },
}

impl RegistryError {
    /// Get the address the violation was detected at.
    pub fn address(&self) -> Address {
        match self {
            RegistryError::LookupFailure { address }
            | RegistryError::RefcountUnderflow { address }
            | RegistryError::Closed { address } => *address,
        }
    }
}

/// Counters describing registry activity since creation.
#[derive(Debug, Default)]
pub struct RegistryStats {
    /// Entries created for previously unseen addresses.
    pub registrations: AtomicU64,
    /// References added to existing entries.
    pub increments: AtomicU64,
    /// References removed.
    pub decrements: AtomicU64,
    /// Sweep passes run.
    pub sweeps: AtomicU64,
    /// Entries freed and removed.
    pub freed: AtomicU64,
}

struct RegistryState<T> {
    entries: HashMap<Address, AllocationEntry<T>>,
    /// Set once `shutdown` has force-reclaimed everything.
    closed: bool,
    /// Addresses force-reclaimed by `shutdown`; late releases of these are ignored.
    reclaimed: HashSet<Address>,
}

/// The collection of allocation entries for one element type.
///
/// Registries are explicit values owned by the application and shared with
/// handles through an `Arc`. Scalar and array allocations of the same type live
/// in the same registry; each entry carries its own allocation form.
pub struct Registry<T> {
    state: Mutex<RegistryState<T>>,
    /// One-shot flag recording enrolment with the process lifecycle.
    enrolled: AtomicBool,
    config: DiagnosticsConfig,
    stats: RegistryStats,
}

impl<T> Registry<T> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::with_config(DiagnosticsConfig::default())
    }

    /// Create a new empty registry with the given dump settings.
    pub fn with_config(config: DiagnosticsConfig) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                entries: HashMap::new(),
                closed: false,
                reclaimed: HashSet::new(),
            }),
            enrolled: AtomicBool::new(false),
            config,
            stats: RegistryStats::default(),
        }
    }

    /// Look up the entry for an address.
    ///
    /// Returns a snapshot; the registry is not modified.
    pub fn find(&self, address: Address) -> Option<AllocationEntry<T>> {
        self.state.lock().entries.get(&address).copied()
    }

    /// Check if an address is registered.
    pub fn contains(&self, address: Address) -> bool {
        self.state.lock().entries.contains_key(&address)
    }

    /// Get the reference count for an address.
    pub fn refcount(&self, address: Address) -> Option<RefCount> {
        self.find(address).map(|entry| entry.refcount())
    }

    /// Add a reference to `ptr`, registering it if it is not yet known.
    ///
    /// A new entry starts with a refcount of one and takes ownership of the
    /// allocation. If the address is already registered, its existing entry
    /// (including its recorded allocation form) is kept and incremented.
    ///
    /// # Safety
    /// If `ptr` is non-null and not yet registered, it must come from
    /// `Box::<T>::into_raw` (for [`AllocKind::Scalar`]) or from
    /// `Box::<[T]>::into_raw` with exactly the given length (for
    /// [`AllocKind::Array`]), and nothing else may free it.
    ///
    /// # Panics
    /// Panics if the registry has been shut down.
    pub unsafe fn register_or_increment(&self, ptr: *mut T, kind: AllocKind) -> AllocationEntry<T> {
        let address = ptr as Address;
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            fail(RegistryError::Closed { address });
        }

        if let Some(entry) = state.entries.get_mut(&address) {
            if entry.kind() != kind {
                warn!(
                    address = format_args!("{:#x}", address),
                    registered = %entry.kind(),
                    requested = %kind,
                    "address re-registered with a different allocation form; keeping the registered form"
                );
            }
            let count = entry.increment();
            self.stats.increments.fetch_add(1, Ordering::Relaxed);
            trace!(address = format_args!("{:#x}", address), refcount = count, "reference added");
            return *entry;
        }

        let entry = AllocationEntry::new(ptr, kind);
        state.entries.insert(address, entry);
        self.stats.registrations.fetch_add(1, Ordering::Relaxed);
        trace!(address = format_args!("{:#x}", address), %kind, "allocation registered");
        entry
    }

    /// Add a reference to an already registered address.
    pub fn try_increment(&self, address: Address) -> Result<AllocationEntry<T>, RegistryError> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(&address)
            .ok_or(RegistryError::LookupFailure { address })?;

        let count = entry.increment();
        self.stats.increments.fetch_add(1, Ordering::Relaxed);
        trace!(address = format_args!("{:#x}", address), refcount = count, "reference added");
        Ok(*entry)
    }

    /// Add a reference to an already registered address.
    ///
    /// # Panics
    /// Panics with a lookup failure if the address is not registered.
    pub fn increment(&self, address: Address) -> AllocationEntry<T> {
        match self.try_increment(address) {
            Ok(entry) => entry,
            Err(err) => fail(err),
        }
    }

    /// Remove a reference from a registered address.
    ///
    /// Returns the remaining count. The entry stays in place at zero until the
    /// next sweep. Once the registry has been shut down, addresses reclaimed by
    /// the shutdown are ignored and report a count of zero; any other unknown
    /// address is still a lookup failure.
    ///
    /// # Safety
    /// The reference removed must be one the caller owns. Taking a reference
    /// that a live handle still holds lets the next sweep free memory that
    /// handle points to.
    pub unsafe fn try_decrement(&self, address: Address) -> Result<RefCount, RegistryError> {
        let mut state = self.state.lock();
        if !state.entries.contains_key(&address) && state.reclaimed.contains(&address) {
            trace!(address = format_args!("{:#x}", address), "release after shutdown ignored");
            return Ok(0);
        }

        let entry = state
            .entries
            .get_mut(&address)
            .ok_or(RegistryError::LookupFailure { address })?;

        let count = entry
            .decrement()
            .ok_or(RegistryError::RefcountUnderflow { address })?;
        self.stats.decrements.fetch_add(1, Ordering::Relaxed);
        trace!(address = format_args!("{:#x}", address), refcount = count, "reference removed");
        Ok(count)
    }

    /// Remove a reference from a registered address.
    ///
    /// # Panics
    /// Panics with a lookup failure if the address is not registered, or with
    /// an underflow if its count is already zero.
    ///
    /// # Safety
    /// Same contract as [`Registry::try_decrement`].
    pub unsafe fn decrement(&self, address: Address) -> RefCount {
        match self.try_decrement(address) {
            Ok(count) => count,
            Err(err) => fail(err),
        }
    }

    /// Free and remove every entry with no references left.
    ///
    /// Returns `true` if at least one entry was freed. Entries are taken out of
    /// the map in a single pass under the lock; the allocations are released
    /// after the lock is dropped, so destructors may freely drop other handles
    /// of this registry.
    pub fn sweep(&self) -> bool {
        let mut garbage = Vec::new();
        {
            let mut state = self.state.lock();
            state.entries.retain(|_, entry| {
                if entry.is_garbage() {
                    garbage.push(*entry);
                    false
                } else {
                    true
                }
            });
        }
        self.stats.sweeps.fetch_add(1, Ordering::Relaxed);

        if garbage.is_empty() {
            return false;
        }

        debug!(
            registry = any::type_name::<T>(),
            freed = garbage.len(),
            "sweep reclaimed allocations"
        );
        self.stats.freed.fetch_add(garbage.len() as u64, Ordering::Relaxed);
        for entry in garbage {
            // Removed above under the lock with a refcount of zero.
            unsafe { entry.release() };
        }
        true
    }

    /// Force every entry to zero and reclaim all of them.
    ///
    /// Returns the number of entries reclaimed. Afterwards the registry is
    /// closed: releases of addresses it reclaimed are ignored instead of
    /// reported as lookup failures, and registering a new allocation panics.
    ///
    /// # Safety
    /// Handles still bound to this registry keep their addresses but the
    /// memory behind them is freed. None of them may be dereferenced, indexed,
    /// iterated or cloned afterwards; dropping them is fine.
    pub unsafe fn shutdown(&self) -> usize {
        let count = {
            let mut state = self.state.lock();
            let state = &mut *state;
            state.closed = true;
            for (address, entry) in state.entries.iter_mut() {
                entry.force_zero();
                state.reclaimed.insert(*address);
            }
            state.entries.len()
        };

        if count > 0 {
            debug!(registry = any::type_name::<T>(), entries = count, "registry shutdown");
            self.sweep();
        }
        count
    }

    /// Get the number of live entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Check if the registry has been shut down.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Get the registry statistics.
    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    /// Get the dump configuration.
    pub fn config(&self) -> &DiagnosticsConfig {
        &self.config
    }

    /// Snapshot every entry, ordered by address.
    pub fn entries(&self) -> Vec<AllocationEntry<T>> {
        let mut entries: Vec<_> = self.state.lock().entries.values().copied().collect();
        entries.sort_by_key(|entry| entry.address());
        entries
    }

    /// Mark the registry as enrolled with the process lifecycle.
    ///
    /// Returns `true` only on the first call.
    pub(crate) fn mark_enrolled(&self) -> bool {
        !self.enrolled.swap(true, Ordering::AcqRel)
    }

    /// Check if the registry has been enrolled with the process lifecycle.
    pub fn is_enrolled(&self) -> bool {
        self.enrolled.load(Ordering::Acquire)
    }
}

impl<T: fmt::Debug> Registry<T> {
    /// Render a listing of every entry: address, refcount and value.
    ///
    /// Diagnostic only; has no effect on the registry.
    pub fn dump(&self) -> String {
        let state = self.state.lock();
        let mut entries: Vec<_> = state.entries.values().collect();
        entries.sort_by_key(|entry| entry.address());

        let mut out = String::new();
        let _ = writeln!(out, "Registry<{}>:", any::type_name::<T>());
        if entries.is_empty() {
            let _ = writeln!(out, "  container is empty");
            return out;
        }

        let _ = writeln!(out, "  address refcount value");
        for entry in entries.iter().take(self.config.dump_limit) {
            let _ = write!(out, "  [{:#x}] {}", entry.address(), entry.refcount());
            if self.config.show_values {
                let _ = write!(out, " ");
                // Entries still in the map have not been released.
                unsafe { write_value(&mut out, entry) };
            }
            out.push('\n');
        }
        if entries.len() > self.config.dump_limit {
            let _ = writeln!(out, "  ... {} more", entries.len() - self.config.dump_limit);
        }
        out
    }
}

/// Append the value behind an entry.
///
/// # Safety
/// The entry's allocation must still be live.
unsafe fn write_value<T: fmt::Debug>(out: &mut String, entry: &AllocationEntry<T>) {
    if entry.is_null() {
        out.push_str("---");
        return;
    }
    match entry.kind() {
        AllocKind::Scalar => {
            let _ = write!(out, "{:?}", &*entry.as_ptr());
        }
        AllocKind::Array(len) => {
            let values = std::slice::from_raw_parts(entry.as_ptr() as *const T, len);
            let _ = write!(out, "{:?}", values);
        }
    }
}

/// Report a contract violation and stop.
#[cold]
#[track_caller]
fn fail(err: RegistryError) -> ! {
    error!(address = format_args!("{:#x}", err.address()), "{}", err);
    panic!("{}", err)
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Registry")
            .field("type", &any::type_name::<T>())
            .field("num_entries", &state.entries.len())
            .field("closed", &state.closed)
            .finish()
    }
}

// Thread-safe: all entry state is behind a Mutex. Entries own values of `T`,
// which may be dropped or read (by `dump`) from whichever thread holds the registry.
unsafe impl<T: Send> Send for Registry<T> {}
unsafe impl<T: Send + Sync> Sync for Registry<T> {}
