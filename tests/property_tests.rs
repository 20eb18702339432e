//! Property-based tests for handle refcounting.
//!
//! Uses proptest to generate random sequences of handle operations and checks
//! them against a simple model: every registered address has a refcount equal
//! to the number of live handles on it, and every allocation is freed exactly
//! once, when its last handle goes away.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use proptest::prelude::*;
use refgc::{Gc, Registry};

#[derive(Debug)]
struct Tracked {
    drops: Rc<Cell<usize>>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

/// One step applied to a pool of handles. Indices wrap around the pool.
#[derive(Debug, Clone)]
enum Op {
    /// Allocate a fresh scalar.
    New,
    /// Allocate a fresh array of the given length.
    NewArray(usize),
    /// Clone a handle.
    Clone(usize),
    /// Drop a handle.
    Drop(usize),
    /// Assign one handle from another.
    Assign(usize, usize),
    /// Rebind a handle to a fresh scalar.
    AssignNew(usize),
    /// Run an extra sweep.
    Sweep,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::New),
        1 => (0usize..6).prop_map(Op::NewArray),
        4 => any::<usize>().prop_map(Op::Clone),
        4 => any::<usize>().prop_map(Op::Drop),
        3 => (any::<usize>(), any::<usize>()).prop_map(|(a, b)| Op::Assign(a, b)),
        2 => any::<usize>().prop_map(Op::AssignNew),
        1 => Just(Op::Sweep),
    ]
}

/// Expected refcount per address from the live handles.
fn model(handles: &[Gc<Tracked>]) -> HashMap<usize, u32> {
    let mut counts = HashMap::new();
    for handle in handles {
        *counts.entry(handle.address()).or_insert(0) += 1;
    }
    counts
}

proptest! {
    /// Refcounts always match live handles, and freed + live elements add up.
    #[test]
    fn refcounts_track_live_handles(ops in prop::collection::vec(op(), 1..80)) {
        let drops = Rc::new(Cell::new(0));
        let registry = Arc::new(Registry::new());
        let mut handles: Vec<Gc<Tracked>> = Vec::new();
        let mut allocated = 0usize;

        for op in ops {
            match op {
                Op::New => {
                    handles.push(Gc::new(&registry, Tracked { drops: drops.clone() }));
                    allocated += 1;
                }
                Op::NewArray(len) => {
                    let values: Vec<_> = (0..len).map(|_| Tracked { drops: drops.clone() }).collect();
                    handles.push(Gc::from_vec(&registry, values));
                    allocated += len;
                }
                Op::Clone(i) if !handles.is_empty() => {
                    let copy = handles[i % handles.len()].clone();
                    handles.push(copy);
                }
                Op::Drop(i) if !handles.is_empty() => {
                    let idx = i % handles.len();
                    handles.swap_remove(idx);
                }
                Op::Assign(i, j) if !handles.is_empty() => {
                    let src = handles[j % handles.len()].clone();
                    let idx = i % handles.len();
                    handles[idx].assign(&src);
                }
                Op::AssignNew(i) if !handles.is_empty() => {
                    let idx = i % handles.len();
                    handles[idx].assign_new(Tracked { drops: drops.clone() });
                    allocated += 1;
                }
                Op::Sweep => {
                    prop_assert!(!registry.sweep());
                }
                _ => {}
            }

            let expected = model(&handles);
            for (address, count) in &expected {
                prop_assert_eq!(registry.refcount(*address), Some(*count));
            }

            // Zero-length arrays all sit at one dangling address and share its entry.
            prop_assert_eq!(registry.len(), expected.len());

            let live_elements: usize = expected
                .keys()
                .filter_map(|address| registry.find(*address))
                .map(|entry| entry.element_count())
                .sum();
            prop_assert_eq!(drops.get() + live_elements, allocated);
        }

        handles.clear();
        prop_assert!(registry.is_empty());
        prop_assert_eq!(drops.get(), allocated);
    }

    /// N aliases of one address give refcount N, and the value survives until the last drop.
    #[test]
    fn n_aliases_free_once(n in 1usize..64) {
        let drops = Rc::new(Cell::new(0));
        let registry = Arc::new(Registry::new());
        let ptr = Box::into_raw(Box::new(Tracked { drops: drops.clone() }));

        let handles: Vec<_> = (0..n).map(|_| unsafe { Gc::from_raw(&registry, ptr) }).collect();
        prop_assert_eq!(registry.refcount(ptr as usize), Some(n as u32));

        drop(handles);
        prop_assert_eq!(drops.get(), 1);
        prop_assert!(registry.is_empty());
    }

    /// Array handles expose exactly their element count, in address order, every time.
    #[test]
    fn array_iteration_covers_every_element(values in prop::collection::vec(any::<i64>(), 1..40)) {
        let registry = Arc::new(Registry::new());
        let handle = Gc::from_vec(&registry, values.clone());

        prop_assert_eq!(handle.len(), values.len());
        for _ in 0..2 {
            let seen: Vec<i64> = handle.iter().copied().collect();
            prop_assert_eq!(&seen, &values);
        }
        prop_assert_eq!(registry.find(handle.address()).map(|e| e.element_count()), Some(values.len()));
    }

    /// Sweep after a sweep never frees anything.
    #[test]
    fn sweep_is_idempotent(count in 0usize..20) {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..count).map(|i| Gc::new(&registry, i)).collect();
        prop_assert!(!registry.sweep());

        drop(handles);
        prop_assert!(!registry.sweep());
        prop_assert!(registry.is_empty());
    }
}
