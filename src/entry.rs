//! # Allocation Entries
//!
//! One [`AllocationEntry`] describes one live managed allocation: where it
//! lives, how many handles currently reference it, and how it was allocated.
//! The allocation form is recorded on the entry itself so that release always
//! uses the matching deallocation, regardless of what any individual handle
//! believes about the address.

use std::fmt;
use std::ptr;

/// Address of a managed allocation, used as the registry key.
///
/// The null address (`0`) is a valid key: unbound handles register it as a
/// degenerate entry that owns nothing.
pub type Address = usize;

/// Reference count type.
pub type RefCount = u32;

/// How a managed allocation was obtained, and therefore how it is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocKind {
    /// A single value obtained from `Box::<T>::into_raw`.
    Scalar,
    /// A slice of the given length obtained from `Box::<[T]>::into_raw`.
    Array(usize),
}

impl AllocKind {
    /// Check if this is an array allocation.
    pub const fn is_array(&self) -> bool {
        matches!(self, AllocKind::Array(_))
    }

    /// Number of elements covered by the allocation.
    ///
    /// Scalars always cover exactly one element.
    pub const fn element_count(&self) -> usize {
        match self {
            AllocKind::Scalar => 1,
            AllocKind::Array(len) => *len,
        }
    }
}

impl fmt::Display for AllocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocKind::Scalar => write!(f, "scalar"),
            AllocKind::Array(len) => write!(f, "array[{}]", len),
        }
    }
}

/// Record of one managed allocation tracked by a [`Registry`](crate::Registry).
///
/// Entries are plain snapshots: copying one does not copy or share the
/// allocation, it only copies the bookkeeping.
pub struct AllocationEntry<T> {
    /// Pointer to the first element (null for the degenerate entry).
    ptr: *mut T,
    /// Number of live handles referencing `ptr`.
    refcount: RefCount,
    /// Allocation form.
    kind: AllocKind,
}

impl<T> AllocationEntry<T> {
    /// Create a new entry with a single reference.
    pub(crate) fn new(ptr: *mut T, kind: AllocKind) -> Self {
        Self {
            ptr,
            refcount: 1,
            kind,
        }
    }

    /// Get the address key of this entry.
    pub fn address(&self) -> Address {
        self.ptr as Address
    }

    /// Get the raw pointer to the first element.
    pub fn as_ptr(&self) -> *mut T {
        self.ptr
    }

    /// Get the current reference count.
    pub fn refcount(&self) -> RefCount {
        self.refcount
    }

    /// Get the allocation form.
    pub fn kind(&self) -> AllocKind {
        self.kind
    }

    /// Check if the allocation is an array.
    pub fn is_array(&self) -> bool {
        self.kind.is_array()
    }

    /// Number of elements in the allocation.
    pub fn element_count(&self) -> usize {
        self.kind.element_count()
    }

    /// Check if this is the degenerate entry for the null address.
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// An entry with no references left is garbage awaiting the next sweep.
    pub fn is_garbage(&self) -> bool {
        self.refcount == 0
    }

    /// Add one reference.
    ///
    /// # Panics
    /// Panics if the count would overflow.
    pub(crate) fn increment(&mut self) -> RefCount {
        self.refcount = match self.refcount.checked_add(1) {
            Some(count) => count,
            None => panic!("refcount overflow at address {:#x}", self.address()),
        };
        self.refcount
    }

    /// Remove one reference.
    ///
    /// Returns `None` if the entry already had no references.
    pub(crate) fn decrement(&mut self) -> Option<RefCount> {
        self.refcount = self.refcount.checked_sub(1)?;
        Some(self.refcount)
    }

    /// Drop every reference at once.
    pub(crate) fn force_zero(&mut self) {
        self.refcount = 0;
    }

    /// Free the allocation using the form recorded on this entry.
    ///
    /// # Safety
    /// The entry must have been removed from its registry, no handle may
    /// dereference the allocation afterwards, and `ptr` must originate from
    /// `Box::into_raw` with the shape described by `kind`.
    pub(crate) unsafe fn release(self) {
        if self.ptr.is_null() {
            return;
        }
        match self.kind {
            AllocKind::Scalar => drop(Box::from_raw(self.ptr)),
            AllocKind::Array(len) => {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.ptr, len)))
            }
        }
    }
}

impl<T> Clone for AllocationEntry<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AllocationEntry<T> {}

impl<T> fmt::Debug for AllocationEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationEntry")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("refcount", &self.refcount)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Tracked(Rc<Cell<usize>>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn test_alloc_kind_element_count() {
        assert_eq!(AllocKind::Scalar.element_count(), 1);
        assert_eq!(AllocKind::Array(5).element_count(), 5);
        assert!(!AllocKind::Scalar.is_array());
        assert!(AllocKind::Array(0).is_array());
    }

    #[test]
    fn test_alloc_kind_display() {
        assert_eq!(AllocKind::Scalar.to_string(), "scalar");
        assert_eq!(AllocKind::Array(3).to_string(), "array[3]");
    }

    #[test]
    fn test_entry_refcount() {
        let mut entry = AllocationEntry::<u8>::new(ptr::null_mut(), AllocKind::Scalar);
        assert_eq!(entry.refcount(), 1);
        assert_eq!(entry.increment(), 2);
        assert_eq!(entry.decrement(), Some(1));
        assert_eq!(entry.decrement(), Some(0));
        assert!(entry.is_garbage());
        assert_eq!(entry.decrement(), None);
        assert_eq!(entry.refcount(), 0);
    }

    #[test]
    fn test_entry_force_zero() {
        let mut entry = AllocationEntry::<u8>::new(ptr::null_mut(), AllocKind::Scalar);
        entry.increment();
        entry.increment();
        entry.force_zero();
        assert!(entry.is_garbage());
    }

    #[test]
    fn test_release_scalar() {
        let drops = Rc::new(Cell::new(0));
        let ptr = Box::into_raw(Box::new(Tracked(drops.clone())));
        let entry = AllocationEntry::new(ptr, AllocKind::Scalar);
        unsafe { entry.release() };
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_release_array_drops_every_element() {
        let drops = Rc::new(Cell::new(0));
        let values: Box<[Tracked]> = (0..4).map(|_| Tracked(drops.clone())).collect();
        let ptr = Box::into_raw(values) as *mut Tracked;
        let entry = AllocationEntry::new(ptr, AllocKind::Array(4));
        assert!(entry.is_array());
        assert_eq!(entry.element_count(), 4);
        unsafe { entry.release() };
        assert_eq!(drops.get(), 4);
    }

    #[test]
    fn test_release_null_is_noop() {
        let entry = AllocationEntry::<String>::new(ptr::null_mut(), AllocKind::Scalar);
        assert!(entry.is_null());
        assert_eq!(entry.address(), 0);
        unsafe { entry.release() };
    }

    #[test]
    fn test_entry_debug_shows_hex_address() {
        let entry = AllocationEntry::<u8>::new(ptr::null_mut(), AllocKind::Array(2));
        let debug = format!("{:?}", entry);
        assert!(debug.contains("0x0"));
        assert!(debug.contains("Array(2)"));
    }
}
