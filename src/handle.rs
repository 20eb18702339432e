//! # Counted Handles
//!
//! [`Gc<T>`] is the user-facing smart pointer. It refers to one managed
//! allocation (a single value or an array) tracked by a [`Registry`], and every
//! lifecycle event of the handle is mirrored into that registry:
//!
//! | Event | Registry effect |
//! |-------|-----------------|
//! | construct | register or increment |
//! | `clone` | increment (entry must exist) |
//! | `assign_raw` | register or increment new, decrement old, sweep |
//! | `assign` / `clone_from` | increment new, decrement old, sweep |
//! | drop | decrement, sweep |
//!
//! Reassigning or dropping the last handle of an allocation frees it before the
//! call returns.
//!
//! Handles are neither `Send` nor `Sync`: the counting protocol is
//! single-threaded.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, Index};
use std::ptr;
use std::slice;
use std::sync::Arc;

use crate::entry::{Address, AllocKind, RefCount};
use crate::lifecycle;
use crate::registry::Registry;

/// A reference-counted handle to a managed allocation.
///
/// A handle is either bound to an allocation or unbound (null address). The
/// cached allocation form mirrors the registry entry, so dereferencing,
/// indexing and iteration never need a registry lookup.
///
/// ```rust
/// use std::sync::Arc;
/// use refgc::{Gc, Registry};
///
/// let registry = Arc::new(Registry::new());
/// let a = Gc::new(&registry, 123);
/// let b = a.clone();
/// assert_eq!(a.refcount(), 2);
///
/// drop(b);
/// assert_eq!(*a, 123);
/// drop(a);
/// assert!(registry.is_empty());
/// ```
pub struct Gc<T> {
    registry: Arc<Registry<T>>,
    ptr: *mut T,
    kind: AllocKind,
    _marker: PhantomData<T>,
}

impl<T: 'static> Gc<T> {
    /// Allocate `value` and bind a new handle to it.
    pub fn new(registry: &Arc<Registry<T>>, value: T) -> Self {
        let ptr = Box::into_raw(Box::new(value));
        // Freshly boxed, owned by nothing else.
        unsafe { Self::from_raw(registry, ptr) }
    }

    /// Move `values` into a managed array and bind a new handle to it.
    pub fn from_vec(registry: &Arc<Registry<T>>, values: Vec<T>) -> Self {
        Self::from_boxed_slice(registry, values.into_boxed_slice())
    }

    /// Take over a boxed slice as a managed array.
    pub fn from_boxed_slice(registry: &Arc<Registry<T>>, values: Box<[T]>) -> Self {
        let len = values.len();
        let ptr = Box::into_raw(values) as *mut T;
        // Freshly released from its box, with the matching length.
        unsafe { Self::from_raw_array(registry, ptr, len) }
    }

    /// Create an unbound handle.
    ///
    /// The null address is still registered so the handle's eventual release
    /// balances out.
    pub fn null(registry: &Arc<Registry<T>>) -> Self {
        // Null owns nothing and is never freed.
        unsafe { Self::bind(registry, ptr::null_mut(), AllocKind::Scalar) }
    }

    /// Bind a handle to a raw scalar allocation.
    ///
    /// # Safety
    /// `ptr` must be null, already managed by `registry`, or come from
    /// `Box::<T>::into_raw` with no other owner. The registry frees it once
    /// the last handle lets go.
    pub unsafe fn from_raw(registry: &Arc<Registry<T>>, ptr: *mut T) -> Self {
        Self::bind(registry, ptr, AllocKind::Scalar)
    }

    /// Bind a handle to a raw array allocation of `len` elements.
    ///
    /// # Safety
    /// `ptr` must be already managed by `registry`, or come from
    /// `Box::<[T]>::into_raw` of a slice of exactly `len` elements with no
    /// other owner.
    pub unsafe fn from_raw_array(registry: &Arc<Registry<T>>, ptr: *mut T, len: usize) -> Self {
        Self::bind(registry, ptr, AllocKind::Array(len))
    }

    unsafe fn bind(registry: &Arc<Registry<T>>, ptr: *mut T, kind: AllocKind) -> Self {
        lifecycle::enroll(registry);
        let entry = registry.register_or_increment(ptr, kind);
        Self {
            registry: Arc::clone(registry),
            ptr,
            kind: entry.kind(),
            _marker: PhantomData,
        }
    }

    /// Rebind this handle to a raw scalar allocation.
    ///
    /// Does nothing if the handle already refers to `ptr`. Otherwise the new
    /// reference is taken, then the old one is released (and freed if it was
    /// the last).
    ///
    /// # Safety
    /// Same contract as [`Gc::from_raw`].
    pub unsafe fn assign_raw(&mut self, ptr: *mut T) {
        self.rebind_raw(ptr, AllocKind::Scalar);
    }

    /// Rebind this handle to a raw array allocation of `len` elements.
    ///
    /// # Safety
    /// Same contract as [`Gc::from_raw_array`].
    pub unsafe fn assign_raw_array(&mut self, ptr: *mut T, len: usize) {
        self.rebind_raw(ptr, AllocKind::Array(len));
    }

    /// Allocate `value` and rebind this handle to it.
    pub fn assign_new(&mut self, value: T) {
        let ptr = Box::into_raw(Box::new(value));
        // A fresh allocation can never equal the current address.
        unsafe { self.rebind_raw(ptr, AllocKind::Scalar) };
    }

    unsafe fn rebind_raw(&mut self, ptr: *mut T, kind: AllocKind) {
        if ptr == self.ptr {
            return;
        }
        let entry = self.registry.register_or_increment(ptr, kind);
        self.release();
        self.ptr = ptr;
        self.kind = entry.kind();
    }
}

impl<T> Gc<T> {
    /// Rebind this handle to the allocation `other` refers to.
    ///
    /// Does nothing if both already refer to the same allocation. Otherwise
    /// `other`'s entry is incremented, then the old reference is released.
    /// The handle adopts `other`'s registry.
    ///
    /// # Panics
    /// Panics with a lookup failure if `other`'s allocation is not registered.
    /// The handle is left unchanged and no entry is created.
    pub fn assign(&mut self, other: &Gc<T>) {
        if Self::ptr_eq(self, other) {
            return;
        }
        other.registry.increment(other.address());
        self.release();
        self.registry = Arc::clone(&other.registry);
        self.ptr = other.ptr;
        self.kind = other.kind;
    }

    /// Drop this handle's share of its entry and collect.
    fn release(&self) {
        // The handle owns exactly one reference to its entry.
        unsafe { self.registry.decrement(self.address()) };
        self.registry.sweep();
    }

    /// Check if two handles refer to the same allocation in the same registry.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.ptr == other.ptr && Arc::ptr_eq(&this.registry, &other.registry)
    }

    /// Get the address this handle refers to.
    pub fn address(&self) -> Address {
        self.ptr as Address
    }

    /// Get the raw pointer, unchanged.
    pub fn as_ptr(&self) -> *mut T {
        self.ptr
    }

    /// Check if the handle is unbound.
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Get the allocation form.
    pub fn kind(&self) -> AllocKind {
        self.kind
    }

    /// Check if the handle refers to an array.
    pub fn is_array(&self) -> bool {
        self.kind.is_array()
    }

    /// Number of elements reachable through this handle.
    ///
    /// Zero for an unbound handle, one for a scalar.
    pub fn len(&self) -> usize {
        if self.ptr.is_null() {
            0
        } else {
            self.kind.element_count()
        }
    }

    /// Check if no element is reachable through this handle.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current reference count of the allocation.
    pub fn refcount(&self) -> RefCount {
        self.registry.refcount(self.address()).unwrap_or(0)
    }

    /// Get the registry this handle counts in.
    pub fn registry(&self) -> &Arc<Registry<T>> {
        &self.registry
    }

    /// Get the first element, or `None` if nothing is reachable.
    pub fn get(&self) -> Option<&T> {
        self.as_slice().first()
    }

    /// Get the element at `index`, or `None` if it is out of range.
    pub fn at(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    /// Get the element at `index` without a bounds check.
    ///
    /// # Safety
    /// `index` must be less than [`Gc::len`].
    pub unsafe fn at_unchecked(&self, index: usize) -> &T {
        &*self.ptr.add(index)
    }

    /// View every reachable element as a slice.
    pub fn as_slice(&self) -> &[T] {
        if self.ptr.is_null() {
            return &[];
        }
        // A bound handle keeps its entry (and so its allocation) alive.
        unsafe { slice::from_raw_parts(self.ptr, self.kind.element_count()) }
    }

    /// View every reachable element as a mutable slice.
    ///
    /// # Safety
    /// Other handles may alias the same allocation. No reference obtained
    /// through any of them may be used while the returned slice is alive.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [T] {
        if self.ptr.is_null() {
            return &mut [];
        }
        slice::from_raw_parts_mut(self.ptr, self.kind.element_count())
    }

    /// Iterate over the reachable elements in address order.
    ///
    /// Covers `[address, address + len)`. Each call starts a fresh pass.
    pub fn iter(&self) -> slice::Iter<'_, T> {
        self.as_slice().iter()
    }
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        self.registry.increment(self.address());
        Self {
            registry: Arc::clone(&self.registry),
            ptr: self.ptr,
            kind: self.kind,
            _marker: PhantomData,
        }
    }

    fn clone_from(&mut self, source: &Self) {
        self.assign(source);
    }
}

impl<T> Drop for Gc<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T> Deref for Gc<T> {
    type Target = T;

    /// # Panics
    /// Panics if the handle is unbound or refers to an empty array.
    fn deref(&self) -> &T {
        match self.get() {
            Some(value) => value,
            None => panic!("dereferenced a handle with no element at {:#x}", self.address()),
        }
    }
}

impl<T> Index<usize> for Gc<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.as_slice()[index]
    }
}

impl<'a, T> IntoIterator for &'a Gc<T> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gc")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("kind", &self.kind)
            .finish()
    }
}

impl<T> fmt::Pointer for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.ptr, f)
    }
}
