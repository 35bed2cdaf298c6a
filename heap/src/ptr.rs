use std::cell::Cell;
use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr;

use crate::global::{try_with_heap, with_heap};
use crate::heap::DeferredHeap;

#[cfg(debug_assertions)]
use page::Found;

// ── The untyped tracked slot ──────────────────────────────────────────

/// The untyped payload of every tracked pointer.
///
/// The heap records slots by the address of this struct. The raw value lives
/// in a `Cell` because the collector is a privileged mutator: Phase 3 nulls
/// condemned edges through shared references, regardless of how immutable the
/// surrounding object looks to user code.
#[repr(transparent)]
pub(crate) struct RawSlot {
    raw: Cell<*mut u8>,
}

impl RawSlot {
    fn new(p: *mut u8) -> Self {
        Self { raw: Cell::new(p) }
    }

    #[inline]
    pub(crate) fn get(&self) -> *mut u8 {
        self.raw.get()
    }

    /// Null the slot. Collector and teardown use this to sever edges.
    #[inline]
    pub(crate) fn reset(&self) {
        self.raw.set(ptr::null_mut());
    }
}

// ── PtrSource: read-only address sources ──────────────────────────────

mod sealed {
    pub trait Sealed {}
}

/// Anything a tracked edge can be pointed at: another edge slot or a root.
/// Read-only; sealed so raw values can only originate inside the heap.
pub trait PtrSource<T>: sealed::Sealed {
    fn raw_value(&self) -> *mut T;
}

impl<T> sealed::Sealed for DeferredPtr<T> {}

impl<T> PtrSource<T> for DeferredPtr<T> {
    fn raw_value(&self) -> *mut T {
        self.as_raw()
    }
}

impl<T> sealed::Sealed for Root<T> {}

impl<T> PtrSource<T> for Root<T> {
    fn raw_value(&self) -> *mut T {
        self.as_raw()
    }
}

// ── DeferredPtr<T>: the in-place tracked pointer ──────────────────────

/// A tracked pointer slot, embedded as a field inside heap objects.
///
/// A slot starts out *inert*: it holds a raw value but the heap does not know
/// about it. It becomes tracked when adopted: visited by its containing
/// object's [`Trace`] impl as `make` places the object into page memory. From
/// then on its own address identifies it to the collector, so an adopted slot
/// must never move; edges are redirected in place with [`DeferredPtr::set`]
/// and [`DeferredPtr::clear`].
///
/// A slot cannot be dereferenced directly: promote it with
/// [`DeferredPtr::rooted`] first. The resulting [`Root`] keeps the target
/// reachable while it is borrowed, which is what makes the borrow sound.
#[repr(transparent)]
pub struct DeferredPtr<T> {
    slot: RawSlot,
    _marker: PhantomData<*mut T>,
}

impl<T> DeferredPtr<T> {
    /// A null slot, inert until adopted.
    #[must_use]
    pub fn null() -> Self {
        Self::from_raw(ptr::null_mut())
    }

    /// Only the heap may produce a tracked pointer from a raw address.
    pub(crate) fn from_raw(p: *mut T) -> Self {
        Self {
            slot: RawSlot::new(p.cast::<u8>()),
            _marker: PhantomData,
        }
    }

    pub(crate) fn slot_addr(&self) -> *const RawSlot {
        &self.slot
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.slot.get().is_null()
    }

    #[inline]
    pub fn as_raw(&self) -> *mut T {
        self.slot.get().cast::<T>()
    }

    /// Null this edge. The slot stays registered as itself.
    pub fn clear(&self) {
        self.slot.reset();
    }

    /// Redirect this edge at `target`. Like assignment in spirit: only the
    /// raw value is copied, identity and registration are unchanged.
    pub fn set(&self, target: &impl PtrSource<T>) {
        self.slot.raw.set(target.raw_value().cast::<u8>());
    }

    /// Promote this edge to an owning [`Root`].
    ///
    /// Inside a destructor running during collection this is still sound: an
    /// edge into the condemned set already reads null by the time any
    /// destructor runs.
    #[must_use]
    pub fn rooted(&self) -> Root<T> {
        Root::from_raw(self.as_raw())
    }

    // ── Checked arithmetic ────────────────────────────────────────────

    /// Step this pointer by `offset` elements within its allocation; the
    /// `+=`/`-=` of tracked pointers. Forming the one-past-the-end address is
    /// allowed; leaving the allocation is a programming error, caught in
    /// debug builds.
    pub fn advance(&self, offset: isize) {
        let target = self.arith_target(offset);
        self.slot.raw.set(target.cast::<u8>());
    }

    /// Element distance `self - other`; both must point into one allocation.
    pub fn offset_from(&self, other: &impl PtrSource<T>) -> isize {
        assert!(mem::size_of::<T>() > 0, "arithmetic on a zero-sized type");
        let other = other.raw_value();
        if self.as_raw() == other {
            return 0;
        }
        #[cfg(debug_assertions)]
        {
            assert!(
                !self.is_null() && !other.is_null(),
                "bad tracked-pointer arithmetic: can't subtract a null pointer"
            );
            check_same_allocation(
                other.cast::<u8>(),
                self.as_raw().cast::<u8>(),
                mem::size_of::<T>(),
            );
        }
        let diff = self.as_raw() as isize - other as isize;
        diff / mem::size_of::<T>() as isize
    }

    /// Compute `self + offset` elements, debug-checking the result stays
    /// within this allocation (one-past-the-end included).
    fn arith_target(&self, offset: isize) -> *mut T {
        assert!(mem::size_of::<T>() > 0, "arithmetic on a zero-sized type");
        let byte_offset = offset.wrapping_mul(mem::size_of::<T>() as isize);
        let target =
            (self.as_raw() as usize).wrapping_add_signed(byte_offset) as *mut T;
        #[cfg(debug_assertions)]
        {
            assert!(
                !self.is_null(),
                "bad tracked-pointer arithmetic: can't offset a null pointer"
            );
            check_same_allocation(
                self.as_raw().cast::<u8>(),
                target.cast::<u8>(),
                mem::size_of::<T>(),
            );
        }
        target
    }
}

/// Debug-assert that `from` points into a heap allocation and `to` points
/// into the same allocation of the same page (or is its one-past-the-end).
#[cfg(debug_assertions)]
fn check_same_allocation(from: *const u8, to: *const u8, elem_size: usize) {
    // Skipped when the heap is already torn down.
    try_with_heap(|h| {
        let this = h
            .find_page_info(from)
            .expect("corrupt tracked pointer, not pointing into the deferred heap");
        assert!(
            this.info.found > Found::Unallocated,
            "corrupt tracked pointer, pointing to unallocated memory"
        );
        let that = h.find_page_info(to);
        let that = match that {
            Some(that) if that.page_index == this.page_index => that,
            _ => panic!("bad tracked-pointer arithmetic: attempt to leave the page"),
        };
        let one_past_start = this.info.found == Found::AllocatedStart
            && (to as usize).wrapping_sub(from as usize) <= elem_size;
        assert!(
            one_past_start
                || (that.info.start_location == this.info.start_location
                    && that.info.found > Found::Unallocated),
            "bad tracked-pointer arithmetic: attempt to leave the allocation"
        );
    });
}

impl<T> Clone for DeferredPtr<T> {
    /// The copy carries the raw value but is inert until adopted in its own
    /// right (moved into `make` inside a new object).
    fn clone(&self) -> Self {
        Self::from_raw(self.as_raw())
    }
}

impl<T> Default for DeferredPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> Drop for DeferredPtr<T> {
    fn drop(&mut self) {
        let addr = self.slot_addr();
        // No-op once the heap itself is gone (slots outliving the heap) or
        // while it is tearing down and mass-resetting its tracking lists.
        try_with_heap(|h| h.deregister(addr));
    }
}

impl<T> PartialEq for DeferredPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.as_raw() == other.as_raw()
    }
}

impl<T> Eq for DeferredPtr<T> {}

impl<T> PartialOrd for DeferredPtr<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for DeferredPtr<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.as_raw() as usize).cmp(&(other.as_raw() as usize))
    }
}

impl<T> fmt::Debug for DeferredPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeferredPtr({:p})", self.as_raw())
    }
}

// ── Root<T>: the movable owner handle ─────────────────────────────────

/// An owning, movable handle to a deferred-heap object; what `make` returns
/// and what user code keeps on the stack.
///
/// Rust moves are untracked memcpys, so the registered slot cannot live in
/// the handle itself: `Root` boxes its slot, giving it a stable address for
/// the root set while the handle moves freely. As long as a `Root` is alive
/// its target (and everything reachable from it) survives every collection.
///
/// Unlike an embedded [`DeferredPtr`], a root is redirected only through
/// `&mut self`. That is what makes [`Root::get`] sound: while the returned
/// borrow lives, the root cannot be pointed away from the target it is
/// keeping alive.
pub struct Root<T> {
    slot: Box<DeferredPtr<T>>,
}

impl<T> Root<T> {
    /// A registered null root.
    #[must_use]
    pub fn null() -> Self {
        Self::from_raw(ptr::null_mut())
    }

    pub(crate) fn from_raw(p: *mut T) -> Self {
        let slot = Box::new(DeferredPtr::from_raw(p));
        with_heap(|h| h.enregister(slot.slot_addr()));
        Root { slot }
    }

    /// Form a root aliasing an existing object (interior references).
    ///
    /// # Safety
    ///
    /// If `target` is not deferred-heap storage the caller must guarantee it
    /// outlives the handle; the collector will simply never consider it.
    #[must_use]
    pub unsafe fn alias(target: &T) -> Self {
        Self::from_raw(target as *const T as *mut T)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.slot.is_null()
    }

    #[inline]
    pub fn as_raw(&self) -> *mut T {
        self.slot.as_raw()
    }

    /// Borrow the target. The null case is a programming error.
    #[must_use]
    pub fn get(&self) -> &T {
        assert!(!self.is_null(), "attempt to dereference null");
        // SAFETY: a non-null root points at a live allocation, this root
        // keeps it reachable, and redirecting the root needs `&mut self`, so
        // the target stays live for as long as the borrow holds it in place.
        unsafe { &*self.as_raw() }
    }

    #[must_use]
    pub fn try_get(&self) -> Option<&T> {
        if self.is_null() {
            None
        } else {
            // SAFETY: as in get().
            Some(unsafe { &*self.as_raw() })
        }
    }

    /// Null this root's edge.
    pub fn clear(&mut self) {
        self.slot.clear();
    }

    /// Redirect this root at `target`. Only the raw value is copied; the
    /// root's registration is unchanged.
    pub fn set(&mut self, target: &impl PtrSource<T>) {
        self.slot.set(target);
    }

    /// Step this root by `offset` elements within its allocation.
    pub fn advance(&mut self, offset: isize) {
        self.slot.advance(offset);
    }

    /// Element distance `self - other`; both must point into one allocation.
    pub fn offset_from(&self, other: &impl PtrSource<T>) -> isize {
        self.slot.offset_from(other)
    }

    /// Borrow element `i` of an array allocation; the `[i]` of tracked
    /// pointers. Bounds are debug-checked through the page bookkeeping.
    #[must_use]
    pub fn index(&self, i: usize) -> &T {
        #[cfg(debug_assertions)]
        {
            let mut tmp = self.clone();
            tmp.advance(i as isize);
            assert!(!tmp.is_null(), "attempt to dereference null");
            // SAFETY: the temporary's checked arithmetic vouched for the
            // element address; the borrow keeps self (the root) alive.
            return unsafe { &*tmp.as_raw() };
        }
        #[cfg(not(debug_assertions))]
        // SAFETY: unchecked in release builds, like all tracked arithmetic.
        unsafe {
            &*self.as_raw().add(i)
        }
    }

    /// A new root at `self + offset` elements.
    #[must_use]
    pub fn offset(&self, offset: isize) -> Root<T> {
        let mut r = self.clone();
        r.advance(offset);
        r
    }

    /// Reinterpret the target type; the converting-copy of tracked pointers.
    /// `cast::<core::ffi::c_void>()` gives the erased form.
    ///
    /// # Safety
    ///
    /// The target must actually be a `U` (or the root never dereferenced).
    #[must_use]
    pub unsafe fn cast<U>(&self) -> Root<U> {
        Root::from_raw(self.as_raw().cast::<U>())
    }
}

impl<T> Clone for Root<T> {
    fn clone(&self) -> Self {
        Self::from_raw(self.as_raw())
    }
}

impl<T> Default for Root<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> PartialEq for Root<T> {
    fn eq(&self, other: &Self) -> bool {
        self.as_raw() == other.as_raw()
    }
}

impl<T> Eq for Root<T> {}

impl<T> PartialOrd for Root<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Root<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.as_raw() as usize).cmp(&(other.as_raw() as usize))
    }
}

impl<T> fmt::Debug for Root<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Root({:p})", self.as_raw())
    }
}

// ── Trace: the adoption walk ──────────────────────────────────────────

/// Enumerates the tracked-pointer slots embedded in a value.
///
/// `make` writes a value into page memory and then walks it with its `Trace`
/// impl so every embedded slot gets registered at its final address; the heap
/// classifies each visited slot as a root or an in-page edge by that address.
/// The default body declares "no edges", which is correct for leaf data.
///
/// # Safety
///
/// An impl must visit every `DeferredPtr` owned by the value, each exactly
/// once, and all visited slots must stay at their adopted addresses for the
/// value's whole lifetime: no slots inside growable containers, and no
/// wholesale replacement of an adopted value through interior mutability.
/// Edges are redirected with [`DeferredPtr::set`]; data lives in `Cell`s.
pub unsafe trait Trace {
    #[allow(unused_variables)]
    fn trace(&self, adopter: &mut Adopter<'_>) {}
}

/// Registers slots discovered by a [`Trace`] walk with the heap.
pub struct Adopter<'h> {
    heap: &'h DeferredHeap,
}

impl<'h> Adopter<'h> {
    pub(crate) fn new(heap: &'h DeferredHeap) -> Self {
        Self { heap }
    }

    /// Adopt one embedded slot.
    pub fn slot<T>(&mut self, slot: &DeferredPtr<T>) {
        self.heap.enregister(slot.slot_addr());
    }
}

// SAFETY: a slot is its own single edge.
unsafe impl<T> Trace for DeferredPtr<T> {
    fn trace(&self, adopter: &mut Adopter<'_>) {
        adopter.slot(self);
    }
}

// SAFETY: fixed-size arrays keep their elements in place.
unsafe impl<T: Trace, const N: usize> Trace for [T; N] {
    fn trace(&self, adopter: &mut Adopter<'_>) {
        for element in self {
            element.trace(adopter);
        }
    }
}

// SAFETY: Copy types cannot own tracked slots (slots are not Copy), so a
// cell of one has no edges.
unsafe impl<T: Copy> Trace for Cell<T> {}

macro_rules! leaf_trace {
    ($($t:ty),* $(,)?) => {
        $(
            // SAFETY: no tracked pointers inside.
            unsafe impl Trace for $t {}
        )*
    };
}

leaf_trace!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::{make, make_array, with_heap};

    #[test]
    fn null_root_registers_and_deregisters() {
        let before = with_heap(|h| h.root_count());
        let r = Root::<u32>::null();
        assert!(r.is_null());
        assert_eq!(with_heap(|h| h.root_count()), before + 1);
        drop(r);
        assert_eq!(with_heap(|h| h.root_count()), before);
    }

    #[test]
    fn clone_copies_the_raw_value_into_a_fresh_registration() {
        let a = make(41u32);
        let b = a.clone();
        assert_eq!(a, b);
        assert_eq!(*b.get(), 41);
        drop(a);
        // The clone still reads the value; it holds its own registration.
        assert_eq!(*b.get(), 41);
    }

    #[test]
    fn set_and_clear_redirect_in_place() {
        let a = make(1u32);
        let b = make(2u32);
        let mut edge = Root::<u32>::null();
        edge.set(&a);
        assert_eq!(edge.as_raw(), a.as_raw());
        assert_eq!(*edge.get(), 1);
        edge.set(&b);
        assert_eq!(edge.as_raw(), b.as_raw());
        edge.clear();
        assert!(edge.is_null());
    }

    #[test]
    fn comparisons_follow_addresses() {
        let arr = make_array::<u32>(4);
        let second = arr.offset(1);
        assert!(arr < second);
        assert_eq!(second.offset_from(&arr), 1);
        assert_eq!(arr.offset_from(&second), -1);
        assert_ne!(arr, second);
        assert_eq!(arr, arr.clone());
    }

    #[test]
    fn array_walk_and_one_past_the_end() {
        let arr = make_array::<u64>(8);
        let mut p = arr.clone();
        for _ in 0..8 {
            p.advance(1);
        }
        // p is now one past the end: formable, comparable, not dereferenced.
        assert_eq!(p.offset_from(&arr), 8);
        p.advance(-8);
        assert_eq!(p, arr);
    }

    #[test]
    #[should_panic(expected = "attempt to dereference null")]
    fn null_deref_is_fatal() {
        let r = Root::<u32>::null();
        let _ = r.get();
    }

    #[test]
    #[should_panic(expected = "attempt to leave the allocation")]
    fn arithmetic_cannot_leave_the_allocation() {
        let arr = make_array::<u64>(4);
        let mut p = arr.clone();
        p.advance(5);
    }

    #[test]
    #[should_panic(expected = "can't offset a null pointer")]
    fn arithmetic_on_null_is_fatal() {
        let mut r = Root::<u32>::null();
        r.advance(1);
    }

    #[test]
    #[should_panic(expected = "attempt to leave the allocation")]
    fn subtraction_across_allocations_is_fatal() {
        let a = make(1u64);
        let b = make(2u64);
        let _ = a.offset_from(&b);
    }
}
