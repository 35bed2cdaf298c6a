use crate::heap::{DeferredHeap, HeapConfig};
use crate::ptr::{Root, Trace};

thread_local! {
    /// The calling thread's deferred heap.
    ///
    /// Tracked pointers must find their heap during registration without an
    /// explicit argument, so the heap is a per-thread singleton: created on
    /// first use, torn down (running every remaining destructor) when the
    /// thread exits. One heap per thread is also what makes the
    /// single-owner, no-locking model literal.
    static HEAP: DeferredHeap = DeferredHeap::new(HeapConfig::default());
}

/// Run `f` with the calling thread's deferred heap.
pub fn with_heap<R>(f: impl FnOnce(&DeferredHeap) -> R) -> R {
    HEAP.with(f)
}

/// As [`with_heap`], but `None` once the heap has been torn down. Used by
/// tracked-pointer drops, which may legitimately run during thread exit
/// after the heap is gone.
pub(crate) fn try_with_heap<R>(f: impl FnOnce(&DeferredHeap) -> R) -> Option<R> {
    HEAP.try_with(f).ok()
}

/// Allocate `value` on the calling thread's heap; null on out-of-memory.
pub fn make<T: Trace>(value: T) -> Root<T> {
    with_heap(|h| h.make(value))
}

/// Allocate `n` default-constructed objects; null on out-of-memory.
pub fn make_array<T: Trace + Default>(n: usize) -> Root<T> {
    with_heap(|h| h.make_array(n))
}

/// Collect the calling thread's heap.
pub fn collect() {
    with_heap(DeferredHeap::collect);
}

pub fn set_collect_before_expand(enable: bool) {
    with_heap(|h| h.set_collect_before_expand(enable));
}

pub fn collect_before_expand() -> bool {
    with_heap(DeferredHeap::collect_before_expand)
}

/// Emit the heap's component enumeration through `tracing`.
pub fn debug_print() {
    with_heap(DeferredHeap::debug_print);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_policy_bit_round_trips() {
        let initial = collect_before_expand();
        set_collect_before_expand(!initial);
        assert_eq!(collect_before_expand(), !initial);
        set_collect_before_expand(initial);
        assert_eq!(collect_before_expand(), initial);
    }

    #[test]
    fn collect_on_an_empty_heap_is_fine() {
        collect();
        collect();
    }
}
