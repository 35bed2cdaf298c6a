//! A deferred heap: tracked pointers reclaimed by stop-the-world mark and
//! sweep.
//!
//! An opt-in alternative to reference counting for object graphs whose
//! topology may contain cycles. Objects are created with [`make`] /
//! [`make_array`] and referenced through tracked pointers; [`collect`] traces
//! from the roots, nulls every edge into the unreachable set (so destructors
//! never observe a dangling neighbour), then destroys and deallocates the
//! unreachable objects. Every destructor runs exactly once, never on a live
//! object.
//!
//! The heap is single-threaded by design: each thread owns its own instance,
//! reached through [`with_heap`], and every remaining destructor runs when
//! the owning thread exits.
//!
//! ```
//! use heap::{collect, make, Adopter, DeferredPtr, Trace};
//!
//! struct Node {
//!     next: DeferredPtr<Node>,
//!     value: u32,
//! }
//!
//! // SAFETY: `next` is the only tracked pointer and stays at its field.
//! unsafe impl Trace for Node {
//!     fn trace(&self, adopter: &mut Adopter<'_>) {
//!         adopter.slot(&self.next);
//!     }
//! }
//!
//! let a = make(Node { next: DeferredPtr::null(), value: 1 });
//! let b = make(Node { next: DeferredPtr::null(), value: 2 });
//! a.get().next.set(&b);
//! b.get().next.set(&a); // a cycle: refcounting would leak this
//! drop(a);
//! drop(b);
//! collect(); // both nodes are reclaimed
//! ```

mod dtors;
mod global;
mod heap;
mod ptr;

pub use dtors::Destructors;
pub use global::{
    collect, collect_before_expand, debug_print, make, make_array,
    set_collect_before_expand, with_heap,
};
pub use heap::{DeferredHeap, HeapConfig};
pub use ptr::{Adopter, DeferredPtr, PtrSource, Root, Trace};
