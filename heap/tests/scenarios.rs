//! End-to-end scenarios for the deferred heap.
//!
//! Every test runs on its own thread (the libtest default), so each one
//! starts with a fresh thread-local heap and exercises teardown on exit.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use heap::{
    collect, make, make_array, set_collect_before_expand, with_heap, Adopter,
    DeferredPtr, Root, Trace,
};

struct Node {
    next: DeferredPtr<Node>,
    drops: Rc<Cell<usize>>,
}

impl Node {
    fn new(drops: &Rc<Cell<usize>>) -> Self {
        Self {
            next: DeferredPtr::null(),
            drops: drops.clone(),
        }
    }
}

// SAFETY: `next` is the only tracked pointer and stays at its field.
unsafe impl Trace for Node {
    fn trace(&self, adopter: &mut Adopter<'_>) {
        adopter.slot(&self.next);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

#[test]
fn linear_chain() {
    let drops = Rc::new(Cell::new(0));
    let r = make(Node::new(&drops));
    r.get().next.set(&make(Node::new(&drops)));
    let second = r.get().next.rooted();
    second.get().next.set(&make(Node::new(&drops)));

    drop(second);
    collect();
    assert_eq!(drops.get(), 0, "all three nodes hang off r");

    // Cut the chain after the second node: the third becomes garbage.
    r.get().next.rooted().get().next.clear();
    collect();
    assert_eq!(drops.get(), 1);

    drop(r);
    collect();
    assert_eq!(drops.get(), 3);
}

#[test]
fn simple_cycle_reads_null_in_both_destructors() {
    struct Peer {
        peer: DeferredPtr<Peer>,
        partner_was_null: Rc<Cell<Option<bool>>>,
    }
    // SAFETY: `peer` is the only tracked pointer.
    unsafe impl Trace for Peer {
        fn trace(&self, adopter: &mut Adopter<'_>) {
            adopter.slot(&self.peer);
        }
    }
    impl Drop for Peer {
        fn drop(&mut self) {
            self.partner_was_null.set(Some(self.peer.is_null()));
        }
    }

    let a_obs = Rc::new(Cell::new(None));
    let b_obs = Rc::new(Cell::new(None));
    {
        let a = make(Peer {
            peer: DeferredPtr::null(),
            partner_was_null: a_obs.clone(),
        });
        let b = make(Peer {
            peer: DeferredPtr::null(),
            partner_was_null: b_obs.clone(),
        });
        a.get().peer.set(&b);
        b.get().peer.set(&a);
        // Both roots go out of scope here.
    }
    collect();
    assert_eq!(a_obs.get(), Some(true));
    assert_eq!(b_obs.get(), Some(true));
}

#[test]
fn int_array_roundtrip_and_page_reuse() {
    let arr = make_array::<Cell<i32>>(10);
    for i in 0..10 {
        arr.index(i).set(i as i32);
    }
    for i in 0..10 {
        assert_eq!(arr.index(i).get(), i as i32);
    }
    let pages = with_heap(|h| h.page_count());
    assert_eq!(with_heap(|h| h.destructor_count()), 0, "trivial elements");

    drop(arr);
    collect();

    // The freed bytes satisfy an identical request without growing the heap.
    let again = make_array::<Cell<i32>>(10);
    assert!(!again.is_null());
    assert_eq!(with_heap(|h| h.page_count()), pages);
}

#[test]
fn collect_before_expand_reuses_the_page() {
    set_collect_before_expand(true);

    // Fill the first page exactly: a u64 allocation takes two 8-byte chunks
    // (8 bytes + the arithmetic pad), and the page opens at 4096 bytes.
    let mut roots: Vec<Root<u64>> = (0..256).map(|i| make(i as u64)).collect();
    assert_eq!(with_heap(|h| h.page_count()), 1);
    for (i, r) in roots.iter().enumerate() {
        assert_eq!(*r.get(), i as u64);
    }

    // Drop half the roots; their storage is garbage but not yet reclaimed.
    roots.truncate(128);

    // The next make finds no free run, collects, and succeeds in place.
    let extra = make(9999u64);
    assert!(!extra.is_null());
    assert_eq!(*extra.get(), 9999);
    assert_eq!(with_heap(|h| h.page_count()), 1, "no page was added");
}

#[test]
fn deep_cycle_marks_and_reclaims() {
    const N: usize = 1000;
    let drops = Rc::new(Cell::new(0));

    let nodes: Vec<Root<Node>> =
        (0..N).map(|_| make(Node::new(&drops))).collect();
    for i in 0..N {
        nodes[i].get().next.set(&nodes[(i + 1) % N]);
    }

    // Keep only the head root: marking must walk the whole ring, one level
    // per hop.
    let head = nodes[0].clone();
    drop(nodes);
    collect();
    assert_eq!(drops.get(), 0, "the ring is reachable through its head");

    drop(head);
    collect();
    assert_eq!(drops.get(), N);
}

#[test]
fn teardown_runs_every_destructor() {
    struct Loud {
        peer: DeferredPtr<Loud>,
        drops: Arc<AtomicUsize>,
        peer_was_null: Arc<AtomicBool>,
    }
    // SAFETY: `peer` is the only tracked pointer.
    unsafe impl Trace for Loud {
        fn trace(&self, adopter: &mut Adopter<'_>) {
            adopter.slot(&self.peer);
        }
    }
    impl Drop for Loud {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::Relaxed);
            if !self.peer.is_null() {
                self.peer_was_null.store(false, Ordering::Relaxed);
            }
        }
    }

    let drops = Arc::new(AtomicUsize::new(0));
    let nulled = Arc::new(AtomicBool::new(true));
    let (drops2, nulled2) = (drops.clone(), nulled.clone());

    std::thread::spawn(move || {
        // Live roots and a live cycle at thread exit; no collect is called.
        let a = make(Loud {
            peer: DeferredPtr::null(),
            drops: drops2.clone(),
            peer_was_null: nulled2.clone(),
        });
        let b = make(Loud {
            peer: DeferredPtr::null(),
            drops: drops2.clone(),
            peer_was_null: nulled2.clone(),
        });
        a.get().peer.set(&b);
        b.get().peer.set(&a);
        let _keep = make(Loud {
            peer: DeferredPtr::null(),
            drops: drops2,
            peer_was_null: nulled2,
        });
        std::mem::forget((a, b));
    })
    .join()
    .expect("worker thread");

    // Heap teardown destroyed all three, each seeing nulled edges.
    assert_eq!(drops.load(Ordering::Relaxed), 3);
    assert!(nulled.load(Ordering::Relaxed));
}

#[test]
fn destructor_may_allocate_during_collect() {
    struct Spawner {
        note: Rc<Cell<u64>>,
    }
    // SAFETY: no tracked pointers inside.
    unsafe impl Trace for Spawner {}
    impl Drop for Spawner {
        fn drop(&mut self) {
            let fresh = make(41u64);
            self.note.set(*fresh.get() + 1);
        }
    }

    let note = Rc::new(Cell::new(0));
    drop(make(Spawner { note: note.clone() }));
    collect();
    assert_eq!(note.get(), 42);
}
