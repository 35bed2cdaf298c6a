use std::cell::RefCell;
use std::mem;
use std::ptr;

// ── Type-erased destructor records ────────────────────────────────────

/// One registered deferred destructor: `count` elements of `elem_size` bytes
/// starting at `base`, each destroyed by `drop_one`.
struct Entry {
    base: *mut u8,
    elem_size: usize,
    count: usize,
    drop_one: unsafe fn(*mut u8),
}

/// Monomorphised dropper stored as a plain function pointer, the cheap form
/// of type erasure.
unsafe fn drop_one_erased<T>(p: *mut u8) {
    // SAFETY: caller passes an address at which a live T was constructed.
    unsafe { ptr::drop_in_place(p.cast::<T>()) }
}

/// Registry of pending destructors for heap-constructed objects.
///
/// Trivially destructible types are never recorded, making the common case
/// free. A destructor may re-enter the heap arbitrarily, so both run paths
/// extract their entries and release the registry before invoking anything;
/// no registry state is read across a destructor call.
#[derive(Default)]
pub struct Destructors {
    entries: RefCell<Vec<Entry>>,
}

impl Destructors {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Record the destructor for `n` objects of type `T` constructed at `p`.
    /// A no-op when `T` needs no drop.
    pub fn store<T>(&self, p: *mut T, n: usize) {
        assert!(
            !p.is_null() && n > 0,
            "no object to register for destruction"
        );
        if !mem::needs_drop::<T>() {
            return;
        }
        self.entries.borrow_mut().push(Entry {
            base: p.cast::<u8>(),
            elem_size: mem::size_of::<T>(),
            count: n,
            drop_one: drop_one_erased::<T>,
        });
    }

    /// Whether a destructor is registered for `p`. Debug assertions only.
    pub fn is_stored<T>(&self, p: *const T) -> bool {
        !mem::needs_drop::<T>()
            || self
                .entries
                .borrow()
                .iter()
                .any(|e| e.base as *const u8 == p.cast::<u8>())
    }

    /// Run every registered destructor and clear the registry.
    pub fn run_all(&self) {
        let entries = self.entries.take();
        for e in &entries {
            for i in 0..e.count {
                // SAFETY: the entry was stored at construction time and the
                // object has not been destroyed since.
                unsafe { (e.drop_one)(e.base.add(i * e.elem_size)) };
            }
        }
    }

    /// Run the destructors of every entry whose base lies in `[begin, end)`,
    /// removing them from the registry. Returns whether any ran.
    pub fn run(&self, begin: *mut u8, end: *mut u8) -> bool {
        assert!(begin < end, "begin must precede end");
        // Move the matching entries to a local list first: the registry must
        // be consistent before any destructor gets a chance to re-enter.
        let to_run: Vec<Entry> = {
            let mut entries = self.entries.borrow_mut();
            let mut kept = Vec::with_capacity(entries.len());
            let mut out = Vec::new();
            for e in entries.drain(..) {
                let b = e.base as usize;
                if begin as usize <= b && b < end as usize {
                    out.push(e);
                } else {
                    kept.push(e);
                }
            }
            *entries = kept;
            out
        };

        let any = !to_run.is_empty();
        for e in &to_run {
            for i in 0..e.count {
                // SAFETY: as in run_all; the borrow above has been released,
                // so the destructor may freely re-enter the registry.
                unsafe { (e.drop_one)(e.base.add(i * e.elem_size)) };
            }
        }
        any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc, dealloc, Layout};
    use std::cell::Cell;
    use std::rc::Rc;

    struct Probe {
        hits: Rc<Cell<usize>>,
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.hits.set(self.hits.get() + 1);
        }
    }

    /// Place a Probe on the ordinary heap without an owning Box, so the
    /// registry is the only thing that will ever destroy it.
    fn raw_probe(hits: &Rc<Cell<usize>>) -> *mut Probe {
        let p = unsafe { alloc(Layout::new::<Probe>()) }.cast::<Probe>();
        assert!(!p.is_null());
        unsafe { p.write(Probe { hits: hits.clone() }) };
        p
    }

    fn free_probe(p: *mut Probe) {
        unsafe { dealloc(p.cast(), Layout::new::<Probe>()) };
    }

    #[test]
    fn trivial_types_are_not_recorded() {
        let d = Destructors::new();
        let mut x = 7u64;
        d.store(&mut x as *mut u64, 1);
        assert!(d.is_empty());
        assert!(d.is_stored(&x as *const u64));
    }

    #[test]
    fn run_all_destroys_everything_once() {
        let hits = Rc::new(Cell::new(0));
        let d = Destructors::new();
        let a = raw_probe(&hits);
        let b = raw_probe(&hits);
        d.store(a, 1);
        d.store(b, 1);
        assert_eq!(d.len(), 2);
        d.run_all();
        assert_eq!(hits.get(), 2);
        assert!(d.is_empty());
        free_probe(a);
        free_probe(b);
    }

    #[test]
    fn run_is_range_selective() {
        let hits = Rc::new(Cell::new(0));
        let d = Destructors::new();
        let a = raw_probe(&hits);
        let b = raw_probe(&hits);
        d.store(a, 1);
        d.store(b, 1);

        let begin = a.cast::<u8>();
        let end = unsafe { begin.add(mem::size_of::<Probe>()) };
        assert!(d.run(begin, end));
        assert_eq!(hits.get(), 1);
        assert_eq!(d.len(), 1);
        assert!(!d.is_stored(a));
        assert!(d.is_stored(b));

        // A range with no matching entries reports false.
        assert!(!d.run(begin, end));
        d.run_all();
        assert_eq!(hits.get(), 2);
        free_probe(a);
        free_probe(b);
    }

    #[test]
    fn array_entries_destroy_each_element() {
        let hits = Rc::new(Cell::new(0));
        let d = Destructors::new();
        let n = 4;
        let layout = Layout::array::<Probe>(n).unwrap();
        let p = unsafe { alloc(layout) }.cast::<Probe>();
        for i in 0..n {
            unsafe { p.add(i).write(Probe { hits: hits.clone() }) };
        }
        d.store(p, n);
        assert_eq!(d.len(), 1);
        d.run_all();
        assert_eq!(hits.get(), n);
        unsafe { dealloc(p.cast(), layout) };
    }
}
