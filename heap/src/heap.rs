use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::mem;
use std::ptr::NonNull;

use page::{Bitmap, ContainsInfo, Found, Page};

use crate::dtors::Destructors;
use crate::ptr::{Adopter, RawSlot, Root, Trace};

// ── Configuration ─────────────────────────────────────────────────────

/// Sizing and collection policy for a deferred heap.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Minimum byte size of a freshly opened page.
    pub min_page_bytes: usize,
    /// Minimum chunk (location) size within a page.
    pub min_chunk_bytes: usize,
    /// Headroom multiplier when sizing a page for the request that opens it;
    /// 1 + phi leaves room for roughly 1.6 further requests of the same
    /// shape before the heap has to expand again.
    pub growth_factor: f64,
    /// Run a collection before opening a new page when allocation fails.
    pub collect_before_expand: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            min_page_bytes: 4096,
            min_chunk_bytes: 4,
            growth_factor: 2.62,
            collect_before_expand: false,
        }
    }
}

impl HeapConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.min_page_bytes == 0 || self.min_chunk_bytes == 0 {
            return Err("sizes must be > 0");
        }
        if self.min_chunk_bytes < 4 {
            return Err("min_chunk_bytes must be at least 4");
        }
        if self.min_page_bytes < self.min_chunk_bytes {
            return Err("min_page_bytes must not be smaller than a chunk");
        }
        if !self.growth_factor.is_finite() || self.growth_factor < 1.0 {
            return Err("growth_factor must be at least 1.0");
        }
        Ok(())
    }
}

// ── Tracking records ──────────────────────────────────────────────────

/// A tracked pointer embedded in one of our pages, with its
/// distance-from-root level for the current mark pass (0 = unreached).
struct NonRoot {
    slot: *const RawSlot,
    level: usize,
}

/// One page plus the collector's per-page state: the live-starts map
/// (meaningful only during a collection cycle) and the tracked pointers
/// whose own addresses lie inside the page.
struct HeapPage {
    page: Page,
    live_starts: Bitmap,
    ptrs: Vec<NonRoot>,
}

impl HeapPage {
    fn new(total_bytes: usize, chunk_bytes: usize) -> Option<Self> {
        let page = Page::new(total_bytes, chunk_bytes)?;
        let live_starts = Bitmap::new(page.locations());
        Some(Self {
            page,
            live_starts,
            ptrs: Vec::new(),
        })
    }
}

/// Where an address lives: which page, and where inside it.
pub(crate) struct PageInfo {
    pub(crate) page_index: usize,
    pub(crate) info: ContainsInfo,
}

// ── The deferred heap ─────────────────────────────────────────────────

/// A heap whose objects are reclaimed by stop-the-world mark and sweep.
///
/// Owns an ordered list of pages, the set of root slots (tracked pointers
/// whose own addresses lie outside every page), the destructor registry, and
/// the collection machinery. One logical owner per instance; there is no
/// internal locking, and every public operation runs to completion. Obtain
/// the calling thread's instance through [`crate::with_heap`].
pub struct DeferredHeap {
    pages: RefCell<Vec<HeapPage>>,
    roots: RefCell<HashSet<usize>>,
    dtors: Destructors,
    collect_before_expand: Cell<bool>,
    is_destroying: Cell<bool>,
    is_collecting: Cell<bool>,
    config: HeapConfig,
}

impl DeferredHeap {
    /// Only the thread-local accessor builds heaps: tracked pointers find
    /// their heap through it, so a second instance per thread would break
    /// registration.
    pub(crate) fn new(config: HeapConfig) -> Self {
        config.validate().expect("invalid heap config");
        let collect_before_expand = Cell::new(config.collect_before_expand);
        Self {
            pages: RefCell::new(Vec::new()),
            roots: RefCell::new(HashSet::new()),
            dtors: Destructors::new(),
            collect_before_expand,
            is_destroying: Cell::new(false),
            is_collecting: Cell::new(false),
            config,
        }
    }

    // ── Tracked-pointer registration ──────────────────────────────────

    /// Track a slot, classifying it by its own address: inside one of our
    /// pages it is an in-page edge, anywhere else it is a root.
    pub(crate) fn enregister(&self, slot: *const RawSlot) {
        assert!(
            !self.is_destroying.get(),
            "cannot register pointers on a heap that is being destroyed"
        );
        let mut pages = self.pages.borrow_mut();
        if let Some(pg) = pages
            .iter_mut()
            .find(|pg| pg.page.contains(slot.cast::<u8>()))
        {
            debug_assert!(
                !pg.ptrs.iter().any(|r| r.slot == slot),
                "duplicate registration"
            );
            pg.ptrs.push(NonRoot { slot, level: 0 });
        } else {
            drop(pages);
            let fresh = self.roots.borrow_mut().insert(slot as usize);
            assert!(fresh, "duplicate registration");
        }
    }

    /// Stop tracking a slot. Roots go first (the common, O(1) case); in-page
    /// lists are scanned from the back because short-lived pointers dominate.
    pub(crate) fn deregister(&self, slot: *const RawSlot) {
        if self.is_destroying.get() {
            return;
        }
        if self.roots.borrow_mut().remove(&(slot as usize)) {
            return;
        }
        let mut pages = self.pages.borrow_mut();
        for pg in pages.iter_mut() {
            if let Some(i) = pg.ptrs.iter().rposition(|r| r.slot == slot) {
                pg.ptrs.swap_remove(i);
                return;
            }
        }
        // A slot that lives inside a page must have been adopted; anything
        // else is an inert value that was never tracked (e.g. a stack
        // temporary that was moved into `make`).
        let in_page = pages.iter().any(|pg| pg.page.contains(slot.cast::<u8>()));
        assert!(
            !in_page,
            "attempt to deregister an unregistered tracked pointer"
        );
    }

    /// Which page contains `p`, if any. Pages are disjoint, so the first
    /// containing page is the only one.
    pub(crate) fn find_page_info(&self, p: *const u8) -> Option<PageInfo> {
        let pages = self.pages.borrow();
        pages
            .iter()
            .position(|pg| pg.page.contains(p))
            .map(|page_index| PageInfo {
                page_index,
                info: pages[page_index].page.contains_info(p),
            })
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocate one `value` on this heap and return an owning root, null on
    /// out-of-memory.
    pub fn make<T: Trace>(&self, value: T) -> Root<T> {
        match self.allocate::<T>(1) {
            Some(p) => {
                // SAFETY: p is fresh storage fitting one T.
                unsafe { self.construct(p.as_ptr(), value) };
                Root::from_raw(p.as_ptr())
            }
            None => Root::null(),
        }
    }

    /// Allocate `n` default-constructed objects; null on out-of-memory.
    pub fn make_array<T: Trace + Default>(&self, n: usize) -> Root<T> {
        assert!(n > 0, "no objects requested");
        match self.allocate::<T>(n) {
            Some(p) => {
                // SAFETY: p is fresh storage fitting n T's.
                unsafe { self.construct_array(p.as_ptr(), n) };
                Root::from_raw(p.as_ptr())
            }
            None => Root::null(),
        }
    }

    /// Raw storage for `n` objects of `T`: existing pages first, then an
    /// optional collection, then a fresh page sized for the request.
    fn allocate<T>(&self, n: usize) -> Option<NonNull<T>> {
        assert!(
            !self.is_destroying.get(),
            "cannot allocate on a heap that is being destroyed"
        );
        let mut p = self.allocate_from_existing::<T>(n);

        if p.is_none() && self.collect_before_expand.get() && !self.is_collecting.get() {
            self.collect();
            p = self.allocate_from_existing::<T>(n);
        }

        if p.is_none() {
            let request = mem::size_of::<T>().checked_mul(n)?;
            let bytes = ((request as f64 * self.config.growth_factor).ceil() as usize)
                .max(self.config.min_page_bytes);
            let chunk = mem::size_of::<T>().max(self.config.min_chunk_bytes);
            let mut pg = HeapPage::new(bytes, chunk)?;
            let fresh = pg.page.allocate::<T>(n);
            assert!(
                fresh.is_some(),
                "fresh page failed to satisfy the request that sized it"
            );
            tracing::debug!(
                target: "deferred_heap",
                bytes,
                chunk,
                pages = self.pages.borrow().len() + 1,
                "opening page"
            );
            self.pages.borrow_mut().push(pg);
            p = fresh;
        }

        if let Some(p) = p {
            // An allocation made while a collection cycle is in flight (from
            // a destructor) must not be condemned by that same cycle.
            if self.is_collecting.get() {
                self.mark_newborn(p.as_ptr().cast::<u8>());
            }
        }
        p
    }

    fn allocate_from_existing<T>(&self, n: usize) -> Option<NonNull<T>> {
        let mut pages = self.pages.borrow_mut();
        pages.iter_mut().find_map(|pg| pg.page.allocate::<T>(n))
    }

    fn mark_newborn(&self, start: *const u8) {
        let mut pages = self.pages.borrow_mut();
        for pg in pages.iter_mut() {
            let info = pg.page.contains_info(start);
            if info.found == Found::AllocatedStart {
                pg.live_starts.set(info.start_location, true);
                return;
            }
        }
        unreachable!("newborn allocation not found in any page");
    }

    /// Place `value` at `p`, adopt its embedded tracked pointers, and record
    /// its destructor.
    ///
    /// # Safety
    ///
    /// `p` must be unoccupied heap storage fitting a `T`.
    unsafe fn construct<T: Trace>(&self, p: *mut T, value: T) {
        assert!(!p.is_null(), "construction at null location");
        // Stale destructor entries over these bytes would run against the
        // new occupant; clear them first.
        let end = unsafe { p.cast::<u8>().add(mem::size_of::<T>()) };
        self.destroy_objects(p.cast::<u8>(), end);
        // No heap state is borrowed past this point: the adoption walk below
        // runs user code that may re-enter the heap.
        unsafe { p.write(value) };
        let mut adopter = Adopter::new(self);
        unsafe { (*p).trace(&mut adopter) };
        self.dtors.store(p, 1);
    }

    /// Array form of [`Self::construct`]: each element default-constructed
    /// and adopted in place.
    ///
    /// # Safety
    ///
    /// `p` must be unoccupied heap storage fitting `n` `T`s.
    unsafe fn construct_array<T: Trace + Default>(&self, p: *mut T, n: usize) {
        assert!(!p.is_null(), "construction at null location");
        let end = unsafe { p.cast::<u8>().add(mem::size_of::<T>() * n) };
        self.destroy_objects(p.cast::<u8>(), end);
        for i in 0..n {
            // SAFETY: element i is in bounds of the fresh storage.
            unsafe {
                let e = p.add(i);
                e.write(T::default());
                let mut adopter = Adopter::new(self);
                (*e).trace(&mut adopter);
            }
        }
        self.dtors.store(p, n);
    }

    /// Run and remove the registered destructors in `[begin, end)`.
    fn destroy_objects(&self, begin: *mut u8, end: *mut u8) -> bool {
        if begin as usize >= end as usize {
            return false;
        }
        self.dtors.run(begin, end)
    }

    // ── Collection ────────────────────────────────────────────────────

    /// Trace from the roots and reclaim everything unreachable.
    ///
    /// Stop-the-world with respect to the owning thread. Unreachable tracked
    /// pointers are nulled before any destructor runs, so a destructor
    /// observes null for every edge into the condemned set and can never
    /// resurrect or double-free a neighbour. Destructors may re-enter the
    /// heap; a nested `collect` is a no-op.
    pub fn collect(&self) {
        if self.is_collecting.get() || self.is_destroying.get() {
            return;
        }
        self.is_collecting.set(true);

        // Phase 1: reset the live maps and the per-slot mark levels.
        {
            let mut pages = self.pages.borrow_mut();
            for pg in pages.iter_mut() {
                pg.live_starts.clear_all();
                for r in pg.ptrs.iter_mut() {
                    r.level = 0;
                }
            }
        }

        // Phase 2: mark from the roots, then wave by wave: level L slots are
        // the ones first reached L steps from a root. Terminates because a
        // pass that wakes nothing leaves nothing at the previous level.
        {
            let mut pages = self.pages.borrow_mut();
            let roots = self.roots.borrow();
            let mut level = 1;
            for &addr in roots.iter() {
                let slot = addr as *const RawSlot;
                // SAFETY: registered root slots are live by construction.
                let target = unsafe { (*slot).get() };
                Self::mark(&mut pages, target, level);
            }
            loop {
                level += 1;
                let mut advanced = false;
                for pi in 0..pages.len() {
                    for ri in 0..pages[pi].ptrs.len() {
                        if pages[pi].ptrs[ri].level != level - 1 {
                            continue;
                        }
                        advanced = true;
                        // SAFETY: in-page slots are live while registered.
                        let target = unsafe { (*pages[pi].ptrs[ri].slot).get() };
                        Self::mark(&mut pages, target, level);
                    }
                }
                if !advanced {
                    break;
                }
            }
        }

        // Phase 3: cycle breaking. Null every unreached tracked pointer now,
        // before any destructor runs, severing all edges into the condemned
        // set. The collector is privileged here: user-visible immutability
        // does not apply.
        {
            let pages = self.pages.borrow();
            for pg in pages.iter() {
                for r in pg.ptrs.iter() {
                    if r.level == 0 {
                        // SAFETY: registered slots are live.
                        unsafe { (*r.slot).reset() };
                    }
                }
            }
        }

        // Phase 4: destroy and deallocate every unmarked allocation. No heap
        // state stays borrowed while a destructor runs, and bounds are
        // re-read every step because destructors may allocate, deregister,
        // or open new pages mid-walk (freshly opened pages are not swept by
        // this cycle).
        let page_count = self.pages.borrow().len();
        let mut freed = 0usize;
        for pi in 0..page_count {
            let mut i = 0;
            loop {
                let condemned = {
                    let pages = self.pages.borrow();
                    let pg = &pages[pi];
                    let locations = pg.page.locations();
                    if i >= locations {
                        break;
                    }
                    let here = pg.page.location_info(i);
                    if here.is_start && !pg.live_starts.get(i) {
                        // The allocation runs to the next start, or to the
                        // page's sentinel end.
                        let mut end = pg.page.location_info(locations).ptr;
                        for j in i + 1..locations {
                            let there = pg.page.location_info(j);
                            if there.is_start {
                                end = there.ptr;
                                break;
                            }
                        }
                        Some((here.ptr, end))
                    } else {
                        None
                    }
                };
                if let Some((start, end)) = condemned {
                    self.destroy_objects(start, end);
                    self.pages.borrow_mut()[pi].page.deallocate(start);
                    freed += 1;
                }
                i += 1;
            }
        }

        tracing::debug!(
            target: "deferred_heap",
            pages = page_count,
            freed,
            roots = self.root_count(),
            "collect complete"
        );
        self.is_collecting.set(false);
    }

    /// Mark the allocation containing `p` as live and wake the tracked
    /// pointers embedded in it. A no-op for null; at most one page contains
    /// `p`, and the walk stops on the first hit.
    fn mark(pages: &mut [HeapPage], p: *mut u8, level: usize) {
        if p.is_null() {
            return;
        }
        for pg in pages.iter_mut() {
            let HeapPage {
                page,
                live_starts,
                ptrs,
            } = pg;
            let info = page.contains_info(p);
            if info.found == Found::NotInRange {
                continue;
            }
            debug_assert!(
                info.found > Found::Unallocated,
                "tracked pointer into unallocated memory"
            );
            live_starts.set(info.start_location, true);
            for r in ptrs.iter_mut() {
                if r.level != 0 {
                    continue;
                }
                let here = page.contains_info(r.slot.cast::<u8>());
                debug_assert!(
                    here.found > Found::Unallocated,
                    "tracked slot in unallocated memory"
                );
                if here.start_location == info.start_location {
                    r.level = level;
                }
            }
            return;
        }
    }

    // ── Policy and introspection ──────────────────────────────────────

    pub fn set_collect_before_expand(&self, enable: bool) {
        self.collect_before_expand.set(enable);
    }

    pub fn collect_before_expand(&self) -> bool {
        self.collect_before_expand.get()
    }

    pub fn page_count(&self) -> usize {
        self.pages.borrow().len()
    }

    pub fn root_count(&self) -> usize {
        self.roots.borrow().len()
    }

    /// Tracked pointers embedded in heap objects, across all pages.
    pub fn tracked_count(&self) -> usize {
        self.pages.borrow().iter().map(|pg| pg.ptrs.len()).sum()
    }

    pub fn destructor_count(&self) -> usize {
        self.dtors.len()
    }

    /// Emit the component enumeration through `tracing`. Diagnostic only.
    pub fn debug_print(&self) {
        tracing::debug!(target: "deferred_heap", heap = ?self, "debug print");
    }
}

impl fmt::Debug for DeferredHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pages = self.pages.borrow();
        let mut list = f.debug_struct("DeferredHeap");
        list.field("pages", &pages.len())
            .field("roots", &self.root_count())
            .field("tracked", &self.tracked_count())
            .field("destructors", &self.dtors.len())
            .field("collect_before_expand", &self.collect_before_expand.get());
        for (i, pg) in pages.iter().enumerate() {
            list.field(&format!("page[{i}]"), &pg.page);
        }
        list.finish()
    }
}

impl Drop for DeferredHeap {
    /// Teardown: reset every tracked pointer with deregistration suppressed,
    /// then run all remaining destructors. User code must not allocate here.
    fn drop(&mut self) {
        self.is_destroying.set(true);
        for &addr in self.roots.borrow().iter() {
            // SAFETY: registered root slots are live until they deregister,
            // which the flag above suppresses.
            unsafe { (*(addr as *const RawSlot)).reset() };
        }
        for pg in self.pages.borrow().iter() {
            for r in pg.ptrs.iter() {
                // SAFETY: in-page slots stay live until their storage is
                // reclaimed below.
                unsafe { (*r.slot).reset() };
            }
        }
        tracing::debug!(
            target: "deferred_heap",
            pages = self.page_count(),
            dtors = self.destructor_count(),
            "tearing down"
        );
        self.dtors.run_all();
    }
}
