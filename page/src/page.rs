use std::fmt;
use std::mem;
use std::ptr::NonNull;

use crate::system;

/// Classification of an address relative to one page.
///
/// The ordering is meaningful: anything above `Unallocated` points into
/// allocated storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Found {
    NotInRange,
    Unallocated,
    AllocatedMiddle,
    AllocatedStart,
}

/// Result of [`Page::contains_info`].
#[derive(Debug, Clone, Copy)]
pub struct ContainsInfo {
    pub found: Found,
    /// Location holding the queried address (0 when not in range).
    pub location: usize,
    /// First location of the allocation the address falls in.
    pub start_location: usize,
}

/// Result of [`Page::location_info`].
#[derive(Debug, Clone, Copy)]
pub struct LocationInfo {
    pub is_start: bool,
    pub ptr: *mut u8,
}

/// Per-location occupancy state, one byte per location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Loc {
    Free = 0,
    Start = 1,
    Middle = 2,
}

/// A contiguous byte region divided into fixed-size locations.
///
/// Allocations occupy a run of locations flagged `Start, Middle, …, Middle`.
/// Every allocation is padded by one byte so that a one-past-the-end pointer
/// still falls inside the allocation's own location run, which is what makes
/// checked pointer arithmetic on arrays possible for the consumer.
pub struct Page {
    base: NonNull<u8>,
    mapped: usize,
    chunk: usize,
    locs: Box<[Loc]>,
}

impl Page {
    /// Open a page spanning at least `total_bytes`, divided into
    /// `chunk_bytes`-sized locations. Out-of-memory is observable as `None`.
    #[must_use]
    pub fn new(total_bytes: usize, chunk_bytes: usize) -> Option<Page> {
        assert!(chunk_bytes > 0, "chunk size must be nonzero");
        assert!(total_bytes > 0, "page size must be nonzero");
        let locations = total_bytes.div_ceil(chunk_bytes);
        let mapped = locations * chunk_bytes;
        let base = system::map_memory(mapped)?;
        Some(Page {
            base,
            mapped,
            chunk: chunk_bytes,
            locs: vec![Loc::Free; locations].into_boxed_slice(),
        })
    }

    #[inline]
    pub fn locations(&self) -> usize {
        self.locs.len()
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk
    }

    /// Total bytes covered by the location map.
    #[inline]
    fn span(&self) -> usize {
        self.locs.len() * self.chunk
    }

    #[inline]
    fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Whether `p` points into this page's storage span.
    #[inline]
    pub fn contains(&self, p: *const u8) -> bool {
        let a = p as usize;
        self.base_addr() <= a && a < self.base_addr() + self.span()
    }

    /// Classify `p` and report the allocation it falls in, if any.
    pub fn contains_info(&self, p: *const u8) -> ContainsInfo {
        if !self.contains(p) {
            return ContainsInfo {
                found: Found::NotInRange,
                location: 0,
                start_location: 0,
            };
        }
        let location = (p as usize - self.base_addr()) / self.chunk;
        match self.locs[location] {
            Loc::Free => ContainsInfo {
                found: Found::Unallocated,
                location,
                start_location: location,
            },
            Loc::Start => ContainsInfo {
                found: Found::AllocatedStart,
                location,
                start_location: location,
            },
            Loc::Middle => {
                let mut start = location;
                while self.locs[start] == Loc::Middle {
                    start -= 1;
                }
                ContainsInfo {
                    found: Found::AllocatedMiddle,
                    location,
                    start_location: start,
                }
            }
        }
    }

    /// Describe location `i`. `i == locations()` is the sentinel end: never a
    /// start, its pointer is the first byte past the page's storage span.
    pub fn location_info(&self, i: usize) -> LocationInfo {
        assert!(i <= self.locs.len(), "location index out of range");
        LocationInfo {
            is_start: i < self.locs.len() && self.locs[i] == Loc::Start,
            // SAFETY: i*chunk <= span, still within (one past) the mapping.
            ptr: unsafe { self.base.as_ptr().add(i * self.chunk) },
        }
    }

    /// Allocate storage for `n` objects of type `T`.
    ///
    /// Needs a contiguous run of free locations covering `n * size_of::<T>()`
    /// bytes plus the one-byte arithmetic pad, starting at an address aligned
    /// for `T`. Returns `None` when no such run exists; never panics on an
    /// ordinary allocation failure.
    pub fn allocate<T>(&mut self, n: usize) -> Option<NonNull<T>> {
        assert!(n > 0, "no objects requested");
        let bytes = mem::size_of::<T>().checked_mul(n)?.checked_add(1)?;
        let chunks = bytes.div_ceil(self.chunk);
        if chunks > self.locs.len() {
            return None;
        }
        let align = mem::align_of::<T>();

        let mut i = 0;
        while i + chunks <= self.locs.len() {
            if (self.base_addr() + i * self.chunk) % align != 0 {
                i += 1;
                continue;
            }
            match (i..i + chunks).find(|&j| self.locs[j] != Loc::Free) {
                // Run is interrupted: resume the scan past the obstacle.
                Some(j) => i = j + 1,
                None => {
                    self.locs[i] = Loc::Start;
                    for j in i + 1..i + chunks {
                        self.locs[j] = Loc::Middle;
                    }
                    let p = (self.base_addr() + i * self.chunk) as *mut T;
                    // SAFETY: p is inside the mapping, which is never null.
                    return Some(unsafe { NonNull::new_unchecked(p) });
                }
            }
        }
        None
    }

    /// Free the allocation starting at `p`.
    ///
    /// `p` must be the exact start address previously returned by
    /// [`Page::allocate`]; anything else is a programming error.
    pub fn deallocate(&mut self, p: *mut u8) {
        let info = self.contains_info(p);
        assert!(
            info.found == Found::AllocatedStart,
            "deallocate of an address that is not an allocation start"
        );
        self.locs[info.location] = Loc::Free;
        let mut j = info.location + 1;
        while j < self.locs.len() && self.locs[j] == Loc::Middle {
            self.locs[j] = Loc::Free;
            j += 1;
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        system::unmap_memory(self.base, self.mapped);
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = String::with_capacity(self.locs.len());
        for l in self.locs.iter() {
            map.push(match l {
                Loc::Free => '.',
                Loc::Start => 'A',
                Loc::Middle => 'a',
            });
        }
        f.debug_struct("Page")
            .field("base", &self.base)
            .field("chunk", &self.chunk)
            .field("locations", &self.locs.len())
            .field("map", &map)
            .finish()
    }
}
