//! Page-granular slab storage for the deferred heap.
//!
//! A [`Page`] is a contiguous byte region divided into fixed-size *locations*
//! (the minimum allocation unit). For every location the page records whether
//! it is the start of an allocation, the middle of one, or free, and it can
//! answer containment queries for arbitrary addresses. The page knows nothing
//! about the objects stored in it; tracing, destruction and pointer tracking
//! are the consumer's concern.

mod bitmap;
mod page;
mod system;

pub use bitmap::Bitmap;
pub use page::{ContainsInfo, Found, LocationInfo, Page};
