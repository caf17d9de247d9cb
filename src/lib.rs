//! Halley is a mark-compact garbage collection library for managed
//! language runtimes. It implements a full-heap collector built around
//! tri-color marking with an ephemeron fixpoint, fragmentation-driven
//! compaction with parallel evacuation, a ten-step weak-reference clearing
//! pipeline and a remembered-set-driven pointer update phase, plus a
//! young-generation sibling specialized for the nursery.
//!
//! The mutator is expected to be stopped (see [`safepoint`]) for the
//! atomic portions of a cycle; sweeping runs concurrently afterwards.

pub mod bitmap;
pub mod clearing;
pub mod collector;
pub mod embedder;
pub mod evacuator;
pub mod flags;
pub mod heap;
pub mod incremental;
pub mod job;
pub mod marking;
pub mod minor;
pub mod object;
pub mod page;
pub mod remembered_set;
pub mod roots;
pub mod safepoint;
pub mod space;
pub mod sweeper;
pub mod update_pointers;
pub mod util;
pub mod visitor;
pub mod weak_objects;
pub mod worklist;

pub use collector::MarkCompactCollector;
pub use flags::Flags;
pub use heap::{AllocationSpace, Heap};
pub use minor::MinorMarkCompactCollector;
pub use object::{HeapObject, Tagged};

#[cfg(test)]
mod tests;
