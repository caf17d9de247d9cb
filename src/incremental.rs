use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::object::{Address, HeapObject};
use crate::page::Page;
use crate::worklist::Worklist;

/// Residual state of the incremental/concurrent marker. The full collector
/// stops it at `Prepare`, consumes whatever grey objects it accumulated and
/// deactivates the write barrier once marking finishes.
pub struct IncrementalMarker {
    marking: AtomicBool,
    barrier_active: AtomicBool,
    residual: Worklist<HeapObject>,
    barrier_log: Mutex<Vec<HeapObject>>,
    steps: AtomicUsize,
}

impl IncrementalMarker {
    pub fn new() -> IncrementalMarker {
        IncrementalMarker {
            marking: AtomicBool::new(false),
            barrier_active: AtomicBool::new(false),
            residual: Worklist::new(),
            barrier_log: Mutex::new(Vec::new()),
            steps: AtomicUsize::new(0),
        }
    }

    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Relaxed)
    }

    pub fn is_barrier_active(&self) -> bool {
        self.barrier_active.load(Ordering::Relaxed)
    }

    pub fn steps_taken(&self) -> usize {
        self.steps.load(Ordering::Relaxed)
    }

    pub fn start(&self) {
        self.marking.store(true, Ordering::Relaxed);
        self.barrier_active.store(true, Ordering::Relaxed);
    }

    /// Record a grey object discovered outside a pause (write barrier or a
    /// concurrent marking step).
    pub fn record_grey(&self, obj: HeapObject) {
        debug_assert!(self.is_marking());
        self.barrier_log.lock().push(obj);
        self.steps.fetch_add(1, Ordering::Relaxed);
    }

    /// Stop incremental marking; reports whether it was running so the
    /// atomic pause can skip the clean `StartMarking` path.
    pub fn stop(&self) -> bool {
        self.marking.swap(false, Ordering::Relaxed)
    }

    /// Flush barrier-discovered objects into the residual pool.
    pub fn publish_all(&self) {
        for obj in self.barrier_log.lock().drain(..) {
            self.residual.push(obj);
        }
    }

    /// Pop one residual object; the atomic pause re-greys them through its
    /// own marker.
    pub fn residual_pop(&self) -> Option<HeapObject> {
        self.residual.pop()
    }

    pub fn deactivate_all(&self) {
        self.barrier_active.store(false, Ordering::Relaxed);
        debug_assert!(self.residual.is_empty());
    }

    /// Copy an object's mark color from a source address to its copy.
    /// Used by migration observers when moving objects mid-cycle.
    pub fn transfer_color(src_page: &Page, src: Address, dst_page: &Page, dst: Address) {
        let src_offset = src_page.offset_of(src);
        let dst_offset = dst_page.offset_of(dst);
        match src_page.bitmap().color(src_offset) {
            crate::bitmap::Color::Black => dst_page.bitmap().set_black(dst_offset),
            crate::bitmap::Color::Grey => dst_page.bitmap().set_grey(dst_offset),
            crate::bitmap::Color::White => {}
        }
    }
}
