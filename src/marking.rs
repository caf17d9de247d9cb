use crate::bitmap::Color;
use crate::heap::Heap;
use crate::object::{layout, map_bits, HeapObject, ObjectKind, ObjectSlot};
use crate::page::Page;
use crate::remembered_set::SlotType;
use crate::visitor::{RootCategory, RootVisitor};
use crate::weak_objects::{Ephemeron, WeakObjects, WeakObjectsLocal};
use crate::worklist::{LocalWorklist, Worklist};

/// Shared-function-info instances survive this many cycles before their
/// bytecode becomes a flushing candidate.
pub const BYTECODE_FLUSH_AGE: usize = 1;

/// Color accessors layered over the per-page bitmaps.
#[derive(Clone, Copy)]
pub struct MarkingState<'h> {
    heap: &'h Heap,
}

impl<'h> MarkingState<'h> {
    pub fn new(heap: &'h Heap) -> MarkingState<'h> {
        MarkingState { heap }
    }

    #[inline]
    fn locate(&self, obj: HeapObject) -> Option<(&'h Page, usize)> {
        let page = self.heap.page_of(obj.address())?;
        let offset = page.offset_of(obj.address());
        Some((page, offset))
    }

    #[inline]
    pub fn color(&self, obj: HeapObject) -> Color {
        match self.locate(obj) {
            Some((page, offset)) => page.bitmap().color(offset),
            // Off-heap referents (read-only roots) count as always black.
            None => Color::Black,
        }
    }

    #[inline]
    pub fn is_white(&self, obj: HeapObject) -> bool {
        self.color(obj) == Color::White
    }

    #[inline]
    pub fn is_black(&self, obj: HeapObject) -> bool {
        self.color(obj) == Color::Black
    }

    #[inline]
    pub fn is_black_or_grey(&self, obj: HeapObject) -> bool {
        self.color(obj) != Color::White
    }

    #[inline]
    pub fn white_to_grey(&self, obj: HeapObject) -> bool {
        match self.locate(obj) {
            Some((page, offset)) => page.bitmap().white_to_grey(offset),
            None => false,
        }
    }

    /// Blacken a grey object, accounting its size into the page's live
    /// bytes.
    #[inline]
    pub fn grey_to_black(&self, obj: HeapObject) -> bool {
        let Some((page, offset)) = self.locate(obj) else {
            return false;
        };
        if page.bitmap().grey_to_black(offset) {
            page.increment_live_bytes(obj.size() as isize);
            true
        } else {
            false
        }
    }

    pub fn set_black(&self, obj: HeapObject) {
        if let Some((page, offset)) = self.locate(obj) {
            if !page.bitmap().is_black(offset) {
                page.bitmap().set_black(offset);
                page.increment_live_bytes(obj.size() as isize);
            }
        }
    }
}

/// The grey-object pools: main transitive closure plus the wrapper queue
/// handed to the embedder.
#[derive(Default)]
pub struct MarkingWorklists {
    pub main: Worklist<HeapObject>,
    pub wrapper: Worklist<HeapObject>,
}

/// The hot marking visitor: one per marking thread. Statically dispatched;
/// slot classification, remembered-set recording and weak-object discovery
/// happen inline while blackening.
pub struct Marker<'h> {
    heap: &'h Heap,
    pub state: MarkingState<'h>,
    pub local: LocalWorklist<'h, HeapObject>,
    pub wrapper_local: LocalWorklist<'h, HeapObject>,
    pub weak: WeakObjectsLocal<'h>,
    pub bytes_marked: usize,
    track_newly_discovered: bool,
    pub newly_discovered: Vec<HeapObject>,
    pub newly_discovered_limit: usize,
    pub newly_discovered_overflowed: bool,
}

impl<'h> Marker<'h> {
    pub fn new(
        heap: &'h Heap,
        worklists: &'h MarkingWorklists,
        weak: &'h WeakObjects,
    ) -> Marker<'h> {
        Marker {
            heap,
            state: MarkingState::new(heap),
            local: LocalWorklist::new(&worklists.main),
            wrapper_local: LocalWorklist::new(&worklists.wrapper),
            weak: WeakObjectsLocal::new(weak),
            bytes_marked: 0,
            track_newly_discovered: false,
            newly_discovered: Vec::new(),
            newly_discovered_limit: 0,
            newly_discovered_overflowed: false,
        }
    }

    pub fn heap(&self) -> &'h Heap {
        self.heap
    }

    /// Grey a white object and queue it for body visitation.
    #[inline]
    pub fn mark_object(&mut self, obj: HeapObject) {
        if self.state.white_to_grey(obj) {
            self.local.push(obj);
        }
    }

    pub fn start_tracking_newly_discovered(&mut self, limit: usize) {
        self.track_newly_discovered = true;
        self.newly_discovered_limit = limit;
        self.newly_discovered.clear();
        self.newly_discovered_overflowed = false;
    }

    pub fn reset_newly_discovered(&mut self) {
        self.newly_discovered.clear();
        self.newly_discovered_overflowed = false;
    }

    pub fn stop_tracking_newly_discovered(&mut self) {
        self.track_newly_discovered = false;
        self.newly_discovered.clear();
        self.newly_discovered.shrink_to_fit();
    }

    fn add_newly_discovered(&mut self, obj: HeapObject) {
        if self.newly_discovered.len() < self.newly_discovered_limit {
            self.newly_discovered.push(obj);
        } else {
            self.newly_discovered_overflowed = true;
        }
    }

    /// Pop grey objects (including the on-hold stash) until the worklist
    /// drains or `bytes_budget` is met. Returns (bytes, objects) processed.
    pub fn process_marking_worklist(&mut self, bytes_budget: usize) -> (usize, usize) {
        let mut bytes_processed = 0;
        let mut objects_processed = 0;
        while let Some(obj) = self.local.pop().or_else(|| self.local.pop_on_hold()) {
            // Left trimming leaves grey or black fillers on the worklist.
            if obj.is_filler() {
                continue;
            }
            debug_assert!(!self.state.is_white(obj));
            if self.track_newly_discovered {
                self.add_newly_discovered(obj);
            }
            if !self.state.grey_to_black(obj) {
                continue;
            }
            let size = self.visit_object(obj);
            bytes_processed += size;
            objects_processed += 1;
            if bytes_budget != 0 && bytes_processed >= bytes_budget {
                break;
            }
        }
        self.bytes_marked += bytes_processed;
        (bytes_processed, objects_processed)
    }

    /// Key reachable -> mark the value; both unreachable -> park the pair
    /// for the next round. Returns true when the value got marked.
    pub fn process_ephemeron(&mut self, key: HeapObject, value: HeapObject) -> bool {
        if self.state.is_black_or_grey(key) {
            if self.state.white_to_grey(value) {
                self.local.push(value);
                return true;
            }
        } else if self.state.is_white(value) {
            self.weak.next_ephemerons.push(Ephemeron { key, value });
        }
        false
    }

    #[inline]
    fn visit_strong_slot(&mut self, host: HeapObject, slot: ObjectSlot) {
        let value = slot.load();
        if let Some(target) = value.to_address() {
            self.mark_object(HeapObject(target));
            self.heap.record_slot(host, slot, target);
        }
    }

    #[inline]
    fn visit_weak_slot(&mut self, host: HeapObject, slot: ObjectSlot) {
        let value = slot.load();
        if let Some(target) = value.to_address() {
            self.weak.weak_references.push((host, slot));
            self.heap.record_slot(host, slot, target);
        }
    }

    /// Record without marking; used for slots whose clearing is handled by
    /// a dedicated pipeline step rather than the generic weak-slot pass.
    #[inline]
    fn record_only(&mut self, host: HeapObject, slot: ObjectSlot) {
        if let Some(target) = slot.load().to_address() {
            self.heap.record_slot(host, slot, target);
        }
    }

    fn visit_map_pointer(&mut self, obj: HeapObject) {
        let map = obj.map();
        self.mark_object(HeapObject(map));
        self.heap.record_slot(obj, ObjectSlot(obj.address()), map);
    }

    /// Apply the map's visitor descriptor: enumerate slots of each semantic
    /// kind, greying referents and recording remembered slots.
    pub fn visit_object(&mut self, obj: HeapObject) -> usize {
        let map = obj.map();
        let size = crate::object::size_with_map(obj, map);
        self.visit_map_pointer(obj);
        let kind = crate::object::map_kind(map);
        match kind {
            ObjectKind::FreeSpace
            | ObjectKind::OneWordFiller
            | ObjectKind::Bytecode
            | ObjectKind::UncompiledData
            | ObjectKind::FinalizationRegistry
            | ObjectKind::SeqString
            | ObjectKind::InternalizedString
            | ObjectKind::ExternalString => {}
            ObjectKind::Regular => {
                for i in 0..crate::object::body_slot_count(obj, map) {
                    self.visit_strong_slot(obj, obj.slot(i));
                }
                if map_bits(map).is_wrapper() {
                    self.wrapper_local.push(obj);
                }
            }
            ObjectKind::WeakHolder => {
                for i in 0..crate::object::body_slot_count(obj, map) {
                    self.visit_weak_slot(obj, obj.slot(i));
                }
            }
            ObjectKind::Map => {
                self.visit_weak_slot(obj, obj.slot(layout::MAP_TRANSITIONS));
                self.visit_strong_slot(obj, obj.slot(layout::MAP_DESCRIPTORS));
            }
            ObjectKind::WeakCell => {
                self.weak.weak_cells.push(obj);
                self.record_only(obj, obj.slot(layout::WEAK_CELL_TARGET));
                self.record_only(obj, obj.slot(layout::WEAK_CELL_TOKEN));
                self.visit_strong_slot(obj, obj.slot(layout::WEAK_CELL_REGISTRY));
            }
            ObjectKind::JsWeakRef => {
                self.weak.js_weak_refs.push(obj);
                self.record_only(obj, obj.slot(layout::WEAK_REF_TARGET));
            }
            ObjectKind::EphemeronTable => {
                self.weak.ephemeron_hash_tables.push(obj);
                let capacity = obj.raw_field(layout::TABLE_CAPACITY);
                for i in 0..capacity {
                    let key_slot = obj.slot(layout::TABLE_ENTRIES + 2 * i);
                    let value_slot = obj.slot(layout::TABLE_ENTRIES + 2 * i + 1);
                    self.record_only(obj, key_slot);
                    self.record_only(obj, value_slot);
                    let (Some(key), Some(value)) = (
                        key_slot.load().to_address(),
                        value_slot.load().to_address(),
                    ) else {
                        continue;
                    };
                    let ephemeron = Ephemeron {
                        key: HeapObject(key),
                        value: HeapObject(value),
                    };
                    if self.state.is_black_or_grey(ephemeron.key) {
                        self.mark_object(ephemeron.value);
                    } else {
                        self.weak.discovered_ephemerons.push(ephemeron);
                    }
                }
            }
            ObjectKind::TransitionArray => {
                self.weak.transition_arrays.push(obj);
                let len = obj.raw_field(layout::ARRAY_LENGTH);
                for i in 0..len {
                    self.record_only(obj, obj.slot(layout::ARRAY_ENTRIES + i));
                }
            }
            ObjectKind::DescriptorArray => {
                let len = obj.raw_field(layout::ARRAY_LENGTH);
                for i in 0..len {
                    self.visit_strong_slot(obj, obj.slot(layout::ARRAY_ENTRIES + i));
                }
            }
            ObjectKind::Code => {
                self.visit_code_body(obj, false);
            }
            ObjectKind::SharedInfo => {
                self.visit_shared_info(obj);
            }
            ObjectKind::BaselineCode => {
                self.visit_strong_slot(obj, obj.slot(layout::BASELINE_BYTECODE));
            }
            ObjectKind::JsFunction => {
                self.visit_js_function(obj);
            }
            ObjectKind::AllocationSite => {
                // weak_next is the retainer-managed list link; zombie flag
                // is raw data.
            }
        }
        size
    }

    /// Code bodies carry typed slots. Weak embedded objects become
    /// dependent-code entries unless `force_strong` (running code on the
    /// top frame keeps its deoptimization literals alive).
    pub fn visit_code_body(&mut self, code: HeapObject, force_strong: bool) {
        let count = code.raw_field(layout::CODE_EMBEDDED_COUNT);
        for i in 0..count {
            let kind_word = code.raw_field(layout::CODE_EMBEDDED_PAIRS + 2 * i);
            let slot = code.slot(layout::CODE_EMBEDDED_PAIRS + 2 * i + 1);
            let value = slot.load();
            let Some(target) = value.to_address() else {
                continue;
            };
            if value.is_weak() && !force_strong {
                self.weak
                    .weak_objects_in_code
                    .push((HeapObject(target), code));
            } else {
                self.mark_object(HeapObject(target));
            }
            self.heap
                .record_typed_slot(code, SlotType::from_u8(kind_word as u8), slot, target);
        }
    }

    fn flush_candidate_at_age(&self, info: HeapObject, age: usize) -> bool {
        if !self.heap.flags.flush_bytecode {
            return false;
        }
        if age < BYTECODE_FLUSH_AGE {
            return false;
        }
        match info.field(layout::SHARED_DATA).to_address() {
            Some(data) => matches!(
                HeapObject(data).kind(),
                ObjectKind::Bytecode | ObjectKind::BaselineCode
            ),
            None => false,
        }
    }

    fn shared_info_is_flush_candidate(&self, info: HeapObject) -> bool {
        self.flush_candidate_at_age(info, info.raw_field(layout::SHARED_AGE))
    }

    fn visit_shared_info(&mut self, info: HeapObject) {
        // Candidacy is judged on the age the info entered this cycle with;
        // the bump below only matters to the next cycle.
        let age = info.raw_field(layout::SHARED_AGE);
        info.set_raw_field(layout::SHARED_AGE, age + 1);
        if self.flush_candidate_at_age(info, age) {
            // Custom weakness: candidacy defers the liveness decision of
            // the bytecode to the clearing phase.
            self.weak.code_flushing_candidates.push(info);
            self.record_only(info, info.slot(layout::SHARED_DATA));
        } else {
            self.visit_strong_slot(info, info.slot(layout::SHARED_DATA));
        }
    }

    fn visit_js_function(&mut self, function: HeapObject) {
        self.visit_strong_slot(function, function.slot(layout::FUNCTION_SHARED));
        let code_slot = function.slot(layout::FUNCTION_CODE);
        let code_kind = code_slot
            .load()
            .to_address()
            .map(|addr| HeapObject(addr).kind());
        let shared = function
            .field(layout::FUNCTION_SHARED)
            .to_address()
            .map(HeapObject);
        let shared_is_candidate =
            shared.map_or(false, |info| self.shared_info_is_flush_candidate(info));
        match code_kind {
            Some(ObjectKind::BaselineCode) if self.heap.flags.flush_baseline_code => {
                self.weak.baseline_flushing_candidates.push(function);
                self.record_only(function, code_slot);
            }
            Some(ObjectKind::Bytecode) if shared_is_candidate => {
                self.weak.flushed_js_functions.push(function);
                self.record_only(function, code_slot);
            }
            _ => self.visit_strong_slot(function, code_slot),
        }
    }

    /// Flush local buffers at a phase barrier.
    pub fn publish(&mut self) {
        self.local.publish();
        self.wrapper_local.publish();
        self.weak.publish_all();
    }

    pub fn is_local_and_global_empty(&self) -> bool {
        self.local.is_local_and_global_empty()
            && self.wrapper_local.is_local_and_global_empty()
    }
}

/// Greys every strong root. Weak roots are excluded; the string table is a
/// weak root handled by the clearing pipeline.
pub struct RootMarkingVisitor<'m, 'h> {
    pub marker: &'m mut Marker<'h>,
}

impl<'m, 'h> RootVisitor for RootMarkingVisitor<'m, 'h> {
    fn visit_root_pointer(&mut self, _category: RootCategory, slot: ObjectSlot) {
        if let Some(target) = slot.load().to_address() {
            self.marker.mark_object(HeapObject(target));
        }
    }

    fn visit_running_code(&mut self, code: HeapObject) {
        self.marker.mark_object(code);
        // A custom body visit: the running frame cannot deoptimize, so its
        // weak embedded objects are retained like strong ones.
        self.marker.visit_code_body(code, true);
    }
}

/// One parallel marking worker: drains the shared pools with its own local
/// buffers until the terminator agrees everything is empty.
pub fn parallel_marking_worker(
    heap: &Heap,
    worklists: &MarkingWorklists,
    weak: &WeakObjects,
    terminator: &crate::job::Terminator,
) -> usize {
    let mut marker = Marker::new(heap, worklists, weak);
    loop {
        marker.process_marking_worklist(0);
        marker.publish();
        if worklists.main.is_empty() && terminator.try_terminate() {
            break;
        }
    }
    debug_assert!(marker.is_local_and_global_empty() || !worklists.main.is_empty());
    marker.bytes_marked
}

