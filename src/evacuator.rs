use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use scoped_threadpool::Pool;

use crate::bitmap::Color;
use crate::heap::{fatal_process_out_of_memory, Heap};
use crate::job::IndexGenerator;
use crate::marking::MarkingState;
use crate::object::{
    layout, Address, HeapObject, MapWord, ObjectKind, ObjectSlot, TAGGED_SIZE,
};
use crate::page::{flags, Page, SpaceId, PAGE_AREA_SIZE};
use crate::remembered_set::{RememberedSetClass, SlotType};
use crate::visitor::{iterate_body, ObjectVisitor};

const LAB_SIZE: usize = 32 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EvacuationMode {
    ObjectsNewToOld,
    PageNewToOld,
    ObjectsOldToOld,
    PageNewToNew,
}

impl EvacuationMode {
    pub fn name(self) -> &'static str {
        match self {
            EvacuationMode::ObjectsNewToOld => "objects-new-to-old",
            EvacuationMode::PageNewToOld => "page-new-to-old",
            EvacuationMode::ObjectsOldToOld => "objects-old-to-old",
            EvacuationMode::PageNewToNew => "page-new-to-new",
        }
    }
}

/// The order of checks matters: promotion flags take precedence over the
/// page's current generation.
pub fn compute_evacuation_mode(page: &Page) -> EvacuationMode {
    if page.is_flag_set(flags::PAGE_NEW_OLD_PROMOTION) {
        return EvacuationMode::PageNewToOld;
    }
    if page.is_flag_set(flags::PAGE_NEW_NEW_PROMOTION) {
        return EvacuationMode::PageNewToNew;
    }
    if page.in_young_generation() {
        return EvacuationMode::ObjectsNewToOld;
    }
    EvacuationMode::ObjectsOldToOld
}

/// Live bytes above which a nursery page is moved wholesale instead of
/// object by object.
pub fn new_space_page_evacuation_threshold(heap: &Heap) -> usize {
    if heap.flags.page_promotion {
        heap.flags.page_promotion_threshold * PAGE_AREA_SIZE / 100
    } else {
        PAGE_AREA_SIZE + TAGGED_SIZE
    }
}

pub fn should_move_page(heap: &Heap, page: &Page, live_bytes: usize, always_promote: bool) -> bool {
    !heap.should_reduce_memory()
        && !page.is_flag_set(flags::NEVER_EVACUATE)
        && live_bytes > new_space_page_evacuation_threshold(heap)
        && (always_promote || !page.contains(heap.new_space.lock().age_mark()))
}

/// Hook invoked on every copied object; profiling and young-generation
/// color transfer attach through this.
pub trait MigrationObserver: Sync {
    fn migrate(&self, heap: &Heap, src: HeapObject, dst: Address, size: usize);
}

pub struct ProfilingMigrationObserver;

impl MigrationObserver for ProfilingMigrationObserver {
    fn migrate(&self, _heap: &Heap, src: HeapObject, dst: Address, size: usize) {
        log::trace!("relocate {:#x} -> {:#x} ({} bytes)", src.address(), dst, size);
    }
}

struct Lab {
    top: Address,
    limit: Address,
}

/// Per-worker allocator with one linear allocation buffer per destination
/// space; buffers are flushed back to their space on `finalize`. A miss on
/// the free list first forces pending pages through the sweeper.
pub struct EvacuationAllocator<'h> {
    heap: &'h Heap,
    sweeper: &'h crate::sweeper::Sweeper,
    labs: [Lab; 4],
}

fn lab_index(space: SpaceId) -> usize {
    match space {
        SpaceId::Old => 0,
        SpaceId::Map => 1,
        SpaceId::Code => 2,
        SpaceId::SharedOld => 3,
        _ => unreachable!("evacuation does not allocate in {:?}", space),
    }
}

impl<'h> EvacuationAllocator<'h> {
    pub fn new(heap: &'h Heap, sweeper: &'h crate::sweeper::Sweeper) -> EvacuationAllocator<'h> {
        EvacuationAllocator {
            heap,
            sweeper,
            labs: [
                Lab { top: 0, limit: 0 },
                Lab { top: 0, limit: 0 },
                Lab { top: 0, limit: 0 },
                Lab { top: 0, limit: 0 },
            ],
        }
    }

    pub fn allocate(&mut self, space: SpaceId, size: usize) -> Option<Address> {
        let index = lab_index(space);
        if self.labs[index].top + size <= self.labs[index].limit {
            let result = self.labs[index].top;
            self.labs[index].top += size;
            return Some(result);
        }
        let (start, end) = self.refill_lab(space, size)?;
        let old = std::mem::replace(&mut self.labs[index], Lab { top: start + size, limit: end });
        self.drop_lab_tail(space, old);
        Some(start)
    }

    fn refill_lab(&mut self, space: SpaceId, min_size: usize) -> Option<(Address, Address)> {
        loop {
            if let Some(lab) = self.heap.paged_space(space).lock().allocate_lab(
                min_size,
                LAB_SIZE,
                &self.heap.registry,
            ) {
                return Some(lab);
            }
            // `allocate_lab` already tried to grow the space, so a miss
            // means exhaustion unless the sweeper still owes us pages.
            if !self.sweeper.sweep_next_page_of(self.heap, space) {
                return None;
            }
        }
    }

    fn drop_lab_tail(&self, space: SpaceId, lab: Lab) {
        if lab.limit > lab.top {
            self.heap
                .paged_space(space)
                .lock()
                .return_lab_tail(lab.top, lab.limit);
            let page = self.heap.page_of(lab.top).expect("lab escaped its page");
            self.heap.free_range(page, lab.top, lab.limit - lab.top);
        }
    }

    /// Release every buffer back to its owning space. Must run on join.
    pub fn finalize(&mut self) {
        for space in [SpaceId::Old, SpaceId::Map, SpaceId::Code, SpaceId::SharedOld] {
            let lab = std::mem::replace(
                &mut self.labs[lab_index(space)],
                Lab { top: 0, limit: 0 },
            );
            self.drop_lab_tail(space, lab);
        }
    }
}

/// Classifies every interior pointer of a migrated (or surviving) object
/// and records it into the destination page's remembered sets.
pub struct SlotRecordingVisitor<'h> {
    pub heap: &'h Heap,
}

impl<'h> ObjectVisitor for SlotRecordingVisitor<'h> {
    fn visit_strong(&mut self, host: HeapObject, slot: ObjectSlot) {
        if let Some(target) = slot.load().to_address() {
            self.heap.record_slot(host, slot, target);
        }
    }

    fn visit_weak(&mut self, host: HeapObject, slot: ObjectSlot) {
        self.visit_strong(host, slot);
    }

    fn visit_map_pointer(&mut self, host: HeapObject) {
        let map = host.map_or_forwarded_map();
        self.heap
            .record_slot(host, ObjectSlot(host.address()), map);
    }

    fn visit_ephemeron(
        &mut self,
        table: HeapObject,
        index: usize,
        key: ObjectSlot,
        value: ObjectSlot,
    ) {
        if let Some(key_addr) = key.load().to_address() {
            if self.heap.in_young_generation(key_addr) {
                self.heap.record_ephemeron_key(table.address(), index);
            } else {
                self.heap.record_slot(table, key, key_addr);
            }
        }
        self.visit_strong(table, value);
    }

    fn visit_embedded_pointer(&mut self, host: HeapObject, kind: SlotType, slot: ObjectSlot) {
        if let Some(target) = slot.load().to_address() {
            self.heap.record_typed_slot(host, kind, slot, target);
        }
    }
}

/// Parallel page visitor: copies live objects out of its claimed pages,
/// installs forwarding addresses and records migrated slots. One exists
/// per worker; `finalize` merges its bookkeeping on the main thread.
pub struct Evacuator<'h> {
    heap: &'h Heap,
    state: MarkingState<'h>,
    pub allocator: EvacuationAllocator<'h>,
    observers: Vec<&'h dyn MigrationObserver>,
    pub bytes_compacted: usize,
    duration_micros: usize,
    /// (failed object address, page address) for OOM-aborted pages.
    pub aborted_due_to_oom: Vec<(Address, usize)>,
}

impl<'h> Evacuator<'h> {
    pub fn new(heap: &'h Heap, sweeper: &'h crate::sweeper::Sweeper) -> Evacuator<'h> {
        Evacuator {
            heap,
            state: MarkingState::new(heap),
            allocator: EvacuationAllocator::new(heap, sweeper),
            observers: Vec::new(),
            bytes_compacted: 0,
            duration_micros: 0,
            aborted_due_to_oom: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, observer: &'h dyn MigrationObserver) {
        self.observers.push(observer);
    }

    pub fn evacuate_page(&mut self, page: &Page) {
        let mode = compute_evacuation_mode(page);
        let live_bytes = page.live_bytes();
        let started = Instant::now();
        match mode {
            EvacuationMode::ObjectsNewToOld => self.evacuate_new_space_objects(page),
            EvacuationMode::ObjectsOldToOld => self.evacuate_old_space_objects(page),
            EvacuationMode::PageNewToOld | EvacuationMode::PageNewToNew => {
                // Whole-page promotion: ownership already flipped, only the
                // slots of surviving objects need re-deriving.
                self.record_live_slots(page);
            }
        }
        let duration = started.elapsed().as_micros() as usize;
        self.duration_micros += duration;
        self.bytes_compacted += live_bytes.max(0) as usize;
        if self.heap.flags.trace_evacuation {
            log::debug!(
                "evacuation: page={:#x} mode={} live_bytes={} time_us={} aborted={}",
                page.area_start(),
                mode.name(),
                live_bytes,
                duration,
                page.is_flag_set(flags::COMPACTION_WAS_ABORTED),
            );
        }
    }

    /// Nursery evacuation cannot fail; running out of memory while the
    /// nursery must be emptied is fatal.
    fn evacuate_new_space_objects(&mut self, page: &Page) {
        // The full collector leaves nursery survivors black, the minor one
        // grey; both colors are live here.
        let mut live = Vec::new();
        page.iterate_live_objects(|obj, _color| {
            live.push(obj);
        });
        for obj in live {
            if obj.map_word().is_forwarding_address() {
                continue;
            }
            let size = obj.size();
            let space = self.promotion_target_space(obj);
            let Some(dst) = self.allocator.allocate(space, size) else {
                fatal_process_out_of_memory("nursery promotion");
            };
            self.migrate_object(obj, dst, size);
        }
        page.bitmap().clear_all();
        page.set_live_bytes(0);
    }

    /// Internalizable strings move to the shared heap when a shared string
    /// table is active.
    fn promotion_target_space(&self, obj: HeapObject) -> SpaceId {
        if self.heap.flags.shared_string_table
            && obj.kind() == ObjectKind::InternalizedString
            && !self.heap.is_shared_heap
        {
            SpaceId::SharedOld
        } else {
            SpaceId::Old
        }
    }

    fn evacuate_old_space_objects(&mut self, page: &Page) {
        let space = page.space();
        let mut black = Vec::new();
        page.iterate_live_objects(|obj, color| {
            if color == Color::Black {
                black.push(obj);
            }
        });
        for obj in &black {
            let size = obj.size();
            match self.allocator.allocate(space, size) {
                Some(dst) => self.migrate_object(*obj, dst, size),
                None => {
                    if self.heap.flags.crash_on_aborted_evacuation {
                        fatal_process_out_of_memory("old-space evacuation");
                    }
                    // Roll the prefix's mark bits back so the aborted page
                    // only reports the objects that were not copied.
                    page.bitmap()
                        .clear_range(0, page.offset_of(obj.address()));
                    self.aborted_due_to_oom
                        .push((obj.address(), page as *const Page as usize));
                    return;
                }
            }
        }
        page.bitmap().clear_all();
        page.set_live_bytes(0);
    }

    /// Raw copy, forwarding installation, observer notification and slot
    /// recording over the destination.
    fn migrate_object(&mut self, src: HeapObject, dst: Address, size: usize) {
        unsafe {
            core::ptr::copy_nonoverlapping(src.address() as *const u8, dst as *mut u8, size);
        }
        let dst_obj = HeapObject(dst);
        if crate::object::map_kind(dst_obj.map_or_forwarded_map()) == ObjectKind::Code {
            // Rebase the embedded entry point and keep the registry keyed
            // by the new address.
            dst_obj.set_raw_field(layout::CODE_ENTRY, dst + TAGGED_SIZE);
            let mut registry = self.heap.code_registry.lock();
            if let Some(entry) = registry.iter_mut().find(|a| **a == src.address()) {
                *entry = dst;
            }
        }
        src.set_map_word(MapWord::from_forwarding_address(dst));
        for observer in &self.observers {
            observer.migrate(self.heap, src, dst, size);
        }
        let mut recorder = SlotRecordingVisitor { heap: self.heap };
        iterate_body(dst_obj, dst_obj.map_or_forwarded_map(), &mut recorder);
    }

    pub fn record_live_slots(&mut self, page: &Page) {
        let mut recorder = SlotRecordingVisitor { heap: self.heap };
        page.iterate_live_objects(|obj, _color| {
            iterate_body(obj, obj.map_or_forwarded_map(), &mut recorder);
        });
    }

    /// Merge locally cached state back; main thread only.
    pub fn finalize(&mut self) -> Vec<(Address, usize)> {
        self.allocator.finalize();
        self.heap
            .record_compaction_event(self.bytes_compacted, self.duration_micros.max(1));
        std::mem::take(&mut self.aborted_due_to_oom)
    }

    pub fn marking_state(&self) -> &MarkingState<'h> {
        &self.state
    }
}

/// Worker count for a page set: enough workers that each handles roughly a
/// megabyte, capped by the configured task count.
pub fn number_of_evacuation_tasks(heap: &Heap, item_count: usize) -> usize {
    if !heap.flags.parallel_compaction {
        return 1;
    }
    let pages_per_task = (1024 * 1024 / PAGE_AREA_SIZE).max(1);
    let wanted = (item_count + pages_per_task - 1) / pages_per_task;
    wanted.clamp(1, heap.flags.worker_threads + 1)
}

/// Claim pages off a shared list and run them through per-worker
/// evacuators. Items are claimed exactly once via the atomic generator.
pub fn evacuate_pages_in_parallel(
    pool: &mut Pool,
    items: &[usize],
    evacuators: &mut Vec<Evacuator<'_>>,
) {
    if items.is_empty() {
        return;
    }
    let generator = IndexGenerator::new(items.len());
    let remaining = AtomicUsize::new(items.len());
    let slots: Vec<Mutex<&mut Evacuator>> =
        evacuators.iter_mut().map(Mutex::new).collect();
    let n_workers = slots.len();
    pool.scoped(|scope| {
        for worker_id in 1..n_workers {
            let generator = &generator;
            let remaining = &remaining;
            let slots = &slots;
            scope.execute(move || {
                run_evacuation_worker(&slots[worker_id], generator, remaining, items);
            });
        }
        run_evacuation_worker(&slots[0], &generator, &remaining, items);
    });
}

fn run_evacuation_worker(
    slot: &Mutex<&mut Evacuator>,
    generator: &IndexGenerator,
    remaining: &AtomicUsize,
    items: &[usize],
) {
    let mut evacuator = slot.lock();
    while remaining.load(Ordering::Relaxed) > 0 {
        let Some(index) = generator.next() else {
            return;
        };
        let page = unsafe { &*(items[index] as *const Page) };
        evacuator.evacuate_page(page);
        if remaining.fetch_sub(1, Ordering::Relaxed) <= 1 {
            return;
        }
    }
}

/// Aborted-page recovery: discard the copied prefix's recorded slots,
/// re-record over the surviving suffix and recompute live bytes. The page
/// then goes to the sweeper like any non-evacuated page.
pub fn re_record_page(heap: &Heap, failed_start: Address, page: &Page) {
    page.set_flag(flags::COMPACTION_WAS_ABORTED);
    let prefix_end = page.offset_of(failed_start);
    for class in [RememberedSetClass::OldToNew, RememberedSetClass::OldToShared] {
        if let Some(set) = page.slot_set(class) {
            set.remove_range(0, prefix_end);
        }
        page.with_typed_slots(|sets| sets[class.index()].remove_range(0, prefix_end));
    }
    let mut recorder = SlotRecordingVisitor { heap };
    let mut live = 0isize;
    page.iterate_live_objects(|obj, _color| {
        debug_assert!(!obj.map_word().is_forwarding_address());
        live += obj.size() as isize;
        iterate_body(obj, obj.map(), &mut recorder);
    });
    page.set_live_bytes(live);
}
