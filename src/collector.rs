use std::time::Instant;

use scoped_threadpool::Pool;

use crate::bitmap::Color;
use crate::clearing::ClearingPipeline;
use crate::evacuator::{
    evacuate_pages_in_parallel, number_of_evacuation_tasks, re_record_page, should_move_page,
    Evacuator,
};
use crate::heap::Heap;
use crate::job::Terminator;
use crate::marking::{parallel_marking_worker, Marker, MarkingState, MarkingWorklists, RootMarkingVisitor};
use crate::object::{Address, HeapObject, ObjectSlot, TAGGED_SIZE};
use crate::page::{flags, Page, SpaceId, PAGE_AREA_SIZE};
use crate::remembered_set::RememberedSetClass;
use crate::sweeper::Sweeper;
use crate::util::formatted_size;
use crate::visitor::SkipRoots;
use crate::weak_objects::{Ephemeron, WeakObjects};

const MB: usize = 1024 * 1024;

/// Only `Prepare` may leave `Idle`; every later phase asserts its
/// predecessor. `AbortCompaction` runs from any state without advancing.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CollectorState {
    Idle,
    PrepareGc,
    MarkLiveObjects,
    SweepSpaces,
    RelocateObjects,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StartCompactionMode {
    Incremental,
    Atomic,
}

/// The full-heap mark-compact collector. Owns the marking worklists, the
/// weak-object pools, the sweeper and the evacuation-candidate list; holds
/// its heap by non-owning pointer for the lifetime of the isolate.
pub struct MarkCompactCollector {
    heap: *const Heap,
    state: CollectorState,
    compacting: bool,
    pub marking_worklists: MarkingWorklists,
    pub weak_objects: WeakObjects,
    pub sweeper: Sweeper,
    pool: Pool,
    /// Main-thread only; mutated during Prepare, Evacuate and Abort.
    evacuation_candidates: Vec<usize>,
    new_space_evacuation_pages: Vec<usize>,
    promoted_large_pages: Vec<usize>,
    aborted_due_to_oom: Vec<(Address, usize)>,
    aborted_due_to_flags: Vec<(Address, usize)>,
    was_marking_incrementally: bool,
}

unsafe impl Send for MarkCompactCollector {}

impl MarkCompactCollector {
    pub fn new(heap: &Heap) -> MarkCompactCollector {
        MarkCompactCollector {
            heap: heap as *const Heap,
            state: CollectorState::Idle,
            compacting: false,
            marking_worklists: MarkingWorklists::default(),
            weak_objects: WeakObjects::new(),
            sweeper: Sweeper::new(),
            pool: Pool::new(heap.flags.worker_threads as u32),
            evacuation_candidates: Vec::new(),
            new_space_evacuation_pages: Vec::new(),
            promoted_large_pages: Vec::new(),
            aborted_due_to_oom: Vec::new(),
            aborted_due_to_flags: Vec::new(),
            was_marking_incrementally: false,
        }
    }

    /// The heap outlives the collector by construction; the unbounded
    /// lifetime lets phase methods split borrows against collector state.
    #[inline]
    pub fn heap(&self) -> &'static Heap {
        unsafe { &*self.heap }
    }

    pub fn set_up(&mut self) {
        debug_assert_eq!(self.state, CollectorState::Idle);
    }

    pub fn tear_down(&mut self) {
        self.abort_compaction();
        self.sweeper.ensure_completed(self.heap());
        while self.marking_worklists.main.pop().is_some() {}
        while self.marking_worklists.wrapper.pop().is_some() {}
    }

    pub fn is_compacting(&self) -> bool {
        self.compacting
    }

    pub fn evacuation_candidate_count(&self) -> usize {
        self.evacuation_candidates.len()
    }

    /// One full cycle. The mutator is stopped by the caller (safepoint).
    pub fn collect_garbage(&mut self) {
        self.prepare();
        self.mark_live_objects();
        self.clear_non_live_references();
        self.verify_marking();
        self.start_sweep_spaces();
        self.evacuate();
        self.finish();
    }

    pub fn prepare(&mut self) {
        assert_eq!(self.state, CollectorState::Idle);
        self.state = CollectorState::PrepareGc;
        let heap = self.heap();
        // Candidates are only selected over fully swept pages.
        self.sweeper.ensure_completed(heap);
        self.was_marking_incrementally = heap.incremental.is_marking();
        // The incremental marker carries its progress in worklists, not in
        // the bitmaps, so the atomic pause always starts from clean marks
        // and re-greys the residue.
        if !self.compacting {
            self.start_compaction(StartCompactionMode::Atomic);
        }
        self.start_marking();
        heap.embedder.lock().prepare_for_trace();
    }

    /// Select evacuation candidates. Incremental entry may run long before
    /// the pause; atomic entry happens inside `Prepare`.
    pub fn start_compaction(&mut self, _mode: StartCompactionMode) -> bool {
        debug_assert!(self.evacuation_candidates.is_empty());
        let heap = self.heap();
        if !heap.flags.should_compact() {
            return false;
        }
        self.collect_evacuation_candidates(SpaceId::Old);
        if heap.flags.compact_maps {
            self.collect_evacuation_candidates(SpaceId::Map);
        }
        if heap.flags.compact_code_space {
            self.collect_evacuation_candidates(SpaceId::Code);
        }
        self.compacting = !self.evacuation_candidates.is_empty();
        self.compacting
    }

    /// Fresh mark bits and live-byte counters for the whole heap; any
    /// residue from the incremental marker has been consumed by now.
    fn start_marking(&mut self) {
        for page_ptr in self.heap().all_pages() {
            let page = unsafe { &*page_ptr };
            page.bitmap().clear_all();
            page.set_live_bytes(0);
        }
    }

    fn compute_evacuation_heuristics(
        &self,
        area_size: usize,
    ) -> (usize, usize) {
        const TARGET_FRAGMENTATION_PERCENT_FOR_REDUCE_MEMORY: usize = 20;
        const MAX_EVACUATED_BYTES_FOR_REDUCE_MEMORY: usize = 12 * MB;
        const TARGET_FRAGMENTATION_PERCENT_FOR_OPTIMIZE_MEMORY: usize = 20;
        const MAX_EVACUATED_BYTES_FOR_OPTIMIZE_MEMORY: usize = 6 * MB;
        // Latency-critical regular mode starts soft and switches to a
        // compaction-speed-derived target once samples exist.
        const TARGET_FRAGMENTATION_PERCENT: usize = 70;
        const MAX_EVACUATED_BYTES: usize = 4 * MB;
        const TARGET_MS_PER_AREA: f64 = 0.5;

        let heap = self.heap();
        if heap.should_reduce_memory() {
            (
                TARGET_FRAGMENTATION_PERCENT_FOR_REDUCE_MEMORY,
                MAX_EVACUATED_BYTES_FOR_REDUCE_MEMORY,
            )
        } else if heap.flags.optimize_for_memory {
            (
                TARGET_FRAGMENTATION_PERCENT_FOR_OPTIMIZE_MEMORY,
                MAX_EVACUATED_BYTES_FOR_OPTIMIZE_MEMORY,
            )
        } else {
            let speed = heap.compaction_speed();
            let target = if speed != 0.0 {
                let estimated_ms_per_area = 1.0 + area_size as f64 / speed;
                let target =
                    100usize.saturating_sub((100.0 * TARGET_MS_PER_AREA / estimated_ms_per_area) as usize);
                target.max(TARGET_FRAGMENTATION_PERCENT_FOR_REDUCE_MEMORY)
            } else {
                TARGET_FRAGMENTATION_PERCENT
            };
            (target, MAX_EVACUATED_BYTES)
        }
    }

    fn add_evacuation_candidate(&mut self, page: &Page) {
        debug_assert!(page
            .slot_set(RememberedSetClass::OldToOld)
            .map_or(true, |set| set.is_empty()));
        page.set_flag(flags::EVACUATION_CANDIDATE);
        // The candidate's free ranges disappear from the allocator; its
        // live objects are about to leave.
        self.heap()
            .paged_space(page.space())
            .lock()
            .evict_free_list(page);
        self.evacuation_candidates.push(page as *const Page as usize);
    }

    fn collect_evacuation_candidates(&mut self, space_id: SpaceId) {
        let heap = self.heap();
        let area_size = PAGE_AREA_SIZE;
        let in_standard_path = !(heap.flags.manual_evacuation_candidates_selection
            || heap.flags.stress_compaction_random
            || heap.flags.stress_compaction
            || heap.flags.compact_on_every_full_gc);
        let (target_fragmentation_percent, max_evacuated_bytes) =
            self.compute_evacuation_heuristics(area_size);
        let free_bytes_threshold = target_fragmentation_percent * (area_size / 100);

        // Pairs of (allocated bytes, page).
        let mut pages: Vec<(usize, usize)> = Vec::new();
        {
            let space = heap.paged_space(space_id).lock();
            let linear_area_owner = space.linear_area_page();
            for page in space.pages() {
                if page.is_flag_set(flags::NEVER_EVACUATE)
                    || Some(page as *const Page) == linear_area_owner
                {
                    continue;
                }
                if page.is_flag_set(flags::PINNED) {
                    debug_assert!(
                        !page.is_flag_set(flags::FORCE_EVACUATION_CANDIDATE_FOR_TESTING)
                    );
                    page.clear_flag(flags::PINNED);
                    continue;
                }
                assert!(!page.is_evacuation_candidate());
                assert!(page
                    .slot_set(RememberedSetClass::OldToOld)
                    .map_or(true, |set| set.is_empty()));
                if !in_standard_path
                    || area_size - page.allocated_bytes().min(area_size) >= free_bytes_threshold
                {
                    pages.push((page.allocated_bytes(), page as *const Page as usize));
                }
            }
        }

        let mut candidate_count = 0usize;
        let mut total_live_bytes = 0usize;

        if heap.flags.manual_evacuation_candidates_selection {
            for &(live, page_addr) in &pages {
                let page = unsafe { &*(page_addr as *const Page) };
                if page.is_flag_set(flags::FORCE_EVACUATION_CANDIDATE_FOR_TESTING) {
                    candidate_count += 1;
                    total_live_bytes += live;
                    page.clear_flag(flags::FORCE_EVACUATION_CANDIDATE_FOR_TESTING);
                    self.add_evacuation_candidate(page);
                }
            }
        } else if heap.flags.stress_compaction_random {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            let fraction: f64 = rng.gen();
            let pages_to_mark = (fraction * (pages.len() + 1) as f64) as usize;
            let mut indices: Vec<usize> = (0..pages.len()).collect();
            for i in 0..pages_to_mark.min(pages.len()) {
                let pick = rng.gen_range(i..indices.len());
                indices.swap(i, pick);
                let (live, page_addr) = pages[indices[i]];
                candidate_count += 1;
                total_live_bytes += live;
                self.add_evacuation_candidate(unsafe { &*(page_addr as *const Page) });
            }
        } else if heap.flags.stress_compaction {
            for (i, &(live, page_addr)) in pages.iter().enumerate() {
                if i % 2 == 0 {
                    candidate_count += 1;
                    total_live_bytes += live;
                    self.add_evacuation_candidate(unsafe { &*(page_addr as *const Page) });
                }
            }
        } else {
            // Sort from most free to least free, then accept greedily until
            // the byte quota is met.
            pages.sort_by_key(|&(live, _)| live);
            for &(live, _) in &pages {
                debug_assert!(area_size >= live);
                if heap.flags.compact_on_every_full_gc
                    || total_live_bytes + live <= max_evacuated_bytes
                {
                    candidate_count += 1;
                    total_live_bytes += live;
                }
                if heap.flags.trace_fragmentation_verbose {
                    log::debug!(
                        "compaction-selection-page: space={} free_bytes_page={} \
                         fragmentation_limit_percent={} sum_compaction_kb={}",
                        space_id.name(),
                        area_size - live,
                        target_fragmentation_percent,
                        total_live_bytes / 1024,
                    );
                }
            }
            // Pages the surviving objects will fill in the worst case:
            // evacuation that releases nothing only churns.
            let estimated_new_pages = (total_live_bytes + area_size - 1) / area_size;
            debug_assert!(estimated_new_pages <= candidate_count || candidate_count == 0);
            if candidate_count.saturating_sub(estimated_new_pages) == 0
                && !heap.flags.compact_on_every_full_gc
            {
                candidate_count = 0;
            }
            for &(_, page_addr) in pages.iter().take(candidate_count) {
                self.add_evacuation_candidate(unsafe { &*(page_addr as *const Page) });
            }
        }

        if heap.flags.trace_fragmentation {
            log::debug!(
                "compaction-selection: space={} reduce_memory={} pages={} total_live_bytes={}",
                space_id.name(),
                heap.should_reduce_memory(),
                candidate_count,
                formatted_size(total_live_bytes),
            );
        }
    }

    /// Reset the candidate list without advancing the state machine. Legal
    /// from any state.
    pub fn abort_compaction(&mut self) {
        if self.compacting {
            let heap = self.heap();
            for page_ptr in heap.all_pages() {
                let page = unsafe { &*page_ptr };
                page.release_slot_set(RememberedSetClass::OldToOld);
                page.release_slot_set(RememberedSetClass::OldToCode);
                page.with_typed_slots(|sets| {
                    sets[RememberedSetClass::OldToOld.index()] = Default::default();
                    sets[RememberedSetClass::OldToCode.index()] = Default::default();
                });
            }
            for &page_addr in &self.evacuation_candidates {
                let page = unsafe { &*(page_addr as *const Page) };
                page.clear_flag(flags::EVACUATION_CANDIDATE);
            }
            self.compacting = false;
            self.evacuation_candidates.clear();
        }
        debug_assert!(self.evacuation_candidates.is_empty());
    }

    // Marking.

    /// The root-closure composition of the atomic pause.
    pub fn mark_live_objects(&mut self) {
        assert_eq!(self.state, CollectorState::PrepareGc);
        self.state = CollectorState::MarkLiveObjects;
        let heap = self.heap();

        heap.embedder.lock().enter_final_pause();

        {
            let mut marker = Marker::new(heap, &self.marking_worklists, &self.weak_objects);
            if self.was_marking_incrementally {
                heap.incremental.stop();
                heap.incremental.publish_all();
                while let Some(obj) = heap.incremental.residual_pop() {
                    marker.mark_object(obj);
                }
            }
            // Residue from a previous cycle's local buffers would violate
            // the barrier invariant.
            debug_assert!(marker.weak.next_ephemerons.is_local_empty());
            let mut root_visitor = RootMarkingVisitor { marker: &mut marker };
            heap.roots.iterate(&mut root_visitor, SkipRoots::NONE);
            if heap.is_shared_heap {
                for &client in heap.client_heaps.lock().iter() {
                    let client = unsafe { &*client };
                    client.roots.iterate(&mut root_visitor, SkipRoots::NONE);
                }
                marker.publish();
                self.mark_objects_from_client_heaps();
            }
            marker.publish();
        }

        if heap.flags.parallel_marking {
            self.mark_transitive_closure_in_parallel();
        }
        self.mark_transitive_closure();
        self.verify_ephemeron_marking();

        heap.incremental.deactivate_all();
        heap.increment_epoch();
        if heap.flags.trace_gc {
            log::debug!("marking finished, epoch {}", heap.epoch());
        }
    }

    /// In shared-GC mode every client object is scanned: slots pointing
    /// into the shared heap are marked and recorded as OLD_TO_SHARED.
    fn mark_objects_from_client_heaps(&self) {
        let heap = self.heap();
        let mut marker = Marker::new(heap, &self.marking_worklists, &self.weak_objects);
        for &client in heap.client_heaps.lock().iter() {
            let client = unsafe { &*client };
            for page_ptr in client.all_pages() {
                let page = unsafe { &*page_ptr };
                page.iterate_objects_linear(|obj| {
                    if obj.is_filler() {
                        return;
                    }
                    let words = obj.size() / TAGGED_SIZE;
                    for i in 0..words.saturating_sub(1) {
                        let slot = obj.slot(i);
                        let Some(target) = slot.load().to_address() else {
                            continue;
                        };
                        let in_shared = heap
                            .page_of(target)
                            .map_or(false, |p| p.space() == SpaceId::SharedOld);
                        if in_shared {
                            marker.mark_object(HeapObject(target));
                            page.slot_set_or_create(RememberedSetClass::OldToShared)
                                .insert(page.offset_of(slot.0));
                        }
                    }
                });
            }
        }
        marker.publish();
    }

    fn mark_transitive_closure_in_parallel(&mut self) {
        let heap = self.heap();
        let workers = (heap.flags.worker_threads).max(1);
        let terminator = Terminator::new(workers);
        let worklists = &self.marking_worklists;
        let weak = &self.weak_objects;
        self.pool.scoped(|scope| {
            for _ in 0..workers {
                let terminator = &terminator;
                scope.execute(move || {
                    parallel_marking_worker(heap, worklists, weak, terminator);
                });
            }
        });
    }

    /// Ephemeron fixpoint, falling back to the linear algorithm when it
    /// fails to converge.
    fn mark_transitive_closure(&mut self) {
        let heap = self.heap();
        let mut marker = Marker::new(heap, &self.marking_worklists, &self.weak_objects);
        if !self.mark_transitive_closure_until_fixpoint(&mut marker) {
            self.mark_transitive_closure_linear(&mut marker);
        }
        marker.publish();
        assert!(self.marking_worklists.main.is_empty());
        assert!(self.marking_worklists.wrapper.is_empty());
    }

    fn mark_transitive_closure_until_fixpoint(&self, marker: &mut Marker) -> bool {
        let heap = self.heap();
        let max_iterations = heap.flags.ephemeron_fixpoint_iterations;
        let mut iterations = 0;
        loop {
            self.perform_wrapper_tracing(marker);
            if iterations >= max_iterations {
                // Give up fixpoint iteration and switch to the linear
                // algorithm.
                return false;
            }
            debug_assert!(marker.weak.current_ephemerons.is_local_and_global_empty());
            self.weak_objects
                .current_ephemerons
                .swap_from(&self.weak_objects.next_ephemerons);
            let another_iteration = self.process_ephemerons(marker);
            assert!(marker.weak.current_ephemerons.is_local_empty());
            assert!(marker.weak.discovered_ephemerons.is_local_empty());
            iterations += 1;
            if !another_iteration
                && marker.local.is_local_and_global_empty()
                && marker.wrapper_local.is_local_and_global_empty()
                && heap.embedder.lock().is_remote_tracing_done()
            {
                return true;
            }
        }
    }

    fn process_ephemerons(&self, marker: &mut Marker) -> bool {
        let mut another_iteration = false;

        // Drain current ephemerons; unresolved pairs go to the next round.
        while let Some(Ephemeron { key, value }) = marker.weak.current_ephemerons.pop() {
            if marker.process_ephemeron(key, value) {
                another_iteration = true;
            }
        }

        // Drain the marking worklist; discovered ephemerons accumulate.
        let (_, objects_processed) = marker.process_marking_worklist(0);
        if objects_processed > 0 {
            // Any object marked here might feed ephemeron semantics on the
            // next pass.
            another_iteration = true;
        }

        while let Some(Ephemeron { key, value }) = marker.weak.discovered_ephemerons.pop() {
            if marker.process_ephemeron(key, value) {
                another_iteration = true;
            }
        }

        marker.weak.ephemeron_hash_tables.publish();
        marker.weak.next_ephemerons.publish();
        another_iteration
    }

    /// Guaranteed-terminating fallback: a key-to-values multimap plus a
    /// bounded newly-discovered buffer; buffer overflow degrades to
    /// conservatively revisiting every pending ephemeron.
    fn mark_transitive_closure_linear(&self, marker: &mut Marker) {
        let heap = self.heap();
        let mut key_to_values: ahash::AHashMap<Address, Vec<HeapObject>> = ahash::AHashMap::new();
        debug_assert!(marker.weak.current_ephemerons.is_local_and_global_empty());
        self.weak_objects
            .current_ephemerons
            .swap_from(&self.weak_objects.next_ephemerons);
        while let Some(Ephemeron { key, value }) = marker.weak.current_ephemerons.pop() {
            marker.process_ephemeron(key, value);
            if marker.state.is_white(value) {
                key_to_values.entry(key.address()).or_default().push(value);
            }
        }

        marker.start_tracking_newly_discovered(key_to_values.len().max(16));
        loop {
            self.perform_wrapper_tracing(marker);
            marker.reset_newly_discovered();
            marker.newly_discovered_limit = key_to_values.len().max(16);
            marker.process_marking_worklist(0);

            while let Some(Ephemeron { key, value }) = marker.weak.discovered_ephemerons.pop() {
                marker.process_ephemeron(key, value);
                if marker.state.is_white(value) {
                    key_to_values.entry(key.address()).or_default().push(value);
                }
            }

            if marker.newly_discovered_overflowed {
                // The buffer lost track: conservatively visit every pending
                // ephemeron once.
                marker.weak.next_ephemerons.publish();
                let mut to_mark = Vec::new();
                self.weak_objects.next_ephemerons.iterate(|eph| {
                    to_mark.push(*eph);
                });
                for eph in to_mark {
                    if marker.state.is_black_or_grey(eph.key) {
                        marker.mark_object(eph.value);
                    }
                }
            } else {
                let discovered: Vec<HeapObject> = marker.newly_discovered.clone();
                for object in discovered {
                    if let Some(values) = key_to_values.get(&object.address()) {
                        for &value in values {
                            marker.mark_object(value);
                        }
                    }
                }
            }

            // Do not drain the worklist here: the emptiness checks below
            // decide whether another iteration is needed.
            let work_to_do = !marker.local.is_local_and_global_empty()
                || !marker.wrapper_local.is_local_and_global_empty()
                || !heap.embedder.lock().is_remote_tracing_done();
            assert!(marker.weak.discovered_ephemerons.is_local_and_global_empty());
            if !work_to_do {
                break;
            }
        }

        marker.stop_tracking_newly_discovered();
        assert!(marker.local.is_local_and_global_empty());
        marker.weak.ephemeron_hash_tables.publish();
        marker.weak.next_ephemerons.publish();
    }

    /// Hand the wrapper queue to the embedder and read back the interior
    /// roots it discovered.
    fn perform_wrapper_tracing(&self, marker: &mut Marker) {
        let heap = self.heap();
        marker.wrapper_local.publish();
        let mut wrappers = Vec::new();
        while let Some(wrapper) = self.marking_worklists.wrapper.pop() {
            wrappers.push(wrapper.address());
        }
        let mut embedder = heap.embedder.lock();
        if !wrappers.is_empty() {
            embedder.register_wrappers(&wrappers);
        }
        embedder.trace(f64::INFINITY);
        for addr in embedder.take_discovered() {
            marker.mark_object(HeapObject(addr));
        }
    }

    /// The fixpoint must leave no resolvable ephemeron behind.
    fn verify_ephemeron_marking(&mut self) {
        assert!(self.weak_objects.ephemerons_settled());
        if cfg!(debug_assertions) {
            let heap = self.heap();
            let mut marker = Marker::new(heap, &self.marking_worklists, &self.weak_objects);
            debug_assert!(marker.weak.current_ephemerons.is_local_and_global_empty());
            self.weak_objects
                .current_ephemerons
                .swap_from(&self.weak_objects.next_ephemerons);
            while let Some(Ephemeron { key, value }) = marker.weak.current_ephemerons.pop() {
                debug_assert!(!marker.process_ephemeron(key, value));
                marker.weak.next_ephemerons.push(Ephemeron { key, value });
            }
            marker.weak.next_ephemerons.publish();
        }
    }

    // Clearing.

    pub fn clear_non_live_references(&mut self) {
        assert_eq!(self.state, CollectorState::MarkLiveObjects);
        let heap = self.heap();
        let pipeline = ClearingPipeline::new(heap, &self.weak_objects);
        pipeline.run(&mut self.pool);
        // Unresolved ephemerons carry over: their values stay unmarked and
        // the entries die with their tables in the weak-collection pass.
        while self.weak_objects.next_ephemerons.pop().is_some() {}
    }

    // Verification.

    /// Full-heap marking verifier; compiled-in checks for the testable
    /// invariants after marking.
    pub fn verify_marking(&self) {
        let heap = self.heap();
        if !heap.flags.verify_heap {
            return;
        }
        let state = MarkingState::new(heap);
        for page_ptr in heap.all_pages() {
            let page = unsafe { &*page_ptr };
            assert!(
                !page.bitmap().has_corrupt_pattern(),
                "impossible mark-bit pattern on page {:#x}",
                page.area_start()
            );
            let mut live = 0isize;
            page.iterate_live_objects(|obj, color| {
                assert_eq!(color, Color::Black, "grey object survived the fixpoint");
                live += obj.size() as isize;
                let map = obj.map();
                assert!(state.is_black_or_grey(HeapObject(map)));
                let mut verifier = VerifyingVisitor { state: &state };
                crate::visitor::iterate_body(obj, map, &mut verifier);
            });
            assert_eq!(
                live,
                page.live_bytes(),
                "live-byte counter out of sync on page {:#x}",
                page.area_start()
            );
        }
    }

    // Sweeping.

    /// Hand every non-candidate page to the sweeper and let it run
    /// concurrently with the remaining phases and the mutator.
    pub fn start_sweep_spaces(&mut self) {
        assert_eq!(self.state, CollectorState::MarkLiveObjects);
        self.state = CollectorState::SweepSpaces;
        let heap = self.heap();
        heap.lo_space.lock().sweep(&heap.registry);
        for space_id in [SpaceId::Old, SpaceId::Map, SpaceId::Code, SpaceId::SharedOld] {
            if space_id == SpaceId::SharedOld && !heap.is_shared_heap {
                continue;
            }
            let mut space = heap.paged_space(space_id).lock();
            // Free lists are rebuilt from this cycle's marks; entries from
            // the last cycle would hand evacuators memory the sweeper is
            // about to free again.
            space.clear_free_list();
            for page in space.pages() {
                if !page.is_evacuation_candidate() {
                    self.sweeper.add_page(space_id, page);
                }
            }
        }
        self.sweeper.start_sweeping(heap);
    }

    // Evacuation.

    pub fn evacuate(&mut self) {
        assert_eq!(self.state, CollectorState::SweepSpaces);
        self.state = CollectorState::RelocateObjects;
        let heap = self.heap();

        self.evacuate_prologue();

        let started = Instant::now();
        let items = self.gather_evacuation_items();
        let pages_count = items.len();
        let mut wanted_num_tasks = 0;
        if !items.is_empty() {
            wanted_num_tasks = number_of_evacuation_tasks(heap, items.len());
            let sweeper = &self.sweeper;
            let mut evacuators: Vec<Evacuator> =
                (0..wanted_num_tasks).map(|_| Evacuator::new(heap, sweeper)).collect();
            evacuate_pages_in_parallel(&mut self.pool, &items, &mut evacuators);
            for evacuator in &mut evacuators {
                self.aborted_due_to_oom.extend(evacuator.finalize());
            }
        }
        let aborted_pages = self.post_process_evacuation_candidates();
        if heap.flags.trace_evacuation {
            log::debug!(
                "evacuation-summary: parallel={} pages={} wanted_tasks={} time_us={} aborted={}",
                heap.flags.parallel_compaction,
                pages_count,
                wanted_num_tasks,
                started.elapsed().as_micros(),
                aborted_pages,
            );
        }

        crate::update_pointers::update_pointers_after_evacuation(heap, &mut self.pool);
        crate::clearing::update_allocation_site_list(heap);

        self.evacuate_epilogue();
    }

    /// Flip the nursery, promote hot pages wholesale and apply the
    /// stack-sensitive abort policy before any copying starts.
    fn evacuate_prologue(&mut self) {
        let heap = self.heap();
        {
            let mut new_space = heap.new_space.lock();
            new_space.flip();
            self.new_space_evacuation_pages = new_space.from_page_pointers().iter().map(|&p| p as usize).collect();
        }

        // Whole-page promotion for hot nursery pages.
        for &page_addr in &self.new_space_evacuation_pages.clone() {
            let page = unsafe { &*(page_addr as *const Page) };
            let live = page.live_bytes().max(0) as usize;
            if live == 0 {
                continue;
            }
            if should_move_page(heap, page, live, true) {
                let boxed = heap.new_space.lock().take_from_page(page as *const Page);
                if let Some(boxed) = boxed {
                    boxed.clear_flag(flags::FROM_PAGE);
                    boxed.set_flag(flags::PAGE_NEW_OLD_PROMOTION);
                    heap.old_space.lock().adopt_page(boxed);
                }
            }
        }

        // Evacuating with a stack restricts which candidates may move.
        let stack_present = !heap.roots.stack.is_empty();
        if stack_present {
            for &page_addr in &self.evacuation_candidates {
                let page = unsafe { &*(page_addr as *const Page) };
                let forbidden = !heap.flags.compact_with_stack
                    || (page.space() == SpaceId::Code
                        && !heap.flags.compact_code_space_with_stack);
                if forbidden {
                    self.aborted_due_to_flags.push((page.area_start(), page_addr));
                    // Flagged early so item gathering can filter the page.
                    page.set_flag(flags::COMPACTION_WAS_ABORTED);
                }
            }
        }

        // Promote every live young large object eagerly.
        let new_lo_pages = heap.new_lo_space.lock().page_pointers();
        for page_ptr in new_lo_pages {
            let page = unsafe { &*page_ptr };
            if page.bitmap().is_black_or_grey(0) {
                if let Some(boxed) = heap.new_lo_space.lock().take_page(page_ptr) {
                    boxed.set_flag(flags::PAGE_NEW_OLD_PROMOTION);
                    heap.lo_space.lock().adopt_page(boxed);
                    self.promoted_large_pages.push(page_ptr as usize);
                }
            }
        }
    }

    /// Nursery pages run before old-space candidates: their evacuation
    /// cannot be aborted.
    fn gather_evacuation_items(&self) -> Vec<usize> {
        let mut items = Vec::new();
        for &page_addr in &self.new_space_evacuation_pages {
            let page = unsafe { &*(page_addr as *const Page) };
            if page.live_bytes() <= 0 && !page.is_flag_set(flags::PAGE_NEW_OLD_PROMOTION) {
                continue;
            }
            items.push(page_addr);
        }
        for &page_addr in &self.evacuation_candidates {
            let page = unsafe { &*(page_addr as *const Page) };
            if page.is_flag_set(flags::COMPACTION_WAS_ABORTED) {
                continue;
            }
            items.push(page_addr);
        }
        items.extend(self.promoted_large_pages.iter().copied());
        items
    }

    /// Recover aborted pages and detach evacuated ones. Returns the number
    /// of aborted candidates.
    fn post_process_evacuation_candidates(&mut self) -> usize {
        let heap = self.heap();
        assert!(
            !heap.flags.crash_on_aborted_evacuation || self.aborted_due_to_oom.is_empty()
        );
        for &(failed_start, page_addr) in &self.aborted_due_to_oom {
            re_record_page(heap, failed_start, unsafe { &*(page_addr as *const Page) });
        }
        for &(failed_start, page_addr) in &self.aborted_due_to_flags {
            re_record_page(heap, failed_start, unsafe { &*(page_addr as *const Page) });
        }
        let aborted_pages = self.aborted_due_to_oom.len() + self.aborted_due_to_flags.len();
        let mut aborted_pages_verified = 0;
        for &page_addr in &self.evacuation_candidates {
            let page = unsafe { &*(page_addr as *const Page) };
            if page.is_flag_set(flags::COMPACTION_WAS_ABORTED) {
                // The page returns to a regular state once the candidate
                // flag drops.
                page.clear_flag(flags::EVACUATION_CANDIDATE);
                aborted_pages_verified += 1;
            } else {
                debug_assert!(page.is_evacuation_candidate());
            }
        }
        debug_assert_eq!(aborted_pages_verified, aborted_pages);
        aborted_pages
    }

    fn evacuate_epilogue(&mut self) {
        let heap = self.heap();

        // Promoted nursery pages go to the sweeper as old pages now.
        let old_space_pages = heap.old_space.lock().page_pointers();
        for page_ptr in old_space_pages {
            let page = unsafe { &*page_ptr };
            if page.is_flag_set(flags::PAGE_NEW_OLD_PROMOTION) {
                page.clear_flag(flags::PAGE_NEW_OLD_PROMOTION);
                page.clear_flag(flags::TO_PAGE);
                self.sweeper.add_page(SpaceId::Old, page);
            }
        }
        for &page_addr in &self.promoted_large_pages {
            let page = unsafe { &*(page_addr as *const Page) };
            debug_assert!(page.is_flag_set(flags::PAGE_NEW_OLD_PROMOTION));
            page.clear_flag(flags::PAGE_NEW_OLD_PROMOTION);
        }
        self.promoted_large_pages.clear();

        // Aborted candidates are swept rather than released.
        for &page_addr in self.evacuation_candidates.clone().iter() {
            let page = unsafe { &*(page_addr as *const Page) };
            if !page.is_evacuation_candidate() {
                // Aborted: candidate flag already dropped in post-process.
                page.clear_flag(flags::COMPACTION_WAS_ABORTED);
                self.sweeper.add_page(page.space(), page);
            } else {
                let space_id = page.space();
                heap.paged_space(space_id)
                    .lock()
                    .release_page(page as *const Page, &heap.registry);
            }
        }
        self.evacuation_candidates.clear();
        self.compacting = false;
        self.aborted_due_to_oom.clear();
        self.aborted_due_to_flags.clear();

        // Dead young large objects die with the cycle.
        heap.new_lo_space.lock().sweep(&heap.registry);

        {
            let mut new_space = heap.new_space.lock();
            new_space.release_from_space(&heap.registry);
            let top = new_space.reset_allocation_area(&heap.registry);
            new_space.set_age_mark(top);
        }
        self.new_space_evacuation_pages.clear();
    }

    pub fn finish(&mut self) {
        assert_eq!(self.state, CollectorState::RelocateObjects);
        self.state = CollectorState::Idle;
        self.sweeper.finish_sweeping_if_out_of_work();
        debug_assert!(self.evacuation_candidates.is_empty());
    }

    /// Drain the sweeper, farming a large backlog out to the worker pool
    /// first.
    pub fn ensure_sweeping_completed(&mut self) {
        let heap = self.heap();
        if self.sweeper.pending_page_count() > 8 {
            self.sweeper.sweep_in_parallel(heap, &mut self.pool);
        }
        self.sweeper.ensure_completed(heap);
    }

    pub fn ensure_page_is_swept(&self, page: &Page) {
        self.sweeper.ensure_page_swept(self.heap(), page);
    }
}

struct VerifyingVisitor<'a, 'h> {
    state: &'a MarkingState<'h>,
}

impl<'a, 'h> crate::visitor::ObjectVisitor for VerifyingVisitor<'a, 'h> {
    fn visit_strong(&mut self, _host: HeapObject, slot: ObjectSlot) {
        if let Some(target) = slot.load().to_address() {
            assert!(
                self.state.is_black_or_grey(HeapObject(target)),
                "black object references white object {:#x}",
                target
            );
        }
    }

    fn visit_ephemeron(
        &mut self,
        _table: HeapObject,
        _index: usize,
        key: ObjectSlot,
        value: ObjectSlot,
    ) {
        // Ephemeron fixpoint invariant: a black key implies a black value.
        if let (Some(key), Some(value)) = (key.load().to_address(), value.load().to_address()) {
            if self.state.is_black(HeapObject(key)) {
                assert!(self.state.is_black_or_grey(HeapObject(value)));
            }
        }
    }
}
