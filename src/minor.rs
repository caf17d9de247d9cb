use ahash::AHashMap;
use scoped_threadpool::Pool;

use crate::evacuator::{
    evacuate_pages_in_parallel, number_of_evacuation_tasks, should_move_page, Evacuator,
};
use crate::heap::Heap;
use crate::job::{IndexGenerator, Terminator};
use crate::object::{HeapObject, ObjectSlot};
use crate::page::{flags, Page, SpaceId};
use crate::remembered_set::{RememberedSetClass, SlotCallbackResult};
use crate::sweeper::Sweeper;
use crate::util::formatted_size;
use crate::visitor::{
    iterate_body, ObjectVisitor, RootCategory, RootVisitor, SkipRoots,
};
use crate::worklist::{LocalWorklist, Worklist};

/// Worker cap for minor marking and evacuation.
const MAX_PARALLEL_TASKS: usize = 8;

/// The young-generation mark-compact collector. Grey is its "marked"
/// state; Black stays reserved for the full collector so both kinds of
/// mark metadata can coexist on mixed pages.
pub struct MinorMarkCompactCollector {
    heap: *const Heap,
    worklist: Worklist<HeapObject>,
    pub sweeper: Sweeper,
    pool: Pool,
}

unsafe impl Send for MinorMarkCompactCollector {}

impl MinorMarkCompactCollector {
    pub fn new(heap: &Heap) -> MinorMarkCompactCollector {
        MinorMarkCompactCollector {
            heap: heap as *const Heap,
            worklist: Worklist::new(),
            sweeper: Sweeper::new(),
            pool: Pool::new(heap.flags.worker_threads.clamp(1, MAX_PARALLEL_TASKS) as u32),
        }
    }

    #[inline]
    fn heap(&self) -> &'static Heap {
        unsafe { &*self.heap }
    }

    /// One minor cycle: grey-mark the nursery, clear the young-side weak
    /// state, evacuate survivors, update pointers and flip the semispace.
    pub fn collect_garbage(&mut self) {
        let heap = self.heap();
        debug_assert!(heap.flags.minor_mc);
        self.sweeper.ensure_completed(heap);
        self.reset_young_marking_state();
        self.mark_live_objects();
        self.clear_non_live_young_references();
        self.evacuate();
    }

    fn reset_young_marking_state(&self) {
        let heap = self.heap();
        let new_space = heap.new_space.lock();
        for page in new_space.to_pages() {
            page.bitmap().clear_all();
            page.set_live_bytes(0);
        }
        drop(new_space);
        for page in heap.new_lo_space.lock().pages() {
            page.bitmap().clear_all();
            page.set_live_bytes(0);
        }
    }

    /// Roots are the strong root set minus the old generation, plus every
    /// OLD_TO_NEW remembered slot; each source chunk is one marking item.
    fn mark_live_objects(&mut self) {
        let heap = self.heap();

        {
            let mut marker = YoungMarker::new(heap, &self.worklist);
            let mut root_visitor = YoungRootVisitor { marker: &mut marker };
            heap.roots
                .iterate(&mut root_visitor, SkipRoots::NONE.with(RootCategory::OldGeneration));
            marker.flush();
        }

        let remembered_items: Vec<usize> = heap
            .all_pages()
            .into_iter()
            .filter(|&p| {
                let page = unsafe { &*p };
                !page.in_young_generation()
                    && (page.slot_set(RememberedSetClass::OldToNew).is_some()
                        || page.with_typed_slots(|sets| {
                            !sets[RememberedSetClass::OldToNew.index()].is_empty()
                        }))
            })
            .map(|p| p as usize)
            .collect();

        let workers = heap
            .flags
            .worker_threads
            .clamp(1, MAX_PARALLEL_TASKS);
        let generator = IndexGenerator::new(remembered_items.len());
        let terminator = Terminator::new(workers);
        let worklist = &self.worklist;
        let items = &remembered_items;
        self.pool.scoped(|scope| {
            for _ in 0..workers {
                let generator = &generator;
                let terminator = &terminator;
                scope.execute(move || {
                    let mut marker = YoungMarker::new(heap, worklist);
                    while let Some(index) = generator.next() {
                        let page = unsafe { &*(items[index] as *const Page) };
                        marker.visit_remembered_slots(page);
                    }
                    loop {
                        marker.drain();
                        if worklist.is_empty() && terminator.try_terminate() {
                            break;
                        }
                    }
                    // Per-page live bytes accumulate locally and flush once
                    // per worker.
                    marker.flush();
                });
            }
        });
        debug_assert!(self.worklist.is_empty());
    }

    /// Only the young external string table and the young weak list run;
    /// the internalized table lives in old space and is untouched.
    fn clear_non_live_young_references(&self) {
        let heap = self.heap();
        heap.young_external_string_table.lock().retain(|&entry| {
            let page = heap.page_of(entry).expect("external string off heap");
            let live = page.bitmap().is_black_or_grey(page.offset_of(entry));
            if !live {
                heap.finalize_external_string(HeapObject(entry));
            }
            live
        });
        self.prune_young_allocation_sites();
    }

    /// Young weak retainer: dead nursery sites drop off the list; old
    /// sites are out of scope for a minor cycle.
    fn prune_young_allocation_sites(&self) {
        let heap = self.heap();
        use crate::object::{layout, NULL_ADDRESS};
        use std::sync::atomic::Ordering;
        let mut prev: Option<HeapObject> = None;
        let mut cursor = heap.allocation_sites_head.load(Ordering::Relaxed);
        let mut new_head = NULL_ADDRESS;
        while cursor != NULL_ADDRESS {
            let site = HeapObject(cursor);
            let next = site.raw_field(layout::SITE_WEAK_NEXT);
            let page = heap.page_of(cursor).expect("allocation site off heap");
            let retained = !page.in_young_generation()
                || page.bitmap().is_black_or_grey(page.offset_of(cursor));
            if retained {
                if let Some(prev) = prev {
                    prev.set_raw_field(layout::SITE_WEAK_NEXT, cursor);
                } else {
                    new_head = cursor;
                }
                prev = Some(site);
            }
            cursor = next;
        }
        if let Some(prev) = prev {
            prev.set_raw_field(layout::SITE_WEAK_NEXT, NULL_ADDRESS);
        }
        heap.allocation_sites_head.store(new_head, Ordering::Relaxed);
    }

    fn evacuate(&mut self) {
        let heap = self.heap();

        let from_pages = {
            let mut new_space = heap.new_space.lock();
            new_space.flip();
            new_space.from_page_pointers()
        };

        let age_mark = heap.new_space.lock().age_mark();
        let mut items: Vec<usize> = Vec::new();
        for &page_ptr in &from_pages {
            let page = unsafe { &*page_ptr };
            let live = page.live_bytes().max(0) as usize;
            if live == 0 {
                continue;
            }
            if should_move_page(heap, page, live, false) {
                // Hot page: flip ownership instead of copying objects.
                if let Some(boxed) = heap.new_space.lock().take_from_page(page_ptr) {
                    boxed.clear_flag(flags::FROM_PAGE);
                    boxed.set_flag(flags::PAGE_NEW_OLD_PROMOTION);
                    heap.old_space.lock().adopt_page(boxed);
                }
            } else if live > crate::evacuator::new_space_page_evacuation_threshold(heap)
                && page.contains(age_mark)
            {
                // The page straddling the age mark stays in the nursery.
                if let Some(boxed) = heap.new_space.lock().take_from_page(page_ptr) {
                    boxed.set_flag(flags::PAGE_NEW_NEW_PROMOTION);
                    heap.new_space.lock().promote_within(boxed);
                }
            }
            items.push(page_ptr as usize);
            if heap.flags.minor_mc_trace_fragmentation {
                log::debug!(
                    "minor-mc page {:#x}: live {}",
                    page.area_start(),
                    formatted_size(live),
                );
            }
        }

        // Young large objects promote eagerly into the old large space.
        let new_lo_pages = heap.new_lo_space.lock().page_pointers();
        for page_ptr in new_lo_pages {
            let page = unsafe { &*page_ptr };
            if page.bitmap().is_black_or_grey(0) {
                if let Some(boxed) = heap.new_lo_space.lock().take_page(page_ptr) {
                    boxed.set_flag(flags::PAGE_NEW_OLD_PROMOTION);
                    heap.lo_space.lock().adopt_page(boxed);
                    items.push(page_ptr as usize);
                }
            }
        }

        if !items.is_empty() {
            let wanted = number_of_evacuation_tasks(heap, items.len()).min(MAX_PARALLEL_TASKS);
            let sweeper = &self.sweeper;
            let mut evacuators: Vec<Evacuator> =
                (0..wanted).map(|_| Evacuator::new(heap, sweeper)).collect();
            evacuate_pages_in_parallel(&mut self.pool, &items, &mut evacuators);
            for evacuator in &mut evacuators {
                // Nursery evacuation cannot abort.
                let aborted = evacuator.finalize();
                debug_assert!(aborted.is_empty());
            }
        }

        crate::update_pointers::update_pointers_after_evacuation(heap, &mut self.pool);
        crate::clearing::update_allocation_site_list(heap);

        self.evacuate_epilogue();
    }

    /// Residual from-space pages are relinquished and the age mark moves
    /// to the post-evacuation allocation top.
    fn evacuate_epilogue(&mut self) {
        let heap = self.heap();
        let old_space_pages = heap.old_space.lock().page_pointers();
        for page_ptr in old_space_pages {
            let page = unsafe { &*page_ptr };
            if page.is_flag_set(flags::PAGE_NEW_OLD_PROMOTION) {
                page.clear_flag(flags::PAGE_NEW_OLD_PROMOTION);
                page.clear_flag(flags::TO_PAGE);
                if heap.flags.minor_mc_sweeping {
                    self.sweeper.add_page(SpaceId::Old, page);
                }
            }
        }
        for page_ptr in heap.lo_space.lock().page_pointers() {
            let page = unsafe { &*page_ptr };
            page.clear_flag(flags::PAGE_NEW_OLD_PROMOTION);
        }
        heap.new_lo_space.lock().sweep(&heap.registry);
        {
            let mut new_space = heap.new_space.lock();
            for page in new_space.to_pages() {
                page.clear_flag(flags::PAGE_NEW_NEW_PROMOTION);
            }
            new_space.release_from_space(&heap.registry);
            let top = new_space.reset_allocation_area(&heap.registry);
            new_space.set_age_mark(top);
        }
        if heap.flags.minor_mc_sweeping {
            self.sweeper.start_sweeping(heap);
        }
    }

    pub fn ensure_sweeping_completed(&self) {
        self.sweeper.ensure_completed(self.heap());
    }
}

/// Minor-marking visitor: greys reachable nursery objects, accumulating
/// per-page live bytes locally.
struct YoungMarker<'h> {
    heap: &'h Heap,
    local: LocalWorklist<'h, HeapObject>,
    live_bytes: AHashMap<usize, isize>,
}

impl<'h> YoungMarker<'h> {
    fn new(heap: &'h Heap, worklist: &'h Worklist<HeapObject>) -> YoungMarker<'h> {
        YoungMarker {
            heap,
            local: LocalWorklist::new(worklist),
            live_bytes: AHashMap::new(),
        }
    }

    fn mark(&mut self, obj: HeapObject) {
        let Some(page) = self.heap.page_of(obj.address()) else {
            return;
        };
        if !page.in_young_generation() {
            return;
        }
        if page.bitmap().white_to_grey(page.offset_of(obj.address())) {
            *self
                .live_bytes
                .entry(page as *const Page as usize)
                .or_insert(0) += obj.size() as isize;
            self.local.push(obj);
        }
    }

    fn drain(&mut self) {
        while let Some(obj) = self.local.pop() {
            if obj.is_filler() {
                continue;
            }
            let mut visitor = YoungBodyVisitor { marker: self };
            iterate_body(obj, obj.map(), &mut visitor);
        }
        self.local.publish();
    }

    fn visit_remembered_slots(&mut self, page: &Page) {
        if let Some(set) = page.slot_set(RememberedSetClass::OldToNew) {
            set.iterate(|offset| {
                let slot = ObjectSlot(page.area_start() + offset);
                if let Some(target) = slot.load().to_address() {
                    self.mark(HeapObject(target));
                }
                SlotCallbackResult::Keep
            });
        }
        page.with_typed_slots(|sets| {
            sets[RememberedSetClass::OldToNew.index()].iterate(|_kind, offset| {
                let slot = ObjectSlot(page.area_start() + offset);
                if let Some(target) = slot.load().to_address() {
                    self.mark(HeapObject(target));
                }
                SlotCallbackResult::Keep
            });
        });
        self.drain();
    }

    /// One-shot flush of the locally accumulated live bytes.
    fn flush(&mut self) {
        for (page_addr, bytes) in self.live_bytes.drain() {
            unsafe { &*(page_addr as *const Page) }.increment_live_bytes(bytes);
        }
        self.local.publish();
    }
}

/// A minor cycle keeps every young referent alive regardless of reference
/// strength; weak clearing belongs to the full collector.
struct YoungBodyVisitor<'a, 'h> {
    marker: &'a mut YoungMarker<'h>,
}

impl<'a, 'h> ObjectVisitor for YoungBodyVisitor<'a, 'h> {
    fn visit_strong(&mut self, _host: HeapObject, slot: ObjectSlot) {
        if let Some(target) = slot.load().to_address() {
            self.marker.mark(HeapObject(target));
        }
    }

    fn visit_weak(&mut self, host: HeapObject, slot: ObjectSlot) {
        self.visit_strong(host, slot);
    }

    fn visit_ephemeron(
        &mut self,
        table: HeapObject,
        _index: usize,
        key: ObjectSlot,
        value: ObjectSlot,
    ) {
        self.visit_strong(table, key);
        self.visit_strong(table, value);
    }
}

struct YoungRootVisitor<'a, 'h> {
    marker: &'a mut YoungMarker<'h>,
}

impl<'a, 'h> RootVisitor for YoungRootVisitor<'a, 'h> {
    fn visit_root_pointer(&mut self, _category: RootCategory, slot: ObjectSlot) {
        if let Some(target) = slot.load().to_address() {
            self.marker.mark(HeapObject(target));
        }
    }
}
