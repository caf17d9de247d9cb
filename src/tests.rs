use crate::collector::MarkCompactCollector;
use crate::flags::Flags;
use crate::heap::{AllocationSpace, Heap};
use crate::marking::MarkingState;
use crate::minor::MinorMarkCompactCollector;
use crate::object::{layout, HeapObject, ObjectKind, Tagged};
use crate::page::{flags as page_flags, SpaceId};
use crate::remembered_set::{RememberedSetClass, SlotType};

fn test_flags() -> Flags {
    Flags {
        concurrent_sweeping: false,
        parallel_marking: false,
        parallel_compaction: false,
        parallel_pointer_update: false,
        worker_threads: 2,
        verify_heap: true,
        ..Flags::default()
    }
}

fn assert_no_forwarding_anywhere(heap: &Heap) {
    for page_ptr in heap.all_pages() {
        let page = unsafe { &*page_ptr };
        page.iterate_live_objects(|obj, _color| {
            assert!(
                !obj.map_word().is_forwarding_address(),
                "live object {:#x} still forwarded",
                obj.address()
            );
        });
    }
}

fn assert_old_to_old_sets_empty(heap: &Heap) {
    for page_ptr in heap.all_pages() {
        let page = unsafe { &*page_ptr };
        if let Some(set) = page.slot_set(RememberedSetClass::OldToOld) {
            assert!(set.is_empty());
        }
    }
}

/// 16 KiB regular object: sixteen of them fill one page exactly.
const BIG_SLOTS: usize = 2047;

#[test]
fn full_cycle_retains_transitive_closure() {
    let heap = Heap::new(test_flags());
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    let a = heap.new_regular(AllocationSpace::Old, 2);
    let b = heap.new_regular(AllocationSpace::Old, 1);
    let c = heap.new_regular(AllocationSpace::Old, 1);
    heap.write_field(a, 0, Tagged::strong(b.address()));
    heap.write_field(a, 1, Tagged::strong(c.address()));
    let dead = heap.new_regular(AllocationSpace::Old, 1);
    let _root = heap.roots.handles.create_strong(a.address());

    collector.collect_garbage();

    let state = MarkingState::new(&heap);
    assert!(state.is_black(a));
    assert!(state.is_black(b));
    assert!(state.is_black(c));
    assert!(state.is_white(dead));
    assert_no_forwarding_anywhere(&heap);

    let page = heap.page_of(a.address()).unwrap();
    assert_eq!(
        page.live_bytes() as usize,
        a.size() + b.size() + c.size(),
        "live bytes must equal the sum of black object sizes"
    );
    assert!(!page.bitmap().has_corrupt_pattern());
}

#[test]
fn fragmented_pages_are_compacted_and_released() {
    let heap = Heap::new(test_flags());
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    // Three old pages, one survivor each; the survivor points at itself so
    // the pointer-update phase is observable.
    let mut handles = Vec::new();
    for _page in 0..3 {
        for i in 0..16 {
            let obj = heap.new_regular(AllocationSpace::Old, BIG_SLOTS);
            if i == 0 {
                heap.write_field(obj, 0, Tagged::strong(obj.address()));
                handles.push(heap.roots.handles.create_strong(obj.address()));
            }
        }
    }
    assert_eq!(heap.old_space.lock().page_count(), 3);
    let old_addresses: Vec<usize> = handles.iter().map(|h| h.get()).collect();

    // First cycle establishes liveness; the second selects the now
    // fragmented pages and evacuates them.
    collector.collect_garbage();
    collector.collect_garbage();
    collector.ensure_sweeping_completed();

    for (handle, old_addr) in handles.iter().zip(&old_addresses) {
        let new_addr = handle.get();
        assert_ne!(new_addr, *old_addr, "object should have moved");
        let page = heap.page_of(new_addr).expect("moved object on heap");
        assert_eq!(page.space(), SpaceId::Old);
        // The self-referential slot was rewritten through forwarding.
        assert_eq!(
            HeapObject(new_addr).field(0),
            Tagged::strong(new_addr),
            "slot must follow the moved object"
        );
        assert!(heap.page_of(*old_addr).is_none(), "source page released");
    }
    // Three sparse pages compacted onto one.
    assert_eq!(heap.old_space.lock().page_count(), 1);
    assert_no_forwarding_anywhere(&heap);
    assert_old_to_old_sets_empty(&heap);
}

#[test]
fn ephemeron_value_lives_only_with_its_key() {
    let heap = Heap::new(test_flags());
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    let table = heap.new_ephemeron_table(AllocationSpace::Old, 2);
    let k1 = heap.new_regular(AllocationSpace::Old, 1);
    let v1 = heap.new_regular(AllocationSpace::Old, 1);
    let k2 = heap.new_regular(AllocationSpace::Old, 1);
    let v2 = heap.new_regular(AllocationSpace::Old, 1);
    heap.write_field(table, layout::TABLE_ENTRIES, Tagged::strong(k1.address()));
    heap.write_field(table, layout::TABLE_ENTRIES + 1, Tagged::strong(v1.address()));
    heap.write_field(table, layout::TABLE_ENTRIES + 2, Tagged::strong(k2.address()));
    heap.write_field(table, layout::TABLE_ENTRIES + 3, Tagged::strong(v2.address()));
    let _table_root = heap.roots.handles.create_strong(table.address());
    let _k1_root = heap.roots.handles.create_strong(k1.address());

    collector.collect_garbage();

    let state = MarkingState::new(&heap);
    assert!(state.is_black(k1));
    assert!(state.is_black(v1));
    assert!(state.is_white(k2));
    assert!(state.is_white(v2));
    assert!(table.field(layout::TABLE_ENTRIES + 2).is_cleared());
    assert!(table.field(layout::TABLE_ENTRIES + 3).is_cleared());
    assert_eq!(
        table.field(layout::TABLE_ENTRIES).to_address(),
        Some(k1.address())
    );
}

#[test]
fn chained_ephemerons_reach_fixpoint() {
    let heap = Heap::new(test_flags());
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    // (k2 -> v) before (k1 -> k2): resolving the second entry is what
    // makes the first resolvable.
    let table = heap.new_ephemeron_table(AllocationSpace::Old, 2);
    let k1 = heap.new_regular(AllocationSpace::Old, 1);
    let k2 = heap.new_regular(AllocationSpace::Old, 1);
    let v = heap.new_regular(AllocationSpace::Old, 1);
    heap.write_field(table, layout::TABLE_ENTRIES, Tagged::strong(k2.address()));
    heap.write_field(table, layout::TABLE_ENTRIES + 1, Tagged::strong(v.address()));
    heap.write_field(table, layout::TABLE_ENTRIES + 2, Tagged::strong(k1.address()));
    heap.write_field(table, layout::TABLE_ENTRIES + 3, Tagged::strong(k2.address()));
    let _table_root = heap.roots.handles.create_strong(table.address());
    let _k1_root = heap.roots.handles.create_strong(k1.address());

    collector.collect_garbage();

    let state = MarkingState::new(&heap);
    assert!(state.is_black(k1));
    assert!(state.is_black(k2));
    assert!(state.is_black(v));
}

#[test]
fn ephemeron_linear_fallback_matches_fixpoint() {
    let mut flags = test_flags();
    // Zero budget forces the linear algorithm immediately.
    flags.ephemeron_fixpoint_iterations = 0;
    let heap = Heap::new(flags);
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    let table = heap.new_ephemeron_table(AllocationSpace::Old, 2);
    let k1 = heap.new_regular(AllocationSpace::Old, 1);
    let v1 = heap.new_regular(AllocationSpace::Old, 1);
    let k2 = heap.new_regular(AllocationSpace::Old, 1);
    let v2 = heap.new_regular(AllocationSpace::Old, 1);
    heap.write_field(table, layout::TABLE_ENTRIES, Tagged::strong(k1.address()));
    heap.write_field(table, layout::TABLE_ENTRIES + 1, Tagged::strong(v1.address()));
    heap.write_field(table, layout::TABLE_ENTRIES + 2, Tagged::strong(k2.address()));
    heap.write_field(table, layout::TABLE_ENTRIES + 3, Tagged::strong(v2.address()));
    let _table_root = heap.roots.handles.create_strong(table.address());
    let _k1_root = heap.roots.handles.create_strong(k1.address());

    collector.collect_garbage();

    let state = MarkingState::new(&heap);
    assert!(state.is_black(k1));
    assert!(state.is_black(v1));
    assert!(state.is_white(k2));
    assert!(state.is_white(v2));
}

#[test]
fn dead_weak_referent_leaves_cleared_sentinel() {
    let heap = Heap::new(test_flags());
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    let x = heap.new_weak_holder(AllocationSpace::Old, 2);
    let dead = heap.new_regular(AllocationSpace::Old, 1);
    let alive = heap.new_regular(AllocationSpace::Old, 1);
    heap.write_field(x, 0, Tagged::weak(dead.address()));
    heap.write_field(x, 1, Tagged::weak(alive.address()));
    let _x_root = heap.roots.handles.create_strong(x.address());
    let _alive_root = heap.roots.handles.create_strong(alive.address());

    collector.collect_garbage();

    let state = MarkingState::new(&heap);
    assert!(state.is_black(x));
    assert!(x.field(0).is_cleared(), "dead weak slot holds the sentinel");
    assert_eq!(x.field(1), Tagged::weak(alive.address()));
}

#[test]
fn aborted_evacuation_recovers_and_completes() {
    let mut flags = test_flags();
    flags.manual_evacuation_candidates_selection = true;
    let heap = Heap::new(flags);
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    // Page A: two survivors, fourteen dead fillers.
    let c1 = heap.new_regular(AllocationSpace::Old, BIG_SLOTS);
    let c2 = heap.new_regular(AllocationSpace::Old, BIG_SLOTS);
    for _ in 0..14 {
        heap.new_regular(AllocationSpace::Old, BIG_SLOTS);
    }
    // Page B: full except for one dead object, leaving exactly one
    // object-sized hole after the first sweep.
    let mut b_handles = Vec::new();
    for i in 0..16 {
        let obj = heap.new_regular(AllocationSpace::Old, BIG_SLOTS);
        if i != 0 {
            b_handles.push(heap.roots.handles.create_strong(obj.address()));
        }
    }
    let c1_handle = heap.roots.handles.create_strong(c1.address());
    let c2_handle = heap.roots.handles.create_strong(c2.address());
    assert_eq!(heap.old_space.lock().page_count(), 2);

    collector.collect_garbage();

    // Force page A, then forbid the old space from growing: the second
    // copy has nowhere to go.
    heap.page_of(c1.address())
        .unwrap()
        .set_flag(page_flags::FORCE_EVACUATION_CANDIDATE_FOR_TESTING);
    heap.old_space.lock().set_page_limit(Some(2));

    collector.collect_garbage();
    collector.ensure_sweeping_completed();

    // c1 moved into the hole on page B; c2 stayed put on the recovered
    // page.
    let b_page_start = heap
        .page_of(b_handles[0].get())
        .unwrap()
        .area_start();
    assert_ne!(c1_handle.get(), c1.address());
    assert_eq!(
        heap.page_of(c1_handle.get()).unwrap().area_start(),
        b_page_start
    );
    assert_eq!(c2_handle.get(), c2.address());
    let a_page = heap.page_of(c2.address()).unwrap();
    assert!(!a_page.is_evacuation_candidate());
    assert!(!a_page.is_flag_set(page_flags::COMPACTION_WAS_ABORTED));
    assert_eq!(a_page.live_bytes() as usize, c2.size());
    assert_no_forwarding_anywhere(&heap);
    assert_old_to_old_sets_empty(&heap);
}

#[test]
fn minor_cycle_promotes_hot_pages_wholesale() {
    let heap = Heap::new(test_flags());
    let mut minor = MinorMarkCompactCollector::new(&heap);

    // The initial age mark sits inside the first nursery page; move it out
    // of the way so a full page qualifies for promotion.
    heap.new_space.lock().set_age_mark(0);

    // Hot page: sixteen rooted objects fill it completely.
    let mut hot_handles = Vec::new();
    for _ in 0..16 {
        let obj = heap.new_regular(AllocationSpace::Young, BIG_SLOTS);
        hot_handles.push(heap.roots.handles.create_strong(obj.address()));
    }
    // Cold page: two survivors and garbage.
    let cold_a = heap.new_regular(AllocationSpace::Young, BIG_SLOTS);
    let cold_b = heap.new_regular(AllocationSpace::Young, 1);
    heap.new_regular(AllocationSpace::Young, BIG_SLOTS);
    let cold_a_handle = heap.roots.handles.create_strong(cold_a.address());
    let cold_b_handle = heap.roots.handles.create_strong(cold_b.address());

    // Old object referencing a young one exercises the OLD_TO_NEW path.
    let holder = heap.new_regular(AllocationSpace::Old, 1);
    heap.write_field(holder, 0, Tagged::strong(cold_b.address()));
    let _holder_root = heap.roots.handles.create_strong(holder.address());

    let hot_addresses: Vec<usize> = hot_handles.iter().map(|h| h.get()).collect();

    minor.collect_garbage();
    minor.ensure_sweeping_completed();

    // Hot objects kept their addresses; only the page changed owners.
    for (handle, addr) in hot_handles.iter().zip(&hot_addresses) {
        assert_eq!(handle.get(), *addr);
        let page = heap.page_of(*addr).unwrap();
        assert_eq!(page.space(), SpaceId::Old);
        assert!(!page.is_flag_set(page_flags::PAGE_NEW_OLD_PROMOTION));
    }
    // Cold survivors were copied out.
    assert_ne!(cold_a_handle.get(), cold_a.address());
    assert_eq!(
        heap.page_of(cold_a_handle.get()).unwrap().space(),
        SpaceId::Old
    );
    // The old object's slot followed the moved referent.
    assert_eq!(
        holder.field(0).to_address(),
        Some(cold_b_handle.get()),
        "OLD_TO_NEW slot must be rewritten"
    );
    assert_ne!(cold_b_handle.get(), cold_b.address());
    // The nursery is empty and the age mark sits at the allocation top.
    let new_space = heap.new_space.lock();
    assert_eq!(new_space.from_pages().count(), 0);
    assert_eq!(new_space.age_mark(), new_space.top());
}

#[test]
fn full_cycle_promotes_nursery_and_large_objects() {
    let heap = Heap::new(test_flags());
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    let young = heap.new_regular(AllocationSpace::Young, 3);
    let young_handle = heap.roots.handles.create_strong(young.address());
    // Above the large-object limit, so this lands in the young LO space.
    let large = heap.new_regular(AllocationSpace::Young, 8 * 1024);
    let large_addr = large.address();
    let large_handle = heap.roots.handles.create_strong(large_addr);
    let dead_large = heap.new_regular(AllocationSpace::Young, 8 * 1024);

    assert_eq!(
        heap.page_of(large_addr).unwrap().space(),
        SpaceId::NewLargeObject
    );

    collector.collect_garbage();
    collector.ensure_sweeping_completed();

    // The small object was copied into old space; the large page flipped
    // ownership without moving its object.
    assert_ne!(young_handle.get(), young.address());
    assert_eq!(
        heap.page_of(young_handle.get()).unwrap().space(),
        SpaceId::Old
    );
    assert_eq!(large_handle.get(), large_addr);
    assert_eq!(
        heap.page_of(large_addr).unwrap().space(),
        SpaceId::LargeObject
    );
    assert!(heap.page_of(dead_large.address()).is_none());
    assert_eq!(heap.new_space.lock().from_pages().count(), 0);
}

#[test]
fn bytecode_flushes_after_aging() {
    let heap = Heap::new(test_flags());
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    let bytecode = heap.new_bytecode(AllocationSpace::Old, 100);
    let info = heap.new_shared_info(AllocationSpace::Old, Tagged::strong(bytecode.address()));
    let function = heap.new_js_function(
        AllocationSpace::Old,
        Tagged::strong(info.address()),
        Tagged::strong(bytecode.address()),
    );
    let _function_root = heap.roots.handles.create_strong(function.address());

    // First cycle: the info is too young, the bytecode survives.
    collector.collect_garbage();
    assert_eq!(bytecode.kind(), ObjectKind::Bytecode);

    // Second cycle: the aged candidate flushes; the bytecode is replaced
    // in place by uncompiled data and the function's entry falls back.
    collector.collect_garbage();
    assert_eq!(
        HeapObject(bytecode.address()).kind(),
        ObjectKind::UncompiledData
    );
    assert_eq!(
        info.field(layout::SHARED_DATA).to_address(),
        Some(bytecode.address())
    );
    assert_eq!(
        function.field(layout::FUNCTION_CODE).to_address(),
        Some(bytecode.address())
    );
    let state = MarkingState::new(&heap);
    assert!(state.is_black(HeapObject(bytecode.address())));
}

#[test]
fn transition_arrays_compact_and_dead_descriptors_trim() {
    let heap = Heap::new(test_flags());
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    let live_holder = heap.new_regular(AllocationSpace::Old, 1);
    let live_map = live_holder.map();
    let dead_map = heap.new_map(ObjectKind::Regular, 2, false);
    let dead_descriptors = heap.new_descriptor_array(AllocationSpace::Old, 4);
    HeapObject(dead_map).set_field(
        layout::MAP_DESCRIPTORS,
        Tagged::strong(dead_descriptors.address()),
    );

    let array = heap.new_transition_array(AllocationSpace::Old, 3);
    array.set_field(layout::ARRAY_ENTRIES, Tagged::weak(dead_map));
    array.set_field(layout::ARRAY_ENTRIES + 1, Tagged::weak(live_map));
    array.set_field(layout::ARRAY_ENTRIES + 2, Tagged::weak(dead_map));
    let _array_root = heap.roots.handles.create_strong(array.address());
    let _holder_root = heap.roots.handles.create_strong(live_holder.address());

    collector.collect_garbage();

    // One live entry slid to the front; the array shrank around it.
    assert_eq!(array.raw_field(layout::ARRAY_LENGTH), 1);
    assert_eq!(
        array.field(layout::ARRAY_ENTRIES).to_address(),
        Some(live_map)
    );
    // The dead map's exclusive descriptor array was right-trimmed away.
    assert_eq!(dead_descriptors.raw_field(layout::ARRAY_LENGTH), 0);
}

#[test]
fn deserializing_transition_array_is_skipped() {
    let heap = Heap::new(test_flags());
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    let array = heap.new_transition_array(AllocationSpace::Old, 2);
    array.set_raw_field(layout::ARRAY_ENTRIES, crate::clearing::DESERIALIZATION_SENTINEL);
    array.set_field(layout::ARRAY_ENTRIES + 1, Tagged::NULL);
    let _root = heap.roots.handles.create_strong(array.address());

    collector.collect_garbage();

    assert_eq!(array.raw_field(layout::ARRAY_LENGTH), 2);
    assert_eq!(
        array.raw_field(layout::ARRAY_ENTRIES),
        crate::clearing::DESERIALIZATION_SENTINEL
    );
}

#[test]
fn weak_cells_clear_and_flag_their_registry() {
    let heap = Heap::new(test_flags());
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    let registry = heap.new_finalization_registry(AllocationSpace::Old);
    let cell = heap.new_weak_cell(AllocationSpace::Old);
    let target = heap.new_regular(AllocationSpace::Old, 1);
    heap.write_field(cell, layout::WEAK_CELL_TARGET, Tagged::weak(target.address()));
    heap.write_field(cell, layout::WEAK_CELL_REGISTRY, Tagged::strong(registry.address()));
    let weak_ref = heap.new_js_weak_ref(AllocationSpace::Old);
    heap.write_field(weak_ref, layout::WEAK_REF_TARGET, Tagged::weak(target.address()));
    let _cell_root = heap.roots.handles.create_strong(cell.address());
    let _ref_root = heap.roots.handles.create_strong(weak_ref.address());

    collector.collect_garbage();

    assert!(cell.field(layout::WEAK_CELL_TARGET).is_cleared());
    assert!(weak_ref.field(layout::WEAK_REF_TARGET).is_cleared());
    assert_eq!(
        registry.raw_field(layout::REGISTRY_DIRTY),
        1,
        "registry with newly dead cells queues for cleanup"
    );
}

#[test]
fn dependent_code_deoptimizes_when_weak_embed_dies() {
    let heap = Heap::new(test_flags());
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    let dead = heap.new_regular(AllocationSpace::Old, 1);
    let alive = heap.new_regular(AllocationSpace::Old, 1);
    let code = heap.new_code(&[
        (SlotType::EmbeddedObjectFull, Tagged::weak(dead.address())),
        (SlotType::EmbeddedObjectFull, Tagged::strong(alive.address())),
    ]);
    let _code_root = heap.roots.handles.create_strong(code.address());

    collector.collect_garbage();

    assert_ne!(
        code.raw_field(layout::CODE_FLAGS) & layout::CODE_FLAG_MARKED_FOR_DEOPT,
        0
    );
    assert!(code.field(layout::CODE_EMBEDDED_PAIRS + 1).is_cleared());
    assert_eq!(
        code.field(layout::CODE_EMBEDDED_PAIRS + 3).to_address(),
        Some(alive.address())
    );
}

#[test]
fn string_tables_drop_dead_entries() {
    let heap = Heap::new(test_flags());
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    let kept = heap.new_internalized_string(AllocationSpace::Old, b"kept");
    let _dropped = heap.new_internalized_string(AllocationSpace::Old, b"dropped");
    let _external = heap.new_external_string(AllocationSpace::Old, b"external");
    let kept_external = heap.new_external_string(AllocationSpace::Old, b"kept-external");
    let _kept_root = heap.roots.handles.create_strong(kept.address());
    let _kept_ext_root = heap.roots.handles.create_strong(kept_external.address());

    heap.string_forwarding_table
        .lock()
        .push((kept.address(), kept.address()));

    collector.collect_garbage();

    let table = heap.string_table.lock();
    assert_eq!(table.len(), 1, "only the rooted internalized string stays");
    assert_eq!(table[0], kept.address());
    drop(table);
    let externals = heap.external_string_table.lock();
    assert_eq!(externals.len(), 1);
    assert_eq!(externals[0], kept_external.address());
    drop(externals);
    assert_eq!(heap.string_forwarding_table.lock().len(), 1);
}

#[test]
fn phantom_handles_fire_on_death() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static FIRED: AtomicUsize = AtomicUsize::new(0);
    fn on_death(_addr: usize) {
        FIRED.fetch_add(1, Ordering::Relaxed);
    }

    let heap = Heap::new(test_flags());
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    let doomed = heap.new_regular(AllocationSpace::Old, 1);
    let phantom = heap.roots.handles.create_phantom(doomed.address(), on_death);

    collector.collect_garbage();

    assert_eq!(FIRED.load(Ordering::Relaxed), 1);
    assert!(phantom.is_cleared());
}

#[test]
fn allocation_sites_get_one_zombie_reprieve() {
    let heap = Heap::new(test_flags());
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    let site = heap.new_allocation_site(AllocationSpace::Old);
    let site_addr = site.address();

    collector.collect_garbage();
    // Unreachable, but retained once as a zombie.
    assert_eq!(
        heap.allocation_sites_head
            .load(std::sync::atomic::Ordering::Relaxed),
        site_addr
    );
    assert_eq!(site.raw_field(layout::SITE_ZOMBIE), 1);

    collector.collect_garbage();
    assert_eq!(
        heap.allocation_sites_head
            .load(std::sync::atomic::Ordering::Relaxed),
        crate::object::NULL_ADDRESS
    );
}

#[test]
fn abort_compaction_resets_candidates_mid_cycle() {
    let mut flags = test_flags();
    flags.manual_evacuation_candidates_selection = true;
    let heap = Heap::new(flags);
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    let obj = heap.new_regular(AllocationSpace::Old, 1);
    let handle = heap.roots.handles.create_strong(obj.address());
    collector.collect_garbage();

    heap.page_of(handle.get())
        .unwrap()
        .set_flag(page_flags::FORCE_EVACUATION_CANDIDATE_FOR_TESTING);

    collector.prepare();
    assert!(collector.is_compacting());
    collector.abort_compaction();
    assert!(!collector.is_compacting());
    assert_eq!(collector.evacuation_candidate_count(), 0);
    assert!(!heap.page_of(handle.get()).unwrap().is_evacuation_candidate());

    // The rest of the cycle behaves exactly like a never-compacting one.
    collector.mark_live_objects();
    collector.clear_non_live_references();
    collector.verify_marking();
    collector.start_sweep_spaces();
    collector.evacuate();
    collector.finish();

    assert_eq!(handle.get(), obj.address(), "nothing moved after abort");
}

#[test]
fn swept_regions_are_reused_for_allocation() {
    let heap = Heap::new(test_flags());
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    for _ in 0..16 {
        heap.new_regular(AllocationSpace::Old, BIG_SLOTS);
    }
    let keeper = heap.new_regular(AllocationSpace::Old, BIG_SLOTS);
    let _keeper_root = heap.roots.handles.create_strong(keeper.address());
    let pages_before = heap.old_space.lock().page_count();

    collector.collect_garbage();
    // On-demand sweeping of one page, then full completion.
    let keeper_page = heap.page_of(keeper.address()).unwrap();
    collector.ensure_page_is_swept(keeper_page);
    assert!(keeper_page.is_flag_set(page_flags::SWEEPING_DONE));
    collector.ensure_sweeping_completed();

    // The freed space satisfies new allocations without growing the space.
    for _ in 0..8 {
        heap.new_regular(AllocationSpace::Old, BIG_SLOTS);
    }
    assert_eq!(heap.old_space.lock().page_count(), pages_before);
}

#[test]
fn parallel_and_concurrent_modes_smoke() {
    let mut flags = Flags::default();
    flags.worker_threads = 4;
    flags.verify_heap = true;
    let heap = Heap::new(flags);
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    // A wide object graph so parallel marking has real fan-out.
    let root = heap.new_regular(AllocationSpace::Old, 64);
    for i in 0..64 {
        let child = heap.new_regular(AllocationSpace::Old, 4);
        for j in 0..4 {
            let leaf = heap.new_regular(AllocationSpace::Old, 1);
            heap.write_field(child, j, Tagged::strong(leaf.address()));
        }
        heap.write_field(root, i, Tagged::strong(child.address()));
    }
    let _root_handle = heap.roots.handles.create_strong(root.address());

    collector.collect_garbage();
    collector.ensure_sweeping_completed();

    let state = MarkingState::new(&heap);
    assert!(state.is_black(root));
    for i in 0..64 {
        let child = HeapObject(root.field(i).to_address().unwrap());
        assert!(state.is_black(child));
        for j in 0..4 {
            assert!(state.is_black(HeapObject(child.field(j).to_address().unwrap())));
        }
    }
    assert_no_forwarding_anywhere(&heap);
}

#[test]
fn incremental_residue_is_consumed_by_the_pause() {
    let mut flags = test_flags();
    flags.concurrent_marking = true;
    let heap = Heap::new(flags);
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    let rooted = heap.new_regular(AllocationSpace::Old, 1);
    let _root = heap.roots.handles.create_strong(rooted.address());
    // Reachable only through the write-barrier log, like an object the
    // mutator stored after the concurrent marker passed it by.
    let barrier_only = heap.new_regular(AllocationSpace::Old, 1);
    heap.start_incremental_marking();
    heap.incremental.record_grey(barrier_only);
    assert!(heap.incremental.is_barrier_active());
    assert_eq!(heap.incremental.steps_taken(), 1);

    collector.collect_garbage();

    let state = MarkingState::new(&heap);
    assert!(state.is_black(rooted));
    assert!(state.is_black(barrier_only));
    assert!(!heap.incremental.is_marking());
    assert!(!heap.incremental.is_barrier_active());
}

#[test]
fn running_code_retains_deopt_literals() {
    let heap = Heap::new(test_flags());
    let mut collector = MarkCompactCollector::new(&heap);
    collector.set_up();

    // A weak embedded literal would normally die; the code being on the
    // top optimized frame keeps it alive.
    let literal = heap.new_regular(AllocationSpace::Old, 1);
    let code = heap.new_code(&[(SlotType::EmbeddedObjectFull, Tagged::weak(literal.address()))]);
    heap.roots.stack.push_root(code.address());
    heap.roots.stack.set_top_frame_code(code.address());

    collector.collect_garbage();

    let state = MarkingState::new(&heap);
    assert!(state.is_black(code));
    assert!(state.is_black(literal));
    assert_eq!(
        code.raw_field(layout::CODE_FLAGS) & layout::CODE_FLAG_MARKED_FOR_DEOPT,
        0
    );
    heap.roots.stack.clear();
}
