use std::sync::atomic::{AtomicUsize, Ordering};

use scoped_threadpool::Pool;

use crate::heap::Heap;
use crate::job::{run_parallel, IndexGenerator, JobDelegate, JobTask};
use crate::object::{HeapObject, MapWord, ObjectSlot};
use crate::page::{flags, Page, SpaceId};
use crate::remembered_set::{RememberedSetClass, SlotCallbackResult, SlotType};
use crate::visitor::{iterate_body, ObjectVisitor, RootCategory, RootVisitor, SkipRoots};

/// Rewrite one slot through its referent's forwarding address, preserving
/// the reference strength. Relaxed atomics; racing updaters write the same
/// value.
#[inline]
pub fn update_slot(slot: ObjectSlot) {
    let value = slot.load();
    if let Some(addr) = value.to_address() {
        let word = HeapObject(addr).map_word();
        if word.is_forwarding_address() {
            slot.store(value.retag(word.to_forwarding_address()));
        }
    }
}

/// Follow forwarding for a bare address.
#[inline]
pub fn forwarded_address(addr: crate::object::Address) -> crate::object::Address {
    let word = HeapObject(addr).map_word();
    if word.is_forwarding_address() {
        word.to_forwarding_address()
    } else {
        addr
    }
}

/// Visitor for roots and to-space objects; does not expect dead referents.
pub struct PointersUpdatingVisitor;

impl ObjectVisitor for PointersUpdatingVisitor {
    fn visit_strong(&mut self, _host: HeapObject, slot: ObjectSlot) {
        update_slot(slot);
    }

    fn visit_weak(&mut self, _host: HeapObject, slot: ObjectSlot) {
        update_slot(slot);
    }

    fn visit_map_pointer(&mut self, host: HeapObject) {
        let word = host.map_word();
        if !word.is_forwarding_address() {
            let map = word.to_map();
            let forwarded = forwarded_address(map);
            if forwarded != map {
                host.set_map_word(MapWord::from_map(forwarded));
            }
        }
    }

    fn visit_ephemeron(
        &mut self,
        _table: HeapObject,
        _index: usize,
        key: ObjectSlot,
        value: ObjectSlot,
    ) {
        update_slot(key);
        update_slot(value);
    }

    fn visit_embedded_pointer(&mut self, _host: HeapObject, _kind: SlotType, slot: ObjectSlot) {
        update_slot(slot);
    }
}

impl RootVisitor for PointersUpdatingVisitor {
    fn visit_root_pointer(&mut self, _category: RootCategory, slot: ObjectSlot) {
        update_slot(slot);
    }
}

/// One unit of parallel pointer-update work.
pub enum UpdatingItem {
    /// A promoted nursery page whose surviving objects' slots need
    /// rewriting; iterated through mark bits since the page holds garbage.
    ToSpace { page: usize },
    /// A chunk with recorded slots in any remembered-set class.
    RememberedSet { page: usize },
}

impl UpdatingItem {
    pub fn process(&self, heap: &Heap) {
        match *self {
            UpdatingItem::ToSpace { page } => {
                let page = unsafe { &*(page as *const Page) };
                let mut visitor = PointersUpdatingVisitor;
                page.iterate_live_objects(|obj, _color| {
                    iterate_body(obj, obj.map_or_forwarded_map(), &mut visitor);
                });
            }
            UpdatingItem::RememberedSet { page } => {
                let page = unsafe { &*(page as *const Page) };
                let _guard = page.mutex().lock();
                update_untyped_pointers(heap, page);
                update_typed_pointers(heap, page);
            }
        }
    }
}

/// The OLD_TO_NEW keep/drop rules: referents on from-pages follow their
/// forwarding; referents on NEW_TO_NEW promoted to-pages consult mark bits;
/// anything no longer young drops out of the set.
fn check_and_update_old_to_new_slot(heap: &Heap, slot: ObjectSlot) -> SlotCallbackResult {
    let Some(addr) = slot.load().to_address() else {
        return SlotCallbackResult::Remove;
    };
    if heap.in_from_page(addr) {
        update_slot(slot);
        let Some(now) = slot.load().to_address() else {
            return SlotCallbackResult::Remove;
        };
        if heap.in_to_page(now) {
            return SlotCallbackResult::Keep;
        }
        SlotCallbackResult::Remove
    } else if heap.in_to_page(addr) {
        // The slot may have been recorded twice or already updated; in the
        // promoted-page case liveness comes from the mark bits.
        let page = heap.page_of(addr).expect("to-page referent");
        if page.is_flag_set(flags::PAGE_NEW_NEW_PROMOTION) {
            if page.bitmap().is_black_or_grey(page.offset_of(addr)) {
                SlotCallbackResult::Keep
            } else {
                SlotCallbackResult::Remove
            }
        } else {
            SlotCallbackResult::Keep
        }
    } else {
        SlotCallbackResult::Remove
    }
}

fn update_untyped_pointers(heap: &Heap, page: &Page) {
    if let Some(set) = page.slot_set(RememberedSetClass::OldToNew) {
        set.iterate(|offset| {
            let slot = ObjectSlot(page.area_start() + offset);
            if page.is_invalidated(slot.0) {
                return SlotCallbackResult::Remove;
            }
            check_and_update_old_to_new_slot(heap, slot)
        });
    }
    for class in [RememberedSetClass::OldToOld, RememberedSetClass::OldToCode] {
        if let Some(set) = page.slot_set(class) {
            set.iterate(|offset| {
                let slot = ObjectSlot(page.area_start() + offset);
                if !page.is_invalidated(slot.0) {
                    update_slot(slot);
                }
                SlotCallbackResult::Remove
            });
        }
        page.release_slot_set(class);
    }
    if let Some(set) = page.slot_set(RememberedSetClass::OldToShared) {
        set.iterate(|offset| {
            let slot = ObjectSlot(page.area_start() + offset);
            if page.is_invalidated(slot.0) {
                return SlotCallbackResult::Remove;
            }
            update_slot(slot);
            match slot.load().to_address() {
                Some(addr)
                    if heap
                        .page_of(addr)
                        .map_or(false, |p| p.space() == SpaceId::SharedOld) =>
                {
                    SlotCallbackResult::Keep
                }
                _ => SlotCallbackResult::Remove,
            }
        });
    }
}

/// Typed slots go through the relocation helper, one arm per slot kind.
fn update_typed_slot(heap: &Heap, kind: SlotType, slot: ObjectSlot) -> SlotCallbackResult {
    match kind {
        SlotType::CodeEntry | SlotType::ConstPoolCodeEntry => {
            update_slot(slot);
            match slot.load().to_address() {
                Some(addr) => {
                    debug_assert!(heap
                        .page_of(addr)
                        .map_or(true, |p| p.space() == SpaceId::Code));
                    SlotCallbackResult::Keep
                }
                None => SlotCallbackResult::Remove,
            }
        }
        SlotType::EmbeddedObjectFull
        | SlotType::EmbeddedObjectCompressed
        | SlotType::EmbeddedObjectData
        | SlotType::ConstPoolEmbeddedObjectFull
        | SlotType::ConstPoolEmbeddedObjectCompressed => {
            update_slot(slot);
            SlotCallbackResult::Keep
        }
    }
}

fn update_typed_pointers(heap: &Heap, page: &Page) {
    page.with_typed_slots(|sets| {
        for class in [
            RememberedSetClass::OldToNew,
            RememberedSetClass::OldToOld,
            RememberedSetClass::OldToCode,
            RememberedSetClass::OldToShared,
        ] {
            let keep_class = class == RememberedSetClass::OldToNew;
            sets[class.index()].iterate(|kind, offset| {
                let slot = ObjectSlot(page.area_start() + offset);
                let result = update_typed_slot(heap, kind, slot);
                if keep_class {
                    match result {
                        SlotCallbackResult::Keep => {
                            check_and_update_old_to_new_slot(heap, slot)
                        }
                        remove => remove,
                    }
                } else {
                    SlotCallbackResult::Remove
                }
            });
        }
    });
}

pub struct PointersUpdatingJob<'h> {
    heap: &'h Heap,
    items: Vec<UpdatingItem>,
    generator: IndexGenerator,
    remaining: AtomicUsize,
}

impl<'h> PointersUpdatingJob<'h> {
    pub fn new(heap: &'h Heap, items: Vec<UpdatingItem>) -> PointersUpdatingJob<'h> {
        let generator = IndexGenerator::new(items.len());
        let remaining = AtomicUsize::new(items.len());
        PointersUpdatingJob {
            heap,
            items,
            generator,
            remaining,
        }
    }
}

impl<'h> JobTask for PointersUpdatingJob<'h> {
    fn run(&self, _delegate: &JobDelegate) {
        while self.remaining.load(Ordering::Relaxed) > 0 {
            let Some(index) = self.generator.next() else {
                return;
            };
            self.items[index].process(self.heap);
            if self.remaining.fetch_sub(1, Ordering::Relaxed) <= 1 {
                return;
            }
        }
    }

    fn max_concurrency(&self, _worker_count: usize) -> usize {
        let items = self.remaining.load(Ordering::Relaxed);
        if !self.heap.flags.parallel_pointer_update {
            return (items > 0) as usize;
        }
        const MAX_POINTER_UPDATE_TASKS: usize = 8;
        items.min(MAX_POINTER_UPDATE_TASKS)
    }
}

/// Collect one updating item per chunk carrying remembered slots, plus one
/// per promoted to-space page.
pub fn collect_updating_items(heap: &Heap) -> Vec<UpdatingItem> {
    let mut items = Vec::new();
    for page_ptr in heap.all_pages() {
        let page = unsafe { &*page_ptr };
        if page.is_flag_set(flags::PAGE_NEW_NEW_PROMOTION)
            || page.is_flag_set(flags::PAGE_NEW_OLD_PROMOTION)
        {
            items.push(UpdatingItem::ToSpace {
                page: page_ptr as usize,
            });
        }
        if page.has_recorded_slots() {
            items.push(UpdatingItem::RememberedSet {
                page: page_ptr as usize,
            });
        }
    }
    items
}

/// The full post-copy phase: roots, remembered sets (parallel), client
/// heaps, the interning tables with the external table last, and the
/// ephemeron remembered set.
pub fn update_pointers_after_evacuation(heap: &Heap, pool: &mut Pool) {
    {
        let mut visitor = PointersUpdatingVisitor;
        heap.roots.iterate(
            &mut visitor,
            SkipRoots::NONE.with(RootCategory::ExternalStringTable),
        );
    }

    let items = collect_updating_items(heap);
    let job = PointersUpdatingJob::new(heap, items);
    run_parallel(pool, &job);

    for &client in heap.client_heaps.lock().iter() {
        let client = unsafe { &*client };
        for page_ptr in client.all_pages() {
            let page = unsafe { &*page_ptr };
            if page.slot_set(RememberedSetClass::OldToShared).is_some() {
                let _guard = page.mutex().lock();
                if let Some(set) = page.slot_set(RememberedSetClass::OldToShared) {
                    set.iterate(|offset| {
                        update_slot(ObjectSlot(page.area_start() + offset));
                        SlotCallbackResult::Keep
                    });
                }
            }
        }
    }

    heap.roots
        .handles
        .update_pointers(|addr| match HeapObject(addr).map_word() {
            word if word.is_forwarding_address() => Some(word.to_forwarding_address()),
            _ => None,
        });
    heap.update_map_caches();
    update_interning_tables(heap);
    update_ephemeron_remembered_set(heap);
}

/// Rewrite the string tables through forwarding. Externals run last and
/// promoted external strings move from the young table to the old one.
pub fn update_interning_tables(heap: &Heap) {
    for entry in heap.string_table.lock().iter_mut() {
        *entry = forwarded_address(*entry);
    }
    for (from, to) in heap.string_forwarding_table.lock().iter_mut() {
        *from = forwarded_address(*from);
        *to = forwarded_address(*to);
    }
    let mut promoted = Vec::new();
    {
        let mut young = heap.young_external_string_table.lock();
        young.retain_mut(|entry| {
            *entry = forwarded_address(*entry);
            if heap.in_young_generation(*entry) {
                true
            } else {
                promoted.push(*entry);
                false
            }
        });
    }
    let mut old_table = heap.external_string_table.lock();
    for entry in old_table.iter_mut() {
        *entry = forwarded_address(*entry);
    }
    old_table.extend(promoted);
}

/// Tables whose map word forwarded are re-keyed; entries whose key left
/// the nursery are dropped.
fn update_ephemeron_remembered_set(heap: &Heap) {
    let mut set = heap.ephemeron_remembered_set.lock();
    let tables: Vec<_> = set.drain().collect();
    for (table_addr, indices) in tables {
        let table_addr = forwarded_address(table_addr);
        let table = HeapObject(table_addr);
        let mut kept = ahash::AHashSet::new();
        for index in indices {
            let key_slot = table.slot(crate::object::layout::TABLE_ENTRIES + 2 * index);
            update_slot(key_slot);
            if let Some(key) = key_slot.load().to_address() {
                if heap.in_young_generation(key) {
                    kept.insert(index);
                }
            }
        }
        if !kept.is_empty() {
            set.insert(table_addr, kept);
        }
    }
}
