use scoped_threadpool::Pool;

use crate::heap::Heap;
use crate::marking::MarkingState;
use crate::object::{
    layout, Address, HeapObject, MapWord, ObjectKind, Tagged, NULL_ADDRESS, TAGGED_SIZE,
};
use crate::weak_objects::WeakObjects;

/// Slot value marking a transition array that is still being deserialized;
/// such arrays are skipped and left unchanged.
pub const DESERIALIZATION_SENTINEL: usize = 0b101;

/// Runs strictly after the marking fixpoint. Step order is load-bearing:
/// phantom handles before code flushing, flushing before flushed-function
/// resets, transition compaction before generic weak-reference clearing.
pub struct ClearingPipeline<'h> {
    heap: &'h Heap,
    state: MarkingState<'h>,
    weak: &'h WeakObjects,
}

impl<'h> ClearingPipeline<'h> {
    pub fn new(heap: &'h Heap, weak: &'h WeakObjects) -> ClearingPipeline<'h> {
        ClearingPipeline {
            heap,
            state: MarkingState::new(heap),
            weak,
        }
    }

    pub fn run(&self, pool: &mut Pool) {
        self.clear_string_forwarding_table();
        let heap_addr = self.heap as *const Heap as usize;
        pool.scoped(|scope| {
            // The internalized-string table cleans on a helper while the
            // main thread works through the rest of the pipeline.
            scope.execute(move || {
                let heap = unsafe { &*(heap_addr as *const Heap) };
                clear_internalized_string_table(heap);
            });

            self.clear_external_string_tables();
            self.process_phantom_handles();
            self.process_old_code_candidates();
            self.process_flushed_baseline_candidates();
            self.clear_flushed_js_functions();
            self.prune_weak_lists();
            self.clear_full_map_transitions();
            self.clear_weak_references();
            self.clear_weak_collections();
            self.clear_js_weak_refs();
            self.mark_dependent_code_for_deoptimization();
        });

        debug_assert!(self.weak.weak_references.is_empty());
        debug_assert!(self.weak.weak_cells.is_empty());
        debug_assert!(self.weak.js_weak_refs.is_empty());
        debug_assert!(self.weak.transition_arrays.is_empty());
        debug_assert!(self.weak.weak_objects_in_code.is_empty());
        debug_assert!(self.weak.code_flushing_candidates.is_empty());
        debug_assert!(self.weak.baseline_flushing_candidates.is_empty());
        debug_assert!(self.weak.flushed_js_functions.is_empty());
    }

    fn is_dead(&self, addr: Address) -> bool {
        self.state.is_white(HeapObject(addr))
    }

    /// Dead keys drop out; surviving pairs stay for the next interning
    /// lookup to resolve.
    fn clear_string_forwarding_table(&self) {
        self.heap
            .string_forwarding_table
            .lock()
            .retain(|&(from, to)| !self.is_dead(from) && !self.is_dead(to));
    }

    /// Dead external strings have their backing store finalized before the
    /// table forgets them; both generations' tables are cleaned.
    fn clear_external_string_tables(&self) {
        for table in [
            &self.heap.external_string_table,
            &self.heap.young_external_string_table,
        ] {
            table.lock().retain(|&entry| {
                if self.is_dead(entry) {
                    self.heap.finalize_external_string(HeapObject(entry));
                    false
                } else {
                    true
                }
            });
        }
    }

    fn process_phantom_handles(&self) {
        self.heap
            .roots
            .handles
            .process_dead_handles(|addr| self.is_dead(addr));
    }

    /// For each code-flushing candidate: dead bytecode is replaced in
    /// place by an uncompiled-data object, dead baseline code falls back
    /// to its bytecode; live data gets its slot re-recorded.
    fn process_old_code_candidates(&self) {
        while let Some(info) = self.weak.code_flushing_candidates.pop() {
            let data_slot = info.slot(layout::SHARED_DATA);
            let Some(mut data) = data_slot.load().to_address() else {
                continue;
            };
            if HeapObject(data).kind() == ObjectKind::BaselineCode {
                let baseline = HeapObject(data);
                if self.is_dead(data) {
                    // Reset dead baseline code to its bytecode fallback.
                    let bytecode = baseline.field(layout::BASELINE_BYTECODE);
                    match bytecode.to_address() {
                        Some(addr) => {
                            data_slot.store(bytecode);
                            data = addr;
                        }
                        None => continue,
                    }
                } else {
                    self.heap.record_slot(info, data_slot, data);
                    continue;
                }
            }
            if self.is_dead(data) {
                self.flush_bytecode(info, HeapObject(data));
            } else {
                self.heap.record_slot(info, data_slot, data);
            }
        }
    }

    /// Overwrite the dead bytecode with an uncompiled-data object of known
    /// smaller size; the remaining bytes become filler and their recorded
    /// slots are invalidated.
    fn flush_bytecode(&self, info: HeapObject, bytecode: HeapObject) {
        let page = self
            .heap
            .page_of(bytecode.address())
            .expect("bytecode off heap");
        let old_size = bytecode.size();
        let uncompiled_size = 2 * TAGGED_SIZE;
        debug_assert!(old_size >= uncompiled_size);
        bytecode.set_map_word(MapWord::from_map(
            self.heap.canonical_map(ObjectKind::UncompiledData),
        ));
        bytecode.set_raw_field(0, 0);
        if old_size > uncompiled_size {
            self.heap.free_range(
                page,
                bytecode.address() + uncompiled_size,
                old_size - uncompiled_size,
            );
            page.register_invalidated_range(
                bytecode.address() + uncompiled_size,
                bytecode.address() + old_size,
            );
        }
        // The replacement object is live even though the bytecode was not.
        self.state.set_black(bytecode);
        info.set_field(layout::SHARED_DATA, Tagged::strong(bytecode.address()));
        self.heap
            .record_slot(info, info.slot(layout::SHARED_DATA), bytecode.address());
    }

    fn process_flushed_baseline_candidates(&self) {
        while let Some(function) = self.weak.baseline_flushing_candidates.pop() {
            let code_slot = function.slot(layout::FUNCTION_CODE);
            let Some(code) = code_slot.load().to_address() else {
                continue;
            };
            if self.is_dead(code) {
                let bytecode = HeapObject(code).field(layout::BASELINE_BYTECODE);
                code_slot.store(bytecode);
                if let Some(addr) = bytecode.to_address() {
                    self.heap.record_slot(function, code_slot, addr);
                }
            } else {
                self.heap.record_slot(function, code_slot, code);
            }
        }
    }

    /// Functions whose bytecode got flushed point their code entry at the
    /// shared info's uncompiled data.
    fn clear_flushed_js_functions(&self) {
        while let Some(function) = self.weak.flushed_js_functions.pop() {
            let code_slot = function.slot(layout::FUNCTION_CODE);
            let Some(code) = code_slot.load().to_address() else {
                continue;
            };
            let flushed = self.is_dead(code)
                || HeapObject(code).kind() == ObjectKind::UncompiledData;
            if !flushed {
                self.heap.record_slot(function, code_slot, code);
                continue;
            }
            let shared = function.field(layout::FUNCTION_SHARED);
            if let Some(info) = shared.to_address() {
                let fallback = HeapObject(info).field(layout::SHARED_DATA);
                code_slot.store(fallback);
                if let Some(addr) = fallback.to_address() {
                    self.heap.record_slot(function, code_slot, addr);
                }
            }
        }
    }

    /// Generic weak-list retainer over the allocation-site chain: Black
    /// sites stay, White sites get a one-time zombie reprieve, zombies die.
    fn prune_weak_lists(&self) {
        let mut prev: Option<HeapObject> = None;
        let mut cursor = self.heap.allocation_sites_head.load(std::sync::atomic::Ordering::Relaxed);
        let mut new_head = NULL_ADDRESS;
        while cursor != NULL_ADDRESS {
            let site = HeapObject(cursor);
            let next = site.raw_field(layout::SITE_WEAK_NEXT);
            let retained = if self.state.is_black_or_grey(site) {
                true
            } else if site.raw_field(layout::SITE_ZOMBIE) == 0 {
                site.set_raw_field(layout::SITE_ZOMBIE, 1);
                self.state.set_black(site);
                true
            } else {
                false
            };
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
        self.heap
            .allocation_sites_head
            .store(new_head, std::sync::atomic::Ordering::Relaxed);
    }

    /// Compact transition arrays in place, sliding live entries left. An
    /// array with a deserialization sentinel is left untouched. Descriptor
    /// arrays no longer referenced by any live map are right-trimmed.
    fn clear_full_map_transitions(&self) {
        while let Some(array) = self.weak.transition_arrays.pop() {
            let len = array.raw_field(layout::ARRAY_LENGTH);
            if (0..len)
                .any(|i| array.raw_field(layout::ARRAY_ENTRIES + i) == DESERIALIZATION_SENTINEL)
            {
                continue;
            }
            let mut write = 0;
            for read in 0..len {
                let slot = array.slot(layout::ARRAY_ENTRIES + read);
                let value = slot.load();
                let Some(map_addr) = value.to_address() else {
                    continue;
                };
                if self.state.is_black_or_grey(HeapObject(map_addr)) {
                    array.set_field(layout::ARRAY_ENTRIES + write, value);
                    write += 1;
                } else {
                    self.maybe_trim_descriptors(HeapObject(map_addr));
                }
            }
            if write < len {
                self.right_trim_array(array, len, write);
            }
        }
    }

    fn maybe_trim_descriptors(&self, dead_map: HeapObject) {
        let Some(descriptors) = dead_map.field(layout::MAP_DESCRIPTORS).to_address() else {
            return;
        };
        let descriptors = HeapObject(descriptors);
        // Only descriptor arrays owned exclusively by dead maps shrink; a
        // live owner marked them black.
        if self.state.is_black_or_grey(descriptors) {
            return;
        }
        let len = descriptors.raw_field(layout::ARRAY_LENGTH);
        if len > 0 {
            self.right_trim_array(descriptors, len, 0);
        }
    }

    /// Shrink a live array from `len` to `new_len` entries, tagging the
    /// freed tail as filler and invalidating its recorded slots.
    fn right_trim_array(&self, array: HeapObject, len: usize, new_len: usize) {
        let trimmed_words = len - new_len;
        array.set_raw_field(layout::ARRAY_LENGTH, new_len);
        let tail_start = array.address() + (2 + new_len) * TAGGED_SIZE;
        if let Some(page) = self.heap.page_of(array.address()) {
            self.heap
                .free_range(page, tail_start, trimmed_words * TAGGED_SIZE);
            page.register_invalidated_range(tail_start, tail_start + trimmed_words * TAGGED_SIZE);
            if self.state.is_black_or_grey(array) {
                page.increment_live_bytes(-((trimmed_words * TAGGED_SIZE) as isize));
            }
        }
    }

    /// Dead weak referents become the cleared sentinel.
    fn clear_weak_references(&self) {
        while let Some((host, slot)) = self.weak.weak_references.pop() {
            let value = slot.load();
            let Some(target) = value.to_address() else {
                continue;
            };
            if self.is_dead(target) {
                slot.store(Tagged::CLEARED_WEAK);
            } else {
                self.heap.record_slot(host, slot, target);
            }
        }
    }

    /// Ephemeron tables drop every entry whose key died.
    fn clear_weak_collections(&self) {
        while let Some(table) = self.weak.ephemeron_hash_tables.pop() {
            let capacity = table.raw_field(layout::TABLE_CAPACITY);
            for i in 0..capacity {
                let key_slot = table.slot(layout::TABLE_ENTRIES + 2 * i);
                let value_slot = table.slot(layout::TABLE_ENTRIES + 2 * i + 1);
                let Some(key) = key_slot.load().to_address() else {
                    continue;
                };
                if cfg!(debug_assertions) {
                    if let Some(value) = value_slot.load().to_address() {
                        debug_assert!(
                            self.is_dead(key) || !self.is_dead(value),
                            "live key retains a dead ephemeron value"
                        );
                    }
                }
                if self.is_dead(key) {
                    key_slot.store(Tagged::CLEARED_WEAK);
                    value_slot.store(Tagged::CLEARED_WEAK);
                }
            }
        }
    }

    /// JSWeakRefs clear dead targets; weak cells additionally flag their
    /// finalization registry for cleanup and drop dead unregister tokens.
    fn clear_js_weak_refs(&self) {
        while let Some(weak_ref) = self.weak.js_weak_refs.pop() {
            let slot = weak_ref.slot(layout::WEAK_REF_TARGET);
            if let Some(target) = slot.load().to_address() {
                if self.is_dead(target) {
                    slot.store(Tagged::CLEARED_WEAK);
                }
            }
        }
        while let Some(cell) = self.weak.weak_cells.pop() {
            let target_slot = cell.slot(layout::WEAK_CELL_TARGET);
            if let Some(target) = target_slot.load().to_address() {
                if self.is_dead(target) {
                    target_slot.store(Tagged::CLEARED_WEAK);
                    if let Some(registry) = cell.field(layout::WEAK_CELL_REGISTRY).to_address() {
                        HeapObject(registry).set_raw_field(layout::REGISTRY_DIRTY, 1);
                    }
                }
            }
            let token_slot = cell.slot(layout::WEAK_CELL_TOKEN);
            if let Some(token) = token_slot.load().to_address() {
                if self.is_dead(token) {
                    token_slot.store(Tagged::CLEARED_WEAK);
                }
            }
        }
    }

    /// Live code holding a dead weak embedded object deoptimizes; the dead
    /// reference is cleared so the code body stays walkable.
    fn mark_dependent_code_for_deoptimization(&self) {
        while let Some((object, code)) = self.weak.weak_objects_in_code.pop() {
            if !self.is_dead(object.address()) {
                continue;
            }
            if self.state.is_black_or_grey(code) {
                code.set_raw_field(
                    layout::CODE_FLAGS,
                    code.raw_field(layout::CODE_FLAGS) | layout::CODE_FLAG_MARKED_FOR_DEOPT,
                );
                let count = code.raw_field(layout::CODE_EMBEDDED_COUNT);
                for i in 0..count {
                    let slot = code.slot(layout::CODE_EMBEDDED_PAIRS + 2 * i + 1);
                    if slot.load().to_address() == Some(object.address()) {
                        slot.store(Tagged::CLEARED_WEAK);
                    }
                }
            }
        }
    }
}

/// Remove internalized-string entries whose only reference was the table
/// itself. Runs as a parallel clearing job.
fn clear_internalized_string_table(heap: &Heap) {
    let state = MarkingState::new(heap);
    heap.string_table
        .lock()
        .retain(|&entry| !state.is_white(HeapObject(entry)));
}

/// Post-evacuation fixup of the allocation-site weak list: follow
/// forwarding so the chain points at the moved copies.
pub fn update_allocation_site_list(heap: &Heap) {
    let head = heap
        .allocation_sites_head
        .load(std::sync::atomic::Ordering::Relaxed);
    if head == NULL_ADDRESS {
        return;
    }
    let forwarded_head = crate::update_pointers::forwarded_address(head);
    heap.allocation_sites_head
        .store(forwarded_head, std::sync::atomic::Ordering::Relaxed);
    let mut cursor = forwarded_head;
    while cursor != NULL_ADDRESS {
        let site = HeapObject(cursor);
        let next = site.raw_field(layout::SITE_WEAK_NEXT);
        if next == NULL_ADDRESS {
            break;
        }
        let forwarded_next = crate::update_pointers::forwarded_address(next);
        site.set_raw_field(layout::SITE_WEAK_NEXT, forwarded_next);
        cursor = forwarded_next;
    }
}
