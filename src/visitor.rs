use crate::object::{layout, HeapObject, ObjectKind, ObjectSlot};
use crate::remembered_set::SlotType;

/// Object-graph visitation capabilities. Concrete visitors implement the
/// subset they care about; defaults fold everything into `visit_strong` so
/// simple visitors (verifiers, record-only passes) stay small. The hot
/// marking visitor does not go through this trait.
pub trait ObjectVisitor {
    fn visit_strong(&mut self, host: HeapObject, slot: ObjectSlot);

    fn visit_weak(&mut self, host: HeapObject, slot: ObjectSlot) {
        let _ = (host, slot);
    }

    /// The header's map reference, an always-strong edge.
    fn visit_map_pointer(&mut self, host: HeapObject) {
        let _ = host;
    }

    fn visit_ephemeron(
        &mut self,
        table: HeapObject,
        index: usize,
        key: ObjectSlot,
        value: ObjectSlot,
    ) {
        let _ = (table, index, key, value);
    }

    /// An embedded pointer inside code relocation data.
    fn visit_embedded_pointer(&mut self, host: HeapObject, kind: SlotType, slot: ObjectSlot) {
        let _ = kind;
        self.visit_strong(host, slot);
    }
}

/// Where a root slot came from; doubles as the skip-set vocabulary.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum RootCategory {
    StrongHandles = 0,
    Stack,
    WellKnown,
    StringTable,
    ExternalStringTable,
    ClientHeaps,
    OldGeneration,
}

#[derive(Clone, Copy, Default)]
pub struct SkipRoots(u32);

impl SkipRoots {
    pub const NONE: SkipRoots = SkipRoots(0);

    pub fn with(self, category: RootCategory) -> SkipRoots {
        SkipRoots(self.0 | 1 << category as u32)
    }

    pub fn contains(self, category: RootCategory) -> bool {
        self.0 & (1 << category as u32) != 0
    }
}

pub trait RootVisitor {
    fn visit_root_pointer(&mut self, category: RootCategory, slot: ObjectSlot);

    /// Body of the code object running in the top optimized frame; visited
    /// so its deoptimization literals survive.
    fn visit_running_code(&mut self, code: HeapObject) {
        let _ = code;
    }
}

/// Enumerate the slots of `obj` according to its map's layout descriptor.
/// Raw (untagged) words are skipped; ephemeron entries go through the
/// dedicated hook.
pub fn iterate_body<V: ObjectVisitor>(obj: HeapObject, map: crate::object::Address, v: &mut V) {
    v.visit_map_pointer(obj);
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
                v.visit_strong(obj, obj.slot(i));
            }
        }
        ObjectKind::WeakHolder => {
            for i in 0..crate::object::body_slot_count(obj, map) {
                v.visit_weak(obj, obj.slot(i));
            }
        }
        ObjectKind::Map => {
            v.visit_weak(obj, obj.slot(layout::MAP_TRANSITIONS));
            v.visit_strong(obj, obj.slot(layout::MAP_DESCRIPTORS));
        }
        ObjectKind::WeakCell => {
            v.visit_weak(obj, obj.slot(layout::WEAK_CELL_TARGET));
            v.visit_weak(obj, obj.slot(layout::WEAK_CELL_TOKEN));
            v.visit_strong(obj, obj.slot(layout::WEAK_CELL_REGISTRY));
        }
        ObjectKind::JsWeakRef => {
            v.visit_weak(obj, obj.slot(layout::WEAK_REF_TARGET));
        }
        ObjectKind::EphemeronTable => {
            let capacity = obj.raw_field(layout::TABLE_CAPACITY);
            for i in 0..capacity {
                let key = obj.slot(layout::TABLE_ENTRIES + 2 * i);
                let value = obj.slot(layout::TABLE_ENTRIES + 2 * i + 1);
                v.visit_ephemeron(obj, i, key, value);
            }
        }
        ObjectKind::TransitionArray => {
            let len = obj.raw_field(layout::ARRAY_LENGTH);
            for i in 0..len {
                v.visit_weak(obj, obj.slot(layout::ARRAY_ENTRIES + i));
            }
        }
        ObjectKind::DescriptorArray => {
            let len = obj.raw_field(layout::ARRAY_LENGTH);
            for i in 0..len {
                v.visit_strong(obj, obj.slot(layout::ARRAY_ENTRIES + i));
            }
        }
        ObjectKind::Code => {
            let count = obj.raw_field(layout::CODE_EMBEDDED_COUNT);
            for i in 0..count {
                let kind_word = obj.raw_field(layout::CODE_EMBEDDED_PAIRS + 2 * i);
                let slot = obj.slot(layout::CODE_EMBEDDED_PAIRS + 2 * i + 1);
                let slot_type = SlotType::from_u8(kind_word as u8);
                if slot.load().is_weak() {
                    v.visit_weak(obj, slot);
                } else {
                    v.visit_embedded_pointer(obj, slot_type, slot);
                }
            }
        }
        ObjectKind::SharedInfo => {
            v.visit_strong(obj, obj.slot(layout::SHARED_DATA));
        }
        ObjectKind::BaselineCode => {
            v.visit_strong(obj, obj.slot(layout::BASELINE_BYTECODE));
        }
        ObjectKind::JsFunction => {
            v.visit_strong(obj, obj.slot(layout::FUNCTION_SHARED));
            v.visit_strong(obj, obj.slot(layout::FUNCTION_CODE));
        }
        ObjectKind::AllocationSite => {
            // The weak-list link must not retain the next site; the weak
            // object retainer rewrites the chain after marking.
        }
    }
}

