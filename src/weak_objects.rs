use crate::object::{HeapObject, ObjectSlot};
use crate::worklist::{LocalWorklist, Worklist};

/// A key/value pair whose value is reachable iff the key is.
#[derive(Clone, Copy, Debug)]
pub struct Ephemeron {
    pub key: HeapObject,
    pub value: HeapObject,
}

/// A weak slot inside a host object, revisited by the clearing phase.
pub type WeakReference = (HeapObject, ObjectSlot);

/// A weak embedded object inside a code object: (object, code).
pub type WeakObjectInCode = (HeapObject, HeapObject);

/// Everything discovered during marking that needs weakness processing
/// after the fixpoint. One global pool per category; workers talk to them
/// through `WeakObjectsLocal`.
#[derive(Default)]
pub struct WeakObjects {
    pub current_ephemerons: Worklist<Ephemeron>,
    pub discovered_ephemerons: Worklist<Ephemeron>,
    pub next_ephemerons: Worklist<Ephemeron>,
    pub weak_references: Worklist<WeakReference>,
    pub weak_cells: Worklist<HeapObject>,
    pub js_weak_refs: Worklist<HeapObject>,
    pub transition_arrays: Worklist<HeapObject>,
    pub ephemeron_hash_tables: Worklist<HeapObject>,
    pub weak_objects_in_code: Worklist<WeakObjectInCode>,
    pub code_flushing_candidates: Worklist<HeapObject>,
    pub baseline_flushing_candidates: Worklist<HeapObject>,
    pub flushed_js_functions: Worklist<HeapObject>,
}

impl WeakObjects {
    pub fn new() -> WeakObjects {
        WeakObjects::default()
    }

    /// All pools a fixpoint barrier requires empty.
    pub fn ephemerons_settled(&self) -> bool {
        self.current_ephemerons.is_empty() && self.discovered_ephemerons.is_empty()
    }
}

/// Per-worker buffered access to every weak pool.
pub struct WeakObjectsLocal<'a> {
    pub current_ephemerons: LocalWorklist<'a, Ephemeron>,
    pub discovered_ephemerons: LocalWorklist<'a, Ephemeron>,
    pub next_ephemerons: LocalWorklist<'a, Ephemeron>,
    pub weak_references: LocalWorklist<'a, WeakReference>,
    pub weak_cells: LocalWorklist<'a, HeapObject>,
    pub js_weak_refs: LocalWorklist<'a, HeapObject>,
    pub transition_arrays: LocalWorklist<'a, HeapObject>,
    pub ephemeron_hash_tables: LocalWorklist<'a, HeapObject>,
    pub weak_objects_in_code: LocalWorklist<'a, WeakObjectInCode>,
    pub code_flushing_candidates: LocalWorklist<'a, HeapObject>,
    pub baseline_flushing_candidates: LocalWorklist<'a, HeapObject>,
    pub flushed_js_functions: LocalWorklist<'a, HeapObject>,
}

impl<'a> WeakObjectsLocal<'a> {
    pub fn new(global: &'a WeakObjects) -> WeakObjectsLocal<'a> {
        WeakObjectsLocal {
            current_ephemerons: LocalWorklist::new(&global.current_ephemerons),
            discovered_ephemerons: LocalWorklist::new(&global.discovered_ephemerons),
            next_ephemerons: LocalWorklist::new(&global.next_ephemerons),
            weak_references: LocalWorklist::new(&global.weak_references),
            weak_cells: LocalWorklist::new(&global.weak_cells),
            js_weak_refs: LocalWorklist::new(&global.js_weak_refs),
            transition_arrays: LocalWorklist::new(&global.transition_arrays),
            ephemeron_hash_tables: LocalWorklist::new(&global.ephemeron_hash_tables),
            weak_objects_in_code: LocalWorklist::new(&global.weak_objects_in_code),
            code_flushing_candidates: LocalWorklist::new(&global.code_flushing_candidates),
            baseline_flushing_candidates: LocalWorklist::new(&global.baseline_flushing_candidates),
            flushed_js_functions: LocalWorklist::new(&global.flushed_js_functions),
        }
    }

    pub fn publish_all(&mut self) {
        self.current_ephemerons.publish();
        self.discovered_ephemerons.publish();
        self.next_ephemerons.publish();
        self.weak_references.publish();
        self.weak_cells.publish();
        self.js_weak_refs.publish();
        self.transition_arrays.publish();
        self.ephemeron_hash_tables.publish();
        self.weak_objects_in_code.publish();
        self.code_flushing_candidates.publish();
        self.baseline_flushing_candidates.publish();
        self.flushed_js_functions.publish();
    }
}
