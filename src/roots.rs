use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::object::{Address, HeapObject, ObjectSlot, NULL_ADDRESS};
use crate::visitor::{RootCategory, RootVisitor, SkipRoots};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HandleKind {
    Strong,
    Weak,
    /// Cleared like a weak handle, plus a death callback.
    Phantom,
}

pub struct HandleCell {
    value: AtomicUsize,
    kind: HandleKind,
    callback: Option<fn(Address)>,
}

impl HandleCell {
    pub fn get(&self) -> Address {
        self.value.load(Ordering::Relaxed)
    }

    pub fn set(&self, addr: Address) {
        self.value.store(addr, Ordering::Relaxed);
    }

    pub fn slot(&self) -> ObjectSlot {
        ObjectSlot(&self.value as *const AtomicUsize as usize)
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }
}

/// A stable reference to a handle cell; cells are boxed and never move.
#[derive(Clone, Copy)]
pub struct Handle(*const HandleCell);

unsafe impl Send for Handle {}

impl Handle {
    pub fn get(&self) -> Address {
        unsafe { (*self.0).get() }
    }

    pub fn set(&self, addr: Address) {
        unsafe { (*self.0).set(addr) }
    }

    pub fn is_cleared(&self) -> bool {
        self.get() == NULL_ADDRESS
    }
}

pub struct GlobalHandles {
    cells: Mutex<Vec<Box<HandleCell>>>,
}

impl GlobalHandles {
    pub fn new() -> GlobalHandles {
        GlobalHandles {
            cells: Mutex::new(Vec::new()),
        }
    }

    fn create(&self, addr: Address, kind: HandleKind, callback: Option<fn(Address)>) -> Handle {
        let cell = Box::new(HandleCell {
            value: AtomicUsize::new(addr),
            kind,
            callback,
        });
        let ptr = &*cell as *const HandleCell;
        self.cells.lock().push(cell);
        Handle(ptr)
    }

    pub fn create_strong(&self, addr: Address) -> Handle {
        self.create(addr, HandleKind::Strong, None)
    }

    pub fn create_weak(&self, addr: Address) -> Handle {
        self.create(addr, HandleKind::Weak, None)
    }

    pub fn create_phantom(&self, addr: Address, callback: fn(Address)) -> Handle {
        self.create(addr, HandleKind::Phantom, Some(callback))
    }

    pub fn iterate_strong(&self, visitor: &mut dyn RootVisitor) {
        for cell in self.cells.lock().iter() {
            if cell.kind == HandleKind::Strong && cell.get() != NULL_ADDRESS {
                visitor.visit_root_pointer(RootCategory::StrongHandles, cell.slot());
            }
        }
    }

    /// Clear weak and phantom handles whose referents died; phantom death
    /// runs the registered callback.
    pub fn process_dead_handles(&self, is_dead: impl Fn(Address) -> bool) {
        for cell in self.cells.lock().iter() {
            if cell.kind == HandleKind::Strong {
                continue;
            }
            let target = cell.get();
            if target != NULL_ADDRESS && is_dead(target) {
                cell.set(NULL_ADDRESS);
                if let Some(callback) = cell.callback {
                    callback(target);
                }
            }
        }
    }

    /// Rewrite surviving handles through forwarding after evacuation.
    pub fn update_pointers(&self, forward: impl Fn(Address) -> Option<Address>) {
        for cell in self.cells.lock().iter() {
            let target = cell.get();
            if target != NULL_ADDRESS {
                if let Some(new_target) = forward(target) {
                    cell.set(new_target);
                }
            }
        }
    }
}

/// Precise thread-stack roots plus the code object of the top optimized
/// frame whose deoptimization literals must be retained.
pub struct ThreadStack {
    slots: Mutex<Vec<Box<AtomicUsize>>>,
    top_frame_code: AtomicUsize,
}

impl ThreadStack {
    pub fn new() -> ThreadStack {
        ThreadStack {
            slots: Mutex::new(Vec::new()),
            top_frame_code: AtomicUsize::new(NULL_ADDRESS),
        }
    }

    pub fn push_root(&self, addr: Address) -> usize {
        let mut slots = self.slots.lock();
        slots.push(Box::new(AtomicUsize::new(addr)));
        slots.len() - 1
    }

    pub fn root_value(&self, index: usize) -> Address {
        self.slots.lock()[index].load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
        self.top_frame_code.store(NULL_ADDRESS, Ordering::Relaxed);
    }

    pub fn set_top_frame_code(&self, code: Address) {
        self.top_frame_code.store(code, Ordering::Relaxed);
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
            && self.top_frame_code.load(Ordering::Relaxed) == NULL_ADDRESS
    }

    pub fn iterate(&self, visitor: &mut dyn RootVisitor) {
        for slot in self.slots.lock().iter() {
            if slot.load(Ordering::Relaxed) != NULL_ADDRESS {
                visitor.visit_root_pointer(
                    RootCategory::Stack,
                    ObjectSlot(&**slot as *const AtomicUsize as usize),
                );
            }
        }
        let code = self.top_frame_code.load(Ordering::Relaxed);
        if code != NULL_ADDRESS {
            visitor.visit_running_code(HeapObject(code));
        }
    }
}

/// Strong roots of one isolate: global handles, the thread stack and a
/// small set of well-known objects.
pub struct RootSet {
    pub handles: GlobalHandles,
    pub stack: ThreadStack,
    well_known: Mutex<Vec<Box<AtomicUsize>>>,
}

impl RootSet {
    pub fn new() -> RootSet {
        RootSet {
            handles: GlobalHandles::new(),
            stack: ThreadStack::new(),
            well_known: Mutex::new(Vec::new()),
        }
    }

    pub fn add_well_known(&self, addr: Address) {
        self.well_known.lock().push(Box::new(AtomicUsize::new(addr)));
    }

    pub fn iterate(&self, visitor: &mut dyn RootVisitor, skip: SkipRoots) {
        if !skip.contains(RootCategory::StrongHandles) {
            self.handles.iterate_strong(visitor);
        }
        if !skip.contains(RootCategory::Stack) {
            self.stack.iterate(visitor);
        }
        if !skip.contains(RootCategory::WellKnown) {
            for slot in self.well_known.lock().iter() {
                if slot.load(Ordering::Relaxed) != NULL_ADDRESS {
                    visitor.visit_root_pointer(
                        RootCategory::WellKnown,
                        ObjectSlot(&**slot as *const AtomicUsize as usize),
                    );
                }
            }
        }
    }
}
