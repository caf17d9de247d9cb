use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering};

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::bitmap::MarkBitmap;
use crate::object::{Address, HeapObject};
use crate::remembered_set::{RememberedSetClass, SlotSet, TypedSlotSet, REMEMBERED_SET_COUNT};

/// Usable area of a regular page. Large pages size their area to the one
/// object they carry.
pub const PAGE_AREA_SIZE: usize = 256 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum SpaceId {
    New = 0,
    Old,
    Map,
    Code,
    LargeObject,
    NewLargeObject,
    SharedOld,
}

impl SpaceId {
    pub fn from_usize(raw: usize) -> SpaceId {
        debug_assert!(raw <= SpaceId::SharedOld as usize);
        unsafe { core::mem::transmute(raw) }
    }

    pub fn is_young(self) -> bool {
        matches!(self, SpaceId::New | SpaceId::NewLargeObject)
    }

    pub fn name(self) -> &'static str {
        match self {
            SpaceId::New => "new",
            SpaceId::Old => "old",
            SpaceId::Map => "map",
            SpaceId::Code => "code",
            SpaceId::LargeObject => "lo",
            SpaceId::NewLargeObject => "new-lo",
            SpaceId::SharedOld => "shared-old",
        }
    }
}

pub mod flags {
    pub const EVACUATION_CANDIDATE: usize = 1 << 0;
    pub const NEVER_EVACUATE: usize = 1 << 1;
    pub const PINNED: usize = 1 << 2;
    pub const PAGE_NEW_OLD_PROMOTION: usize = 1 << 3;
    pub const PAGE_NEW_NEW_PROMOTION: usize = 1 << 4;
    pub const COMPACTION_WAS_ABORTED: usize = 1 << 5;
    pub const IS_EXECUTABLE: usize = 1 << 6;
    pub const FROM_PAGE: usize = 1 << 7;
    pub const TO_PAGE: usize = 1 << 8;
    pub const LARGE_PAGE: usize = 1 << 9;
    pub const FORCE_EVACUATION_CANDIDATE_FOR_TESTING: usize = 1 << 10;
    /// Slot recording is suppressed for pages about to be freed wholesale.
    pub const SKIP_RECORDING: usize = 1 << 11;
    pub const SWEEPING_DONE: usize = 1 << 12;
}

/// One fixed-size region of a space plus its collection metadata: mark
/// bitmap, live-byte counter, flag word and the per-class remembered sets.
/// Pages are owned by their space and borrowed by the collector for the
/// duration of a phase.
pub struct Page {
    backing: MmapMut,
    area_start: Address,
    area_end: Address,
    space: AtomicUsize,
    flag_bits: AtomicUsize,
    live_bytes: AtomicIsize,
    allocated_bytes: AtomicUsize,
    bitmap: MarkBitmap,
    slot_sets: [AtomicPtr<SlotSet>; REMEMBERED_SET_COUNT],
    typed_slot_sets: Mutex<[TypedSlotSet; REMEMBERED_SET_COUNT]>,
    /// Chunk mutex: guards slot iteration during pointer updates and typed
    /// insertion from background code publication.
    mutex: Mutex<()>,
    /// Ranges freed since slots were recorded (flushed bytecode, trimmed
    /// arrays); recorded slots inside them are dropped by the update phase.
    invalidated: Mutex<Vec<(Address, Address)>>,
}

unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    pub fn new(space: SpaceId, area_size: usize, executable: bool) -> Box<Page> {
        let backing = MmapMut::map_anon(area_size).expect("page reservation failed");
        let area_start = backing.as_ptr() as usize;
        let page = Box::new(Page {
            area_start,
            area_end: area_start + area_size,
            backing,
            space: AtomicUsize::new(space as usize),
            flag_bits: AtomicUsize::new(if executable { flags::IS_EXECUTABLE } else { 0 }),
            live_bytes: AtomicIsize::new(0),
            allocated_bytes: AtomicUsize::new(0),
            bitmap: MarkBitmap::new(area_size),
            slot_sets: Default::default(),
            typed_slot_sets: Mutex::new(Default::default()),
            mutex: Mutex::new(()),
            invalidated: Mutex::new(Vec::new()),
        });
        page
    }

    #[inline(always)]
    pub fn area_start(&self) -> Address {
        self.area_start
    }

    #[inline(always)]
    pub fn area_end(&self) -> Address {
        self.area_end
    }

    #[inline(always)]
    pub fn area_size(&self) -> usize {
        self.area_end - self.area_start
    }

    #[inline(always)]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.area_start && addr < self.area_end
    }

    #[inline(always)]
    pub fn offset_of(&self, addr: Address) -> usize {
        debug_assert!(self.contains(addr));
        addr - self.area_start
    }

    #[inline(always)]
    pub fn space(&self) -> SpaceId {
        SpaceId::from_usize(self.space.load(Ordering::Relaxed))
    }

    pub fn set_space(&self, space: SpaceId) {
        self.space.store(space as usize, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn is_flag_set(&self, flag: usize) -> bool {
        self.flag_bits.load(Ordering::Relaxed) & flag != 0
    }

    pub fn set_flag(&self, flag: usize) {
        self.flag_bits.fetch_or(flag, Ordering::Relaxed);
    }

    pub fn clear_flag(&self, flag: usize) {
        self.flag_bits.fetch_and(!flag, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn is_evacuation_candidate(&self) -> bool {
        self.is_flag_set(flags::EVACUATION_CANDIDATE)
    }

    #[inline(always)]
    pub fn is_large(&self) -> bool {
        self.is_flag_set(flags::LARGE_PAGE)
    }

    #[inline(always)]
    pub fn in_young_generation(&self) -> bool {
        self.space().is_young()
    }

    pub fn bitmap(&self) -> &MarkBitmap {
        &self.bitmap
    }

    pub fn mutex(&self) -> &Mutex<()> {
        &self.mutex
    }

    #[inline(always)]
    pub fn live_bytes(&self) -> isize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn increment_live_bytes(&self, delta: isize) {
        self.live_bytes.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set_live_bytes(&self, value: isize) {
        self.live_bytes.store(value, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    pub fn increment_allocated_bytes(&self, delta: usize) {
        self.allocated_bytes.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set_allocated_bytes(&self, value: usize) {
        self.allocated_bytes.store(value, Ordering::Relaxed);
    }

    /// The remembered set of `class`, if any slots were ever recorded.
    #[inline]
    pub fn slot_set(&self, class: RememberedSetClass) -> Option<&SlotSet> {
        let ptr = self.slot_sets[class.index()].load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }

    /// The remembered set of `class`, installing an empty one on first use.
    pub fn slot_set_or_create(&self, class: RememberedSetClass) -> &SlotSet {
        let cell = &self.slot_sets[class.index()];
        let mut ptr = cell.load(Ordering::Acquire);
        if ptr.is_null() {
            let fresh = Box::into_raw(Box::new(SlotSet::new(self.area_size())));
            match cell.compare_exchange(
                core::ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => ptr = fresh,
                Err(existing) => {
                    unsafe { drop(Box::from_raw(fresh)) };
                    ptr = existing;
                }
            }
        }
        unsafe { &*ptr }
    }

    pub fn release_slot_set(&self, class: RememberedSetClass) {
        let ptr = self.slot_sets[class.index()].swap(core::ptr::null_mut(), Ordering::AcqRel);
        if !ptr.is_null() {
            unsafe { drop(Box::from_raw(ptr)) };
        }
    }

    pub fn with_typed_slots<R>(
        &self,
        f: impl FnOnce(&mut [TypedSlotSet; REMEMBERED_SET_COUNT]) -> R,
    ) -> R {
        f(&mut self.typed_slot_sets.lock())
    }

    pub fn has_recorded_slots(&self) -> bool {
        (0..REMEMBERED_SET_COUNT).any(|i| {
            let ptr = self.slot_sets[i].load(Ordering::Acquire);
            !ptr.is_null() && !unsafe { &*ptr }.is_empty()
        }) || self
            .typed_slot_sets
            .lock()
            .iter()
            .any(|set| !set.is_empty())
    }

    pub fn register_invalidated_range(&self, start: Address, end: Address) {
        self.invalidated.lock().push((start, end));
    }

    pub fn is_invalidated(&self, addr: Address) -> bool {
        self.invalidated
            .lock()
            .iter()
            .any(|&(start, end)| addr >= start && addr < end)
    }

    pub fn clear_invalidated_ranges(&self) {
        self.invalidated.lock().clear();
    }

    /// Walk live (marked) objects in address order.
    pub fn iterate_live_objects(&self, mut visitor: impl FnMut(HeapObject, crate::bitmap::Color)) {
        let start = self.area_start;
        self.bitmap
            .iterate_live(|offset, color| visitor(HeapObject(start + offset), color));
    }

    /// Walk every object in address order, fillers included. Stops at the
    /// first unallocated (zero) header word.
    pub fn iterate_objects_linear(&self, mut visitor: impl FnMut(HeapObject)) {
        let mut cursor = self.area_start;
        while cursor < self.area_end {
            let obj = HeapObject(cursor);
            if obj.map_word().0 == 0 {
                break;
            }
            let size = obj.size();
            visitor(obj);
            cursor += size;
        }
    }

    /// Reset all collection metadata; used when a page is recycled.
    pub fn reset_for_reuse(&self, space: SpaceId) {
        self.set_space(space);
        self.flag_bits.store(
            self.flag_bits.load(Ordering::Relaxed) & flags::IS_EXECUTABLE,
            Ordering::Relaxed,
        );
        self.bitmap.clear_all();
        self.set_live_bytes(0);
        self.set_allocated_bytes(0);
        for i in 0..REMEMBERED_SET_COUNT {
            let ptr = self.slot_sets[i].swap(core::ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                unsafe { drop(Box::from_raw(ptr)) };
            }
        }
        *self.typed_slot_sets.lock() = Default::default();
        self.invalidated.lock().clear();
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        for cell in &self.slot_sets {
            let ptr = cell.load(Ordering::Relaxed);
            if !ptr.is_null() {
                unsafe { drop(Box::from_raw(ptr)) };
            }
        }
    }
}
