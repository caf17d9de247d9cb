use std::sync::atomic::{AtomicUsize, Ordering};

use modular_bitfield::prelude::*;

pub const TAGGED_SIZE: usize = core::mem::size_of::<usize>();
/// Mark bits come in adjacent pairs, so nothing smaller than two tagged
/// words may be allocated.
pub const MIN_OBJECT_SIZE: usize = 2 * TAGGED_SIZE;

pub type Address = usize;
pub const NULL_ADDRESS: Address = 0;

/// A tagged slot value. Low bit set marks a weak reference; the pattern
/// `0b11` is the cleared-weak sentinel, never a valid aligned address.
pub const WEAK_TAG: usize = 1;
pub const CLEARED_WEAK_VALUE: usize = 0b11;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct Tagged(pub usize);

impl Tagged {
    pub const NULL: Tagged = Tagged(0);
    pub const CLEARED_WEAK: Tagged = Tagged(CLEARED_WEAK_VALUE);

    #[inline(always)]
    pub fn strong(addr: Address) -> Tagged {
        debug_assert!(addr & WEAK_TAG == 0);
        Tagged(addr)
    }

    #[inline(always)]
    pub fn weak(addr: Address) -> Tagged {
        debug_assert!(addr & WEAK_TAG == 0);
        Tagged(addr | WEAK_TAG)
    }

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn is_cleared(self) -> bool {
        self.0 == CLEARED_WEAK_VALUE
    }

    #[inline(always)]
    pub fn is_weak(self) -> bool {
        self.0 & WEAK_TAG != 0 && !self.is_cleared()
    }

    #[inline(always)]
    pub fn is_strong(self) -> bool {
        self.0 != 0 && self.0 & WEAK_TAG == 0
    }

    /// Referent address for strong and weak values alike.
    #[inline(always)]
    pub fn to_address(self) -> Option<Address> {
        if self.is_null() || self.is_cleared() {
            None
        } else {
            Some(self.0 & !WEAK_TAG)
        }
    }

    /// Rebuild the value with the same strength around a new referent.
    #[inline(always)]
    pub fn retag(self, addr: Address) -> Tagged {
        if self.is_weak() {
            Tagged::weak(addr)
        } else {
            Tagged::strong(addr)
        }
    }
}

/// The header word of every object: either a map pointer (low bit clear)
/// or, during evacuation, a forwarding address with the low bit set.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct MapWord(pub usize);

pub const FORWARDING_TAG: usize = 1;

impl MapWord {
    #[inline(always)]
    pub fn from_map(map: Address) -> MapWord {
        debug_assert!(map & FORWARDING_TAG == 0);
        MapWord(map)
    }

    #[inline(always)]
    pub fn from_forwarding_address(target: Address) -> MapWord {
        debug_assert!(target & FORWARDING_TAG == 0);
        MapWord(target | FORWARDING_TAG)
    }

    #[inline(always)]
    pub fn is_forwarding_address(self) -> bool {
        self.0 & FORWARDING_TAG != 0
    }

    #[inline(always)]
    pub fn to_map(self) -> Address {
        debug_assert!(!self.is_forwarding_address());
        self.0
    }

    #[inline(always)]
    pub fn to_forwarding_address(self) -> Address {
        debug_assert!(self.is_forwarding_address());
        self.0 & !FORWARDING_TAG
    }
}

/// Layout discriminator carried by a map. The clearing pipeline keys off
/// these; everything else only cares about which slots are strong, weak or
/// ephemeron entries.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ObjectKind {
    Regular = 0,
    FreeSpace,
    Map,
    WeakHolder,
    WeakCell,
    JsWeakRef,
    FinalizationRegistry,
    EphemeronTable,
    TransitionArray,
    DescriptorArray,
    Code,
    SharedInfo,
    Bytecode,
    UncompiledData,
    BaselineCode,
    JsFunction,
    AllocationSite,
    SeqString,
    InternalizedString,
    ExternalString,
    /// Fills a single-word gap the sweeper cannot describe with a sized
    /// free-space object.
    OneWordFiller,
}

impl ObjectKind {
    pub fn from_u8(raw: u8) -> ObjectKind {
        debug_assert!(raw <= ObjectKind::OneWordFiller as u8);
        unsafe { core::mem::transmute(raw) }
    }

    pub fn is_string(self) -> bool {
        matches!(
            self,
            ObjectKind::SeqString | ObjectKind::InternalizedString | ObjectKind::ExternalString
        )
    }
}

/// Packed map descriptor word, stored raw in the first body slot of a map.
#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
pub struct MapBits {
    pub kind: B8,
    /// Object size in tagged words for fixed-size kinds; 0 for kinds whose
    /// size derives from a length word.
    pub instance_words: B16,
    /// Instances wrap an embedder (foreign) object and are routed through
    /// the wrapper worklist during marking.
    pub is_wrapper: bool,
    #[skip]
    unused: B39,
}

/// Body slot indices (relative to the object body, i.e. word 1 onwards).
pub mod layout {
    // Map
    pub const MAP_BITS: usize = 0;
    pub const MAP_TRANSITIONS: usize = 1;
    pub const MAP_DESCRIPTORS: usize = 2;
    pub const MAP_WORDS: usize = 4;

    // FreeSpace
    pub const FREE_SIZE: usize = 0;

    // WeakCell
    pub const WEAK_CELL_TARGET: usize = 0;
    pub const WEAK_CELL_TOKEN: usize = 1;
    pub const WEAK_CELL_REGISTRY: usize = 2;

    // JsWeakRef
    pub const WEAK_REF_TARGET: usize = 0;

    // FinalizationRegistry
    pub const REGISTRY_DIRTY: usize = 0;

    // EphemeronTable
    pub const TABLE_CAPACITY: usize = 0;
    pub const TABLE_ENTRIES: usize = 1;

    // TransitionArray / DescriptorArray
    pub const ARRAY_LENGTH: usize = 0;
    pub const ARRAY_ENTRIES: usize = 1;

    // Code
    pub const CODE_FLAGS: usize = 0;
    pub const CODE_ENTRY: usize = 1;
    pub const CODE_EMBEDDED_COUNT: usize = 2;
    pub const CODE_EMBEDDED_PAIRS: usize = 3;
    pub const CODE_FLAG_MARKED_FOR_DEOPT: usize = 1;

    // SharedInfo
    pub const SHARED_DATA: usize = 0;
    pub const SHARED_AGE: usize = 1;

    // Bytecode / strings
    pub const VAR_LENGTH: usize = 0;
    pub const VAR_PAYLOAD: usize = 1;

    // BaselineCode
    pub const BASELINE_BYTECODE: usize = 0;

    // JsFunction
    pub const FUNCTION_SHARED: usize = 0;
    pub const FUNCTION_CODE: usize = 1;

    // AllocationSite
    pub const SITE_WEAK_NEXT: usize = 0;
    pub const SITE_ZOMBIE: usize = 1;

    // ExternalString
    pub const EXTERNAL_BACKING: usize = 1;
}

/// Accessor over a raw object address. Copyable and untracked; the caller
/// guarantees the address points at a live header.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct HeapObject(pub Address);

impl HeapObject {
    #[inline(always)]
    pub fn address(self) -> Address {
        self.0
    }

    #[inline(always)]
    fn header(self) -> &'static AtomicUsize {
        unsafe { &*(self.0 as *const AtomicUsize) }
    }

    #[inline(always)]
    pub fn map_word(self) -> MapWord {
        MapWord(self.header().load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn set_map_word(self, word: MapWord) {
        self.header().store(word.0, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn map(self) -> Address {
        self.map_word().to_map()
    }

    /// Map even while a forwarding address is installed, read through the
    /// copy. Valid only during evacuation.
    #[inline(always)]
    pub fn map_or_forwarded_map(self) -> Address {
        let word = self.map_word();
        if word.is_forwarding_address() {
            HeapObject(word.to_forwarding_address()).map()
        } else {
            word.to_map()
        }
    }

    #[inline(always)]
    pub fn slot(self, body_index: usize) -> ObjectSlot {
        ObjectSlot(self.0 + (1 + body_index) * TAGGED_SIZE)
    }

    #[inline(always)]
    pub fn field(self, body_index: usize) -> Tagged {
        self.slot(body_index).load()
    }

    #[inline(always)]
    pub fn set_field(self, body_index: usize, value: Tagged) {
        self.slot(body_index).store(value);
    }

    #[inline(always)]
    pub fn raw_field(self, body_index: usize) -> usize {
        self.slot(body_index).load().0
    }

    #[inline(always)]
    pub fn set_raw_field(self, body_index: usize, value: usize) {
        self.slot(body_index).store(Tagged(value));
    }

    pub fn kind(self) -> ObjectKind {
        map_kind(self.map_or_forwarded_map())
    }

    pub fn is_filler(self) -> bool {
        matches!(
            self.kind(),
            ObjectKind::FreeSpace | ObjectKind::OneWordFiller
        )
    }

    /// Object size in bytes, derived from the map plus a length word for
    /// variable-size kinds. Reads through a forwarded map so sweeping and
    /// evacuation can size objects while map space is being compacted.
    pub fn size(self) -> usize {
        size_with_map(self, self.map_or_forwarded_map())
    }
}

/// A slot: a memory location holding one tagged pointer. Loads and stores
/// are relaxed-atomic so the update phase may rewrite roots and fields
/// while other workers read them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct ObjectSlot(pub Address);

impl ObjectSlot {
    #[inline(always)]
    fn cell(self) -> &'static AtomicUsize {
        unsafe { &*(self.0 as *const AtomicUsize) }
    }

    #[inline(always)]
    pub fn load(self) -> Tagged {
        Tagged(self.cell().load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn store(self, value: Tagged) {
        self.cell().store(value.0, Ordering::Relaxed);
    }
}

pub fn map_bits(map: Address) -> MapBits {
    MapBits::from_bytes(HeapObject(map).raw_field(layout::MAP_BITS).to_le_bytes())
}

pub fn map_kind(map: Address) -> ObjectKind {
    ObjectKind::from_u8(map_bits(map).kind())
}

/// Size of `obj` under `map`. Passing the map explicitly lets evacuation
/// and verification read the size of an already-forwarded source object.
pub fn size_with_map(obj: HeapObject, map: Address) -> usize {
    let bits = map_bits(map);
    let kind = ObjectKind::from_u8(bits.kind());
    let words = match kind {
        ObjectKind::OneWordFiller => return TAGGED_SIZE,
        ObjectKind::FreeSpace => return obj.raw_field(layout::FREE_SIZE),
        ObjectKind::EphemeronTable => 2 + 2 * obj.raw_field(layout::TABLE_CAPACITY),
        ObjectKind::TransitionArray | ObjectKind::DescriptorArray => {
            2 + obj.raw_field(layout::ARRAY_LENGTH)
        }
        ObjectKind::Code => 4 + 2 * obj.raw_field(layout::CODE_EMBEDDED_COUNT),
        ObjectKind::Bytecode
        | ObjectKind::SeqString
        | ObjectKind::InternalizedString => {
            2 + crate::util::align_up(obj.raw_field(layout::VAR_LENGTH), TAGGED_SIZE) / TAGGED_SIZE
        }
        _ => bits.instance_words() as usize,
    };
    debug_assert!(words * TAGGED_SIZE >= MIN_OBJECT_SIZE);
    words * TAGGED_SIZE
}

/// Number of body slots (tagged words after the header) for iteration.
pub fn body_slot_count(obj: HeapObject, map: Address) -> usize {
    size_with_map(obj, map) / TAGGED_SIZE - 1
}

/// Overwrite `[start, start + size)` with a filler so linear heap walks
/// stay parseable. One-word gaps take the degenerate filler map.
pub fn create_filler(
    free_space_map: Address,
    one_word_filler_map: Address,
    start: Address,
    size: usize,
) {
    debug_assert!(size >= TAGGED_SIZE && size % TAGGED_SIZE == 0);
    let filler = HeapObject(start);
    if size == TAGGED_SIZE {
        filler.set_map_word(MapWord::from_map(one_word_filler_map));
    } else {
        filler.set_map_word(MapWord::from_map(free_space_map));
        filler.set_raw_field(layout::FREE_SIZE, size);
    }
}
