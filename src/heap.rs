use std::sync::atomic::{AtomicUsize, Ordering};

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;

use crate::embedder::{EmbedderTracer, NoEmbedderTracer};
use crate::flags::Flags;
use crate::incremental::IncrementalMarker;
use crate::object::{
    layout, Address, HeapObject, MapBits, MapWord, ObjectKind, ObjectSlot, Tagged,
    MIN_OBJECT_SIZE, NULL_ADDRESS, TAGGED_SIZE,
};
use crate::page::{flags as page_flags, Page, SpaceId};
use crate::remembered_set::{RememberedSetClass, SlotType};
use crate::roots::RootSet;
use crate::safepoint::GlobalSafepoint;
use crate::space::{LargeObjectSpace, NewSpace, PagedSpace, PageRegistry};
use crate::util::align_up;

/// Objects at or above this size go to a large-object space.
pub const LARGE_OBJECT_LIMIT: usize = 32 * 1024;

const KIND_COUNT: usize = ObjectKind::OneWordFiller as usize + 1;

pub fn fatal_process_out_of_memory(reason: &str) -> ! {
    eprintln!("FATAL: process out of memory: {}", reason);
    std::process::abort();
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocationSpace {
    Young,
    Old,
    Map,
    Code,
    Shared,
}

/// The managed heap of one isolate: spaces, roots, interning tables and the
/// collector-facing bookkeeping. Collectors hold it by non-owning reference
/// for the duration of a cycle.
pub struct Heap {
    pub flags: Flags,
    pub registry: PageRegistry,
    pub new_space: Mutex<NewSpace>,
    pub old_space: Mutex<PagedSpace>,
    pub map_space: Mutex<PagedSpace>,
    pub code_space: Mutex<PagedSpace>,
    pub shared_old_space: Mutex<PagedSpace>,
    pub lo_space: Mutex<LargeObjectSpace>,
    pub new_lo_space: Mutex<LargeObjectSpace>,
    pub roots: RootSet,
    pub safepoint: GlobalSafepoint,
    pub incremental: IncrementalMarker,
    pub embedder: Mutex<Box<dyn EmbedderTracer>>,

    /// Internalized string table; entries are weak (the table alone does
    /// not keep a string alive).
    pub string_table: Mutex<Vec<Address>>,
    /// Strings forwarded during interning: (from, to) pairs.
    pub string_forwarding_table: Mutex<Vec<(Address, Address)>>,
    pub external_string_table: Mutex<Vec<Address>>,
    pub young_external_string_table: Mutex<Vec<Address>>,
    /// External-string backing bytes accounted per owning page.
    pub external_bytes: AtomicUsize,

    /// Head of the allocation-site weak list, threaded through each site.
    pub allocation_sites_head: AtomicUsize,
    pub code_registry: Mutex<Vec<Address>>,
    /// Ephemeron entries with young keys: table -> entry indices.
    pub ephemeron_remembered_set: Mutex<AHashMap<Address, AHashSet<usize>>>,

    canonical_maps: [AtomicUsize; KIND_COUNT],
    sized_maps: Mutex<AHashMap<(u8, usize), Address>>,
    meta_map: AtomicUsize,

    epoch: AtomicUsize,
    compaction_bytes: AtomicUsize,
    compaction_micros: AtomicUsize,

    /// Client isolates attached to this heap when it serves as the shared
    /// heap. Raw and non-owning; clients outlive the shared GC cycle.
    pub client_heaps: Mutex<Vec<*const Heap>>,
    pub is_shared_heap: bool,
}

unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    pub fn new(flags: Flags) -> Box<Heap> {
        let registry = PageRegistry::new();
        let new_space = NewSpace::new(flags.nursery_size, &registry);
        let heap = Box::new(Heap {
            new_space: Mutex::new(new_space),
            old_space: Mutex::new(PagedSpace::new(SpaceId::Old, false)),
            map_space: Mutex::new(PagedSpace::new(SpaceId::Map, false)),
            code_space: Mutex::new(PagedSpace::new(SpaceId::Code, true)),
            shared_old_space: Mutex::new(PagedSpace::new(SpaceId::SharedOld, false)),
            lo_space: Mutex::new(LargeObjectSpace::new(SpaceId::LargeObject)),
            new_lo_space: Mutex::new(LargeObjectSpace::new(SpaceId::NewLargeObject)),
            roots: RootSet::new(),
            safepoint: GlobalSafepoint::new(),
            incremental: IncrementalMarker::new(),
            embedder: Mutex::new(Box::new(NoEmbedderTracer)),
            string_table: Mutex::new(Vec::new()),
            string_forwarding_table: Mutex::new(Vec::new()),
            external_string_table: Mutex::new(Vec::new()),
            young_external_string_table: Mutex::new(Vec::new()),
            external_bytes: AtomicUsize::new(0),
            allocation_sites_head: AtomicUsize::new(NULL_ADDRESS),
            code_registry: Mutex::new(Vec::new()),
            ephemeron_remembered_set: Mutex::new(AHashMap::new()),
            canonical_maps: Default::default(),
            sized_maps: Mutex::new(AHashMap::new()),
            meta_map: AtomicUsize::new(NULL_ADDRESS),
            epoch: AtomicUsize::new(0),
            compaction_bytes: AtomicUsize::new(0),
            compaction_micros: AtomicUsize::new(0),
            client_heaps: Mutex::new(Vec::new()),
            is_shared_heap: false,
            registry,
            flags,
        });
        heap.bootstrap_maps();
        // The sweeper writes fillers from arbitrary phases; their maps must
        // never be allocated mid-sweep.
        heap.canonical_map(ObjectKind::FreeSpace);
        heap.canonical_map(ObjectKind::OneWordFiller);
        heap
    }

    fn bootstrap_maps(&self) {
        // The meta map describes maps, including itself.
        let meta = self
            .map_space
            .lock()
            .allocate_raw(layout::MAP_WORDS * TAGGED_SIZE, &self.registry)
            .expect("map space bootstrap");
        let meta_obj = HeapObject(meta);
        meta_obj.set_map_word(MapWord::from_map(meta));
        let bits = MapBits::new()
            .with_kind(ObjectKind::Map as u8)
            .with_instance_words(layout::MAP_WORDS as u16)
            .with_is_wrapper(false);
        meta_obj.set_raw_field(layout::MAP_BITS, u64::from_le_bytes(bits.into_bytes()) as usize);
        meta_obj.set_field(layout::MAP_TRANSITIONS, Tagged::NULL);
        meta_obj.set_field(layout::MAP_DESCRIPTORS, Tagged::NULL);
        self.roots.add_well_known(meta);
        self.meta_map.store(meta, Ordering::Relaxed);
    }

    pub fn meta_map(&self) -> Address {
        self.meta_map.load(Ordering::Relaxed)
    }

    /// Allocate a fresh map in map space. A map not reachable from any
    /// live object dies like any other heap object; the canonical and
    /// sized caches root theirs separately.
    pub fn new_map(&self, kind: ObjectKind, instance_words: usize, is_wrapper: bool) -> Address {
        let addr = self
            .map_space
            .lock()
            .allocate_raw(layout::MAP_WORDS * TAGGED_SIZE, &self.registry)
            .unwrap_or_else(|| fatal_process_out_of_memory("map space"));
        let map = HeapObject(addr);
        map.set_map_word(MapWord::from_map(self.meta_map()));
        let bits = MapBits::new()
            .with_kind(kind as u8)
            .with_instance_words(instance_words as u16)
            .with_is_wrapper(is_wrapper);
        map.set_raw_field(layout::MAP_BITS, u64::from_le_bytes(bits.into_bytes()) as usize);
        map.set_field(layout::MAP_TRANSITIONS, Tagged::NULL);
        map.set_field(layout::MAP_DESCRIPTORS, Tagged::NULL);
        addr
    }

    /// Re-key the map caches after map space compaction moved maps.
    pub fn update_map_caches(&self) {
        let forward = |addr: Address| -> Address {
            let word = HeapObject(addr).map_word();
            if word.is_forwarding_address() {
                word.to_forwarding_address()
            } else {
                addr
            }
        };
        let meta = self.meta_map.load(Ordering::Relaxed);
        if meta != NULL_ADDRESS {
            self.meta_map.store(forward(meta), Ordering::Relaxed);
        }
        for cell in &self.canonical_maps {
            let map = cell.load(Ordering::Relaxed);
            if map != NULL_ADDRESS {
                cell.store(forward(map), Ordering::Relaxed);
            }
        }
        for map in self.sized_maps.lock().values_mut() {
            *map = forward(*map);
        }
    }

    /// Canonical map of a kind whose size never varies per instance.
    pub fn canonical_map(&self, kind: ObjectKind) -> Address {
        let cell = &self.canonical_maps[kind as usize];
        let cached = cell.load(Ordering::Relaxed);
        if cached != NULL_ADDRESS {
            return cached;
        }
        let words = match kind {
            ObjectKind::Map => layout::MAP_WORDS,
            ObjectKind::WeakCell => 4,
            ObjectKind::JsWeakRef => 2,
            ObjectKind::FinalizationRegistry => 2,
            ObjectKind::SharedInfo => 3,
            ObjectKind::UncompiledData => 2,
            ObjectKind::BaselineCode => 2,
            ObjectKind::JsFunction => 3,
            ObjectKind::AllocationSite => 3,
            ObjectKind::ExternalString => 3,
            ObjectKind::OneWordFiller => 1,
            // Variable-size kinds derive size from a length word.
            _ => 0,
        };
        let map = self.new_map(kind, words, false);
        // Cache-held maps are immortal: root them so the cache never goes
        // stale through a map dying.
        self.roots.add_well_known(map);
        cell.store(map, Ordering::Relaxed);
        map
    }

    /// Map for a regular or weak-holder object of `words` total size.
    pub fn sized_map(&self, kind: ObjectKind, words: usize) -> Address {
        debug_assert!(matches!(kind, ObjectKind::Regular | ObjectKind::WeakHolder));
        let mut cache = self.sized_maps.lock();
        if let Some(&map) = cache.get(&(kind as u8, words)) {
            return map;
        }
        let map = self.new_map(kind, words, false);
        self.roots.add_well_known(map);
        cache.insert((kind as u8, words), map);
        map
    }

    pub fn allocate_raw(&self, space: AllocationSpace, size: usize) -> Option<Address> {
        let size = align_up(size.max(MIN_OBJECT_SIZE), TAGGED_SIZE);
        match space {
            AllocationSpace::Young if size >= LARGE_OBJECT_LIMIT => {
                Some(self.new_lo_space.lock().allocate(size, &self.registry))
            }
            AllocationSpace::Young => self.new_space.lock().allocate_raw(size, &self.registry),
            AllocationSpace::Old if size >= LARGE_OBJECT_LIMIT => {
                Some(self.lo_space.lock().allocate(size, &self.registry))
            }
            AllocationSpace::Old => self.old_space.lock().allocate_raw(size, &self.registry),
            AllocationSpace::Map => self
                .map_space
                .lock()
                .allocate_raw(size, &self.registry),
            AllocationSpace::Code => self
                .code_space
                .lock()
                .allocate_raw(size, &self.registry),
            AllocationSpace::Shared => self
                .shared_old_space
                .lock()
                .allocate_raw(size, &self.registry),
        }
    }

    fn allocate_with_map(&self, space: AllocationSpace, map: Address, size: usize) -> HeapObject {
        let addr = self
            .allocate_raw(space, size)
            .unwrap_or_else(|| fatal_process_out_of_memory("allocation"));
        let obj = HeapObject(addr);
        obj.set_map_word(MapWord::from_map(map));
        for i in 0..(size / TAGGED_SIZE - 1) {
            obj.set_field(i, Tagged::NULL);
        }
        obj
    }

    // Factory functions used by the runtime embedding and the tests.

    pub fn new_regular(&self, space: AllocationSpace, slots: usize) -> HeapObject {
        let words = 1 + slots.max(1);
        let map = self.sized_map(ObjectKind::Regular, words);
        self.allocate_with_map(space, map, words * TAGGED_SIZE)
    }

    pub fn new_wrapper(&self, space: AllocationSpace, slots: usize) -> HeapObject {
        let words = 1 + slots.max(1);
        let map = self.new_map(ObjectKind::Regular, words, true);
        self.allocate_with_map(space, map, words * TAGGED_SIZE)
    }

    pub fn new_weak_holder(&self, space: AllocationSpace, slots: usize) -> HeapObject {
        let words = 1 + slots.max(1);
        let map = self.sized_map(ObjectKind::WeakHolder, words);
        self.allocate_with_map(space, map, words * TAGGED_SIZE)
    }

    pub fn new_ephemeron_table(&self, space: AllocationSpace, capacity: usize) -> HeapObject {
        let map = self.canonical_map(ObjectKind::EphemeronTable);
        let size = (2 + 2 * capacity) * TAGGED_SIZE;
        let table = self.allocate_with_map(space, map, size);
        table.set_raw_field(layout::TABLE_CAPACITY, capacity);
        table
    }

    pub fn new_weak_cell(&self, space: AllocationSpace) -> HeapObject {
        self.allocate_with_map(
            space,
            self.canonical_map(ObjectKind::WeakCell),
            4 * TAGGED_SIZE,
        )
    }

    pub fn new_js_weak_ref(&self, space: AllocationSpace) -> HeapObject {
        self.allocate_with_map(
            space,
            self.canonical_map(ObjectKind::JsWeakRef),
            2 * TAGGED_SIZE,
        )
    }

    pub fn new_finalization_registry(&self, space: AllocationSpace) -> HeapObject {
        self.allocate_with_map(
            space,
            self.canonical_map(ObjectKind::FinalizationRegistry),
            2 * TAGGED_SIZE,
        )
    }

    pub fn new_transition_array(&self, space: AllocationSpace, len: usize) -> HeapObject {
        let map = self.canonical_map(ObjectKind::TransitionArray);
        let array = self.allocate_with_map(space, map, (2 + len) * TAGGED_SIZE);
        array.set_raw_field(layout::ARRAY_LENGTH, len);
        array
    }

    pub fn new_descriptor_array(&self, space: AllocationSpace, len: usize) -> HeapObject {
        let map = self.canonical_map(ObjectKind::DescriptorArray);
        let array = self.allocate_with_map(space, map, (2 + len) * TAGGED_SIZE);
        array.set_raw_field(layout::ARRAY_LENGTH, len);
        array
    }

    /// A code object with the given embedded references; registered with
    /// the code object registry.
    pub fn new_code(&self, embedded: &[(SlotType, Tagged)]) -> HeapObject {
        let map = self.canonical_map(ObjectKind::Code);
        let size = (4 + 2 * embedded.len()) * TAGGED_SIZE;
        let code = self.allocate_with_map(AllocationSpace::Code, map, size);
        code.set_raw_field(layout::CODE_FLAGS, 0);
        code.set_raw_field(layout::CODE_ENTRY, code.address() + TAGGED_SIZE);
        code.set_raw_field(layout::CODE_EMBEDDED_COUNT, embedded.len());
        for (i, &(kind, target)) in embedded.iter().enumerate() {
            code.set_raw_field(layout::CODE_EMBEDDED_PAIRS + 2 * i, kind as usize);
            code.set_field(layout::CODE_EMBEDDED_PAIRS + 2 * i + 1, target);
        }
        self.code_registry.lock().push(code.address());
        code
    }

    pub fn new_shared_info(&self, space: AllocationSpace, data: Tagged) -> HeapObject {
        let info = self.allocate_with_map(
            space,
            self.canonical_map(ObjectKind::SharedInfo),
            3 * TAGGED_SIZE,
        );
        info.set_field(layout::SHARED_DATA, data);
        info.set_raw_field(layout::SHARED_AGE, 0);
        info
    }

    pub fn new_bytecode(&self, space: AllocationSpace, len: usize) -> HeapObject {
        let map = self.canonical_map(ObjectKind::Bytecode);
        let size = (2 + align_up(len, TAGGED_SIZE) / TAGGED_SIZE) * TAGGED_SIZE;
        let bytecode = self.allocate_with_map(space, map, size);
        bytecode.set_raw_field(layout::VAR_LENGTH, len);
        bytecode
    }

    pub fn new_baseline_code(&self, space: AllocationSpace, bytecode: Tagged) -> HeapObject {
        let baseline = self.allocate_with_map(
            space,
            self.canonical_map(ObjectKind::BaselineCode),
            2 * TAGGED_SIZE,
        );
        if self.flags.concurrent_sparkplug {
            // A background tier-up thread publishes code links under the
            // chunk mutex so the pointer-update phase never observes a
            // half-written slot.
            if let Some(page) = self.page_of(baseline.address()) {
                let _guard = page.mutex().lock();
                baseline.set_field(layout::BASELINE_BYTECODE, bytecode);
                return baseline;
            }
        }
        baseline.set_field(layout::BASELINE_BYTECODE, bytecode);
        baseline
    }

    /// Begin concurrent marking ahead of the next atomic pause. The write
    /// barrier starts logging grey objects for the pause to consume.
    pub fn start_incremental_marking(&self) {
        debug_assert!(self.flags.concurrent_marking);
        self.incremental.start();
    }

    pub fn new_js_function(&self, space: AllocationSpace, shared: Tagged, code: Tagged) -> HeapObject {
        let function = self.allocate_with_map(
            space,
            self.canonical_map(ObjectKind::JsFunction),
            3 * TAGGED_SIZE,
        );
        function.set_field(layout::FUNCTION_SHARED, shared);
        function.set_field(layout::FUNCTION_CODE, code);
        function
    }

    /// Allocation sites join the heap-global weak list on creation.
    pub fn new_allocation_site(&self, space: AllocationSpace) -> HeapObject {
        let site = self.allocate_with_map(
            space,
            self.canonical_map(ObjectKind::AllocationSite),
            3 * TAGGED_SIZE,
        );
        let head = self.allocation_sites_head.load(Ordering::Relaxed);
        site.set_raw_field(layout::SITE_WEAK_NEXT, head);
        site.set_raw_field(layout::SITE_ZOMBIE, 0);
        self.allocation_sites_head
            .store(site.address(), Ordering::Relaxed);
        site
    }

    pub fn new_string(&self, space: AllocationSpace, contents: &[u8]) -> HeapObject {
        let map = self.canonical_map(ObjectKind::SeqString);
        let size = (2 + align_up(contents.len(), TAGGED_SIZE) / TAGGED_SIZE) * TAGGED_SIZE;
        let string = self.allocate_with_map(space, map, size);
        string.set_raw_field(layout::VAR_LENGTH, contents.len());
        unsafe {
            core::ptr::copy_nonoverlapping(
                contents.as_ptr(),
                (string.address() + (1 + layout::VAR_PAYLOAD) * TAGGED_SIZE) as *mut u8,
                contents.len(),
            );
        }
        string
    }

    /// An internalized string, registered in the string table.
    pub fn new_internalized_string(&self, space: AllocationSpace, contents: &[u8]) -> HeapObject {
        let string = self.new_string(space, contents);
        string.set_map_word(MapWord::from_map(
            self.canonical_map(ObjectKind::InternalizedString),
        ));
        self.string_table.lock().push(string.address());
        string
    }

    /// An external string; its backing store lives outside the heap and is
    /// freed when the string dies.
    pub fn new_external_string(&self, space: AllocationSpace, contents: &[u8]) -> HeapObject {
        let string = self.allocate_with_map(
            space,
            self.canonical_map(ObjectKind::ExternalString),
            3 * TAGGED_SIZE,
        );
        let backing = unsafe { libc::malloc(contents.len().max(1)) };
        unsafe {
            core::ptr::copy_nonoverlapping(contents.as_ptr(), backing as *mut u8, contents.len());
        }
        string.set_raw_field(layout::VAR_LENGTH, contents.len());
        string.set_raw_field(layout::EXTERNAL_BACKING, backing as usize);
        self.external_bytes
            .fetch_add(contents.len(), Ordering::Relaxed);
        if self.page_of(string.address()).map_or(false, Page::in_young_generation) {
            self.young_external_string_table.lock().push(string.address());
        } else {
            self.external_string_table.lock().push(string.address());
        }
        string
    }

    pub fn finalize_external_string(&self, string: HeapObject) {
        debug_assert!(string.kind() == ObjectKind::ExternalString);
        let backing = string.raw_field(layout::EXTERNAL_BACKING);
        if backing != 0 {
            unsafe { libc::free(backing as *mut libc::c_void) };
            self.external_bytes
                .fetch_sub(string.raw_field(layout::VAR_LENGTH), Ordering::Relaxed);
            string.set_raw_field(layout::EXTERNAL_BACKING, 0);
        }
    }

    // Page and classification queries.

    #[inline]
    pub fn page_of(&self, addr: Address) -> Option<&Page> {
        self.registry.lookup(addr)
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.page_of(addr).is_some()
    }

    #[inline]
    pub fn in_young_generation(&self, addr: Address) -> bool {
        self.page_of(addr).map_or(false, Page::in_young_generation)
    }

    #[inline]
    pub fn in_from_page(&self, addr: Address) -> bool {
        self.page_of(addr)
            .map_or(false, |p| p.is_flag_set(page_flags::FROM_PAGE))
    }

    #[inline]
    pub fn in_to_page(&self, addr: Address) -> bool {
        self.page_of(addr)
            .map_or(false, |p| p.is_flag_set(page_flags::TO_PAGE))
    }

    /// Follow an installed forwarding address, if any.
    #[inline]
    pub fn forwarded(&self, addr: Address) -> Option<Address> {
        let word = HeapObject(addr).map_word();
        if word.is_forwarding_address() {
            Some(word.to_forwarding_address())
        } else {
            None
        }
    }

    /// Record `slot` (inside `host`) into the remembered set matching the
    /// host -> target edge, unless the host page skips recording.
    pub fn record_slot(&self, host: HeapObject, slot: ObjectSlot, target: Address) {
        let Some(host_page) = self.page_of(host.address()) else {
            return;
        };
        if host_page.is_flag_set(page_flags::SKIP_RECORDING) {
            return;
        }
        let Some(target_page) = self.page_of(target) else {
            return;
        };
        let offset = host_page.offset_of(slot.0);
        if target_page.in_young_generation() {
            if !host_page.in_young_generation() {
                host_page
                    .slot_set_or_create(RememberedSetClass::OldToNew)
                    .insert(offset);
            }
        } else if target_page.is_evacuation_candidate() {
            let class = if target_page.space() == SpaceId::Code {
                RememberedSetClass::OldToCode
            } else {
                RememberedSetClass::OldToOld
            };
            host_page.slot_set_or_create(class).insert(offset);
        } else if target_page.space() == SpaceId::SharedOld && !self.is_shared_heap {
            host_page
                .slot_set_or_create(RememberedSetClass::OldToShared)
                .insert(offset);
        }
    }

    /// Store into an object field, keeping the remembered sets current.
    /// This is the runtime's store path; barrier design beyond recording is
    /// out of collector scope.
    pub fn write_field(&self, host: HeapObject, body_index: usize, value: Tagged) {
        host.set_field(body_index, value);
        if let Some(target) = value.to_address() {
            self.record_slot(host, host.slot(body_index), target);
        }
    }

    /// Record a typed (relocation) slot of a code object. Typed insertion
    /// takes the chunk mutex; background code publication shares this path.
    pub fn record_typed_slot(
        &self,
        host: HeapObject,
        kind: SlotType,
        slot: ObjectSlot,
        target: Address,
    ) {
        let Some(host_page) = self.page_of(host.address()) else {
            return;
        };
        if host_page.is_flag_set(page_flags::SKIP_RECORDING) {
            return;
        }
        let Some(target_page) = self.page_of(target) else {
            return;
        };
        let class = if target_page.in_young_generation() {
            if host_page.in_young_generation() {
                return;
            }
            RememberedSetClass::OldToNew
        } else if target_page.is_evacuation_candidate() {
            RememberedSetClass::OldToOld
        } else {
            return;
        };
        let offset = host_page.offset_of(slot.0);
        host_page.with_typed_slots(|sets| sets[class.index()].insert(kind, offset));
    }

    pub fn record_ephemeron_key(&self, table: Address, index: usize) {
        self.ephemeron_remembered_set
            .lock()
            .entry(table)
            .or_default()
            .insert(index);
    }

    // Cycle bookkeeping.

    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Relaxed)
    }

    pub fn increment_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::Relaxed);
    }

    pub fn should_reduce_memory(&self) -> bool {
        self.flags.reduce_memory
    }

    pub fn record_compaction_event(&self, bytes: usize, micros: usize) {
        self.compaction_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.compaction_micros.fetch_add(micros, Ordering::Relaxed);
    }

    /// Measured compaction speed in bytes per millisecond; 0 before the
    /// first sample.
    pub fn compaction_speed(&self) -> f64 {
        let micros = self.compaction_micros.load(Ordering::Relaxed);
        if micros == 0 {
            return 0.0;
        }
        let bytes = self.compaction_bytes.load(Ordering::Relaxed);
        bytes as f64 / (micros as f64 / 1000.0)
    }

    /// Every page of every space, large pages included.
    pub fn all_pages(&self) -> Vec<*const Page> {
        let mut pages = Vec::new();
        {
            let new_space = self.new_space.lock();
            pages.extend(new_space.to_pages().map(|p| p as *const Page));
            pages.extend(new_space.from_pages().map(|p| p as *const Page));
        }
        pages.extend(self.old_space.lock().page_pointers());
        pages.extend(self.map_space.lock().page_pointers());
        pages.extend(self.code_space.lock().page_pointers());
        pages.extend(self.shared_old_space.lock().page_pointers());
        pages.extend(self.lo_space.lock().page_pointers());
        pages.extend(self.new_lo_space.lock().page_pointers());
        pages
    }

    pub fn attach_client_heap(&self, client: *const Heap) {
        self.client_heaps.lock().push(client);
    }

    pub fn paged_space(&self, id: SpaceId) -> &Mutex<PagedSpace> {
        match id {
            SpaceId::Old => &self.old_space,
            SpaceId::Map => &self.map_space,
            SpaceId::Code => &self.code_space,
            SpaceId::SharedOld => &self.shared_old_space,
            _ => unreachable!("not a paged space: {:?}", id),
        }
    }

    /// Write a filler over a freed range, drop any slots recorded inside
    /// it and register it with the owning space's free list when it can
    /// hold an allocation again.
    pub fn free_range(&self, page: &Page, start: Address, size: usize) {
        if size == 0 {
            return;
        }
        crate::object::create_filler(
            self.canonical_map(ObjectKind::FreeSpace),
            self.canonical_map(ObjectKind::OneWordFiller),
            start,
            size,
        );
        let from = page.offset_of(start);
        for class in [
            RememberedSetClass::OldToNew,
            RememberedSetClass::OldToOld,
            RememberedSetClass::OldToCode,
            RememberedSetClass::OldToShared,
        ] {
            if let Some(set) = page.slot_set(class) {
                set.remove_range(from, from + size);
            }
            page.with_typed_slots(|sets| sets[class.index()].remove_range(from, from + size));
        }
        match page.space() {
            SpaceId::Old | SpaceId::Map | SpaceId::Code | SpaceId::SharedOld => {
                if size >= MIN_OBJECT_SIZE && !page.is_evacuation_candidate() {
                    self.paged_space(page.space())
                        .lock()
                        .add_free_region(start, size);
                }
            }
            _ => {}
        }
    }
}
