use parking_lot::RwLock;

use crate::object::{Address, NULL_ADDRESS};
use crate::page::{flags, Page, SpaceId, PAGE_AREA_SIZE};
use crate::util::align_up;

/// Address -> page lookup shared by every thread. Pages are arena-boxed so
/// registered pointers stay stable for the page's lifetime.
pub struct PageRegistry {
    ranges: RwLock<Vec<(Address, Address, *const Page)>>,
}

unsafe impl Send for PageRegistry {}
unsafe impl Sync for PageRegistry {}

impl PageRegistry {
    pub fn new() -> PageRegistry {
        PageRegistry {
            ranges: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, page: &Page) {
        let mut ranges = self.ranges.write();
        let entry = (page.area_start(), page.area_end(), page as *const Page);
        let at = ranges
            .binary_search_by(|probe| probe.0.cmp(&entry.0))
            .unwrap_err();
        ranges.insert(at, entry);
    }

    pub fn unregister(&self, area_start: Address) {
        let mut ranges = self.ranges.write();
        if let Ok(at) = ranges.binary_search_by(|probe| probe.0.cmp(&area_start)) {
            ranges.remove(at);
        }
    }

    #[inline]
    pub fn lookup(&self, addr: Address) -> Option<&Page> {
        let ranges = self.ranges.read();
        let at = match ranges.binary_search_by(|probe| probe.0.cmp(&addr)) {
            Ok(at) => at,
            Err(0) => return None,
            Err(at) => at - 1,
        };
        let (start, end, page) = ranges[at];
        if addr >= start && addr < end {
            Some(unsafe { &*page })
        } else {
            None
        }
    }
}

/// A paged space: old, map, code and (in shared mode) shared-old. Owns its
/// pages and a free list of swept regions; hands out linear allocation
/// buffers to evacuation workers.
pub struct PagedSpace {
    id: SpaceId,
    executable: bool,
    pages: Vec<Box<Page>>,
    free_list: Vec<(Address, usize)>,
    top: Address,
    limit: Address,
    /// Growth cap; `expand` fails beyond it. Unlimited by default.
    page_limit: Option<usize>,
}

impl PagedSpace {
    pub fn new(id: SpaceId, executable: bool) -> PagedSpace {
        PagedSpace {
            id,
            executable,
            pages: Vec::new(),
            free_list: Vec::new(),
            top: NULL_ADDRESS,
            limit: NULL_ADDRESS,
            page_limit: None,
        }
    }

    pub fn set_page_limit(&mut self, limit: Option<usize>) {
        self.page_limit = limit;
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self) -> impl Iterator<Item = &Page> {
        self.pages.iter().map(|p| &**p)
    }

    pub fn page_pointers(&self) -> Vec<*const Page> {
        self.pages.iter().map(|p| &**p as *const Page).collect()
    }

    /// Page currently backing the linear allocation area, if any.
    pub fn linear_area_page(&self) -> Option<*const Page> {
        if self.top == self.limit {
            return None;
        }
        self.pages
            .iter()
            .find(|p| p.contains(self.top))
            .map(|p| &**p as *const Page)
    }

    pub fn expand(&mut self, registry: &PageRegistry) -> Option<*const Page> {
        if let Some(limit) = self.page_limit {
            if self.pages.len() >= limit {
                return None;
            }
        }
        let page = Page::new(self.id, PAGE_AREA_SIZE, self.executable);
        registry.register(&page);
        let ptr = &*page as *const Page;
        self.pages.push(page);
        Some(ptr)
    }

    /// Bump-or-free-list allocation. Returns None when the space cannot be
    /// grown; callers decide whether that is fatal.
    pub fn allocate_raw(&mut self, size: usize, registry: &PageRegistry) -> Option<Address> {
        let size = align_up(size, crate::object::TAGGED_SIZE);
        if self.top + size <= self.limit {
            let result = self.top;
            self.top += size;
            self.page_containing(result)
                .expect("linear area escaped its page")
                .increment_allocated_bytes(size);
            return Some(result);
        }
        if let Some(at) = self.free_list.iter().position(|&(_, len)| len >= size) {
            let (start, len) = self.free_list.remove(at);
            if len > size {
                self.free_list.push((start + size, len - size));
            }
            self.page_containing(start)
                .expect("free region escaped its page")
                .increment_allocated_bytes(size);
            return Some(start);
        }
        let page = unsafe { &*self.expand(registry)? };
        self.top = page.area_start() + size;
        self.limit = page.area_end();
        page.increment_allocated_bytes(size);
        Some(page.area_start())
    }

    /// Carve out a linear allocation buffer for an evacuation worker.
    pub fn allocate_lab(
        &mut self,
        min_size: usize,
        preferred: usize,
        registry: &PageRegistry,
    ) -> Option<(Address, Address)> {
        let want = min_size.max(preferred);
        if let Some(at) = self.free_list.iter().position(|&(_, len)| len >= min_size) {
            let (start, len) = self.free_list.remove(at);
            let take = len.min(want);
            if len > take {
                self.free_list.push((start + take, len - take));
            }
            self.page_containing(start)?.increment_allocated_bytes(take);
            return Some((start, start + take));
        }
        let page = unsafe { &*self.expand(registry)? };
        let take = want.min(page.area_size());
        page.increment_allocated_bytes(take);
        if take < page.area_size() {
            self.free_list
                .push((page.area_start() + take, page.area_size() - take));
        }
        Some((page.area_start(), page.area_start() + take))
    }

    /// Return the unused tail of a worker's buffer. The caller writes the
    /// filler and re-registers the region through the heap.
    pub fn return_lab_tail(&mut self, start: Address, end: Address) {
        if end > start {
            if let Some(page) = self.page_containing(start) {
                page.set_allocated_bytes(page.allocated_bytes().saturating_sub(end - start));
            }
        }
    }

    pub fn add_free_region(&mut self, start: Address, size: usize) {
        self.free_list.push((start, size));
    }

    /// Drop every free region on `page`; evacuation candidates must not
    /// receive new allocations.
    pub fn evict_free_list(&mut self, page: &Page) {
        self.free_list.retain(|&(start, _)| !page.contains(start));
    }

    /// Forget all free regions. Sweeping re-derives them from the current
    /// mark bits; stale regions from the previous cycle must not survive
    /// into evacuation.
    pub fn clear_free_list(&mut self) {
        self.free_list.clear();
        self.top = NULL_ADDRESS;
        self.limit = NULL_ADDRESS;
    }

    pub fn page_containing(&self, addr: Address) -> Option<&Page> {
        self.pages.iter().map(|p| &**p).find(|p| p.contains(addr))
    }

    /// Adopt a page promoted from another space.
    pub fn adopt_page(&mut self, page: Box<Page>) {
        page.set_space(self.id);
        self.pages.push(page);
    }

    pub fn take_page(&mut self, page: *const Page) -> Option<Box<Page>> {
        let at = self
            .pages
            .iter()
            .position(|p| &**p as *const Page == page)?;
        Some(self.pages.remove(at))
    }

    /// Unlink and unmap an evacuated page. Its free-list entries must have
    /// been dropped by the caller.
    pub fn release_page(&mut self, page: *const Page, registry: &PageRegistry) {
        if let Some(boxed) = self.take_page(page) {
            let start = boxed.area_start();
            let end = boxed.area_end();
            self.free_list
                .retain(|&(addr, _)| addr < start || addr >= end);
            if self.top >= start && self.top < end {
                self.top = NULL_ADDRESS;
                self.limit = NULL_ADDRESS;
            }
            registry.unregister(start);
            drop(boxed);
        }
    }

    pub fn allocated_bytes(&self) -> usize {
        self.pages.iter().map(|p| p.allocated_bytes()).sum()
    }
}

/// The nursery: two semispaces of equal page capacity. The mutator bump
/// allocates in to-space; a flip retags the current pages as from-space.
pub struct NewSpace {
    from_pages: Vec<Box<Page>>,
    to_pages: Vec<Box<Page>>,
    capacity_pages: usize,
    current: usize,
    top: Address,
    limit: Address,
    age_mark: Address,
}

impl NewSpace {
    pub fn new(capacity: usize, registry: &PageRegistry) -> NewSpace {
        let capacity_pages = (capacity / PAGE_AREA_SIZE).max(1);
        let mut space = NewSpace {
            from_pages: Vec::new(),
            to_pages: Vec::new(),
            capacity_pages,
            current: 0,
            top: NULL_ADDRESS,
            limit: NULL_ADDRESS,
            age_mark: NULL_ADDRESS,
        };
        let page = Page::new(SpaceId::New, PAGE_AREA_SIZE, false);
        page.set_flag(flags::TO_PAGE);
        registry.register(&page);
        space.top = page.area_start();
        space.limit = page.area_end();
        space.age_mark = page.area_start();
        space.to_pages.push(page);
        space
    }

    pub fn to_pages(&self) -> impl Iterator<Item = &Page> {
        self.to_pages.iter().map(|p| &**p)
    }

    pub fn from_pages(&self) -> impl Iterator<Item = &Page> {
        self.from_pages.iter().map(|p| &**p)
    }

    pub fn from_page_pointers(&self) -> Vec<*const Page> {
        self.from_pages.iter().map(|p| &**p as *const Page).collect()
    }

    pub fn age_mark(&self) -> Address {
        self.age_mark
    }

    pub fn set_age_mark(&mut self, mark: Address) {
        self.age_mark = mark;
    }

    pub fn top(&self) -> Address {
        self.top
    }

    pub fn allocate_raw(&mut self, size: usize, registry: &PageRegistry) -> Option<Address> {
        let size = align_up(size, crate::object::TAGGED_SIZE);
        if self.top + size <= self.limit {
            let result = self.top;
            self.top += size;
            self.to_pages[self.current].increment_allocated_bytes(size);
            return Some(result);
        }
        if self.current + 1 < self.to_pages.len() {
            self.current += 1;
        } else if self.to_pages.len() < self.capacity_pages {
            let page = Page::new(SpaceId::New, PAGE_AREA_SIZE, false);
            page.set_flag(flags::TO_PAGE);
            registry.register(&page);
            self.to_pages.push(page);
            self.current = self.to_pages.len() - 1;
        } else {
            return None;
        }
        let page = &self.to_pages[self.current];
        self.top = page.area_start() + size;
        self.limit = page.area_end();
        page.increment_allocated_bytes(size);
        Some(page.area_start())
    }

    /// Retag to-space as from-space ahead of evacuation. The to-space side
    /// starts empty; survivors either get promoted or copied into pages the
    /// evacuators allocate here.
    pub fn flip(&mut self) {
        debug_assert!(self.from_pages.is_empty());
        std::mem::swap(&mut self.from_pages, &mut self.to_pages);
        for page in &self.from_pages {
            page.clear_flag(flags::TO_PAGE);
            page.set_flag(flags::FROM_PAGE);
        }
        self.current = 0;
        self.top = NULL_ADDRESS;
        self.limit = NULL_ADDRESS;
    }

    pub fn take_from_page(&mut self, page: *const Page) -> Option<Box<Page>> {
        let at = self
            .from_pages
            .iter()
            .position(|p| &**p as *const Page == page)?;
        Some(self.from_pages.remove(at))
    }

    /// Keep a NEW_TO_NEW promoted page on the to-space side.
    pub fn promote_within(&mut self, page: Box<Page>) {
        page.clear_flag(flags::FROM_PAGE);
        page.set_flag(flags::TO_PAGE);
        self.to_pages.push(page);
    }

    /// Drop whatever is left on the from side after evacuation.
    pub fn release_from_space(&mut self, registry: &PageRegistry) {
        for page in self.from_pages.drain(..) {
            registry.unregister(page.area_start());
        }
    }

    /// Make sure the mutator has an allocatable to-space page again and
    /// report the post-GC allocation top. Promoted to-space pages still
    /// hold live objects, so the allocation area always opens on a fresh
    /// page.
    pub fn reset_allocation_area(&mut self, registry: &PageRegistry) -> Address {
        if self.top == NULL_ADDRESS {
            let page = Page::new(SpaceId::New, PAGE_AREA_SIZE, false);
            page.set_flag(flags::TO_PAGE);
            registry.register(&page);
            self.top = page.area_start();
            self.limit = page.area_end();
            self.to_pages.push(page);
            self.current = self.to_pages.len() - 1;
        }
        self.top
    }
}

/// Large objects get a dedicated page each; they are never moved, only
/// promoted by flipping page ownership.
pub struct LargeObjectSpace {
    id: SpaceId,
    pages: Vec<Box<Page>>,
}

impl LargeObjectSpace {
    pub fn new(id: SpaceId) -> LargeObjectSpace {
        LargeObjectSpace {
            id,
            pages: Vec::new(),
        }
    }

    pub fn pages(&self) -> impl Iterator<Item = &Page> {
        self.pages.iter().map(|p| &**p)
    }

    pub fn page_pointers(&self) -> Vec<*const Page> {
        self.pages.iter().map(|p| &**p as *const Page).collect()
    }

    pub fn allocate(&mut self, size: usize, registry: &PageRegistry) -> Address {
        let area = align_up(size, crate::object::TAGGED_SIZE);
        let page = Page::new(self.id, area, false);
        page.set_flag(flags::LARGE_PAGE);
        page.increment_allocated_bytes(area);
        registry.register(&page);
        let start = page.area_start();
        self.pages.push(page);
        start
    }

    pub fn take_page(&mut self, page: *const Page) -> Option<Box<Page>> {
        let at = self
            .pages
            .iter()
            .position(|p| &**p as *const Page == page)?;
        Some(self.pages.remove(at))
    }

    pub fn adopt_page(&mut self, page: Box<Page>) {
        page.set_space(self.id);
        self.pages.push(page);
    }

    /// Free every large page whose object stayed white.
    pub fn sweep(&mut self, registry: &PageRegistry) -> usize {
        let mut freed = 0;
        self.pages.retain(|page| {
            let live = page.bitmap().is_black_or_grey(0);
            if !live {
                freed += page.area_size();
                registry.unregister(page.area_start());
            }
            live
        });
        freed
    }
}
