use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::Mutex;
use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;
use scoped_threadpool::Pool;
use threadfin::{Task, ThreadPool};

use crate::heap::Heap;
use crate::job::Terminator;
use crate::object::{Address, TAGGED_SIZE};
use crate::page::{flags, Page, SpaceId};

/// Lazily reclaims dead ranges on non-evacuated pages after marking. Pages
/// are handed over at `StartSweepSpaces`; from then on the mutator races a
/// background task for them, with `ensure_page_swept` as the merge point.
pub struct Sweeper {
    pending: Mutex<VecDeque<(SpaceId, usize)>>,
    in_progress: AtomicBool,
    background: ThreadPool,
    task: Mutex<Option<Task<usize>>>,
    done_tx: flume::Sender<usize>,
    done_rx: flume::Receiver<usize>,
    freed_total: AtomicUsize,
}

impl Sweeper {
    pub fn new() -> Sweeper {
        let (done_tx, done_rx) = flume::unbounded();
        Sweeper {
            pending: Mutex::new(VecDeque::new()),
            in_progress: AtomicBool::new(false),
            background: ThreadPool::builder().size(1).build(),
            task: Mutex::new(None),
            done_tx,
            done_rx,
            freed_total: AtomicUsize::new(0),
        }
    }

    pub fn add_page(&self, space: SpaceId, page: &Page) {
        page.clear_flag(flags::SWEEPING_DONE);
        self.pending
            .lock()
            .push_back((space, page as *const Page as usize));
    }

    pub fn sweeping_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Relaxed)
    }

    pub fn pending_page_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn total_freed(&self) -> usize {
        self.freed_total.load(Ordering::Relaxed)
    }

    /// Begin sweeping the queued pages. With concurrent sweeping enabled
    /// the work runs on a background task and the mutator resumes
    /// immediately; otherwise pages wait for lazy or forced sweeps.
    pub fn start_sweeping(&self, heap: &Heap) {
        if self.pending.lock().is_empty() {
            return;
        }
        self.in_progress.store(true, Ordering::Relaxed);
        if !heap.flags.concurrent_sweeping {
            return;
        }
        let heap_addr = heap as *const Heap as usize;
        let sweeper_addr = self as *const Sweeper as usize;
        let done_tx = self.done_tx.clone();
        let task = self.background.execute(move || {
            let heap = unsafe { &*(heap_addr as *const Heap) };
            let sweeper = unsafe { &*(sweeper_addr as *const Sweeper) };
            let mut freed = 0;
            while let Some((space, page_addr)) = sweeper.pop_pending() {
                freed += sweeper.sweep_page(heap, space, unsafe { &*(page_addr as *const Page) });
            }
            let _ = done_tx.send(freed);
            freed
        });
        *self.task.lock() = Some(task);
    }

    fn pop_pending(&self) -> Option<(SpaceId, usize)> {
        self.pending.lock().pop_front()
    }

    /// Sweep one pending page of `space`, if any. Lets the evacuation
    /// allocator refill its free list on demand instead of waiting for the
    /// background task.
    pub fn sweep_next_page_of(&self, heap: &Heap, space: SpaceId) -> bool {
        let claimed = {
            let mut pending = self.pending.lock();
            match pending.iter().position(|&(s, _)| s == space) {
                Some(at) => pending.remove(at),
                None => None,
            }
        };
        match claimed {
            Some((space, page_addr)) => {
                self.sweep_page(heap, space, unsafe { &*(page_addr as *const Page) });
                true
            }
            None => false,
        }
    }

    /// Promote the background sweep to completion only when it already ran
    /// out of queued work; a latency hook, not a correctness barrier.
    pub fn finish_sweeping_if_out_of_work(&self) {
        if !self.sweeping_in_progress() {
            return;
        }
        if self.pending.lock().is_empty() && self.done_rx.try_recv().is_ok() {
            if let Some(task) = self.task.lock().take() {
                task.join();
            }
            self.in_progress.store(false, Ordering::Relaxed);
        }
    }

    /// Drain every remaining page, joining the background task.
    pub fn ensure_completed(&self, heap: &Heap) {
        if !self.sweeping_in_progress() {
            return;
        }
        while let Some((space, page_addr)) = self.pop_pending() {
            self.sweep_page(heap, space, unsafe { &*(page_addr as *const Page) });
        }
        if let Some(task) = self.task.lock().take() {
            task.join();
        }
        while self.done_rx.try_recv().is_ok() {}
        self.in_progress.store(false, Ordering::Relaxed);
    }

    /// Make one specific page allocatable right now. If the background
    /// task already claimed it, spin until the done flag appears.
    pub fn ensure_page_swept(&self, heap: &Heap, page: &Page) {
        if page.is_flag_set(flags::SWEEPING_DONE) {
            return;
        }
        let claimed = {
            let mut pending = self.pending.lock();
            let addr = page as *const Page as usize;
            if let Some(at) = pending.iter().position(|&(_, p)| p == addr) {
                pending.remove(at)
            } else {
                None
            }
        };
        match claimed {
            Some((space, _)) => {
                self.sweep_page(heap, space, page);
            }
            None => {
                let backoff = crossbeam_utils::Backoff::new();
                while !page.is_flag_set(flags::SWEEPING_DONE) {
                    backoff.snooze();
                }
            }
        }
    }

    /// Sweep all queued pages in parallel on the foreground pool. Pages
    /// are distributed through work-stealing deques; workers without local
    /// work steal from a random victim.
    pub fn sweep_in_parallel(&self, heap: &Heap, pool: &mut Pool) -> usize {
        let n_threads = pool.thread_count() as usize;
        let injector = Injector::new();
        let mut item_count = 0;
        while let Some(item) = self.pop_pending() {
            injector.push(item);
            item_count += 1;
        }
        if item_count == 0 {
            return 0;
        }
        let mut workers = Vec::with_capacity(n_threads);
        let mut stealers = Vec::with_capacity(n_threads);
        for _ in 0..n_threads {
            let worker = Worker::new_lifo();
            stealers.push(worker.stealer());
            workers.push(worker);
        }
        let terminator = Terminator::new(n_threads);
        let freed = AtomicUsize::new(0);
        let heap_addr = heap as *const Heap as usize;
        let sweeper_addr = self as *const Sweeper as usize;
        pool.scoped(|scoped| {
            for (task_id, worker) in workers.into_iter().enumerate() {
                let injector = &injector;
                let stealers = &stealers;
                let terminator = &terminator;
                let freed = &freed;
                scoped.execute(move || {
                    let mut sweep_worker = SweepWorker {
                        sweeper: unsafe { &*(sweeper_addr as *const Sweeper) },
                        heap: unsafe { &*(heap_addr as *const Heap) },
                        task_id,
                        worker,
                        injector,
                        stealers,
                        terminator,
                        freed,
                    };
                    sweep_worker.run();
                });
            }
        });
        self.in_progress.store(false, Ordering::Relaxed);
        freed.load(Ordering::Relaxed)
    }

    /// Free every dead range of one page: write fillers, return regions to
    /// the owning space's free list, reset the allocated-byte count to the
    /// surviving bytes. Mark bits survive until the next cycle starts.
    pub fn sweep_page(&self, heap: &Heap, space: SpaceId, page: &Page) -> usize {
        debug_assert!(!page.is_evacuation_candidate());
        let mut free_start = page.area_start();
        let mut freed = 0;
        let mut live = 0usize;
        let mut live_ranges: Vec<(Address, usize)> = Vec::new();
        page.iterate_live_objects(|obj, _color| {
            live_ranges.push((obj.address(), obj.size()));
        });
        for (addr, size) in live_ranges {
            if addr > free_start {
                freed += addr - free_start;
                heap.free_range(page, free_start, addr - free_start);
            }
            live += size;
            free_start = addr + size;
        }
        if page.area_end() > free_start {
            freed += page.area_end() - free_start;
            heap.free_range(page, free_start, page.area_end() - free_start);
        }
        debug_assert!(live % TAGGED_SIZE == 0);
        page.set_allocated_bytes(live);
        page.set_flag(flags::SWEEPING_DONE);
        self.freed_total.fetch_add(freed, Ordering::Relaxed);
        freed
    }
}

struct SweepWorker<'a> {
    sweeper: &'a Sweeper,
    heap: &'a Heap,
    task_id: usize,
    worker: Worker<(SpaceId, usize)>,
    injector: &'a Injector<(SpaceId, usize)>,
    stealers: &'a [Stealer<(SpaceId, usize)>],
    terminator: &'a Terminator,
    freed: &'a AtomicUsize,
}

impl<'a> SweepWorker<'a> {
    fn pop(&mut self) -> Option<(SpaceId, usize)> {
        self.worker.pop().or_else(|| self.pop_global()).or_else(|| self.steal())
    }

    fn pop_global(&mut self) -> Option<(SpaceId, usize)> {
        loop {
            match self.injector.steal_batch_and_pop(&self.worker) {
                Steal::Empty => return None,
                Steal::Success(item) => return Some(item),
                Steal::Retry => continue,
            }
        }
    }

    fn steal(&self) -> Option<(SpaceId, usize)> {
        if self.stealers.len() == 1 {
            return None;
        }
        let mut rng = thread_rng();
        let range = Uniform::new(0, self.stealers.len());
        for _ in 0..2 * self.stealers.len() {
            let mut victim = self.task_id;
            while victim == self.task_id {
                victim = range.sample(&mut rng);
            }
            loop {
                match self.stealers[victim].steal_batch_and_pop(&self.worker) {
                    Steal::Empty => break,
                    Steal::Success(item) => return Some(item),
                    Steal::Retry => continue,
                }
            }
        }
        None
    }

    fn run(&mut self) {
        loop {
            let (space, page_addr) = match self.pop() {
                Some(item) => item,
                None => {
                    if self.terminator.try_terminate() {
                        break;
                    }
                    continue;
                }
            };
            let freed =
                self.sweeper
                    .sweep_page(self.heap, space, unsafe { &*(page_addr as *const Page) });
            self.freed.fetch_add(freed, Ordering::Relaxed);
        }
    }
}
