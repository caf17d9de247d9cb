use std::sync::atomic::{AtomicUsize, Ordering};

use scoped_threadpool::Pool;

/// A parallel phase task. Implementations claim work items through their
/// own atomic counters; the delegate only tells a worker who it is.
pub trait JobTask: Sync {
    fn run(&self, delegate: &JobDelegate);

    /// Upper bound on useful workers given how much work remains.
    fn max_concurrency(&self, worker_count: usize) -> usize;
}

pub struct JobDelegate {
    task_id: usize,
    joining_thread: bool,
}

impl JobDelegate {
    pub fn task_id(&self) -> usize {
        self.task_id
    }

    pub fn is_joining_thread(&self) -> bool {
        self.joining_thread
    }

    /// Cooperative yield point between pages / slots / worklist items.
    pub fn should_yield(&self) -> bool {
        false
    }
}

/// Run `task` across the pool with the main thread joining as worker 0.
/// Returns once every worker has drained; jobs finish by draining, there is
/// no cancellation.
pub fn run_parallel(pool: &mut Pool, task: &dyn JobTask) {
    let helpers = task
        .max_concurrency(pool.thread_count() as usize + 1)
        .saturating_sub(1)
        .min(pool.thread_count() as usize);
    if helpers == 0 {
        task.run(&JobDelegate {
            task_id: 0,
            joining_thread: true,
        });
        return;
    }
    let next_id = AtomicUsize::new(1);
    pool.scoped(|scope| {
        for _ in 0..helpers {
            let next_id = &next_id;
            scope.execute(move || {
                let delegate = JobDelegate {
                    task_id: next_id.fetch_add(1, Ordering::Relaxed),
                    joining_thread: false,
                };
                task.run(&delegate);
            });
        }
        // The main thread joins the job as an additional worker.
        task.run(&JobDelegate {
            task_id: 0,
            joining_thread: true,
        });
    });
}

/// Atomic claim counter over a shared item list; each item is processed
/// exactly once no matter how workers interleave.
pub struct IndexGenerator {
    next: AtomicUsize,
    limit: usize,
}

impl IndexGenerator {
    pub fn new(limit: usize) -> IndexGenerator {
        IndexGenerator {
            next: AtomicUsize::new(0),
            limit,
        }
    }

    pub fn next(&self) -> Option<usize> {
        let claimed = self.next.fetch_add(1, Ordering::Relaxed);
        if claimed < self.limit {
            Some(claimed)
        } else {
            None
        }
    }
}

/// Distributed termination for workers that drain shared queues: a worker
/// that finds no work votes to stop; a vote that does not reach zero means
/// someone else may still publish items, so the worker re-registers and
/// retries.
pub struct Terminator {
    const_nworkers: usize,
    nworkers: AtomicUsize,
}

impl Terminator {
    pub fn new(number_workers: usize) -> Terminator {
        Terminator {
            const_nworkers: number_workers,
            nworkers: AtomicUsize::new(number_workers),
        }
    }

    pub fn try_terminate(&self) -> bool {
        if self.const_nworkers == 1 {
            return true;
        }

        if self.decrease_workers() {
            return true;
        }

        std::thread::sleep(std::time::Duration::from_micros(1));
        self.zero_or_increase_workers()
    }

    fn decrease_workers(&self) -> bool {
        self.nworkers.fetch_sub(1, Ordering::Relaxed) == 1
    }

    fn zero_or_increase_workers(&self) -> bool {
        let mut nworkers = self.nworkers.load(Ordering::Relaxed);
        loop {
            if nworkers == 0 {
                return true;
            }
            match self.nworkers.compare_exchange(
                nworkers,
                nworkers + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                // Successfully re-registered: there is still work left.
                Ok(_) => return false,
                Err(prev) => nworkers = prev,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingTask {
        generator: IndexGenerator,
        processed: AtomicUsize,
    }

    impl JobTask for CountingTask {
        fn run(&self, _delegate: &JobDelegate) {
            while let Some(_index) = self.generator.next() {
                self.processed.fetch_add(1, Ordering::Relaxed);
            }
        }

        fn max_concurrency(&self, worker_count: usize) -> usize {
            worker_count.min(4)
        }
    }

    #[test]
    fn every_item_claimed_once() {
        let mut pool = Pool::new(3);
        let task = CountingTask {
            generator: IndexGenerator::new(1000),
            processed: AtomicUsize::new(0),
        };
        run_parallel(&mut pool, &task);
        assert_eq!(task.processed.load(Ordering::Relaxed), 1000);
    }
}
