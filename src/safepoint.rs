use std::cell::Cell;
use std::sync::atomic::AtomicU32;

use atomic::Ordering;
use crossbeam_utils::Backoff;
use parking_lot::{lock_api::RawMutex as _, RawMutex as Lock};

/// Stop-the-world coordination. The collector runs its atomic phases only
/// inside a safepoint; mutator threads park in `wait_gc` until it ends.
pub struct GlobalSafepoint {
    safepoint_lock: Lock,
    safepoint_enable_cnt: Cell<u8>,
    gc_running: AtomicU32,
    n_mutators: AtomicU32,
}

unsafe impl Sync for GlobalSafepoint {}

impl GlobalSafepoint {
    pub fn new() -> Self {
        Self {
            safepoint_enable_cnt: Cell::new(0),
            safepoint_lock: Lock::INIT,
            gc_running: AtomicU32::new(0),
            n_mutators: AtomicU32::new(1),
        }
    }

    pub fn register_mutator(&self) {
        self.n_mutators.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unregister_mutator(&self) {
        self.n_mutators.fetch_sub(1, Ordering::Relaxed);
    }

    /// Try to become the collecting thread. Returns false when another
    /// thread won the race; the caller then waits the cycle out instead.
    pub fn start(&self) -> bool {
        if self.n_mutators.load(Ordering::Relaxed) == 1 {
            self.gc_running.store(1, Ordering::Relaxed);
            return true;
        }
        self.safepoint_lock.lock();
        if self
            .gc_running
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            unsafe {
                self.safepoint_lock.unlock();
            }
            self.wait_gc();
            return false;
        }
        self.safepoint_enable_cnt
            .set(self.safepoint_enable_cnt.get() + 1);
        unsafe {
            self.safepoint_lock.unlock();
        }
        true
    }

    pub fn end(&self) {
        if self.n_mutators.load(Ordering::Relaxed) == 1 {
            self.gc_running.store(0, Ordering::Relaxed);
            return;
        }
        self.safepoint_lock.lock();
        self.safepoint_enable_cnt
            .set(self.safepoint_enable_cnt.get() - 1);
        self.gc_running.store(0, Ordering::Release);
        unsafe {
            self.safepoint_lock.unlock();
        }
    }

    pub fn wait_gc(&self) {
        let backoff = Backoff::new();
        while self.gc_running.load(Ordering::Acquire) != 0 {
            backoff.snooze();
        }
    }
}

/// RAII pause: entering stops the world, dropping resumes it.
pub struct SafepointScope<'a> {
    safepoint: &'a GlobalSafepoint,
}

impl<'a> SafepointScope<'a> {
    pub fn new(safepoint: &'a GlobalSafepoint) -> Option<SafepointScope<'a>> {
        if safepoint.start() {
            Some(SafepointScope { safepoint })
        } else {
            None
        }
    }
}

impl<'a> Drop for SafepointScope<'a> {
    fn drop(&mut self) {
        self.safepoint.end();
    }
}
