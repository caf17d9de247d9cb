use crossbeam::queue::SegQueue;

const LOCAL_CAPACITY: usize = 64;

/// MPMC pool of work items with per-thread local views. The global side is
/// a lock-free queue; locals batch pushes so workers touch it rarely.
pub struct Worklist<T> {
    global: SegQueue<T>,
}

impl<T> Worklist<T> {
    pub fn new() -> Worklist<T> {
        Worklist {
            global: SegQueue::new(),
        }
    }

    pub fn push(&self, item: T) {
        self.global.push(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.global.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty()
    }

    pub fn len(&self) -> usize {
        self.global.len()
    }

    /// Move every item of `other` into this (empty) pool. This is the
    /// current/next ephemeron rotation at the top of a fixpoint round.
    pub fn swap_from(&self, other: &Worklist<T>) {
        debug_assert!(self.is_empty());
        while let Some(item) = other.pop() {
            self.global.push(item);
        }
    }

    /// Visit every item without consuming the pool.
    pub fn iterate(&self, mut f: impl FnMut(&T)) {
        let mut stash = Vec::with_capacity(self.global.len());
        while let Some(item) = self.global.pop() {
            stash.push(item);
        }
        for item in &stash {
            f(item);
        }
        for item in stash {
            self.global.push(item);
        }
    }
}

impl<T> Default for Worklist<T> {
    fn default() -> Self {
        Worklist::new()
    }
}

/// A worker's buffered view of one worklist. Items stay local until the
/// buffer fills or `publish` runs at a phase barrier. The on-hold stash
/// parks items that must be revisited after the current drain finishes.
pub struct LocalWorklist<'a, T> {
    global: &'a Worklist<T>,
    buffer: Vec<T>,
    on_hold: Vec<T>,
}

impl<'a, T> LocalWorklist<'a, T> {
    pub fn new(global: &'a Worklist<T>) -> LocalWorklist<'a, T> {
        LocalWorklist {
            global,
            buffer: Vec::with_capacity(LOCAL_CAPACITY),
            on_hold: Vec::new(),
        }
    }

    #[inline]
    pub fn push(&mut self, item: T) {
        if self.buffer.len() == LOCAL_CAPACITY {
            for item in self.buffer.drain(..) {
                self.global.push(item);
            }
        }
        self.buffer.push(item);
    }

    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        self.buffer.pop().or_else(|| self.global.pop())
    }

    pub fn push_on_hold(&mut self, item: T) {
        self.on_hold.push(item);
    }

    pub fn pop_on_hold(&mut self) -> Option<T> {
        self.on_hold.pop()
    }

    /// Flush everything local to the global pool. Required before the
    /// owning worker joins a phase barrier.
    pub fn publish(&mut self) {
        for item in self.buffer.drain(..) {
            self.global.push(item);
        }
        for item in self.on_hold.drain(..) {
            self.global.push(item);
        }
    }

    pub fn is_local_empty(&self) -> bool {
        self.buffer.is_empty() && self.on_hold.is_empty()
    }

    pub fn is_local_and_global_empty(&self) -> bool {
        self.is_local_empty() && self.global.is_empty()
    }

    pub fn global(&self) -> &'a Worklist<T> {
        self.global
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_buffer_publishes_on_overflow() {
        let pool = Worklist::new();
        let mut local = LocalWorklist::new(&pool);
        for i in 0..LOCAL_CAPACITY + 1 {
            local.push(i);
        }
        assert_eq!(pool.len(), LOCAL_CAPACITY);
        assert!(!local.is_local_empty());
        local.publish();
        assert_eq!(pool.len(), LOCAL_CAPACITY + 1);
        assert!(local.is_local_empty());
    }

    #[test]
    fn swap_rotates_pools() {
        let current: Worklist<u32> = Worklist::new();
        let next = Worklist::new();
        next.push(1);
        next.push(2);
        current.swap_from(&next);
        assert!(next.is_empty());
        assert_eq!(current.len(), 2);
    }

    #[test]
    fn on_hold_items_come_back() {
        let pool = Worklist::new();
        let mut local = LocalWorklist::new(&pool);
        local.push_on_hold(7usize);
        assert!(local.pop().is_none());
        assert_eq!(local.pop_on_hold(), Some(7));
    }
}
