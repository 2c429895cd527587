//! Bounded lock-free cache of reusable raw memory blocks.
//!
//! `CachedPool<T, S>` keeps up to `S` freed blocks (each the size and
//! alignment of `T`) in a ring of pointer slots and hands them back on the
//! next allocation, falling through to the system allocator when the cache
//! is empty (on [`alloc`](CachedPool::alloc)) or full
//! (on [`free`](CachedPool::free)). The pool traffics in *uninitialized*
//! memory only: it never constructs or drops a `T`, that is the caller's
//! business.
//!
//! # Ring indexing
//!
//! `head` and `tail` index a virtual space of `2 * S` and wrap there; the
//! physical slot for a virtual index `i` is `i` when `i < S`, else `i - S`.
//! Doubling the wrap modulus distinguishes empty (`head == tail`) from full
//! (`head + S == tail` or `tail + S == head`) without a separate counter.
//!
//! # Contract
//!
//! The slot reservation (a CAS on `head` or `tail`) is decoupled from the
//! slot pointer access, so the pool is linearizable only under the usage it
//! was built for: at most one thread allocating and one thread releasing at
//! a time (the chunk list's producer and consumer roles). Slot accesses are
//! atomic *exchanges* (the `S = 1` form applied per slot), which keeps the
//! reservation/access gap harmless: an allocation that races a release can
//! swap out a null (a missed reuse, served as a cache miss), and a release
//! that lands in a slot orphaned by such a race displaces the stale block
//! and hands it to the system deallocator instead of double-issuing it.

use std::alloc::{Layout, alloc, dealloc};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Snapshot of a pool's cache-effectiveness counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Allocations served from the cache.
    pub hits: u64,
    /// Allocations that fell through to the system allocator.
    pub misses: u64,
    /// Frees that fell through to the system deallocator (cache full).
    pub spills: u64,
}

/// Lock-free bounded cache of raw blocks for `T`.
///
/// `S = 0` degenerates to a pass-through over the system allocator and
/// `S = 1` to a single atomically-exchanged slot; both branches are folded
/// at compile time.
pub struct CachedPool<T, const S: usize> {
    slots: [AtomicPtr<T>; S],
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    hits: AtomicU64,
    misses: AtomicU64,
    spills: AtomicU64,
}

// SAFETY: the pool stores raw *uninitialized* blocks and never reads or
// writes a T through them, so it is safe to share regardless of T. All
// shared state is atomic.
unsafe impl<T, const S: usize> Send for CachedPool<T, S> {}
unsafe impl<T, const S: usize> Sync for CachedPool<T, S> {}

impl<T, const S: usize> CachedPool<T, S> {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            spills: AtomicU64::new(0),
        }
    }

    /// Takes a block from the cache, or from the system allocator on a
    /// cache miss.
    ///
    /// Returns null only if the system allocator itself failed. The block
    /// is uninitialized either way; recycled blocks still hold the bytes of
    /// whatever previously lived there.
    pub fn alloc(&self) -> *mut T {
        if S == 0 {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Self::alloc_raw();
        }

        if S == 1 {
            let cached = self.slots[0].swap(ptr::null_mut(), Ordering::AcqRel);
            return if cached.is_null() {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Self::alloc_raw()
            } else {
                self.hits.fetch_add(1, Ordering::Relaxed);
                cached
            };
        }

        let mut cached = ptr::null_mut();
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // Empty cache: nothing to take.
            if head == self.tail.load(Ordering::Acquire) {
                break;
            }

            let next = (head + 1) % (2 * S);
            match self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // Take the reserved slot's pointer by exchange. A null
                    // here means a release reserved this slot but its swap
                    // has not landed yet; treat it as a miss.
                    let phys = if head < S { head } else { head - S };
                    cached = self.slots[phys].swap(ptr::null_mut(), Ordering::AcqRel);
                    break;
                }
                Err(observed) => head = observed,
            }
        }

        if cached.is_null() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            Self::alloc_raw()
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
            cached
        }
    }

    /// Returns a block to the cache, or to the system deallocator when the
    /// cache is full. `free(null)` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must have been produced by [`alloc`](Self::alloc) on a pool of
    /// the same `T` (any cache size) and not freed since.
    pub unsafe fn free(&self, ptr: *mut T) {
        if ptr.is_null() {
            return;
        }

        if S == 0 {
            self.spills.fetch_add(1, Ordering::Relaxed);
            unsafe { Self::dealloc_raw(ptr) };
            return;
        }

        if S == 1 {
            let evicted = self.slots[0].swap(ptr, Ordering::AcqRel);
            if !evicted.is_null() {
                self.spills.fetch_add(1, Ordering::Relaxed);
                unsafe { Self::dealloc_raw(evicted) };
            }
            return;
        }

        let mut tail = self.tail.load(Ordering::Acquire);
        loop {
            // Full cache: both watermarks S apart in the virtual space.
            let head = self.head.load(Ordering::Acquire);
            if head + S == tail || tail + S == head {
                self.spills.fetch_add(1, Ordering::Relaxed);
                unsafe { Self::dealloc_raw(ptr) };
                return;
            }

            let next = (tail + 1) % (2 * S);
            match self
                .tail
                .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // Park the block in the pre-CAS slot. Anything already
                    // there was orphaned by an allocation racing a release;
                    // displace it to the system deallocator rather than
                    // letting two owners see the same block.
                    let phys = if tail < S { tail } else { tail - S };
                    let orphan = self.slots[phys].swap(ptr, Ordering::AcqRel);
                    if !orphan.is_null() {
                        self.spills.fetch_add(1, Ordering::Relaxed);
                        unsafe { Self::dealloc_raw(orphan) };
                    }
                    return;
                }
                Err(observed) => tail = observed,
            }
        }
    }

    /// Snapshot of the hit/miss/spill counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            spills: self.spills.load(Ordering::Relaxed),
        }
    }

    fn alloc_raw() -> *mut T {
        let layout = Layout::new::<T>();
        if layout.size() == 0 {
            return NonNull::dangling().as_ptr();
        }
        unsafe { alloc(layout) as *mut T }
    }

    unsafe fn dealloc_raw(ptr: *mut T) {
        let layout = Layout::new::<T>();
        if layout.size() != 0 {
            unsafe { dealloc(ptr as *mut u8, layout) };
        }
    }
}

impl<T, const S: usize> Default for CachedPool<T, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const S: usize> Drop for CachedPool<T, S> {
    fn drop(&mut self) {
        // Sole owner at this point; drain whatever is still cached.
        for slot in &mut self.slots {
            let ptr = *slot.get_mut();
            if !ptr.is_null() {
                unsafe { Self::dealloc_raw(ptr) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_when_uncached() {
        let pool: CachedPool<u64, 0> = CachedPool::new();
        let a = pool.alloc();
        assert!(!a.is_null());
        unsafe { pool.free(a) };
        assert_eq!(
            pool.stats(),
            PoolStats {
                hits: 0,
                misses: 1,
                spills: 1
            }
        );
    }

    #[test]
    fn single_slot_recycles() {
        let pool: CachedPool<u64, 1> = CachedPool::new();
        let a = pool.alloc();
        unsafe { pool.free(a) };
        let b = pool.alloc();
        assert_eq!(a, b, "single-slot cache must hand the block back");
        assert_eq!(pool.stats().hits, 1);
        unsafe { pool.free(b) };
    }

    #[test]
    fn single_slot_evicts_when_occupied() {
        let pool: CachedPool<u64, 1> = CachedPool::new();
        let a = pool.alloc();
        let b = pool.alloc();
        unsafe { pool.free(a) };
        unsafe { pool.free(b) }; // slot holds a, so a is evicted
        assert_eq!(pool.stats().spills, 1);
        let c = pool.alloc();
        assert_eq!(c, b);
        unsafe { pool.free(c) };
    }

    #[test]
    fn ring_recycles_up_to_capacity() {
        const S: usize = 4;
        let pool: CachedPool<u64, S> = CachedPool::new();

        let blocks: Vec<*mut u64> = (0..S).map(|_| pool.alloc()).collect();
        assert_eq!(pool.stats().misses, S as u64);
        for &b in &blocks {
            unsafe { pool.free(b) };
        }
        assert_eq!(pool.stats().spills, 0);

        // All S come back out of the cache, in the order they went in.
        for &expected in &blocks {
            assert_eq!(pool.alloc(), expected);
        }
        assert_eq!(pool.stats().hits, S as u64);

        for &b in &blocks {
            unsafe { pool.free(b) };
        }
    }

    #[test]
    fn ring_spills_past_capacity() {
        const S: usize = 2;
        let pool: CachedPool<u64, S> = CachedPool::new();
        let blocks: Vec<*mut u64> = (0..S + 1).map(|_| pool.alloc()).collect();
        for &b in &blocks {
            unsafe { pool.free(b) };
        }
        assert_eq!(pool.stats().spills, 1, "third free must fall through");
    }

    #[test]
    fn ring_wraps_virtual_space() {
        const S: usize = 3;
        let pool: CachedPool<u64, S> = CachedPool::new();
        // Cycle enough times to drive head/tail around the 2*S space twice.
        let mut last = ptr::null_mut();
        for _ in 0..(4 * S) {
            let b = pool.alloc();
            assert!(!b.is_null());
            unsafe { pool.free(b) };
            last = b;
        }
        let again = pool.alloc();
        assert_eq!(again, last);
        unsafe { pool.free(again) };
    }

    #[test]
    fn drop_drains_cache() {
        // Nothing to assert directly; run under miri/asan to catch leaks.
        let pool: CachedPool<[u8; 256], 8> = CachedPool::new();
        let blocks: Vec<_> = (0..8).map(|_| pool.alloc()).collect();
        for b in blocks {
            unsafe { pool.free(b) };
        }
    }

    #[test]
    fn concurrent_one_allocator_one_releaser() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicBool;

        const S: usize = 8;
        let pool = Arc::new(CachedPool::<u64, S>::new());
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = std::sync::mpsc::channel::<usize>();

        let alloc_side = {
            let pool = Arc::clone(&pool);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut n = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let b = pool.alloc();
                    assert!(!b.is_null());
                    tx.send(b as usize).unwrap();
                    n += 1;
                }
                n
            })
        };

        let free_side = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                for addr in rx {
                    unsafe { pool.free(addr as *mut u64) };
                }
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        stop.store(true, Ordering::Relaxed);
        let produced = alloc_side.join().unwrap();
        free_side.join().unwrap();
        assert!(produced > 0);

        let s = pool.stats();
        assert_eq!(s.hits + s.misses, produced);
    }
}
