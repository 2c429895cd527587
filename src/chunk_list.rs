//! Unrolled doubly-linked list of fixed-size chunks with stable slot
//! addresses.
//!
//! The list is the storage layer of the pipe: the producer reserves slots
//! at the tail (`push`/`unpush`/`back`), the consumer retires them at the
//! head (`pop`/`front`), and whole chunks are recycled through a
//! [`CachedPool`] as either end crosses a chunk boundary. Slot addresses
//! never move for the slot's lifetime, which is what lets the pipe hand
//! them out as publication tokens.
//!
//! The list itself performs no cross-thread synchronization. It is safe to
//! drive from two threads only under the pipe's protocol: the producer
//! never touches a chunk the consumer still owns and vice versa, and the
//! pipe's shared atomic orders the handoff. The methods are `unsafe` and
//! spell out exactly that contract.

use std::cell::Cell;
use std::mem::MaybeUninit;
use std::ptr::{self, addr_of_mut};

use crossbeam_utils::CachePadded;

use crate::pool::CachedPool;

/// One list node: `N` element slots plus sibling links.
///
/// Chunks are allocated as raw blocks from the pool and always accessed
/// through raw pointers so the producer and consumer never materialize
/// aliasing references to the same node.
struct Chunk<T, const N: usize> {
    slots: [MaybeUninit<T>; N],
    prev: *mut Chunk<T, N>,
    next: *mut Chunk<T, N>,
}

/// Producer-owned cursors: the most recently reserved slot (`back`) and
/// the next slot to reserve (`end`).
struct TailCursor<T, const N: usize> {
    back_chunk: Cell<*mut Chunk<T, N>>,
    back_pos: Cell<usize>,
    end_chunk: Cell<*mut Chunk<T, N>>,
    end_pos: Cell<usize>,
}

/// Consumer-owned cursor: the next slot to read.
struct HeadCursor<T, const N: usize> {
    begin_chunk: Cell<*mut Chunk<T, N>>,
    begin_pos: Cell<usize>,
}

/// Unrolled SPSC list of `N`-slot chunks, recycled through a
/// `CachedPool` of cache size `S`.
pub struct ChunkList<T, const N: usize, const S: usize> {
    tail: CachePadded<TailCursor<T, N>>,
    head: CachePadded<HeadCursor<T, N>>,
    pool: CachedPool<Chunk<T, N>, S>,
}

// SAFETY: the Cell cursor groups are split by role; each is read and
// written by exactly one thread (tail by the producer, head by the
// consumer), which the unsafe method contracts require. Chunk memory is
// handed between roles only through the caller's own synchronization.
unsafe impl<T: Send, const N: usize, const S: usize> Send for ChunkList<T, N, S> {}
unsafe impl<T: Send, const N: usize, const S: usize> Sync for ChunkList<T, N, S> {}

impl<T, const N: usize, const S: usize> ChunkList<T, N, S> {
    /// Creates a list holding one empty chunk.
    ///
    /// `back` is unset until the first [`push`](Self::push); `begin` and
    /// `end` both address the first slot of the initial chunk.
    pub fn new() -> Self {
        const { assert!(N >= 1, "chunk size must be at least 1") };

        let pool = CachedPool::new();
        let first = Self::fresh_chunk(&pool);
        Self {
            tail: CachePadded::new(TailCursor {
                back_chunk: Cell::new(ptr::null_mut()),
                back_pos: Cell::new(0),
                end_chunk: Cell::new(first),
                end_pos: Cell::new(0),
            }),
            head: CachePadded::new(HeadCursor {
                begin_chunk: Cell::new(first),
                begin_pos: Cell::new(0),
            }),
            pool,
        }
    }

    /// Address of the slot at the head of the list.
    ///
    /// # Safety
    ///
    /// Consumer role only. The pointer is valid for reads/writes until the
    /// matching [`pop`](Self::pop); whether the slot currently holds an
    /// initialized `T` is the caller's bookkeeping.
    #[inline]
    pub unsafe fn front(&self) -> *mut T {
        unsafe { Self::slot_ptr(self.head.begin_chunk.get(), self.head.begin_pos.get()) }
    }

    /// Address of the most recently reserved slot at the tail.
    ///
    /// # Safety
    ///
    /// Producer role only. Undefined before the first
    /// [`push`](Self::push).
    #[inline]
    pub unsafe fn back(&self) -> *mut T {
        unsafe { Self::slot_ptr(self.tail.back_chunk.get(), self.tail.back_pos.get()) }
    }

    /// Reserves one slot at the tail: `back` takes over the previous
    /// one-past-the-end slot, and `end` advances, linking a fresh chunk
    /// when it wraps.
    ///
    /// The slot exposed by [`back`](Self::back) afterwards is
    /// uninitialized storage; the caller constructs the element there.
    ///
    /// # Safety
    ///
    /// Producer role only: no concurrent `push`/`unpush`/`back`.
    pub unsafe fn push(&self) {
        let t = &*self.tail;
        t.back_chunk.set(t.end_chunk.get());
        t.back_pos.set(t.end_pos.get());

        let next_pos = t.end_pos.get() + 1;
        if next_pos != N {
            t.end_pos.set(next_pos);
            return;
        }

        // Tail chunk is exhausted; link a recycled or fresh one. The link
        // stores are plain: they become visible to the consumer through
        // the pipe's release on the commit pointer.
        let fresh = Self::fresh_chunk(&self.pool);
        unsafe {
            (*t.end_chunk.get()).next = fresh;
            (*fresh).prev = t.end_chunk.get();
        }
        t.end_chunk.set(fresh);
        t.end_pos.set(0);
    }

    /// Undoes the most recent [`push`](Self::push), retreating both `back`
    /// and `end` by one slot. A trailing chunk emptied by the retreat goes
    /// back to the pool.
    ///
    /// # Safety
    ///
    /// Producer role only, and there must be a reserved slot to take back
    /// whose element the consumer can never have observed.
    pub unsafe fn unpush(&self) {
        let t = &*self.tail;

        if t.back_pos.get() != 0 {
            t.back_pos.set(t.back_pos.get() - 1);
        } else {
            t.back_pos.set(N - 1);
            t.back_chunk.set(unsafe { (*t.back_chunk.get()).prev });
        }

        if t.end_pos.get() != 0 {
            t.end_pos.set(t.end_pos.get() - 1);
        } else {
            t.end_pos.set(N - 1);
            let emptied = t.end_chunk.get();
            let prev = unsafe { (*emptied).prev };
            t.end_chunk.set(prev);
            unsafe {
                (*prev).next = ptr::null_mut();
                self.pool.free(emptied);
            }
        }
    }

    /// Retires the slot at the head. When the head position wraps, the
    /// exhausted chunk is unlinked and returned to the pool.
    ///
    /// # Safety
    ///
    /// Consumer role only, and the head slot must already be vacated (its
    /// element moved out or dropped). When the head chunk is exhausted its
    /// successor must already be linked and published, which holds
    /// whenever the caller only pops slots below the pipe's committed
    /// frontier.
    pub unsafe fn pop(&self) {
        let h = &*self.head;
        let next_pos = h.begin_pos.get() + 1;
        if next_pos != N {
            h.begin_pos.set(next_pos);
            return;
        }

        let exhausted = h.begin_chunk.get();
        unsafe {
            let next = (*exhausted).next;
            (*next).prev = ptr::null_mut();
            h.begin_chunk.set(next);
            h.begin_pos.set(0);
            self.pool.free(exhausted);
        }
    }

    /// The backing pool's counters.
    pub fn pool_stats(&self) -> crate::pool::PoolStats {
        self.pool.stats()
    }

    /// Allocates a chunk with cleared sibling links.
    ///
    /// Aborts through `handle_alloc_error` if the system allocator fails;
    /// reserving a slot is infallible by contract.
    fn fresh_chunk(pool: &CachedPool<Chunk<T, N>, S>) -> *mut Chunk<T, N> {
        let chunk = pool.alloc();
        if chunk.is_null() {
            std::alloc::handle_alloc_error(std::alloc::Layout::new::<Chunk<T, N>>());
        }
        unsafe {
            addr_of_mut!((*chunk).prev).write(ptr::null_mut());
            addr_of_mut!((*chunk).next).write(ptr::null_mut());
        }
        chunk
    }

    #[inline]
    unsafe fn slot_ptr(chunk: *mut Chunk<T, N>, pos: usize) -> *mut T {
        unsafe { addr_of_mut!((*chunk).slots).cast::<T>().add(pos) }
    }
}

impl<T, const N: usize, const S: usize> Drop for ChunkList<T, N, S> {
    fn drop(&mut self) {
        // Release chunk memory only; live elements are the owner's to drop
        // before the list goes away (the pipe walks front..back first).
        let mut chunk = self.head.begin_chunk.get();
        let end = self.tail.end_chunk.get();
        loop {
            let next = unsafe { (*chunk).next };
            let last = chunk == end;
            unsafe { self.pool.free(chunk) };
            if last {
                break;
            }
            chunk = next;
        }
    }
}
