//! Non-blocking single-producer / single-consumer pipe.
//!
//! # Overview
//!
//! `Pipe` moves values from one producer thread to one consumer thread
//! without locks and without blocking either side. Writes are *batched*:
//! nothing a producer writes is visible until it calls
//! [`flush`](PipeProducer::flush), which publishes every completed write in
//! one atomic step. The same atomic doubles as the consumer's
//! sleep-detection channel, so a producer learns from `flush`'s return
//! value whether it must wake the consumer through some out-of-band
//! mechanism (see [`crate::blocking`] for the canonical composition).
//!
//! Storage is a [`ChunkList`]: slot addresses are stable, so the protocol
//! can use them as opaque publication tokens.
//!
//! # Publication protocol
//!
//! Four slot-address cursors; only `commit_end` is shared:
//!
//! ```text
//!   last_flush_end   producer-private   frontier published by the last flush
//!   flush_end        producer-private   frontier the next flush will publish
//!   read_end         consumer-private   frontier observed at the last check
//!   commit_end       shared atomic      slots before it are safe to read;
//!                                       null = consumer went to sleep
//! ```
//!
//! ```text
//!  state of commit_end      producer flush            consumer check_read
//!  ─────────────────────    ───────────────────────   ─────────────────────
//!  == last_flush_end        CAS to new frontier, ok   CAS to null, sleeps
//!  newer frontier           CAS to newer frontier     adopt frontier, read
//!  null (asleep)            store frontier,           stays asleep until
//!                           return false (wake!)      producer publishes
//! ```
//!
//! A successful consumer CAS on `commit_end` is the only point where the
//! two threads synchronize: the producer's release on `commit_end` makes
//! every element write and chunk link before the frontier visible to the
//! consumer's acquire.
//!
//! Chunk recycling cannot forge CAS equality on these tokens. A frontier
//! the consumer still holds in `read_end` lives in the chunk under the
//! consumer's cursor, and that chunk is never returned to the pool until
//! the cursor leaves it; the producer therefore cannot publish a *newer*
//! frontier at the same address. The same pinning argument keeps
//! `flush_end` honest for `unwrite`.
//!
//! # Contract
//!
//! Exactly one producer and one consumer, enforced by the split
//! [`PipeProducer`] / [`PipeConsumer`] handles. Every operation completes
//! in a bounded number of its own steps regardless of what the other side
//! is doing.

use std::cell::Cell;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

use crate::chunk_list::ChunkList;
use crate::pool::PoolStats;

/// Producer-private flush cursors.
struct FlushCursors<T> {
    /// Frontier published by the most recent flush.
    last_flush_end: Cell<*mut T>,
    /// Frontier the next flush will publish (first slot *not* covered).
    flush_end: Cell<*mut T>,
}

/// Consumer-private prefetch cursor.
struct ReadCursor<T> {
    /// The commit frontier observed at the last successful check. Null
    /// after the consumer noticed it had already parked itself.
    read_end: Cell<*mut T>,
}

/// Shared core of the pipe. Use [`Pipe::new`] for the split handles.
pub struct Pipe<T, const N: usize = 128, const S: usize = 1> {
    list: ChunkList<T, N, S>,
    flush: CachePadded<FlushCursors<T>>,
    read: CachePadded<ReadCursor<T>>,
    /// Slots strictly before this address (in list order) are committed.
    /// Null is the consumer-asleep sentinel.
    commit_end: CachePadded<AtomicPtr<T>>,
}

// SAFETY: `flush` is touched only through PipeProducer, `read` only
// through PipeConsumer, and there is exactly one of each; `commit_end` is
// atomic; the list carries the same split-role contract.
unsafe impl<T: Send, const N: usize, const S: usize> Send for Pipe<T, N, S> {}
unsafe impl<T: Send, const N: usize, const S: usize> Sync for Pipe<T, N, S> {}

impl<T, const N: usize, const S: usize> Pipe<T, N, S> {
    /// Creates a pipe and splits it into its two single-role handles.
    pub fn new() -> (PipeProducer<T, N, S>, PipeConsumer<T, N, S>) {
        let list = ChunkList::new();
        // Reserve the first slot so `back` is defined; it stays
        // uninitialized. All four cursors on that address = empty pipe.
        let first = unsafe {
            list.push();
            list.back()
        };
        let pipe = Arc::new(Self {
            list,
            flush: CachePadded::new(FlushCursors {
                last_flush_end: Cell::new(first),
                flush_end: Cell::new(first),
            }),
            read: CachePadded::new(ReadCursor {
                read_end: Cell::new(first),
            }),
            commit_end: CachePadded::new(AtomicPtr::new(first)),
        });
        (
            PipeProducer {
                pipe: Arc::clone(&pipe),
            },
            PipeConsumer { pipe },
        )
    }

    /// Counters of the chunk pool backing this pipe.
    pub fn pool_stats(&self) -> PoolStats {
        self.list.pool_stats()
    }

    // ── producer side (called via PipeProducer only) ─────────────────────

    unsafe fn write(&self, value: T, incomplete: bool) {
        unsafe {
            self.list.back().write(value);
            self.list.push();
        }
        if !incomplete {
            // Everything up to (not including) the newly reserved slot
            // becomes eligible for the next flush.
            self.flush.flush_end.set(unsafe { self.list.back() });
        }
    }

    unsafe fn unwrite(&self) -> Option<T> {
        // Anything at or before flush_end is spoken for; only the tail
        // beyond it can be taken back.
        if self.flush.flush_end.get() == unsafe { self.list.back() } {
            return None;
        }
        unsafe {
            self.list.unpush();
            Some(self.list.back().read())
        }
    }

    unsafe fn flush(&self) -> bool {
        let last = self.flush.last_flush_end.get();
        let goal = self.flush.flush_end.get();
        if last == goal {
            return true;
        }

        // Release publishes the element writes and chunk links behind the
        // new frontier.
        match self
            .commit_end
            .compare_exchange(last, goal, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.flush.last_flush_end.set(goal);
                true
            }
            Err(_) => {
                // Only the consumer writes anything other than a frontier
                // we published, and the only thing it writes is null: it
                // observed emptiness and went to sleep. Publish anyway and
                // tell the caller a wake-up is owed.
                self.commit_end.store(goal, Ordering::Release);
                self.flush.last_flush_end.set(goal);
                false
            }
        }
    }

    // ── consumer side (called via PipeConsumer only) ─────────────────────

    unsafe fn check_read(&self) -> bool {
        let read_end = self.read.read_end.get();
        if unsafe { self.list.front() } != read_end && !read_end.is_null() {
            // Still inside the frontier adopted earlier.
            return true;
        }

        // Caught up. Either mark ourselves asleep (commit_end still equals
        // what we last saw) or adopt the frontier the producer advanced to.
        match self.commit_end.compare_exchange(
            read_end,
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => false,
            Err(observed) => {
                if observed.is_null() {
                    // We already parked ourselves on an earlier call and
                    // nothing was published since.
                    self.read.read_end.set(ptr::null_mut());
                    false
                } else {
                    self.read.read_end.set(observed);
                    true
                }
            }
        }
    }

    unsafe fn read(&self) -> Option<T> {
        unsafe {
            if !self.check_read() {
                return None;
            }
            let value = self.list.front().read();
            self.list.pop();
            Some(value)
        }
    }
}

impl<T, const N: usize, const S: usize> Drop for Pipe<T, N, S> {
    fn drop(&mut self) {
        // Both handles are gone, so both roles are ours. Every slot from
        // the head up to (not including) `back` holds a constructed
        // element: written-but-unflushed and flushed-but-unread alike.
        unsafe {
            while self.list.front() != self.list.back() {
                ptr::drop_in_place(self.list.front());
                self.list.pop();
            }
        }
    }
}

/// Writing half of a [`Pipe`]. One per pipe; `Send` but not clonable.
pub struct PipeProducer<T, const N: usize = 128, const S: usize = 1> {
    pipe: Arc<Pipe<T, N, S>>,
}

/// Reading half of a [`Pipe`]. One per pipe; `Send` but not clonable.
pub struct PipeConsumer<T, const N: usize = 128, const S: usize = 1> {
    pipe: Arc<Pipe<T, N, S>>,
}

impl<T, const N: usize, const S: usize> PipeProducer<T, N, S> {
    /// Writes `value` into the pipe without making it visible.
    ///
    /// With `incomplete = false` the element (and any incomplete elements
    /// written before it) becomes eligible for the next
    /// [`flush`](Self::flush). With `incomplete = true` visibility is
    /// deferred: the element can still be taken back by
    /// [`unwrite`](Self::unwrite), and is published only once a later
    /// complete write and flush cover it.
    pub fn write(&mut self, value: T, incomplete: bool) {
        // SAFETY: &mut self is the producer role.
        unsafe { self.pipe.write(value, incomplete) }
    }

    /// Takes back the most recent write that no flush frontier covers.
    ///
    /// Returns `None` when every written element is already eligible for
    /// flushing (or the pipe is empty); those can no longer be retracted.
    pub fn unwrite(&mut self) -> Option<T> {
        // SAFETY: &mut self is the producer role.
        unsafe { self.pipe.unwrite() }
    }

    /// Publishes all completed writes to the consumer.
    ///
    /// Returns `false` when the consumer had already observed emptiness
    /// and gone to sleep; the data *is* published, but the caller owes the
    /// consumer a wake-up through whatever out-of-band signal the two
    /// sides share. Returns `true` when no wake-up is needed (including
    /// when there was nothing to publish).
    pub fn flush(&mut self) -> bool {
        // SAFETY: &mut self is the producer role.
        unsafe { self.pipe.flush() }
    }

    /// Counters of the chunk pool backing this pipe.
    pub fn pool_stats(&self) -> PoolStats {
        self.pipe.pool_stats()
    }
}

impl<T, const N: usize, const S: usize> PipeConsumer<T, N, S> {
    /// Reports whether a read would succeed right now.
    ///
    /// Returning `false` *is* the sleep signal: the consumer has marked
    /// itself asleep, and the producer's next frontier-advancing
    /// [`flush`](PipeProducer::flush) will return `false` to demand a
    /// wake-up. Calling this again while still asleep keeps returning
    /// `false` until the producer publishes.
    pub fn check_read(&mut self) -> bool {
        // SAFETY: &mut self is the consumer role.
        unsafe { self.pipe.check_read() }
    }

    /// Takes the next visible element, in write order.
    ///
    /// `None` means the pipe is empty *as published*: unflushed writes do
    /// not count. See [`check_read`](Self::check_read) for the sleep
    /// side-effect.
    pub fn read(&mut self) -> Option<T> {
        // SAFETY: &mut self is the consumer role.
        unsafe { self.pipe.read() }
    }

    /// Counters of the chunk pool backing this pipe.
    pub fn pool_stats(&self) -> PoolStats {
        self.pipe.pool_stats()
    }
}
