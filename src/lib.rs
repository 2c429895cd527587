//! Lock-free primitives for low-latency message passing between two
//! threads of one process.
//!
//! The centerpiece is [`Pipe`], a single-producer / single-consumer
//! non-blocking queue with *batched publication*: the producer writes at
//! its own pace and makes whole batches visible with one atomic operation,
//! which simultaneously tells it whether the consumer has given up polling
//! and needs an out-of-band wake-up. The layers underneath are usable on
//! their own:
//!
//! - [`CachedPool`]: a bounded lock-free cache of reusable raw memory
//!   blocks, falling through to the system allocator on miss or overflow.
//! - [`ChunkList`]: an unrolled linked list of fixed-size chunks with
//!   stable slot addresses, recycling whole chunks through a `CachedPool`.
//! - [`ObjectPool`]: a thin construct/destruct wrapper over `CachedPool`.
//! - [`blocking`]: the recommended mutex + condvar composition for callers
//!   who want blocking send/recv semantics on top of the pipe.
//!
//! # Choosing parameters
//!
//! `Pipe<T, N, S>`: `N` is the chunk size (slots per allocation, default
//! 128), `S` the number of retired chunks kept for reuse (default 1). A
//! steady-state pipe whose backlog stays under `N` elements allocates
//! nothing after warm-up: the producer and consumer pass the same chunks
//! back and forth through the pool.
//!
//! # Example
//!
//! ```
//! use chunkpipe::Pipe;
//!
//! let (mut tx, mut rx) = Pipe::<u64>::new();
//!
//! tx.write(1, false);
//! tx.write(2, false);
//! assert_eq!(rx.read(), None); // not yet published
//!
//! let awake = tx.flush();      // one atomic op publishes both
//! assert_eq!(rx.read(), Some(1));
//! assert_eq!(rx.read(), Some(2));
//! # let _ = awake;
//! ```
//!
//! `flush` returning `false` means the consumer observed emptiness and
//! went to sleep; the producer must wake it through whatever signal the
//! two sides share. [`blocking::channel`] wires this up with a condvar.

pub mod blocking;
pub mod chunk_list;
pub mod object_pool;
pub mod pipe;
pub mod pool;

pub use chunk_list::ChunkList;
pub use object_pool::ObjectPool;
pub use pipe::{Pipe, PipeConsumer, PipeProducer};
pub use pool::{CachedPool, PoolStats};
