//! Blocking channel composed from a [`Pipe`] plus a mutex, a condvar and a
//! running flag.
//!
//! The pipe itself never blocks; it only *reports*, through
//! [`flush`](crate::pipe::PipeProducer::flush) returning `false`, that the
//! consumer has gone to sleep. This module closes the loop: the sender
//! turns that report into a condvar notification, and the receiver parks
//! on the condvar whenever the pipe is empty. Dropping either half shuts
//! the channel down; a receiver drains already-published elements before
//! reporting disconnection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::pipe::{Pipe, PipeConsumer, PipeProducer};

/// Error returned by [`Sender::send`] after the receiver is gone; carries
/// the rejected value.
#[derive(Debug, PartialEq, Eq)]
pub struct SendError<T>(pub T);

struct Control {
    running: AtomicBool,
    /// True when the sender owes the receiver a wake-up it hasn't consumed.
    notify: Mutex<bool>,
    cond: Condvar,
}

impl Control {
    fn shut_down(&self) {
        self.running.store(false, Ordering::Release);
        let _unused = self.notify.lock();
        self.cond.notify_one();
    }
}

/// Creates a connected blocking channel over a `Pipe<T, N, S>`.
pub fn channel<T, const N: usize, const S: usize>() -> (Sender<T, N, S>, Receiver<T, N, S>) {
    let (producer, consumer) = Pipe::new();
    let ctl = Arc::new(Control {
        running: AtomicBool::new(true),
        notify: Mutex::new(false),
        cond: Condvar::new(),
    });
    (
        Sender {
            pipe: producer,
            ctl: Arc::clone(&ctl),
        },
        Receiver {
            pipe: consumer,
            ctl,
        },
    )
}

/// Producing half of a blocking channel.
pub struct Sender<T, const N: usize = 128, const S: usize = 1> {
    pipe: PipeProducer<T, N, S>,
    ctl: Arc<Control>,
}

/// Consuming half of a blocking channel.
pub struct Receiver<T, const N: usize = 128, const S: usize = 1> {
    pipe: PipeConsumer<T, N, S>,
    ctl: Arc<Control>,
}

impl<T, const N: usize, const S: usize> Sender<T, N, S> {
    /// Writes and publishes `value`, waking the receiver if it slept.
    pub fn send(&mut self, value: T) -> Result<(), SendError<T>> {
        if !self.ctl.running.load(Ordering::Acquire) {
            return Err(SendError(value));
        }
        self.pipe.write(value, false);
        if !self.pipe.flush() {
            let mut notify = self.ctl.notify.lock();
            *notify = true;
            drop(notify);
            self.ctl.cond.notify_one();
        }
        Ok(())
    }
}

impl<T, const N: usize, const S: usize> Receiver<T, N, S> {
    /// Takes the next element, parking until one is published or the
    /// sender goes away. `None` means disconnected *and* drained.
    pub fn recv(&mut self) -> Option<T> {
        loop {
            if let Some(value) = self.pipe.read() {
                return Some(value);
            }
            // Empty as published; the pipe has marked us asleep, so the
            // sender's next flush will notify. Park until then.
            let mut notify = self.ctl.notify.lock();
            while !*notify && self.ctl.running.load(Ordering::Acquire) {
                self.ctl.cond.wait(&mut notify);
            }
            let was_running = self.ctl.running.load(Ordering::Acquire);
            *notify = false;
            drop(notify);
            if !was_running {
                // Shut down: whatever was flushed before is still owed.
                return self.pipe.read();
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<T> {
        self.pipe.read()
    }
}

impl<T, const N: usize, const S: usize> Drop for Sender<T, N, S> {
    fn drop(&mut self) {
        self.ctl.shut_down();
    }
}

impl<T, const N: usize, const S: usize> Drop for Receiver<T, N, S> {
    fn drop(&mut self) {
        self.ctl.shut_down();
    }
}
