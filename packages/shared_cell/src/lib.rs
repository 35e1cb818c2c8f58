//! Shared memory cell with futex-style wait and notify.
//!
//! A [`SharedCell`] is a fixed array of 32-bit slots visible to every thread holding a handle to
//! it. Threads block on a slot with [`CellReader::wait`] (or [`CellReader::wait_async`] from a
//! task) and are released by [`SharedCell::notify`].
//!
//! # Single writer
//!
//! Only the owner holding the [`SharedCell`] can write to or notify the slots. Workers receive a
//! [`CellReader`], which can load and wait but never store. The atomics themselves would accept
//! concurrent writers; the split handle types are what keep the cell single-writer.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use readiness_shared_cell::{Isolation, SharedCell, WaitResult};
//!
//! let cell = SharedCell::allocate(Isolation::CrossThread, 1).unwrap();
//! let reader = cell.reader();
//!
//! let worker = std::thread::spawn(move || reader.wait(0, 0, Some(Duration::from_secs(5))));
//!
//! while cell.waiter_count(0).unwrap() == 0 {
//!     std::thread::yield_now();
//! }
//! assert_eq!(cell.notify(0, None).unwrap(), 1);
//! assert_eq!(worker.join().unwrap().unwrap(), WaitResult::Woken);
//! ```

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

mod queue;

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicI32, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::queue::{Parker, WaitQueues, WaiterKind, lock};

pub use queue::WaitResult;

/// Upper bound on the number of slots a single cell may hold.
pub const MAX_SLOTS: usize = 1024;

/// Whether the execution context allows memory to be shared across threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Isolation {
    /// Threads may share memory.
    #[default]
    CrossThread,
    /// The context forbids shared memory. Allocation always fails.
    Unisolated,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("Execution context is not cross-thread isolated, shared memory is unavailable")]
    NotIsolated,
    #[error("Shared cell needs at least one slot")]
    NoSlots,
    #[error("Shared cell cannot hold {requested} slots (max {max})")]
    TooManySlots { requested: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Slot index {index} is out of bounds for a cell with {len} slots")]
pub struct SlotOutOfBounds {
    pub index: usize,
    pub len: usize,
}

struct Inner {
    slots: Box<[AtomicI32]>,
    waiters: Mutex<WaitQueues>,
}

impl Inner {
    fn slot(&self, index: usize) -> Result<&AtomicI32, SlotOutOfBounds> {
        self.slots.get(index).ok_or(SlotOutOfBounds {
            index,
            len: self.slots.len(),
        })
    }

    fn load(&self, index: usize) -> Result<i32, SlotOutOfBounds> {
        Ok(self.slot(index)?.load(Ordering::SeqCst))
    }

    fn wait(
        &self,
        index: usize,
        expected: i32,
        timeout: Option<Duration>,
    ) -> Result<WaitResult, SlotOutOfBounds> {
        let slot = self.slot(index)?;
        let parker = Arc::new(Parker::default());

        let id = {
            let mut waiters = lock(&self.waiters);
            if slot.load(Ordering::SeqCst) != expected {
                return Ok(WaitResult::NotEqual);
            }
            waiters.push(index, WaiterKind::Thread(parker.clone()))
        };

        log::trace!("wait: waiter {id} parked on slot {index}");

        if parker.park(timeout) {
            return Ok(WaitResult::Woken);
        }

        // A notify holding the queue lock may have dequeued us right as the timeout expired.
        let removed = lock(&self.waiters).remove(index, id);

        Ok(if removed {
            WaitResult::TimedOut
        } else {
            WaitResult::Woken
        })
    }

    async fn wait_async(
        &self,
        index: usize,
        expected: i32,
        timeout: Option<Duration>,
    ) -> Result<WaitResult, SlotOutOfBounds> {
        let slot = self.slot(index)?;
        let (tx, mut rx) = oneshot::channel();

        let id = {
            let mut waiters = lock(&self.waiters);
            if slot.load(Ordering::SeqCst) != expected {
                return Ok(WaitResult::NotEqual);
            }
            waiters.push(index, WaiterKind::Task(tx))
        };

        log::trace!("wait_async: waiter {id} queued on slot {index}");

        let mut guard = DequeueOnDrop {
            inner: self,
            index,
            id,
            armed: true,
        };

        let received = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, &mut rx).await.ok(),
            None => Some((&mut rx).await),
        };

        Ok(match received {
            // The sender is only ever dropped after it has been dequeued by a notify.
            Some(_) => {
                guard.armed = false;
                WaitResult::Woken
            }
            None => {
                if guard.dequeue() {
                    WaitResult::TimedOut
                } else {
                    WaitResult::Woken
                }
            }
        })
    }
}

/// Removes a queued async waiter if its future is dropped before it resolves.
struct DequeueOnDrop<'a> {
    inner: &'a Inner,
    index: usize,
    id: u64,
    armed: bool,
}

impl DequeueOnDrop<'_> {
    fn dequeue(&mut self) -> bool {
        self.armed = false;
        lock(&self.inner.waiters).remove(self.index, self.id)
    }
}

impl Drop for DequeueOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.dequeue();
        }
    }
}

/// Owner handle to a block of shared 32-bit slots.
///
/// Dropping the owner does not free the memory while readers are still alive.
pub struct SharedCell {
    inner: Arc<Inner>,
}

impl SharedCell {
    /// Allocates a zero-initialized cell with `slots` slots.
    ///
    /// # Errors
    ///
    /// * If `isolation` does not allow shared memory
    /// * If `slots` is zero or larger than [`MAX_SLOTS`]
    pub fn allocate(isolation: Isolation, slots: usize) -> Result<Self, AllocationError> {
        if isolation == Isolation::Unisolated {
            return Err(AllocationError::NotIsolated);
        }
        if slots == 0 {
            return Err(AllocationError::NoSlots);
        }
        if slots > MAX_SLOTS {
            return Err(AllocationError::TooManySlots {
                requested: slots,
                max: MAX_SLOTS,
            });
        }

        log::debug!("allocate: shared cell with {slots} slot(s)");

        Ok(Self {
            inner: Arc::new(Inner {
                slots: (0..slots).map(|_| AtomicI32::new(0)).collect(),
                waiters: Mutex::new(WaitQueues::new(slots)),
            }),
        })
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.inner.slots.len()
    }

    /// Creates a read-only handle addressing the same memory.
    #[must_use]
    pub fn reader(&self) -> CellReader {
        CellReader {
            inner: self.inner.clone(),
        }
    }

    /// # Errors
    ///
    /// * If `index` is out of bounds
    pub fn load(&self, index: usize) -> Result<i32, SlotOutOfBounds> {
        self.inner.load(index)
    }

    /// # Errors
    ///
    /// * If `index` is out of bounds
    pub fn store(&self, index: usize, value: i32) -> Result<(), SlotOutOfBounds> {
        self.inner.slot(index)?.store(value, Ordering::SeqCst);
        Ok(())
    }

    /// Wakes up to `count` threads or tasks waiting on `index`, or all of them for `None`.
    ///
    /// Returns how many waiters were woken. A notify with nobody waiting is not remembered: a
    /// waiter that arrives afterwards blocks until the next notify or its own timeout.
    ///
    /// Every write made before this call is visible to the waiters it wakes.
    ///
    /// # Errors
    ///
    /// * If `index` is out of bounds
    pub fn notify(&self, index: usize, count: Option<usize>) -> Result<usize, SlotOutOfBounds> {
        self.inner.slot(index)?;
        let woken = lock(&self.inner.waiters).wake(index, count);
        log::trace!("notify: slot {index} count={count:?} woken={woken}");
        Ok(woken)
    }

    /// Number of waiters currently queued on `index`.
    ///
    /// # Errors
    ///
    /// * If `index` is out of bounds
    pub fn waiter_count(&self, index: usize) -> Result<usize, SlotOutOfBounds> {
        self.inner.slot(index)?;
        Ok(lock(&self.inner.waiters).len(index))
    }
}

impl fmt::Debug for SharedCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCell")
            .field("slots", &self.inner.slots)
            .finish_non_exhaustive()
    }
}

/// Worker handle to a [`SharedCell`]: it can read and wait, never write.
#[derive(Clone)]
pub struct CellReader {
    inner: Arc<Inner>,
}

impl CellReader {
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.inner.slots.len()
    }

    /// # Errors
    ///
    /// * If `index` is out of bounds
    pub fn load(&self, index: usize) -> Result<i32, SlotOutOfBounds> {
        self.inner.load(index)
    }

    /// Blocks the calling thread while slot `index` holds `expected`.
    ///
    /// Returns [`WaitResult::NotEqual`] straight away if the slot already holds something else,
    /// [`WaitResult::Woken`] once a notify releases this waiter, and [`WaitResult::TimedOut`] if
    /// `timeout` elapses first. `None` waits forever.
    ///
    /// Do not call this from inside an async task; use [`Self::wait_async`] there.
    ///
    /// # Errors
    ///
    /// * If `index` is out of bounds
    pub fn wait(
        &self,
        index: usize,
        expected: i32,
        timeout: Option<Duration>,
    ) -> Result<WaitResult, SlotOutOfBounds> {
        self.inner.wait(index, expected, timeout)
    }

    /// Async counterpart of [`Self::wait`]. Suspends the task instead of the thread.
    ///
    /// # Cancel safety
    ///
    /// Dropping the returned future dequeues the waiter, so later notifies skip it.
    ///
    /// # Errors
    ///
    /// * If `index` is out of bounds
    pub async fn wait_async(
        &self,
        index: usize,
        expected: i32,
        timeout: Option<Duration>,
    ) -> Result<WaitResult, SlotOutOfBounds> {
        self.inner.wait_async(index, expected, timeout).await
    }
}

impl fmt::Debug for CellReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellReader")
            .field("slots", &self.inner.slots)
            .finish_non_exhaustive()
    }
}
