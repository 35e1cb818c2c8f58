//! Per-slot FIFO wait queues.
//!
//! Blocking waiters park on their own condition variable; async waiters hold the receiving half
//! of a oneshot channel. Both kinds share one queue per slot so `notify` wakes them in arrival
//! order regardless of how they wait.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::sync::oneshot;

/// Outcome of waiting on a slot.
///
/// The three cases are deliberately distinct: a caller that only sees "returned" cannot tell a
/// notification apart from an expired timeout or a value that had already moved on.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitResult {
    /// A `notify` on the slot released this waiter.
    Woken,
    /// The timeout elapsed before any notification reached this waiter.
    TimedOut,
    /// The slot did not hold the expected value, so the caller never suspended.
    NotEqual,
}

impl WaitResult {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Woken => "woken",
            Self::TimedOut => "timed-out",
            Self::NotEqual => "not-equal",
        }
    }

    #[must_use]
    pub const fn is_woken(self) -> bool {
        matches!(self, Self::Woken)
    }
}

impl fmt::Display for WaitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub(crate) struct Parker {
    notified: Mutex<bool>,
    condvar: Condvar,
}

impl Parker {
    fn unpark(&self) {
        *lock(&self.notified) = true;
        self.condvar.notify_one();
    }

    /// Blocks until unparked or until `timeout` elapses. Returns whether it was unparked.
    pub(crate) fn park(&self, timeout: Option<Duration>) -> bool {
        let guard = lock(&self.notified);

        let guard = match timeout {
            Some(timeout) => {
                self.condvar
                    .wait_timeout_while(guard, timeout, |notified| !*notified)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .condvar
                .wait_while(guard, |notified| !*notified)
                .unwrap_or_else(PoisonError::into_inner),
        };

        *guard
    }
}

#[derive(Debug)]
pub(crate) enum WaiterKind {
    Thread(Arc<Parker>),
    Task(oneshot::Sender<()>),
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    kind: WaiterKind,
}

#[derive(Debug)]
pub(crate) struct WaitQueues {
    queues: Vec<VecDeque<Waiter>>,
    next_id: u64,
}

impl WaitQueues {
    pub(crate) fn new(slots: usize) -> Self {
        Self {
            queues: (0..slots).map(|_| VecDeque::new()).collect(),
            next_id: 0,
        }
    }

    pub(crate) fn push(&mut self, index: usize, kind: WaiterKind) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.queues[index].push_back(Waiter { id, kind });
        id
    }

    /// Removes a waiter that gave up. Returns `false` if a notify already dequeued it.
    pub(crate) fn remove(&mut self, index: usize, id: u64) -> bool {
        let queue = &mut self.queues[index];
        let before = queue.len();
        queue.retain(|waiter| waiter.id != id);
        queue.len() != before
    }

    pub(crate) fn len(&self, index: usize) -> usize {
        self.queues[index].len()
    }

    /// Wakes up to `count` waiters on `index` (all of them when `None`), oldest first.
    pub(crate) fn wake(&mut self, index: usize, count: Option<usize>) -> usize {
        let queue = &mut self.queues[index];
        let mut woken = 0;

        while count.is_none_or(|count| woken < count) {
            let Some(waiter) = queue.pop_front() else {
                break;
            };

            match waiter.kind {
                WaiterKind::Thread(parker) => {
                    parker.unpark();
                    woken += 1;
                }
                WaiterKind::Task(tx) => {
                    // A closed receiver means the waiting future was dropped mid-flight.
                    if tx.send(()).is_ok() {
                        woken += 1;
                    } else {
                        log::trace!("wake: skipping abandoned waiter {}", waiter.id);
                    }
                }
            }
        }

        woken
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn wake_respects_count_and_fifo_order() {
        let mut queues = WaitQueues::new(1);
        let first = Arc::new(Parker::default());
        let second = Arc::new(Parker::default());

        queues.push(0, WaiterKind::Thread(first.clone()));
        queues.push(0, WaiterKind::Thread(second.clone()));

        assert_eq!(queues.wake(0, Some(1)), 1);
        assert!(*lock(&first.notified));
        assert!(!*lock(&second.notified));
        assert_eq!(queues.len(0), 1);
    }

    #[test_log::test]
    fn wake_skips_dropped_task_waiters() {
        let mut queues = WaitQueues::new(1);
        let (tx, rx) = oneshot::channel();
        drop(rx);
        queues.push(0, WaiterKind::Task(tx));

        let parker = Arc::new(Parker::default());
        queues.push(0, WaiterKind::Thread(parker.clone()));

        assert_eq!(queues.wake(0, Some(1)), 1);
        assert!(*lock(&parker.notified));
        assert_eq!(queues.len(0), 0);
    }

    #[test_log::test]
    fn remove_reports_whether_waiter_was_still_queued() {
        let mut queues = WaitQueues::new(2);
        let id = queues.push(1, WaiterKind::Thread(Arc::new(Parker::default())));

        assert!(queues.remove(1, id));
        assert!(!queues.remove(1, id));
    }

    #[test_log::test]
    fn park_times_out_without_unpark() {
        let parker = Parker::default();
        assert!(!parker.park(Some(Duration::from_millis(5))));
    }

    #[test_log::test]
    fn wait_result_strings() {
        assert_eq!(WaitResult::Woken.to_string(), "woken");
        assert_eq!(WaitResult::TimedOut.to_string(), "timed-out");
        assert_eq!(WaitResult::NotEqual.to_string(), "not-equal");
    }
}
