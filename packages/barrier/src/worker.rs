//! Worker side of the barrier.
//!
//! A [`WorkerTask`] runs its [`Job`], reports [`BarrierMessage::Ready`] to the owner and then,
//! if configured, waits on the shared cell until the owner releases it:
//!
//! ```text
//! Spawned -> Running -> AwaitingNotification -> Done
//!                    \________________________/
//!                      (when not waiting)
//! ```

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use flume::Sender;
use readiness_shared_cell::{CellReader, WaitResult};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{Error, message::BarrierMessage, service::Command};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WorkerIdentity(usize);

impl WorkerIdentity {
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerState {
    Spawned = 0,
    Running = 1,
    AwaitingNotification = 2,
    Done = 3,
}

impl WorkerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Spawned,
            1 => Self::Running,
            2 => Self::AwaitingNotification,
            _ => Self::Done,
        }
    }
}

/// Worker state readable from the owner's side while the worker runs.
#[derive(Debug, Clone)]
pub(crate) struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(WorkerState::Spawned as u8)))
    }

    pub(crate) fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// The unit of work a worker performs before reporting ready.
///
/// Thread-backed workers drive the job on their own single-threaded runtime, so both async
/// waits and blocking calls are fine there. Task-backed workers share the caller's runtime and
/// should not block.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, identity: WorkerIdentity);
}

/// Reports ready straight away.
#[derive(Debug, Clone, Copy, Default)]
pub struct Idle;

#[async_trait]
impl Job for Idle {
    async fn run(&self, _identity: WorkerIdentity) {}
}

/// Every worker sleeps for the same duration.
#[derive(Debug, Clone, Copy)]
pub struct Sleep(pub Duration);

#[async_trait]
impl Job for Sleep {
    async fn run(&self, _identity: WorkerIdentity) {
        tokio::time::sleep(self.0).await;
    }
}

/// Worker `i` sleeps for the `i`th delay. Workers past the end of the list do not sleep.
#[derive(Debug, Clone, Default)]
pub struct Staggered {
    delays: Vec<Duration>,
}

impl Staggered {
    #[must_use]
    pub fn new(delays: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            delays: delays.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn from_millis(delays: impl IntoIterator<Item = u64>) -> Self {
        Self::new(delays.into_iter().map(Duration::from_millis))
    }

    #[must_use]
    pub fn delay(&self, identity: WorkerIdentity) -> Duration {
        self.delays
            .get(identity.index())
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Job for Staggered {
    async fn run(&self, identity: WorkerIdentity) {
        tokio::time::sleep(self.delay(identity)).await;
    }
}

/// Runs a blocking closure.
pub struct FnJob<F>(pub F);

#[async_trait]
impl<F> Job for FnJob<F>
where
    F: Fn(WorkerIdentity) + Send + Sync,
{
    async fn run(&self, identity: WorkerIdentity) {
        (self.0)(identity);
    }
}

/// What a worker waits on once it has reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSpec {
    pub slot: usize,
    pub expected: i32,
    pub timeout: Option<Duration>,
}

/// What a worker is handed at spawn time.
#[derive(Debug, Clone)]
pub struct WorkerInit {
    pub cell: CellReader,
    pub identity: WorkerIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub identity: WorkerIdentity,
    /// Whether the ready report reached the owner's channel.
    pub reported: bool,
    /// Result of the wait, if the worker waited.
    pub wait: Option<WaitResult>,
    /// Whether the worker saw the barrier release, directly or by re-checking the slot.
    pub released: bool,
    pub finished_at: Instant,
}

pub struct WorkerTask {
    init: WorkerInit,
    job: Arc<dyn Job>,
    reporter: Sender<Command>,
    wait: Option<WaitSpec>,
    state: StateCell,
}

impl fmt::Debug for WorkerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerTask")
            .field("identity", &self.init.identity)
            .field("wait", &self.wait)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl WorkerTask {
    pub(crate) fn new(
        init: WorkerInit,
        job: Arc<dyn Job>,
        reporter: Sender<Command>,
        wait: Option<WaitSpec>,
    ) -> Self {
        Self {
            init,
            job,
            reporter,
            wait,
            state: StateCell::new(),
        }
    }

    #[must_use]
    pub const fn identity(&self) -> WorkerIdentity {
        self.init.identity
    }

    pub(crate) fn state_cell(&self) -> StateCell {
        self.state.clone()
    }

    /// Runs the worker on the calling thread, blocking it while waiting for the release.
    ///
    /// # Errors
    ///
    /// * If the worker's own runtime fails to build
    /// * If the configured wait slot does not exist
    pub fn run(self) -> Result<WorkerOutcome, Error> {
        let result = self.run_blocking();
        self.state.set(WorkerState::Done);
        result
    }

    /// Runs the worker as a task, suspending it while waiting for the release.
    ///
    /// # Errors
    ///
    /// * If the configured wait slot does not exist
    pub async fn run_async(self) -> Result<WorkerOutcome, Error> {
        let identity = self.identity();

        self.state.set(WorkerState::Running);
        log::debug!("Worker {identity} started");
        self.job.run(identity).await;
        let reported = self.report();

        let result = match self.wait {
            Some(spec) => {
                self.state.set(WorkerState::AwaitingNotification);
                let result = self
                    .init
                    .cell
                    .wait_async(spec.slot, spec.expected, spec.timeout)
                    .await;
                result
                    .map_err(Error::from)
                    .and_then(|result| self.settle(spec, result))
                    .map(|(wait, released)| self.outcome(reported, Some(wait), released))
            }
            None => Ok(self.outcome(reported, None, false)),
        };

        self.state.set(WorkerState::Done);
        result
    }

    fn run_blocking(&self) -> Result<WorkerOutcome, Error> {
        let identity = self.identity();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;

        self.state.set(WorkerState::Running);
        log::debug!("Worker {identity} started");
        runtime.block_on(self.job.run(identity));
        let reported = self.report();

        let Some(spec) = self.wait else {
            return Ok(self.outcome(reported, None, false));
        };

        self.state.set(WorkerState::AwaitingNotification);
        let result = self
            .init
            .cell
            .wait(spec.slot, spec.expected, spec.timeout)?;
        let (wait, released) = self.settle(spec, result)?;

        Ok(self.outcome(reported, Some(wait), released))
    }

    fn report(&self) -> bool {
        let identity = self.identity();
        match self
            .reporter
            .send(Command::new(BarrierMessage::Ready { identity }))
        {
            Ok(()) => true,
            Err(_) => {
                log::warn!("Worker {identity} could not report ready: the owner has stopped");
                false
            }
        }
    }

    /// Decides whether the wait ended in a release.
    ///
    /// A timed out wait is never taken as a release on its own; the slot is re-read instead.
    fn settle(&self, spec: WaitSpec, result: WaitResult) -> Result<(WaitResult, bool), Error> {
        let identity = self.identity();
        log::info!("Worker {identity} awoken with {result}");

        let released = match result {
            WaitResult::Woken | WaitResult::NotEqual => true,
            WaitResult::TimedOut => {
                let current = self.init.cell.load(spec.slot)?;
                if current == spec.expected {
                    log::warn!("Worker {identity} timed out before the release, giving up");
                    false
                } else {
                    log::debug!("Worker {identity} timed out but the slot moved to {current}");
                    true
                }
            }
        };

        Ok((result, released))
    }

    fn outcome(&self, reported: bool, wait: Option<WaitResult>, released: bool) -> WorkerOutcome {
        WorkerOutcome {
            identity: self.identity(),
            reported,
            wait,
            released,
            finished_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use readiness_shared_cell::{Isolation, SharedCell};

    use super::*;

    fn worker_task(
        cell: &SharedCell,
        wait: Option<WaitSpec>,
    ) -> (WorkerTask, flume::Receiver<Command>) {
        let (tx, rx) = flume::unbounded();
        let init = WorkerInit {
            cell: cell.reader(),
            identity: WorkerIdentity::new(1),
        };
        (WorkerTask::new(init, Arc::new(Idle), tx, wait), rx)
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn reports_ready_then_finishes_without_waiting() {
        let cell = SharedCell::allocate(Isolation::CrossThread, 1).unwrap();
        let (task, rx) = worker_task(&cell, None);
        let state = task.state_cell();

        assert_eq!(state.get(), WorkerState::Spawned);
        let outcome = task.run_async().await.unwrap();

        assert_eq!(state.get(), WorkerState::Done);
        assert!(outcome.reported);
        assert_eq!(outcome.wait, None);
        assert_eq!(
            rx.recv_async().await.unwrap().message(),
            BarrierMessage::Ready {
                identity: WorkerIdentity::new(1)
            }
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn timed_out_wait_rechecks_slot() {
        let cell = SharedCell::allocate(Isolation::CrossThread, 1).unwrap();
        let spec = WaitSpec {
            slot: 0,
            expected: 0,
            timeout: Some(Duration::from_millis(100)),
        };

        let (task, _rx) = worker_task(&cell, Some(spec));
        let outcome = task.run_async().await.unwrap();
        assert_eq!(outcome.wait, Some(WaitResult::TimedOut));
        assert!(!outcome.released);

        let (task, _rx) = worker_task(&cell, Some(spec));
        let state = task.state_cell();
        let handle = tokio::spawn(task.run_async());
        tokio::task::yield_now().await;
        assert_eq!(state.get(), WorkerState::AwaitingNotification);

        // Published without a notify: the worker only learns about it by re-reading the slot.
        cell.store(0, 1).unwrap();
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.wait, Some(WaitResult::TimedOut));
        assert!(outcome.released);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn not_equal_counts_as_released() {
        let cell = SharedCell::allocate(Isolation::CrossThread, 1).unwrap();
        cell.store(0, 1).unwrap();
        let spec = WaitSpec {
            slot: 0,
            expected: 0,
            timeout: None,
        };

        let (task, _rx) = worker_task(&cell, Some(spec));
        let outcome = task.run_async().await.unwrap();

        assert_eq!(outcome.wait, Some(WaitResult::NotEqual));
        assert!(outcome.released);
    }

    #[test_log::test]
    fn blocking_run_uses_its_own_runtime() {
        let cell = SharedCell::allocate(Isolation::CrossThread, 1).unwrap();
        let (tx, rx) = flume::unbounded();
        let init = WorkerInit {
            cell: cell.reader(),
            identity: WorkerIdentity::new(0),
        };
        let task = WorkerTask::new(
            init,
            Arc::new(Sleep(Duration::from_millis(5))),
            tx,
            Some(WaitSpec {
                slot: 0,
                expected: 0,
                timeout: Some(Duration::from_millis(5)),
            }),
        );

        let outcome = std::thread::spawn(move || task.run()).join().unwrap().unwrap();

        assert!(outcome.reported);
        assert_eq!(outcome.wait, Some(WaitResult::TimedOut));
        assert!(rx.try_recv().is_ok());
    }

    #[test_log::test]
    fn staggered_delays_by_identity() {
        let job = Staggered::from_millis([100, 150]);

        assert_eq!(job.delay(WorkerIdentity::new(1)), Duration::from_millis(150));
        assert_eq!(job.delay(WorkerIdentity::new(5)), Duration::ZERO);
    }

    #[test_log::test]
    fn state_round_trips_through_atomic() {
        let state = StateCell::new();
        for expected in [
            WorkerState::Running,
            WorkerState::AwaitingNotification,
            WorkerState::Done,
        ] {
            state.set(expected);
            assert_eq!(state.get(), expected);
        }
    }
}
