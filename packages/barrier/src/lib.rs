//! Cross-thread readiness barrier.
//!
//! [`create_barrier`] allocates a [`SharedCell`], spawns a fixed number of workers sharing it
//! and runs an owner loop that releases every worker blocked on the cell exactly once:
//!
//! * [`Policy::Timer`]: after a fixed delay, whatever the workers are doing
//! * [`Policy::Quorum`]: once every worker has reported ready
//! * [`Policy::QuorumOrTimer`]: whichever of the two comes first
//!
//! ```rust,no_run
//! use readiness_barrier::{
//!     BarrierConfig, Context, Policy, ThreadRuntime, create_barrier, worker::Staggered,
//! };
//!
//! # async fn demo() -> Result<(), readiness_barrier::Error> {
//! let barrier = create_barrier(
//!     &Context::default(),
//!     BarrierConfig::new(4, Policy::Quorum),
//!     Staggered::from_millis([100, 150, 90, 200]),
//!     &ThreadRuntime,
//! )?;
//!
//! let outcome = barrier.join().await?;
//! assert_eq!(outcome.report.remaining, 0);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod context;
pub mod message;
pub mod readiness;
pub mod runtime;
pub mod service;
pub mod worker;

use std::sync::Arc;

use readiness_shared_cell::{AllocationError, CellReader, SharedCell, SlotOutOfBounds};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle, time::Instant};

pub use config::{BarrierConfig, ConfigError, NotifyCount, Policy};
pub use context::Context;
pub use message::BarrierMessage;
pub use readiness::{DuplicateReportPolicy, ProtocolError};
pub use readiness_shared_cell as shared_cell;
pub use runtime::{TaskRuntime, ThreadRuntime, WorkerHandle, WorkerRuntime};
pub use service::{BarrierReport, Handle, Release, ReleaseTrigger};
pub use worker::{Job, WorkerIdentity, WorkerOutcome, WorkerState};

use crate::{
    service::{Command, OwnerContext, Service},
    worker::{WorkerInit, WorkerTask},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Slot(#[from] SlotOutOfBounds),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
    #[error(transparent)]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
    #[error("The barrier owner has stopped")]
    Send,
    #[error("Worker {0} panicked")]
    WorkerPanicked(WorkerIdentity),
}

impl From<flume::SendError<Command>> for Error {
    fn from(_value: flume::SendError<Command>) -> Self {
        Self::Send
    }
}

/// Everything the barrier produced once its workers are done.
#[derive(Debug)]
pub struct BarrierOutcome {
    pub report: BarrierReport,
    /// In identity order.
    pub workers: Vec<WorkerOutcome>,
}

/// A running barrier: the owner loop plus the workers it released or will release.
pub struct ReadinessBarrier {
    cell: Arc<SharedCell>,
    config: BarrierConfig,
    handle: Handle,
    service: JoinHandle<BarrierReport>,
    workers: Vec<WorkerHandle>,
    released: watch::Receiver<Option<Release>>,
}

impl std::fmt::Debug for ReadinessBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessBarrier")
            .field("config", &self.config)
            .field("workers", &self.workers)
            .field("release", &self.release())
            .finish_non_exhaustive()
    }
}

/// Allocates the shared cell, starts the owner loop and spawns `config.worker_count` workers
/// running `job` on `runtime`.
///
/// Must be called from within a tokio runtime. Any timer starts counting from this call.
///
/// # Errors
///
/// * If `config` is invalid
/// * If `context` does not allow shared memory, or the slot layout is invalid
/// * If a worker cannot be spawned. Workers already spawned are released before returning.
pub fn create_barrier(
    context: &Context,
    config: BarrierConfig,
    job: impl Job + 'static,
    runtime: &impl WorkerRuntime,
) -> Result<ReadinessBarrier, Error> {
    config.validate()?;
    tokio::runtime::Handle::try_current()?;

    let cell = Arc::new(SharedCell::allocate(context.isolation(), config.slots)?);
    let created_at = Instant::now();

    let (ctx, released) = OwnerContext::new(cell.clone(), config.clone(), created_at);
    let service = Service::new(ctx);
    let handle = service.handle();
    let reporter = service.reporter();
    let service = service.start();

    log::debug!(
        "create_barrier: {} worker(s), policy={}",
        config.worker_count,
        config.policy.name()
    );

    let job: Arc<dyn Job> = Arc::new(job);
    let mut workers = Vec::with_capacity(config.worker_count);

    for index in 0..config.worker_count {
        let init = WorkerInit {
            cell: cell.reader(),
            identity: WorkerIdentity::new(index),
        };
        let task = WorkerTask::new(init, job.clone(), reporter.clone(), config.wait_spec());

        match runtime.spawn(context, task) {
            Ok(worker) => workers.push(worker),
            Err(e) => {
                log::error!("create_barrier: failed to spawn worker {index}: {e}");
                service::abandon(&cell, &config);
                handle.shutdown();
                return Err(e);
            }
        }
    }

    Ok(ReadinessBarrier {
        cell,
        config,
        handle,
        service,
        workers,
        released,
    })
}

impl ReadinessBarrier {
    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// A read-only view of the shared cell.
    #[must_use]
    pub fn reader(&self) -> CellReader {
        self.cell.reader()
    }

    #[must_use]
    pub const fn config(&self) -> &BarrierConfig {
        &self.config
    }

    #[must_use]
    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Takes the worker handles, leaving [`Self::join`] with nothing to wait for.
    pub fn take_workers(&mut self) -> Vec<WorkerHandle> {
        std::mem::take(&mut self.workers)
    }

    #[must_use]
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(WorkerHandle::state).collect()
    }

    /// The release, if it has happened.
    #[must_use]
    pub fn release(&self) -> Option<Release> {
        *self.released.borrow()
    }

    /// Waits for the release. Resolves to `None` if the owner stops without releasing.
    pub async fn released(&self) -> Option<Release> {
        let mut released = self.released.clone();
        released
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|release| *release)
    }

    /// Waits for every worker still held by the barrier, in identity order.
    ///
    /// # Errors
    ///
    /// * If any worker panicked or failed. Every worker is still joined first.
    pub async fn join_workers(&mut self) -> Result<Vec<WorkerOutcome>, Error> {
        let workers = self.take_workers();
        futures::future::join_all(workers.into_iter().map(WorkerHandle::join))
            .await
            .into_iter()
            .collect()
    }

    /// Waits for every worker, then stops the owner loop.
    ///
    /// # Errors
    ///
    /// * If any worker panicked or failed
    /// * If the owner loop panicked
    pub async fn join(mut self) -> Result<BarrierOutcome, Error> {
        let workers = self.join_workers().await;
        let report = self.shutdown().await?;

        Ok(BarrierOutcome {
            report,
            workers: workers?,
        })
    }

    /// Stops the owner loop and returns its report. Workers still held keep running.
    ///
    /// # Errors
    ///
    /// * If the owner loop panicked
    pub async fn shutdown(self) -> Result<BarrierReport, Error> {
        if !self.workers.is_empty() {
            log::debug!(
                "shutdown: leaving {} worker(s) running: {:?}",
                self.workers.len(),
                self.worker_states()
            );
        }
        self.handle.shutdown();
        Ok(self.service.await?)
    }
}
