//! Where worker tasks execute.
//!
//! [`ThreadRuntime`] gives every worker its own OS thread, the same way the owner would hand
//! each one a dedicated execution context. [`TaskRuntime`] spawns workers onto the current
//! tokio runtime instead, which is what the deterministic tests use.

use std::{fmt, thread};

use crate::{
    Error,
    context::Context,
    worker::{StateCell, WorkerIdentity, WorkerOutcome, WorkerState, WorkerTask},
};

pub trait WorkerRuntime {
    /// Starts `task` and returns a handle to it.
    ///
    /// # Errors
    ///
    /// * If the execution context for the worker cannot be created
    fn spawn(&self, context: &Context, task: WorkerTask) -> Result<WorkerHandle, Error>;
}

/// One OS thread per worker, blocked in [`WorkerTask::run`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRuntime;

impl WorkerRuntime for ThreadRuntime {
    fn spawn(&self, context: &Context, task: WorkerTask) -> Result<WorkerHandle, Error> {
        let identity = task.identity();
        let state = task.state_cell();
        let join = thread::Builder::new()
            .name(format!("{}-worker-{identity}", context.name()))
            .spawn(move || task.run())?;

        log::debug!("Spawned worker thread {identity}");

        Ok(WorkerHandle {
            identity,
            state,
            join: Join::Thread(join),
        })
    }
}

/// One tokio task per worker, suspended in [`WorkerTask::run_async`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskRuntime;

impl WorkerRuntime for TaskRuntime {
    fn spawn(&self, _context: &Context, task: WorkerTask) -> Result<WorkerHandle, Error> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let identity = task.identity();
        let state = task.state_cell();
        let join = runtime.spawn(task.run_async());

        log::debug!("Spawned worker task {identity}");

        Ok(WorkerHandle {
            identity,
            state,
            join: Join::Task(join),
        })
    }
}

enum Join {
    Thread(thread::JoinHandle<Result<WorkerOutcome, Error>>),
    Task(tokio::task::JoinHandle<Result<WorkerOutcome, Error>>),
}

pub struct WorkerHandle {
    identity: WorkerIdentity,
    state: StateCell,
    join: Join,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("identity", &self.identity)
            .field("state", &self.state.get())
            .field(
                "kind",
                &match self.join {
                    Join::Thread(_) => "thread",
                    Join::Task(_) => "task",
                },
            )
            .finish()
    }
}

impl WorkerHandle {
    #[must_use]
    pub const fn identity(&self) -> WorkerIdentity {
        self.identity
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        match &self.join {
            Join::Thread(join) => join.is_finished(),
            Join::Task(join) => join.is_finished(),
        }
    }

    /// Cancels a task-backed worker. Threads cannot be cancelled, so this returns `false` for
    /// them and the thread keeps running.
    pub fn abort(&self) -> bool {
        match &self.join {
            Join::Thread(_) => {
                log::warn!("Worker {} runs on a thread and cannot be aborted", self.identity);
                false
            }
            Join::Task(join) => {
                join.abort();
                true
            }
        }
    }

    /// Waits for the worker to finish. A thread-backed worker is joined off the async runtime.
    ///
    /// # Errors
    ///
    /// * If the worker panicked
    /// * If the worker task was aborted
    /// * If the worker itself failed
    pub async fn join(self) -> Result<WorkerOutcome, Error> {
        let identity = self.identity;
        match self.join {
            Join::Thread(join) => {
                match tokio::task::spawn_blocking(move || join.join()).await? {
                    Ok(result) => result,
                    Err(_) => Err(Error::WorkerPanicked(identity)),
                }
            }
            Join::Task(join) => match join.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(Error::WorkerPanicked(identity)),
                Err(e) => Err(Error::Join(e)),
            },
        }
    }
}
