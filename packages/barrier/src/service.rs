//! The owner loop.
//!
//! All messages, from workers, from the policy timer and from [`Handle`]s, go through a single
//! channel and are processed one at a time by [`Service`]. The readiness count and the release
//! decision therefore never race with each other.

use std::{fmt, sync::Arc, time::Duration};

use flume::{Receiver, Sender};
use readiness_shared_cell::SharedCell;
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    Error,
    config::{BarrierConfig, NotifyCount},
    message::BarrierMessage,
    readiness::{ProtocolError, ReadinessCount, ReadyOutcome},
    worker::WorkerIdentity,
};

pub struct Command {
    message: BarrierMessage,
    ack: Option<Sender<Result<(), ProtocolError>>>,
}

impl Command {
    pub(crate) const fn new(message: BarrierMessage) -> Self {
        Self { message, ack: None }
    }

    #[must_use]
    pub const fn message(&self) -> BarrierMessage {
        self.message
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("message", &self.message)
            .field("ack", &self.ack.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseTrigger {
    Quorum,
    Timer,
    Manual,
}

impl fmt::Display for ReleaseTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Quorum => "quorum",
            Self::Timer => "timer",
            Self::Manual => "manual notify",
        })
    }
}

/// How and when the barrier released its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Release {
    pub trigger: ReleaseTrigger,
    /// Time from barrier creation to the release.
    pub elapsed: Duration,
    /// Waiters woken by the release notify.
    pub woken: usize,
    /// Whether the slot was moved off the expected value, so that late waiters pass straight
    /// through.
    pub published: bool,
}

/// Final state of the owner loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierReport {
    pub release: Option<Release>,
    /// Workers in the order their first ready report was processed.
    pub reported: Vec<WorkerIdentity>,
    pub violations: Vec<ProtocolError>,
    /// Workers that never reported.
    pub remaining: usize,
}

pub(crate) struct OwnerContext {
    cell: Arc<SharedCell>,
    config: BarrierConfig,
    readiness: ReadinessCount,
    created_at: Instant,
    release: Option<Release>,
    reported: Vec<WorkerIdentity>,
    violations: Vec<ProtocolError>,
    released_tx: watch::Sender<Option<Release>>,
}

impl OwnerContext {
    pub(crate) fn new(
        cell: Arc<SharedCell>,
        config: BarrierConfig,
        created_at: Instant,
    ) -> (Self, watch::Receiver<Option<Release>>) {
        let (released_tx, released_rx) = watch::channel(None);
        let ctx = Self {
            cell,
            readiness: ReadinessCount::new(config.worker_count, config.duplicates),
            reported: Vec::with_capacity(config.worker_count),
            config,
            created_at,
            release: None,
            violations: vec![],
            released_tx,
        };
        (ctx, released_rx)
    }

    fn elapsed_ms(&self) -> u128 {
        self.created_at.elapsed().as_millis()
    }

    pub(crate) fn process_message(&mut self, message: BarrierMessage) -> Result<(), ProtocolError> {
        log::trace!("process_message: {message:?}");

        match message {
            BarrierMessage::Ready { identity } => self.on_ready(identity)?,
            BarrierMessage::Timeout => match self.config.policy.deadline() {
                Some((_, notify_count)) => {
                    self.release(ReleaseTrigger::Timer, notify_count, false);
                }
                None => log::warn!("Received a timeout but the quorum policy has no timer"),
            },
            BarrierMessage::Notify { count } => {
                self.release(ReleaseTrigger::Manual, count, false);
            }
        }

        Ok(())
    }

    fn on_ready(&mut self, identity: WorkerIdentity) -> Result<(), ProtocolError> {
        let outcome = match self.readiness.on_worker_ready(identity) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Rejected ready report: {e}");
                self.violations.push(e.clone());
                return Err(e);
            }
        };

        match outcome {
            ReadyOutcome::Duplicate => {
                log::debug!("Ignoring duplicate ready report from worker {identity}");
            }
            ReadyOutcome::Pending { remaining } => {
                self.reported.push(identity);
                log::info!(
                    "Ready; id={identity}, count={remaining}, time={}ms",
                    self.elapsed_ms()
                );
            }
            ReadyOutcome::QuorumReached => {
                self.reported.push(identity);
                log::info!("Ready; id={identity}, count=0, time={}ms", self.elapsed_ms());
                if self.config.policy.uses_quorum() {
                    self.release(ReleaseTrigger::Quorum, NotifyCount::All, true);
                } else {
                    log::debug!("All workers ready, waiting for the timer");
                }
            }
        }

        Ok(())
    }

    /// Releases the workers. Only the first call has any effect.
    fn release(&mut self, trigger: ReleaseTrigger, count: NotifyCount, publish: bool) {
        if let Some(existing) = self.release {
            log::debug!(
                "Ignoring {trigger} release, already released by {} after {}ms",
                existing.trigger,
                existing.elapsed.as_millis()
            );
            return;
        }

        let slot = self.config.slot;
        let published = publish
            && match self.cell.store(slot, self.config.expected.wrapping_add(1)) {
                Ok(()) => true,
                Err(e) => {
                    log::error!("Failed to publish release: {e}");
                    false
                }
            };
        let woken = self
            .cell
            .notify(slot, count.as_option())
            .unwrap_or_else(|e| {
                log::error!("Failed to notify waiters: {e}");
                0
            });

        let release = Release {
            trigger,
            elapsed: self.created_at.elapsed(),
            woken,
            published,
        };
        log::info!(
            "Released by {trigger} after {}ms; notify count={count}, woken={woken}",
            release.elapsed.as_millis()
        );

        self.release = Some(release);
        self.released_tx.send_replace(Some(release));
    }

    fn report(&self) -> BarrierReport {
        BarrierReport {
            release: self.release,
            reported: self.reported.clone(),
            violations: self.violations.clone(),
            remaining: self.readiness.remaining(),
        }
    }
}

/// Releases every worker that is waiting or about to wait, outside of the normal policy.
///
/// Used when the barrier cannot be brought up fully and the workers already started must not be
/// left blocked.
pub(crate) fn abandon(cell: &SharedCell, config: &BarrierConfig) {
    if let Err(e) = cell.store(config.slot, config.expected.wrapping_add(1)) {
        log::error!("abandon: failed to publish: {e}");
        return;
    }
    match cell.notify(config.slot, None) {
        Ok(woken) => log::debug!("abandon: woke {woken} worker(s)"),
        Err(e) => log::error!("abandon: failed to notify: {e}"),
    }
}

pub(crate) struct Service {
    ctx: OwnerContext,
    token: CancellationToken,
    sender: Sender<Command>,
    receiver: Receiver<Command>,
}

impl Service {
    pub(crate) fn new(ctx: OwnerContext) -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            ctx,
            token: CancellationToken::new(),
            sender,
            receiver,
        }
    }

    pub(crate) fn handle(&self) -> Handle {
        Handle {
            sender: self.sender.clone(),
            token: self.token.clone(),
        }
    }

    pub(crate) fn reporter(&self) -> Sender<Command> {
        self.sender.clone()
    }

    fn start_timer(&self) -> Option<JoinHandle<()>> {
        let (delay, _) = self.ctx.config.policy.deadline()?;
        let Some(deadline) = self.ctx.created_at.checked_add(delay) else {
            log::warn!("Timer delay {delay:?} is past the end of the clock, the timer never fires");
            return None;
        };
        let sender = self.sender.clone();
        let token = self.token.clone();

        Some(tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    log::debug!("Timer cancelled");
                }
                () = tokio::time::sleep_until(deadline) => {
                    log::debug!("Timer expired after {}ms", delay.as_millis());
                    if sender.send_async(Command::new(BarrierMessage::Timeout)).await.is_err() {
                        log::debug!("Timer fired after the owner stopped");
                    }
                }
            }
        }))
    }

    async fn process_command(&mut self, command: Command) {
        let result = self.ctx.process_message(command.message);
        if let Some(ack) = command.ack
            && ack.send_async(result).await.is_err()
        {
            log::debug!("Sender stopped waiting for the acknowledgement");
        }
    }

    /// Runs the owner loop until the [`Handle`] shuts it down.
    pub(crate) fn start(mut self) -> JoinHandle<BarrierReport> {
        let timer = self.start_timer();

        tokio::spawn(async move {
            log::debug!(
                "Started barrier owner: policy={} workers={}",
                self.ctx.config.policy.name(),
                self.ctx.config.worker_count
            );

            while let Ok(command) = tokio::select!(
                () = self.token.cancelled() => {
                    log::debug!("Barrier owner was cancelled");
                    Err(flume::RecvError::Disconnected)
                }
                command = self.receiver.recv_async() => command
            ) {
                self.process_command(command).await;
            }

            while let Ok(command) = self.receiver.try_recv() {
                log::trace!("Draining queued command after shutdown");
                self.process_command(command).await;
            }

            if let Some(timer) = timer {
                timer.abort();
            }

            let report = self.ctx.report();
            log::debug!("Stopped barrier owner: {report:?}");
            report
        })
    }
}

/// Sends messages to a running owner loop.
#[derive(Debug, Clone)]
pub struct Handle {
    sender: Sender<Command>,
    token: CancellationToken,
}

impl Handle {
    /// # Errors
    ///
    /// * If the owner loop has stopped
    pub fn send(&self, message: BarrierMessage) -> Result<(), Error> {
        Ok(self.sender.send(Command::new(message))?)
    }

    /// # Errors
    ///
    /// * If the owner loop has stopped
    pub async fn send_async(&self, message: BarrierMessage) -> Result<(), Error> {
        Ok(self.sender.send_async(Command::new(message)).await?)
    }

    /// Sends `message` and waits until the owner has processed it.
    ///
    /// # Errors
    ///
    /// * If the owner loop has stopped
    /// * If the owner rejected the message as a protocol violation
    pub async fn send_and_wait(&self, message: BarrierMessage) -> Result<(), Error> {
        let (tx, rx) = flume::bounded(1);
        self.sender
            .send_async(Command {
                message,
                ack: Some(tx),
            })
            .await?;

        rx.recv_async()
            .await
            .map_err(|_| Error::Send)?
            .map_err(Error::Protocol)
    }

    /// Reports `identity` as ready on its behalf.
    ///
    /// # Errors
    ///
    /// * If the owner loop has stopped
    /// * If `identity` is unknown, or already reported while duplicates are rejected
    pub async fn worker_ready(&self, identity: WorkerIdentity) -> Result<(), Error> {
        self.send_and_wait(BarrierMessage::Ready { identity }).await
    }

    /// Releases the barrier now, waking up to `count` waiters. Ignored once released.
    ///
    /// # Errors
    ///
    /// * If the owner loop has stopped
    pub async fn notify(&self, count: NotifyCount) -> Result<(), Error> {
        self.send_and_wait(BarrierMessage::Notify { count }).await
    }

    /// Stops the owner loop. Messages already queued are still processed.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use readiness_shared_cell::{Isolation, WaitResult};

    use super::*;
    use crate::{config::Policy, readiness::DuplicateReportPolicy};

    fn owner(config: BarrierConfig) -> (OwnerContext, Arc<SharedCell>) {
        let cell = Arc::new(SharedCell::allocate(Isolation::CrossThread, config.slots).unwrap());
        let (ctx, _rx) = OwnerContext::new(cell.clone(), config, Instant::now());
        (ctx, cell)
    }

    fn ready(index: usize) -> BarrierMessage {
        BarrierMessage::Ready {
            identity: WorkerIdentity::new(index),
        }
    }

    #[test_log::test(tokio::test)]
    async fn quorum_publishes_before_notify() {
        let (mut ctx, cell) = owner(BarrierConfig::new(2, Policy::Quorum));

        ctx.process_message(ready(0)).unwrap();
        assert_eq!(ctx.release, None);
        ctx.process_message(ready(1)).unwrap();

        let release = ctx.release.unwrap();
        assert_eq!(release.trigger, ReleaseTrigger::Quorum);
        assert!(release.published);
        assert_eq!(cell.load(0).unwrap(), 1);
        assert_eq!(cell.reader().wait(0, 0, None).unwrap(), WaitResult::NotEqual);
    }

    #[test_log::test(tokio::test)]
    async fn timer_release_leaves_slot_untouched() {
        let (mut ctx, cell) = owner(BarrierConfig::new(
            2,
            Policy::timer(Duration::from_millis(500)),
        ));

        ctx.process_message(BarrierMessage::Timeout).unwrap();
        ctx.process_message(ready(0)).unwrap();
        ctx.process_message(ready(1)).unwrap();

        let release = ctx.release.unwrap();
        assert_eq!(release.trigger, ReleaseTrigger::Timer);
        assert!(!release.published);
        assert_eq!(cell.load(0).unwrap(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn release_happens_once() {
        let (mut ctx, _cell) = owner(BarrierConfig::new(
            1,
            Policy::QuorumOrTimer {
                delay: Duration::from_millis(100),
                notify_count: NotifyCount::All,
            },
        ));

        ctx.process_message(ready(0)).unwrap();
        ctx.process_message(BarrierMessage::Timeout).unwrap();
        ctx.process_message(BarrierMessage::Notify {
            count: NotifyCount::All,
        })
        .unwrap();

        assert_eq!(ctx.release.unwrap().trigger, ReleaseTrigger::Quorum);
    }

    #[test_log::test(tokio::test)]
    async fn timeout_without_timer_is_ignored() {
        let (mut ctx, _cell) = owner(BarrierConfig::new(1, Policy::Quorum));

        ctx.process_message(BarrierMessage::Timeout).unwrap();

        assert_eq!(ctx.release, None);
    }

    #[test_log::test(tokio::test)]
    async fn violations_are_recorded() {
        let (mut ctx, _cell) = owner(
            BarrierConfig::new(2, Policy::Quorum).with_duplicates(DuplicateReportPolicy::Reject),
        );

        ctx.process_message(ready(0)).unwrap();
        assert!(ctx.process_message(ready(0)).is_err());
        assert!(ctx.process_message(ready(7)).is_err());

        let report = ctx.report();
        assert_eq!(report.reported, vec![WorkerIdentity::new(0)]);
        assert_eq!(report.remaining, 1);
        assert_eq!(report.violations.len(), 2);
        assert_eq!(report.release, None);
    }

    #[test_log::test(tokio::test)]
    async fn abandon_releases_current_and_late_waiters() {
        let config = BarrierConfig::new(1, Policy::Quorum);
        let (_ctx, cell) = owner(config.clone());

        abandon(&cell, &config);

        assert_eq!(cell.reader().wait(0, 0, None).unwrap(), WaitResult::NotEqual);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn handle_reports_stopped_owner() {
        let (ctx, _cell) = owner(BarrierConfig::new(1, Policy::Quorum));
        let service = Service::new(ctx);
        let handle = service.handle();
        let join = service.start();

        handle.shutdown();
        let report = join.await.unwrap();

        assert_eq!(report.remaining, 1);
        assert!(handle.is_shutdown());
    }
}
