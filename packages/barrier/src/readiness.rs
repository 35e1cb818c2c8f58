//! Owner-side readiness bookkeeping.
//!
//! [`ReadinessCount`] is only ever touched by the owner loop, one message at a time, so it needs
//! no synchronization of its own.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{config::ConfigError, worker::WorkerIdentity};

/// What to do when the same worker reports ready twice.
///
/// Neither choice decrements the count again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateReportPolicy {
    /// Absorb the report silently.
    #[default]
    Ignore,
    /// Surface it as [`ProtocolError::DuplicateReport`].
    Reject,
}

impl FromStr for DuplicateReportPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "reject" => Ok(Self::Reject),
            _ => Err(ConfigError::InvalidValue {
                name: "duplicate report policy",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Worker {identity} is not part of this barrier of {worker_count} workers")]
    UnknownWorker {
        identity: WorkerIdentity,
        worker_count: usize,
    },
    #[error("Worker {identity} reported ready more than once")]
    DuplicateReport { identity: WorkerIdentity },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyOutcome {
    /// Counted; `remaining` workers have yet to report.
    Pending { remaining: usize },
    /// Counted, and it was the last one outstanding.
    QuorumReached,
    /// Already counted before. Nothing changed.
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct ReadinessCount {
    remaining: usize,
    reported: Vec<bool>,
    duplicates: DuplicateReportPolicy,
}

impl ReadinessCount {
    #[must_use]
    pub fn new(worker_count: usize, duplicates: DuplicateReportPolicy) -> Self {
        Self {
            remaining: worker_count,
            reported: vec![false; worker_count],
            duplicates,
        }
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.reported.len()
    }

    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.remaining
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    #[must_use]
    pub fn has_reported(&self, identity: WorkerIdentity) -> bool {
        self.reported
            .get(identity.index())
            .copied()
            .unwrap_or(false)
    }

    /// Records that `identity` is ready.
    ///
    /// The count only moves on the first report from each worker and hits zero exactly once.
    ///
    /// # Errors
    ///
    /// * If `identity` is outside `[0, worker_count)`
    /// * If `identity` already reported and duplicates are rejected
    pub fn on_worker_ready(
        &mut self,
        identity: WorkerIdentity,
    ) -> Result<ReadyOutcome, ProtocolError> {
        let worker_count = self.worker_count();
        let Some(reported) = self.reported.get_mut(identity.index()) else {
            return Err(ProtocolError::UnknownWorker {
                identity,
                worker_count,
            });
        };

        if *reported {
            return match self.duplicates {
                DuplicateReportPolicy::Ignore => Ok(ReadyOutcome::Duplicate),
                DuplicateReportPolicy::Reject => Err(ProtocolError::DuplicateReport { identity }),
            };
        }

        *reported = true;
        self.remaining -= 1;

        Ok(if self.remaining == 0 {
            ReadyOutcome::QuorumReached
        } else {
            ReadyOutcome::Pending {
                remaining: self.remaining,
            }
        })
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use pretty_assertions::assert_eq;
    use quickcheck_macros::quickcheck;

    use super::*;

    fn id(index: usize) -> WorkerIdentity {
        WorkerIdentity::new(index)
    }

    #[test_log::test]
    fn counts_down_to_quorum() {
        let mut count = ReadinessCount::new(3, DuplicateReportPolicy::Ignore);

        assert_eq!(
            count.on_worker_ready(id(1)).unwrap(),
            ReadyOutcome::Pending { remaining: 2 }
        );
        assert_eq!(
            count.on_worker_ready(id(0)).unwrap(),
            ReadyOutcome::Pending { remaining: 1 }
        );
        assert_eq!(
            count.on_worker_ready(id(2)).unwrap(),
            ReadyOutcome::QuorumReached
        );
        assert!(count.is_complete());
    }

    #[test_log::test]
    fn quorum_is_reached_only_by_the_last_report_for_every_size() {
        for worker_count in 1..=16 {
            let mut count = ReadinessCount::new(worker_count, DuplicateReportPolicy::Ignore);

            for index in (0..worker_count).rev() {
                let outcome = count.on_worker_ready(id(index)).unwrap();
                if index == 0 {
                    assert_eq!(outcome, ReadyOutcome::QuorumReached);
                } else {
                    assert_eq!(outcome, ReadyOutcome::Pending { remaining: index });
                }
            }
        }
    }

    #[test_log::test]
    fn duplicates_are_ignored_by_default() {
        let mut count = ReadinessCount::new(2, DuplicateReportPolicy::Ignore);

        count.on_worker_ready(id(0)).unwrap();
        assert_eq!(
            count.on_worker_ready(id(0)).unwrap(),
            ReadyOutcome::Duplicate
        );
        assert_eq!(count.remaining(), 1);
    }

    #[test_log::test]
    fn duplicates_can_be_rejected() {
        let mut count = ReadinessCount::new(2, DuplicateReportPolicy::Reject);

        count.on_worker_ready(id(1)).unwrap();
        assert_eq!(
            count.on_worker_ready(id(1)).unwrap_err(),
            ProtocolError::DuplicateReport { identity: id(1) }
        );
        assert_eq!(count.remaining(), 1);
    }

    #[test_log::test]
    fn duplicates_after_quorum_do_not_reach_it_again() {
        let mut count = ReadinessCount::new(1, DuplicateReportPolicy::Ignore);

        assert_eq!(
            count.on_worker_ready(id(0)).unwrap(),
            ReadyOutcome::QuorumReached
        );
        assert_eq!(
            count.on_worker_ready(id(0)).unwrap(),
            ReadyOutcome::Duplicate
        );
        assert_eq!(count.remaining(), 0);
    }

    #[test_log::test]
    fn unknown_workers_are_protocol_errors() {
        let mut count = ReadinessCount::new(2, DuplicateReportPolicy::Ignore);

        assert_eq!(
            count.on_worker_ready(id(2)).unwrap_err(),
            ProtocolError::UnknownWorker {
                identity: id(2),
                worker_count: 2,
            }
        );
        assert_eq!(count.remaining(), 2);
        assert!(!count.has_reported(id(2)));
    }

    #[quickcheck]
    #[allow(clippy::needless_pass_by_value)]
    fn count_tracks_distinct_reports(reports: Vec<u8>, workers: u8) -> bool {
        let worker_count = usize::from(workers % 8) + 1;
        let mut count = ReadinessCount::new(worker_count, DuplicateReportPolicy::Ignore);
        let mut seen = BTreeSet::new();
        let mut reached = 0;

        for report in reports {
            let identity = id(usize::from(report) % worker_count);
            let first = seen.insert(identity);

            match count.on_worker_ready(identity).unwrap() {
                ReadyOutcome::QuorumReached => {
                    reached += 1;
                    assert!(first);
                    assert_eq!(seen.len(), worker_count);
                }
                ReadyOutcome::Pending { remaining } => {
                    assert!(first);
                    assert_eq!(remaining, worker_count - seen.len());
                }
                ReadyOutcome::Duplicate => assert!(!first),
            }
        }

        count.remaining() == worker_count - seen.len()
            && reached == usize::from(seen.len() == worker_count)
    }
}
