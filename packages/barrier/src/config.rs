//! Barrier configuration.
//!
//! Everything can be set in code through the `with_*` builders or loaded from the environment
//! with [`BarrierConfig::from_env`]:
//!
//! | variable | meaning | default |
//! | --- | --- | --- |
//! | `READINESS_WORKERS` | number of workers | `4` |
//! | `READINESS_POLICY` | `quorum`, `timer` or `quorum-or-timer` | `quorum` |
//! | `READINESS_DELAY_MS` | timer delay | `500` |
//! | `READINESS_NOTIFY_COUNT` | waiters the timer wakes, a number or `all` | `all` |
//! | `READINESS_WAIT_TIMEOUT_MS` | worker wait timeout, unset waits forever | unset |
//! | `READINESS_DUPLICATES` | `ignore` or `reject` duplicate reports | `ignore` |

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{readiness::DuplicateReportPolicy, worker::WaitSpec};

pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_DELAY: Duration = Duration::from_millis(500);
/// Upper bound on the number of workers a single barrier may spawn.
pub const MAX_WORKERS: usize = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
    #[error("Unknown policy {0:?} (expected quorum, timer or quorum-or-timer)")]
    UnknownPolicy(String),
    #[error("A barrier needs at least one worker")]
    NoWorkers,
    #[error("A barrier cannot have {requested} workers (max {max})")]
    TooManyWorkers { requested: usize, max: usize },
    #[error("Timer delay must be positive")]
    ZeroDelay,
    #[error("Wait slot {slot} is outside of a {slots}-slot cell")]
    SlotOutOfRange { slot: usize, slots: usize },
}

/// How many waiters a release wakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyCount {
    #[default]
    All,
    AtMost(usize),
}

impl NotifyCount {
    #[must_use]
    pub const fn as_option(self) -> Option<usize> {
        match self {
            Self::All => None,
            Self::AtMost(count) => Some(count),
        }
    }
}

impl fmt::Display for NotifyCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::AtMost(count) => write!(f, "{count}"),
        }
    }
}

impl FromStr for NotifyCount {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        s.parse::<usize>()
            .map(Self::AtMost)
            .map_err(|_| ConfigError::InvalidValue {
                name: "notify count",
                value: s.to_string(),
            })
    }
}

/// When the owner releases the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Policy {
    /// Notify up to `notify_count` waiters once `delay` has passed, whatever the workers are
    /// doing. Workers that start waiting after that are never woken.
    Timer {
        delay: Duration,
        notify_count: NotifyCount,
    },
    /// Notify every waiter once all workers have reported ready. If a worker never reports,
    /// nobody is ever released.
    Quorum,
    /// Quorum, with a timer as fallback. Whichever fires first releases.
    QuorumOrTimer {
        delay: Duration,
        notify_count: NotifyCount,
    },
}

impl Policy {
    #[must_use]
    pub const fn timer(delay: Duration) -> Self {
        Self::Timer {
            delay,
            notify_count: NotifyCount::All,
        }
    }

    /// The timer half of the policy, if there is one.
    #[must_use]
    pub const fn deadline(&self) -> Option<(Duration, NotifyCount)> {
        match *self {
            Self::Timer {
                delay,
                notify_count,
            }
            | Self::QuorumOrTimer {
                delay,
                notify_count,
            } => Some((delay, notify_count)),
            Self::Quorum => None,
        }
    }

    #[must_use]
    pub const fn uses_quorum(&self) -> bool {
        matches!(self, Self::Quorum | Self::QuorumOrTimer { .. })
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Timer { .. } => "timer",
            Self::Quorum => "quorum",
            Self::QuorumOrTimer { .. } => "quorum-or-timer",
        }
    }

    /// Builds a policy from its name as used by `READINESS_POLICY`.
    ///
    /// # Errors
    ///
    /// * If `name` is not a known policy
    pub fn from_name(
        name: &str,
        delay: Duration,
        notify_count: NotifyCount,
    ) -> Result<Self, ConfigError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "quorum" => Ok(Self::Quorum),
            "timer" => Ok(Self::Timer {
                delay,
                notify_count,
            }),
            "quorum-or-timer" | "quorum_or_timer" => Ok(Self::QuorumOrTimer {
                delay,
                notify_count,
            }),
            _ => Err(ConfigError::UnknownPolicy(name.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierConfig {
    pub worker_count: usize,
    pub policy: Policy,
    /// Number of slots in the shared cell.
    pub slots: usize,
    /// Slot the workers wait on and the owner notifies.
    pub slot: usize,
    /// Value the slot holds while workers are meant to block.
    pub expected: i32,
    /// Worker wait timeout. `None` waits forever.
    pub wait_timeout: Option<Duration>,
    /// Whether workers wait for the release after reporting ready.
    pub wait_for_release: bool,
    pub duplicates: DuplicateReportPolicy,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_COUNT, Policy::Quorum)
    }
}

impl BarrierConfig {
    #[must_use]
    pub const fn new(worker_count: usize, policy: Policy) -> Self {
        Self {
            worker_count,
            policy,
            slots: 1,
            slot: 0,
            expected: 0,
            wait_timeout: None,
            wait_for_release: true,
            duplicates: DuplicateReportPolicy::Ignore,
        }
    }

    #[must_use]
    pub const fn with_wait_timeout(mut self, wait_timeout: Option<Duration>) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    #[must_use]
    pub const fn with_wait_for_release(mut self, wait_for_release: bool) -> Self {
        self.wait_for_release = wait_for_release;
        self
    }

    #[must_use]
    pub const fn with_duplicates(mut self, duplicates: DuplicateReportPolicy) -> Self {
        self.duplicates = duplicates;
        self
    }

    #[must_use]
    pub const fn with_slot(mut self, slots: usize, slot: usize) -> Self {
        self.slots = slots;
        self.slot = slot;
        self
    }

    #[must_use]
    pub const fn with_expected(mut self, expected: i32) -> Self {
        self.expected = expected;
        self
    }

    /// What each worker waits on after reporting, if it waits at all.
    #[must_use]
    pub const fn wait_spec(&self) -> Option<WaitSpec> {
        if !self.wait_for_release {
            return None;
        }
        Some(WaitSpec {
            slot: self.slot,
            expected: self.expected,
            timeout: self.wait_timeout,
        })
    }

    /// # Errors
    ///
    /// * If there are no workers, or more than [`MAX_WORKERS`]
    /// * If the timer delay is zero
    /// * If the wait slot is outside the cell
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.worker_count > MAX_WORKERS {
            return Err(ConfigError::TooManyWorkers {
                requested: self.worker_count,
                max: MAX_WORKERS,
            });
        }
        if self
            .policy
            .deadline()
            .is_some_and(|(delay, _)| delay.is_zero())
        {
            return Err(ConfigError::ZeroDelay);
        }
        if self.slot >= self.slots {
            return Err(ConfigError::SlotOutOfRange {
                slot: self.slot,
                slots: self.slots,
            });
        }
        Ok(())
    }

    /// Loads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// * If a variable is set to a value that does not parse
    /// * If the resulting configuration is invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads the configuration through `lookup`, which maps a variable name to its value.
    ///
    /// # Errors
    ///
    /// * If a variable is set to a value that does not parse
    /// * If the resulting configuration is invalid
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let worker_count =
            parse_var::<usize>(&lookup, "READINESS_WORKERS")?.unwrap_or(DEFAULT_WORKER_COUNT);
        let delay = parse_var::<u64>(&lookup, "READINESS_DELAY_MS")?
            .map_or(DEFAULT_DELAY, Duration::from_millis);
        let notify_count = lookup("READINESS_NOTIFY_COUNT")
            .map(|value| {
                value.parse::<NotifyCount>().map_err(|_| ConfigError::InvalidValue {
                    name: "READINESS_NOTIFY_COUNT",
                    value,
                })
            })
            .transpose()?
            .unwrap_or_default();
        let policy = lookup("READINESS_POLICY")
            .map(|name| Policy::from_name(&name, delay, notify_count))
            .transpose()?
            .unwrap_or(Policy::Quorum);
        let wait_timeout =
            parse_var::<u64>(&lookup, "READINESS_WAIT_TIMEOUT_MS")?.map(Duration::from_millis);
        let duplicates = lookup("READINESS_DUPLICATES")
            .map(|value| {
                value.parse::<DuplicateReportPolicy>().map_err(|_| ConfigError::InvalidValue {
                    name: "READINESS_DUPLICATES",
                    value,
                })
            })
            .transpose()?
            .unwrap_or_default();

        let config = Self::new(worker_count, policy)
            .with_wait_timeout(wait_timeout)
            .with_duplicates(duplicates);
        config.validate()?;

        log::debug!("from_lookup: loaded {config:?}");

        Ok(config)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidValue { name, value })
        })
        .transpose()
}
