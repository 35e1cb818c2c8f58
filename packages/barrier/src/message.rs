use serde::{Deserialize, Serialize};

use crate::{config::NotifyCount, worker::WorkerIdentity};

/// Everything the owner loop reacts to.
///
/// On the wire a report reads `{"type":"ready","identity":2}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BarrierMessage {
    /// A worker finished its job.
    Ready { identity: WorkerIdentity },
    /// The policy timer expired.
    Timeout,
    /// Release now, outside of any policy trigger.
    Notify { count: NotifyCount },
}
