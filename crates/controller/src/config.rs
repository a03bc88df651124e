//! The `[controller]` configuration section.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// Delay before retrying a cycle that failed without its own retry hint.
    #[serde(with = "polling::duration::serde_str")]
    pub error_backoff: Duration,

    /// Cycles allowed in flight at once across all records.
    pub max_concurrent_reconciles: usize,

    /// Deadline for one cycle; an overrunning cycle is abandoned.
    #[serde(with = "polling::duration::serde_str")]
    pub reconcile_timeout: Duration,

    /// Where observed state is saved between runs. `None` keeps it in memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            error_backoff: Duration::from_secs(30),
            max_concurrent_reconciles: 16,
            reconcile_timeout: Duration::from_secs(120),
            state_file: None,
        }
    }
}
