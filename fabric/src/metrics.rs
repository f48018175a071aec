//! Raft metrics for observability.
//!
//! Applications may use this data in whatever way is needed. The metrics
//! channel is also what the test suite builds upon: the [`Wait`] helper
//! blocks until the published metrics satisfy a predicate.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::raft::Role;
use crate::NodeId;

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The role of the Raft node.
    pub role: Role,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The index of the last log entry.
    pub last_log_index: u64,
    /// The index of the highest log entry known to be committed.
    pub commit_index: u64,
    /// The per-peer match indices, published while this node is the leader.
    pub replication: Option<BTreeMap<NodeId, u64>>,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            role: Role::Follower,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            replication: None,
        }
    }
}

/// Error variants of a metrics wait.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timeout after {0:?} when waiting for {1}")]
    Timeout(Duration, String),
    #[error("raft is shutting down")]
    ShuttingDown,
}

/// A handle for waiting on the metrics to satisfy some condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait for the metrics to satisfy the given predicate.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg = msg))]
    pub async fn metrics<T>(&self, func: T, msg: &str) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool {
        let mut rx = self.rx.clone();
        let deadline = Instant::now() + self.timeout;
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!(?latest, "wait condition satisfied");
                return Ok(latest);
            }

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) => d,
                None => return Err(WaitError::Timeout(self.timeout, msg.to_string())),
            };
            match tokio::time::timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(WaitError::ShuttingDown),
                Err(_) => return Err(WaitError::Timeout(self.timeout, msg.to_string())),
            }
        }
    }

    /// Wait for the node to assume the given role.
    pub async fn role(&self, want: Role, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.role == want, &format!("{} role -> {:?}", msg, want)).await
    }

    /// Wait for `current_term` to reach at least `term`.
    pub async fn term(&self, term: u64, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.current_term >= term, &format!("{} term -> {}", msg, term)).await
    }

    /// Wait for `commit_index` to reach at least `index`.
    pub async fn commit(&self, index: u64, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.commit_index >= index, &format!("{} commit -> {}", msg, index)).await
    }
}
