//! The Raft replication engine.
//!
//! One [`Raft`] task per participant. The task owns the actor state, the
//! cluster of per-peer replicators, and a mailbox; remote participants are
//! reached through the RPC client behind the service resolver.

mod actor;
mod cluster;
mod log;
mod remote;
mod state;

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

pub use actor::Raft;
pub use log::LogStore;
pub use log::LogView;
pub use state::Role;

use crate::AppData;
use crate::NodeId;

/// The protocol version announced by Raft service endpoints.
pub const PROTOCOL_VERSION: u32 = 1;

/// A position in the log: an index paired with the term of the entry at it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    pub index: u64,
    pub term: u64,
}

impl LogPosition {
    pub fn new(index: u64, term: u64) -> Self {
        Self { index, term }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.term)
    }
}

/// A Raft log entry. Indices are 1-based and implied by the position of the
/// entry in the log; index 0 is reserved for the empty prefix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub term: u64,
    #[serde(bound = "D: AppData")]
    pub payload: D,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a leader to replicate log entries, and as a heartbeat
/// when `entries` is empty.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendRequest<D: AppData> {
    /// The name of the replicated state machine this request addresses.
    pub name: String,
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID.
    pub leader: NodeId,
    /// The log position immediately preceding the new entries.
    pub prev: LogPosition,
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

/// The reply to an [`AppendRequest`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
}

/// An RPC sent by candidates to gather votes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The name of the replicated state machine this request addresses.
    pub name: String,
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate: NodeId,
    /// The position of the candidate's last log entry.
    pub last: LogPosition,
}

/// The reply to a [`VoteRequest`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
}

/// An RPC sent by a leader to install its snapshot on a follower whose next
/// entry has already been compacted away.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApplyRequest {
    /// The name of the replicated state machine this request addresses.
    pub name: String,
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID.
    pub leader: NodeId,
    /// The position the snapshot covers, inclusive.
    pub snapshot: LogPosition,
    /// The snapshot blob.
    pub data: Vec<u8>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

/// The reply to an [`ApplyRequest`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ApplyResponse {
    pub term: u64,
    pub success: bool,
}
