//! The volatile and persistent state of the local Raft actor.

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::Config;
use crate::NodeId;

/// All possible roles of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the cluster leader.
    Leader,
}

impl Role {
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// The per-node Raft state: term, vote, commit index, role and tunables.
///
/// All writes happen on the actor's event task; peer replicators touch this
/// state only from that task.
pub struct ActorState {
    id: NodeId,
    name: String,
    options: Arc<Config>,
    current_term: u64,
    voted_for: Option<NodeId>,
    commit_index: u64,
    role: Role,
}

impl ActorState {
    pub(crate) fn new(id: NodeId, name: String, options: Arc<Config>) -> Self {
        Self {
            id,
            name,
            options,
            current_term: 0,
            voted_for: None,
            commit_index: 0,
            role: Role::Follower,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// The name of the replicated state machine this actor drives.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &Config {
        &self.options
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role.is_leader()
    }

    /// Advance the commit index. The value is monotonic; stale updates are
    /// ignored.
    pub(crate) fn set_commit_index(&mut self, index: u64) {
        if index > self.commit_index {
            self.commit_index = index;
        }
    }

    /// Transition to follower at `term` if it is newer than the current
    /// one, clearing the vote. Returns whether a transition happened; the
    /// caller is responsible for stopping leadership machinery.
    pub(crate) fn step_down(&mut self, term: u64) -> bool {
        if term <= self.current_term {
            return false;
        }
        tracing::info!(from = self.current_term, to = term, "stepping down to follower");
        self.current_term = term;
        self.voted_for = None;
        self.role = Role::Follower;
        true
    }

    /// Open a new ballot: bump the term, vote for ourselves.
    pub(crate) fn become_candidate(&mut self) {
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
    }

    pub(crate) fn become_leader(&mut self) {
        self.role = Role::Leader;
    }

    pub(crate) fn become_follower(&mut self) {
        self.role = Role::Follower;
    }

    /// Record a vote granted to `candidate` in the current term.
    pub(crate) fn grant_vote(&mut self, candidate: NodeId) {
        self.voted_for = Some(candidate);
    }
}
