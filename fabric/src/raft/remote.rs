//! Per-peer replication state.
//!
//! One [`RemoteNode`] per cluster member, owned by the cluster and mutated
//! only on the actor's event task. Network I/O happens in short spawned
//! tasks which post their outcome back into the actor mailbox as
//! [`PeerEvent`]s tagged with the peer's generation; events carrying a
//! stale generation are silently dropped, which is how outstanding requests
//! are cancelled without revoking the transport.

use futures::future::AbortHandle;

use crate::rpc::Client;
use crate::rpc::Upstream;
use crate::NodeId;

/// The state of an outstanding append or snapshot-install request.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AppendCall {
    /// The index of the last entry shipped with this request; 0 until the
    /// request is actually serialized.
    pub(crate) last_index: u64,
}

/// What a peer wants to do with its connection once one exists.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Intent {
    Vote,
    Append,
    Heartbeat,
}

/// An event posted back to the actor task by a peer's I/O tasks.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    /// A connection attempt finished.
    Connected {
        id: NodeId,
        generation: u64,
        result: Result<Client, String>,
    },
    /// The peer's client channel failed.
    Disconnected { id: NodeId, generation: u64 },
    /// A vote request completed; `None` for RPC failure.
    VoteReply {
        id: NodeId,
        generation: u64,
        result: Option<(u64, bool)>,
    },
    /// An append or snapshot-install request completed; `None` for RPC
    /// failure.
    AppendReply {
        id: NodeId,
        generation: u64,
        result: Option<(u64, bool)>,
    },
    /// The peer's heartbeat timer fired.
    Tick { id: NodeId },
}

impl PeerEvent {
    pub(crate) fn peer(&self) -> &NodeId {
        match self {
            PeerEvent::Connected { id, .. }
            | PeerEvent::Disconnected { id, .. }
            | PeerEvent::VoteReply { id, .. }
            | PeerEvent::AppendReply { id, .. }
            | PeerEvent::Tick { id } => id,
        }
    }
}

/// Replication state for a single remote peer.
pub(crate) struct RemoteNode {
    pub(crate) id: NodeId,

    /// The next log entry to send to the peer.
    pub(crate) next_index: u64,
    /// The last entry known to be replicated on the peer.
    pub(crate) match_index: u64,
    /// The last term in which the peer voted for us.
    pub(crate) won_term: u64,

    /// The cancellation generation. Bumped on every reset; events tagged
    /// with an older generation are discarded.
    pub(crate) generation: u64,
    /// Whether a vote request is outstanding.
    pub(crate) vote_state: bool,
    /// The outstanding append request, if any.
    pub(crate) append_state: Option<AppendCall>,

    pub(crate) client: Option<Client>,
    /// Whether a resolver is currently looking the peer up.
    pub(crate) connecting: bool,
    /// Whether a heartbeat is waiting for the connection to come up.
    pub(crate) pending_heartbeat: bool,

    /// The heartbeat timer task; armed only while we are the leader.
    pub(crate) heartbeat: Option<AbortHandle>,
}

impl RemoteNode {
    pub(crate) fn new(id: NodeId, last_index: u64) -> Self {
        Self {
            id,
            next_index: std::cmp::max(1, last_index),
            match_index: 0,
            won_term: 0,
            generation: 0,
            vote_state: false,
            append_state: None,
            client: None,
            connecting: false,
            pending_heartbeat: false,
            heartbeat: None,
        }
    }

    /// Drop outstanding requests and tear the connection down. Any I/O task
    /// still in flight observes a stale generation and is ignored.
    pub(crate) fn reset(&mut self) {
        self.generation += 1;
        self.vote_state = false;
        self.append_state = None;
        self.connecting = false;
        self.pending_heartbeat = false;
        if let Some(client) = self.client.take() {
            client.close();
        }
    }

    pub(crate) fn stop_heartbeat(&mut self) {
        if let Some(timer) = self.heartbeat.take() {
            timer.abort();
        }
    }
}

/// Collapse a raft reply stream into the result shape the handlers expect:
/// one `(term, success)` chunk, or `None` for an error, a choke without a
/// chunk, or channel teardown.
pub(crate) async fn unary(upstream: Upstream) -> Option<(u64, bool)> {
    upstream.result::<(u64, bool)>().await.ok()
}
