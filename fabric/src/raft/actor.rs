//! The Raft actor: the public handle and the event task behind it.
//!
//! One task per participant owns all mutable Raft state. The handle posts
//! messages into the task's mailbox; per-peer network I/O reports back
//! through the peer event channel. Everything else — elections, follower
//! bookkeeping, quorum advancement — happens inline on the task.

use std::cmp;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::error::RaftError;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::raft::cluster::Cluster;
use crate::raft::remote::PeerEvent;
use crate::raft::state::ActorState;
use crate::raft::AppendRequest;
use crate::raft::AppendResponse;
use crate::raft::ApplyRequest;
use crate::raft::ApplyResponse;
use crate::raft::Entry;
use crate::raft::LogStore;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::Config;
use crate::NodeId;
use crate::rpc::Connector;

/// A message posted through the Raft API.
pub(crate) enum ApiMsg<D: AppData> {
    Append {
        rpc: AppendRequest<D>,
        tx: oneshot::Sender<AppendResponse>,
    },
    Vote {
        rpc: VoteRequest,
        tx: oneshot::Sender<VoteResponse>,
    },
    Apply {
        rpc: ApplyRequest,
        tx: oneshot::Sender<ApplyResponse>,
    },
    Propose {
        data: D,
        tx: oneshot::Sender<Result<u64, RaftError>>,
    },
}

struct RaftInner<D: AppData, L: LogStore<D>> {
    tx_api: mpsc::UnboundedSender<ApiMsg<D>>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<()>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_l: PhantomData<fn() -> L>,
}

/// The public handle to a running Raft participant.
///
/// The handle is cheap to clone. Dropping every clone shuts the task down.
pub struct Raft<D: AppData, L: LogStore<D>> {
    inner: Arc<RaftInner<D, L>>,
}

impl<D: AppData, L: LogStore<D>> Raft<D, L> {
    /// Spawn a new Raft participant.
    ///
    /// `name` is the replicated state machine's name carried on every wire
    /// request; `members` is the full cluster membership including this
    /// node. Remote members are located by resolving
    /// `config.service_name` against the locator at their `NodeId`.
    pub fn spawn(
        id: NodeId,
        name: impl Into<String>,
        config: Arc<Config>,
        members: Vec<NodeId>,
        log: Arc<L>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_event, rx_event) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id.clone()));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();

        let state = ActorState::new(id.clone(), name.into(), config);
        let cluster = Cluster::new(state, members, log.clone(), connector, tx_event);
        let core = NodeCore {
            cluster,
            log,
            rx_api,
            rx_event,
            tx_metrics,
            rx_shutdown,
            election_deadline: Instant::now(),
        };
        let raft_handle = tokio::spawn(core.main().instrument(tracing::debug_span!("raft", id = %id)));

        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_l: PhantomData,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Submit an AppendEntries RPC to this node.
    pub async fn append_entries(&self, rpc: AppendRequest<D>) -> Result<AppendResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(ApiMsg::Append { rpc, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Submit a RequestVote RPC to this node.
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(ApiMsg::Vote { rpc, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Submit a snapshot-install RPC to this node.
    pub async fn apply(&self, rpc: ApplyRequest) -> Result<ApplyResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(ApiMsg::Apply { rpc, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Append a new entry to the replicated log. Fails with
    /// [`RaftError::NotLeader`] unless this node currently leads the
    /// cluster; returns the index of the appended entry.
    pub async fn propose(&self, data: D) -> Result<u64, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(ApiMsg::Propose { data, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shut this node down and await task termination.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

impl<D: AppData, L: LogStore<D>> Clone for Raft<D, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The event task of a Raft participant.
struct NodeCore<D: AppData, L: LogStore<D>> {
    cluster: Cluster<D, L>,
    log: Arc<L>,
    rx_api: mpsc::UnboundedReceiver<ApiMsg<D>>,
    rx_event: mpsc::UnboundedReceiver<PeerEvent>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
    election_deadline: Instant,
}

impl<D: AppData, L: LogStore<D>> NodeCore<D, L> {
    async fn main(mut self) {
        tracing::debug!("raft node is initializing");
        self.rearm_election_timer();
        self.report_metrics();

        loop {
            let deadline = self.election_deadline;
            let is_leader = self.cluster.state().is_leader();
            tokio::select! {
                msg = self.rx_api.recv() => match msg {
                    Some(msg) => self.handle_api(msg),
                    // Every handle is gone; nothing can reach us anymore.
                    None => break,
                },
                Some(event) = self.rx_event.recv() => self.handle_peer_event(event),
                _ = sleep_until(deadline), if !is_leader => self.start_election(),
                _ = &mut self.rx_shutdown => break,
            }
            self.report_metrics();
        }

        tracing::info!("raft node has shut down");
        self.cluster.shutdown();
    }

    fn handle_api(&mut self, msg: ApiMsg<D>) {
        match msg {
            ApiMsg::Append { rpc, tx } => {
                let _ = tx.send(self.handle_append(rpc));
            }
            ApiMsg::Vote { rpc, tx } => {
                let _ = tx.send(self.handle_vote(rpc));
            }
            ApiMsg::Apply { rpc, tx } => {
                let _ = tx.send(self.handle_apply(rpc));
            }
            ApiMsg::Propose { data, tx } => {
                let _ = tx.send(self.handle_propose(data));
            }
        }
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        tracing::trace!(peer = %event.peer(), "peer event");
        let was_leader = self.cluster.state().is_leader();
        self.cluster.handle_event(event);
        if was_leader && !self.cluster.state().is_leader() {
            // Leadership was lost on a newer observed term; watch for an
            // absent leader again.
            self.rearm_election_timer();
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Follower-side RPC handling.

    fn handle_append(&mut self, rpc: AppendRequest<D>) -> AppendResponse {
        let current_term = self.cluster.state().current_term();
        if rpc.name != self.cluster.state().name() || rpc.term < current_term {
            return AppendResponse {
                term: current_term,
                success: false,
            };
        }
        if rpc.term > current_term {
            self.cluster.step_down(rpc.term);
        } else if self.cluster.state().role().is_candidate() {
            // A live leader exists for our term.
            self.cluster.state_mut().become_follower();
        }
        self.rearm_election_timer();
        let current_term = self.cluster.state().current_term();

        let log = &self.log;
        let prev = rpc.prev;
        let matched = if prev.index == 0 && log.snapshot_index() == 0 {
            true
        } else if prev.index <= log.snapshot_index() {
            // Entries at or below the snapshot boundary are committed here;
            // only the boundary itself still has a term to compare.
            prev.index < log.snapshot_index() || prev.term == log.snapshot_term()
        } else if prev.index <= log.last_index() {
            log.entry(prev.index).term == prev.term
        } else {
            false
        };
        if !matched {
            tracing::debug!(prev = %prev, "discarding append request, no matching entry");
            return AppendResponse {
                term: current_term,
                success: false,
            };
        }

        let mut to_append = Vec::new();
        for (offset, entry) in rpc.entries.into_iter().enumerate() {
            let index = prev.index + 1 + offset as u64;
            if index <= log.snapshot_index() {
                continue;
            }
            if index <= log.last_index() {
                if log.entry(index).term != entry.term {
                    log.truncate(index);
                    to_append.push(entry);
                }
                // Same index and term: the entry is already stored.
            } else {
                to_append.push(entry);
            }
        }
        if !to_append.is_empty() {
            log.append(to_append);
        }

        if rpc.leader_commit > self.cluster.state().commit_index() {
            let commit = cmp::min(rpc.leader_commit, self.log.last_index());
            self.cluster.state_mut().set_commit_index(commit);
        }
        AppendResponse {
            term: current_term,
            success: true,
        }
    }

    fn handle_vote(&mut self, rpc: VoteRequest) -> VoteResponse {
        let current_term = self.cluster.state().current_term();
        if rpc.name != self.cluster.state().name() || rpc.term < current_term {
            return VoteResponse {
                term: current_term,
                granted: false,
            };
        }
        if rpc.term > current_term {
            self.cluster.step_down(rpc.term);
        }
        let current_term = self.cluster.state().current_term();

        let free_to_vote = match self.cluster.state().voted_for() {
            None => true,
            Some(candidate) => candidate == &rpc.candidate,
        };
        let up_to_date = rpc.last.term > self.log.last_term()
            || (rpc.last.term == self.log.last_term() && rpc.last.index >= self.log.last_index());

        if rpc.term == current_term && free_to_vote && up_to_date {
            tracing::debug!(candidate = %rpc.candidate, term = current_term, "granting vote");
            self.cluster.state_mut().grant_vote(rpc.candidate);
            self.rearm_election_timer();
            VoteResponse {
                term: current_term,
                granted: true,
            }
        } else {
            VoteResponse {
                term: current_term,
                granted: false,
            }
        }
    }

    fn handle_apply(&mut self, rpc: ApplyRequest) -> ApplyResponse {
        let current_term = self.cluster.state().current_term();
        if rpc.name != self.cluster.state().name() || rpc.term < current_term {
            return ApplyResponse {
                term: current_term,
                success: false,
            };
        }
        if rpc.term > current_term {
            self.cluster.step_down(rpc.term);
        } else if self.cluster.state().role().is_candidate() {
            self.cluster.state_mut().become_follower();
        }
        self.rearm_election_timer();
        let current_term = self.cluster.state().current_term();

        tracing::info!(snapshot = %rpc.snapshot, "installing snapshot from the leader");
        self.log.install_snapshot(rpc.snapshot.index, rpc.snapshot.term, rpc.data);
        let commit = cmp::min(rpc.leader_commit, self.log.last_index());
        self.cluster.state_mut().set_commit_index(commit);
        ApplyResponse {
            term: current_term,
            success: true,
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Leader-side operations.

    fn handle_propose(&mut self, data: D) -> Result<u64, RaftError> {
        if !self.cluster.state().is_leader() {
            return Err(RaftError::NotLeader);
        }
        let term = self.cluster.state().current_term();
        self.log.append(vec![Entry { term, payload: data }]);
        let index = self.log.last_index();
        self.cluster.replicate_all();
        Ok(index)
    }

    fn start_election(&mut self) {
        self.cluster.state_mut().become_candidate();
        let term = self.cluster.state().current_term();
        tracing::info!(term, "election timeout, campaigning for leadership");
        self.rearm_election_timer();
        self.cluster.request_vote_all();
    }

    fn rearm_election_timer(&mut self) {
        let timeout = self.cluster.state().options().new_rand_election_timeout();
        self.election_deadline = Instant::now() + Duration::from_millis(timeout);
    }

    fn report_metrics(&mut self) {
        let state = self.cluster.state();
        let metrics = RaftMetrics {
            id: state.id().clone(),
            role: state.role(),
            current_term: state.current_term(),
            last_log_index: self.log.last_index(),
            commit_index: state.commit_index(),
            replication: if state.is_leader() {
                Some(self.cluster.replication_metrics())
            } else {
                None
            },
        };
        if *self.tx_metrics.borrow() != metrics {
            let _ = self.tx_metrics.send(metrics);
        }
    }
}
