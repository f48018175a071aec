//! The cluster: the set of per-peer replicators plus the quorum logic.
//!
//! All methods run on the actor's event task. Peer I/O is pushed out into
//! short spawned tasks which report back through the shared event channel;
//! the cluster is the single serialization point for the state read by
//! quorum arithmetic.

use std::cmp;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::future::AbortHandle;
use futures::future::Abortable;
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::raft::remote;
use crate::raft::remote::AppendCall;
use crate::raft::remote::Intent;
use crate::raft::remote::PeerEvent;
use crate::raft::remote::RemoteNode;
use crate::raft::state::ActorState;
use crate::raft::AppendRequest;
use crate::raft::ApplyRequest;
use crate::raft::Entry;
use crate::raft::LogPosition;
use crate::raft::LogStore;
use crate::raft::VoteRequest;
use crate::raft::PROTOCOL_VERSION;
use crate::resolve::Resolver;
use crate::rpc::Client;
use crate::rpc::Connector;
use crate::AppData;
use crate::NodeId;

pub(crate) struct Cluster<D: AppData, L: LogStore<D>> {
    state: ActorState,
    log: Arc<L>,
    connector: Arc<dyn Connector>,
    peers: BTreeMap<NodeId, RemoteNode>,
    tx_event: mpsc::UnboundedSender<PeerEvent>,
    _marker: PhantomData<fn() -> D>,
}

impl<D: AppData, L: LogStore<D>> Cluster<D, L> {
    pub(crate) fn new(
        state: ActorState,
        members: Vec<NodeId>,
        log: Arc<L>,
        connector: Arc<dyn Connector>,
        tx_event: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        let last_index = log.last_index();
        let mut peers = BTreeMap::new();
        for id in members {
            peers.insert(id.clone(), RemoteNode::new(id, last_index));
        }
        // The local node stays in the peer set so quorum arithmetic counts
        // it; its vote and replication short-circuit to local updates.
        let self_id = state.id().clone();
        peers
            .entry(self_id.clone())
            .or_insert_with(|| RemoteNode::new(self_id, last_index));

        Self {
            state,
            log,
            connector,
            peers,
            tx_event,
            _marker: PhantomData,
        }
    }

    pub(crate) fn state(&self) -> &ActorState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut ActorState {
        &mut self.state
    }

    /// The match index of every peer, for metrics.
    pub(crate) fn replication_metrics(&self) -> BTreeMap<NodeId, u64> {
        self.peers.iter().map(|(id, peer)| (id.clone(), peer.match_index)).collect()
    }

    //////////////////////////////////////////////////////////////////////////
    // Public operations driven by the actor.

    /// Solicit a vote from every cluster member for the current term.
    pub(crate) fn request_vote_all(&mut self) {
        let ids: Vec<NodeId> = self.peers.keys().cloned().collect();
        for id in ids {
            self.request_vote(&id);
        }
    }

    /// Solicit a vote from one member. A peer which already voted for us in
    /// this term is not asked again; the local node registers its vote
    /// directly.
    pub(crate) fn request_vote(&mut self, id: &NodeId) {
        let current_term = self.state.current_term();
        let self_id = self.state.id().clone();
        let peer = match self.peers.get_mut(id) {
            Some(peer) => peer,
            None => return,
        };
        if peer.won_term >= current_term {
            return;
        }
        if peer.id == self_id {
            peer.won_term = current_term;
            self.register_vote();
            return;
        }
        if peer.vote_state {
            return;
        }
        peer.vote_state = true;
        self.with_connection(id, Intent::Vote);
    }

    /// Drive replication to every member after the log has grown.
    pub(crate) fn replicate_all(&mut self) {
        let ids: Vec<NodeId> = self.peers.keys().cloned().collect();
        for id in ids {
            self.replicate(&id);
        }
    }

    /// Drive replication to one member. Does nothing when an append is
    /// already outstanding, we are not the leader, or the peer is caught up.
    pub(crate) fn replicate(&mut self, id: &NodeId) {
        let self_id = self.state.id().clone();
        let is_leader = self.state.is_leader();
        let last_index = self.log.last_index();
        let peer = match self.peers.get_mut(id) {
            Some(peer) => peer,
            None => return,
        };
        if peer.id == self_id {
            peer.match_index = last_index;
            self.update_commit_index();
            return;
        }
        if peer.append_state.is_none() && is_leader && last_index >= peer.next_index {
            peer.append_state = Some(AppendCall { last_index: 0 });
            self.with_connection(id, Intent::Append);
        }
    }

    /// Arm the heartbeat timers and reset replication progress; called on
    /// the leadership transition.
    pub(crate) fn begin_leadership(&mut self) {
        let last_index = self.log.last_index();
        let period = Duration::from_millis(self.state.options().heartbeat_interval);
        let ids: Vec<NodeId> = self.peers.keys().cloned().collect();
        for id in ids {
            let tx = self.tx_event.clone();
            let peer = self.peers.get_mut(&id).expect("peer set is fixed");
            peer.stop_heartbeat();
            // Replication progress from any previous leadership is unknown.
            peer.match_index = 0;
            peer.next_index = cmp::max(1, last_index);

            let (handle, registration) = AbortHandle::new_pair();
            let ticker = async move {
                let mut ticks = interval(period);
                loop {
                    ticks.tick().await;
                    if tx.send(PeerEvent::Tick { id: id.clone() }).is_err() {
                        break;
                    }
                }
            };
            tokio::spawn(Abortable::new(ticker, registration));
            peer.heartbeat = Some(handle);
        }
    }

    /// Stop the heartbeat timers and reset every peer; called when
    /// leadership is lost or the actor shuts down.
    pub(crate) fn finish_leadership(&mut self) {
        for peer in self.peers.values_mut() {
            peer.stop_heartbeat();
            peer.reset();
        }
    }

    /// Step down to follower at `term` if it is newer than the current one,
    /// stopping the leadership machinery.
    pub(crate) fn step_down(&mut self, term: u64) {
        let was_leader = self.state.is_leader();
        if self.state.step_down(term) && was_leader {
            self.finish_leadership();
        }
    }

    pub(crate) fn shutdown(&mut self) {
        self.finish_leadership();
    }

    //////////////////////////////////////////////////////////////////////////
    // Quorum logic.

    /// Count the votes won in the current term; on the transition to a
    /// majority, assume leadership.
    pub(crate) fn register_vote(&mut self) {
        if !self.state.role().is_candidate() {
            return;
        }
        let current_term = self.state.current_term();
        let quorum = self.peers.len() / 2 + 1;
        let votes = self.peers.values().filter(|peer| peer.won_term == current_term).count();
        tracing::debug!(votes, quorum, term = current_term, "registered a vote");
        if votes >= quorum {
            tracing::info!(term = current_term, "won the election, assuming leadership");
            self.state.become_leader();
            self.begin_leadership();
        }
    }

    /// Recompute the commit index from the quorum of match indices.
    pub(crate) fn update_commit_index(&mut self) {
        let matches: Vec<u64> = self.peers.values().map(|peer| peer.match_index).collect();
        let candidate = quorum_floor(matches);
        if candidate <= self.state.commit_index() {
            return;
        }
        // An entry from a prior term must never be committed by match count
        // alone.
        if self.term_at(candidate) != Some(self.state.current_term()) {
            return;
        }
        tracing::debug!(commit = candidate, "advancing commit index");
        self.state.set_commit_index(candidate);
    }

    /// The term of the entry at `index`, answered from the snapshot window
    /// or the snapshot boundary itself.
    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            None
        } else if index == self.log.snapshot_index() {
            Some(self.log.snapshot_term())
        } else if index > self.log.snapshot_index() && index <= self.log.last_index() {
            Some(self.log.entry(index).term)
        } else {
            None
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Peer event handling.

    pub(crate) fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected {
                id,
                generation,
                result,
            } => self.handle_connected(id, generation, result),
            PeerEvent::Disconnected { id, generation } => self.handle_disconnected(id, generation),
            PeerEvent::VoteReply {
                id,
                generation,
                result,
            } => self.handle_vote_reply(id, generation, result),
            PeerEvent::AppendReply {
                id,
                generation,
                result,
            } => self.handle_append_reply(id, generation, result),
            PeerEvent::Tick { id } => self.handle_tick(id),
        }
    }

    fn handle_connected(&mut self, id: NodeId, generation: u64, result: Result<Client, String>) {
        let tx = self.tx_event.clone();
        let peer = match self.peers.get_mut(&id) {
            Some(peer) => peer,
            None => return,
        };
        if generation != peer.generation {
            // The connection attempt was cancelled by a reset.
            if let Ok(client) = result {
                client.close();
            }
            return;
        }
        peer.connecting = false;
        match result {
            Ok(client) => {
                let bound_id = id.clone();
                let bound_generation = peer.generation;
                client.bind(move |_| {
                    let _ = tx.send(PeerEvent::Disconnected {
                        id: bound_id,
                        generation: bound_generation,
                    });
                });
                peer.client = Some(client);

                let vote = peer.vote_state;
                let append = peer.append_state.is_some();
                let heartbeat = std::mem::take(&mut peer.pending_heartbeat);
                if vote {
                    self.dispatch(&id, Intent::Vote);
                }
                if append {
                    self.dispatch(&id, Intent::Append);
                }
                if heartbeat {
                    self.dispatch(&id, Intent::Heartbeat);
                }
            }
            Err(error) => {
                tracing::debug!(peer = %id, %error, "unable to connect to the raft service");
                // Fail the pending handlers fast; a later heartbeat or
                // membership event reconnects.
                peer.vote_state = false;
                peer.append_state = None;
                peer.pending_heartbeat = false;
                peer.reset();
            }
        }
    }

    fn handle_disconnected(&mut self, id: NodeId, generation: u64) {
        let peer = match self.peers.get_mut(&id) {
            Some(peer) => peer,
            None => return,
        };
        if generation != peer.generation {
            return;
        }
        tracing::debug!(peer = %id, "connection error, resetting the peer");
        peer.reset();
    }

    fn handle_vote_reply(&mut self, id: NodeId, generation: u64, result: Option<(u64, bool)>) {
        enum Outcome {
            StepDown(u64),
            Granted,
            Ignore,
        }
        let current_term = self.state.current_term();
        let outcome = {
            let peer = match self.peers.get_mut(&id) {
                Some(peer) => peer,
                None => return,
            };
            if generation != peer.generation || !peer.vote_state {
                return;
            }
            peer.vote_state = false;
            match result {
                None => Outcome::Ignore,
                Some((term, _)) if term > current_term => Outcome::StepDown(term),
                Some((_, true)) => {
                    peer.won_term = current_term;
                    Outcome::Granted
                }
                Some((_, false)) => Outcome::Ignore,
            }
        };
        match outcome {
            Outcome::StepDown(term) => self.step_down(term),
            Outcome::Granted => self.register_vote(),
            Outcome::Ignore => {}
        }
    }

    fn handle_append_reply(&mut self, id: NodeId, generation: u64, result: Option<(u64, bool)>) {
        enum Outcome {
            StepDown(u64),
            Advanced,
            Continue,
        }
        let current_term = self.state.current_term();
        let message_size = self.state.options().message_size;
        let outcome = {
            let peer = match self.peers.get_mut(&id) {
                Some(peer) => peer,
                None => return,
            };
            if generation != peer.generation {
                return;
            }
            let call = match peer.append_state.take() {
                Some(call) => call,
                None => return,
            };
            // An RPC failure is left alone; the next heartbeat re-drives
            // replication.
            let (term, success) = match result {
                Some(result) => result,
                None => return,
            };
            if term > current_term {
                Outcome::StepDown(term)
            } else if success {
                peer.next_index = cmp::max(call.last_index + 1, peer.next_index);
                if peer.match_index < call.last_index {
                    peer.match_index = call.last_index;
                    Outcome::Advanced
                } else {
                    Outcome::Continue
                }
            } else {
                if peer.next_index > 1 {
                    // The follower discarded the request; back off to older
                    // entries by at least one and at most one message chunk.
                    peer.next_index -= cmp::min(message_size, peer.next_index - 1);
                }
                Outcome::Continue
            }
        };
        match outcome {
            Outcome::StepDown(term) => self.step_down(term),
            Outcome::Advanced => {
                self.update_commit_index();
                self.replicate(&id);
            }
            Outcome::Continue => self.replicate(&id),
        }
    }

    fn handle_tick(&mut self, id: NodeId) {
        if !self.state.is_leader() {
            return;
        }
        let self_id = self.state.id().clone();
        let last_index = self.log.last_index();
        let (is_self, busy_or_idle) = {
            let peer = match self.peers.get(&id) {
                Some(peer) => peer,
                None => return,
            };
            (peer.id == self_id, peer.append_state.is_some() || peer.next_index > last_index)
        };
        if is_self {
            self.replicate(&id);
        } else if busy_or_idle {
            // Nothing to replicate right now, but the follower still needs
            // the current commit index.
            self.with_connection(&id, Intent::Heartbeat);
        } else {
            self.replicate(&id);
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Connection maintenance and wire sends.

    /// Run `intent` against a connected client, establishing the connection
    /// first when there is none.
    fn with_connection(&mut self, id: &NodeId, intent: Intent) {
        let has_client = self.peers.get(id).map(|peer| peer.client.is_some()).unwrap_or(false);
        if has_client {
            self.dispatch(id, intent);
            return;
        }

        let service_name = self.state.options().service_name.clone();
        let peer = match self.peers.get_mut(id) {
            Some(peer) => peer,
            None => return,
        };
        if let Intent::Heartbeat = intent {
            peer.pending_heartbeat = true;
        }
        if peer.connecting {
            return;
        }
        peer.connecting = true;
        tracing::debug!(peer = %id, "client is not connected, connecting");

        let generation = peer.generation;
        let endpoint = peer.id.endpoint();
        let connector = self.connector.clone();
        let tx = self.tx_event.clone();
        let peer_id = id.clone();
        tokio::spawn(async move {
            let result = match endpoint {
                Ok(endpoint) => {
                    let resolver = Resolver::new(connector, vec![endpoint]);
                    resolver
                        .resolve(&service_name, PROTOCOL_VERSION)
                        .await
                        .map_err(|err| err.to_string())
                }
                Err(err) => Err(err.to_string()),
            };
            let _ = tx.send(PeerEvent::Connected {
                id: peer_id,
                generation,
                result,
            });
        });
    }

    fn dispatch(&mut self, id: &NodeId, intent: Intent) {
        match intent {
            Intent::Vote => self.send_vote(id),
            Intent::Append => self.send_append(id),
            Intent::Heartbeat => self.send_heartbeat(id),
        }
    }

    fn send_vote(&mut self, id: &NodeId) {
        let req = VoteRequest {
            name: self.state.name().to_string(),
            term: self.state.current_term(),
            candidate: self.state.id().clone(),
            last: LogPosition::new(self.log.last_index(), self.log.last_term()),
        };
        let peer = match self.peers.get_mut(id) {
            Some(peer) => peer,
            None => return,
        };
        let client = match peer.client.clone() {
            Some(client) => client,
            None => {
                peer.vote_state = false;
                return;
            }
        };
        tracing::debug!(peer = %id, term = req.term, "sending vote request");
        let generation = peer.generation;
        let tx = self.tx_event.clone();
        let peer_id = id.clone();
        tokio::spawn(async move {
            let result = match client.call("request_vote", &req) {
                Ok(upstream) => remote::unary(upstream).await,
                Err(_) => None,
            };
            let _ = tx.send(PeerEvent::VoteReply {
                id: peer_id,
                generation,
                result,
            });
        });
    }

    /// Ship the next batch to the peer: its missing entries, or the whole
    /// snapshot when its next entry has already been compacted away.
    fn send_append(&mut self, id: &NodeId) {
        let name = self.state.name().to_string();
        let term = self.state.current_term();
        let leader = self.state.id().clone();
        let leader_commit = self.state.commit_index();
        let message_size = self.state.options().message_size;
        let is_leader = self.state.is_leader();
        let snapshot_index = self.log.snapshot_index();
        let snapshot_term = self.log.snapshot_term();
        let last_index = self.log.last_index();

        let snapshot_blob = if self
            .peers
            .get(id)
            .map(|peer| peer.next_index <= snapshot_index)
            .unwrap_or(false)
        {
            Some(self.log.snapshot())
        } else {
            None
        };

        let peer = match self.peers.get_mut(id) {
            Some(peer) => peer,
            None => return,
        };
        let client = match (peer.client.clone(), is_leader) {
            (Some(client), true) => client,
            _ => {
                tracing::debug!(
                    peer = %id,
                    "client isn't connected or the local node is not the leader, dropping append"
                );
                peer.append_state = None;
                return;
            }
        };
        let generation = peer.generation;
        let tx = self.tx_event.clone();
        let peer_id = id.clone();

        if let Some(data) = snapshot_blob {
            // The follower is behind the snapshot boundary.
            match peer.append_state.as_mut() {
                Some(call) => call.last_index = snapshot_index,
                None => return,
            }
            let req = ApplyRequest {
                name,
                term,
                leader,
                snapshot: LogPosition::new(snapshot_index, snapshot_term),
                data,
                leader_commit,
            };
            tracing::debug!(peer = %id, term, next = peer.next_index, index = snapshot_index, "sending apply request");
            tokio::spawn(async move {
                let result = match client.call("apply", &req) {
                    Ok(upstream) => remote::unary(upstream).await,
                    Err(_) => None,
                };
                let _ = tx.send(PeerEvent::AppendReply {
                    id: peer_id,
                    generation,
                    result,
                });
            });
        } else if peer.next_index <= last_index {
            let log = &self.log;
            let prev_term = if snapshot_index + 1 == peer.next_index {
                snapshot_term
            } else {
                log.entry(peer.next_index - 1).term
            };
            let last = cmp::min(peer.next_index + message_size - 1, last_index);
            let entries: Vec<Entry<D>> = (peer.next_index..=last).map(|index| log.entry(index)).collect();
            match peer.append_state.as_mut() {
                Some(call) => call.last_index = last,
                None => return,
            }
            let req = AppendRequest {
                name,
                term,
                leader,
                prev: LogPosition::new(peer.next_index - 1, prev_term),
                entries,
                leader_commit,
            };
            tracing::debug!(peer = %id, term, next = peer.next_index, last, "sending append request");
            tokio::spawn(async move {
                let result = match client.call("append", &req) {
                    Ok(upstream) => remote::unary(upstream).await,
                    Err(_) => None,
                };
                let _ = tx.send(PeerEvent::AppendReply {
                    id: peer_id,
                    generation,
                    result,
                });
            });
        } else {
            // The log shrank under the request; release the slot and let
            // the next heartbeat re-evaluate.
            peer.append_state = None;
        }
    }

    /// Send a bodyless append. The follower only accepts the carried commit
    /// index when `prev` matches its log, so it is recomputed here instead
    /// of being left at the last shipped position.
    fn send_heartbeat(&mut self, id: &NodeId) {
        let name = self.state.name().to_string();
        let term = self.state.current_term();
        let leader = self.state.id().clone();
        let leader_commit = self.state.commit_index();
        let snapshot_index = self.log.snapshot_index();
        let snapshot_term = self.log.snapshot_term();
        let last_index = self.log.last_index();

        let prev = {
            let peer = match self.peers.get(id) {
                Some(peer) => peer,
                None => return,
            };
            if peer.client.is_none() {
                return;
            }
            if peer.next_index - 1 <= snapshot_index {
                LogPosition::new(snapshot_index, snapshot_term)
            } else if peer.next_index - 1 <= last_index {
                LogPosition::new(peer.next_index - 1, self.log.entry(peer.next_index - 1).term)
            } else {
                LogPosition::default()
            }
        };

        let peer = match self.peers.get(id) {
            Some(peer) => peer,
            None => return,
        };
        let client = match peer.client.as_ref() {
            Some(client) => client,
            None => return,
        };
        tracing::debug!(peer = %id, term, "sending heartbeat");
        let req = AppendRequest::<D> {
            name,
            term,
            leader,
            prev,
            entries: Vec::new(),
            leader_commit,
        };
        let _ = client.call_mute("append", &req);
    }
}

/// The quorum lower bound of a set of match indices: the value that a
/// majority of members have reached.
fn quorum_floor(mut matches: Vec<u64>) -> u64 {
    matches.sort_unstable_by(|a, b| b.cmp(a));
    matches[matches.len() / 2]
}
