//! Fixtures for exercising the fabric over an in-memory network.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use fabric::async_trait;
use fabric::gateway::Gateway;
use fabric::locator::Locator;
use fabric::raft::AppendRequest;
use fabric::raft::ApplyRequest;
use fabric::raft::LogPosition;
use fabric::raft::Raft;
use fabric::raft::VoteRequest;
use fabric::raft::PROTOCOL_VERSION;
use fabric::rpc::Frame;
use fabric::rpc::FrameKind;
use fabric::Config;
use fabric::Connector;
use fabric::LocatorError;
use fabric::NodeId;
use fabric::ResolveInfo;
use memstore::ClientRequest;
use memstore::MemLog;
use memstore::MemNetwork;
use memstore::MemTransport;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing_subscriber::prelude::*;

/// The state machine name used throughout the tests.
pub const MACHINE: &str = "configuration";

/// A concrete Raft type used during testing.
pub type MemRaft = Raft<ClientRequest, MemLog<ClientRequest>>;

/// Initialize the tracing system. Safe to call from every test.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// The locator endpoint of test node `i`.
pub fn node_id(i: u16) -> NodeId {
    NodeId::new("127.0.0.1", 10100 + i)
}

/// The raft service endpoint of test node `i`.
pub fn raft_addr(i: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 20100 + i))
}

/// A free-standing locator endpoint for locator tests.
pub fn locator_addr(i: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 30100 + i))
}

pub fn info_for(port: u16) -> ResolveInfo {
    ResolveInfo {
        endpoints: vec![SocketAddr::from(([127, 0, 0, 1], port))],
        version: 1,
        graph: Default::default(),
    }
}

/// Await one value from a channel within `dur`.
pub async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>, dur: Duration) -> Option<T> {
    timeout(dur, rx.recv()).await.ok().flatten()
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// The server side of the in-memory wire: accept transports, route
// invocations into a service, write replies back.

/// A service handling invocations arriving on a listener.
#[async_trait]
pub trait InvokeService: Send + Sync + 'static {
    async fn invoke(&self, event: String, args: Value, sink: Sink);
}

/// The reply channel of one invocation.
#[derive(Clone)]
pub struct Sink {
    tx: mpsc::UnboundedSender<Frame>,
    channel: u64,
}

impl Sink {
    /// Write one reply chunk; false once the connection is gone.
    pub fn chunk<T: Serialize>(&self, value: &T) -> bool {
        let value = serde_json::to_value(value).expect("reply must serialize");
        self.tx
            .send(Frame {
                channel: self.channel,
                kind: FrameKind::Chunk(value),
            })
            .is_ok()
    }

    pub fn error(&self, code: u32, message: impl Into<String>) {
        let _ = self.tx.send(Frame {
            channel: self.channel,
            kind: FrameKind::Error {
                code,
                message: message.into(),
            },
        });
    }

    pub fn choke(&self) {
        let _ = self.tx.send(Frame {
            channel: self.channel,
            kind: FrameKind::Choke,
        });
    }
}

/// Serve `service` on every transport accepted from `listener`.
pub fn serve<S: InvokeService>(mut listener: mpsc::UnboundedReceiver<MemTransport>, service: Arc<S>) {
    tokio::spawn(async move {
        while let Some(transport) = listener.recv().await {
            tokio::spawn(handle_connection(transport, service.clone()));
        }
    });
}

async fn handle_connection<S: InvokeService>(mut transport: MemTransport, service: Arc<S>) {
    use fabric::Transport;

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    loop {
        tokio::select! {
            Some(frame) = rx.recv() => {
                if transport.send(frame).await.is_err() {
                    break;
                }
            }
            incoming = transport.recv() => match incoming {
                Ok(Some(Frame { channel, kind: FrameKind::Invoke { event, args } })) => {
                    let sink = Sink { tx: tx.clone(), channel };
                    let service = service.clone();
                    tokio::spawn(async move { service.invoke(event, args, sink).await });
                }
                Ok(Some(_)) => {}
                _ => break,
            }
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Service adapters.

/// Exposes a [`MemRaft`] node over the wire protocol.
pub struct RaftService(pub MemRaft);

#[async_trait]
impl InvokeService for RaftService {
    async fn invoke(&self, event: String, args: Value, sink: Sink) {
        match event.as_str() {
            "append" => match serde_json::from_value::<AppendRequest<ClientRequest>>(args) {
                Ok(rpc) => match self.0.append_entries(rpc).await {
                    Ok(res) => {
                        sink.chunk(&(res.term, res.success));
                        sink.choke();
                    }
                    Err(_) => sink.error(0, "raft is shutting down"),
                },
                Err(err) => sink.error(0, err.to_string()),
            },
            "request_vote" => match serde_json::from_value::<VoteRequest>(args) {
                Ok(rpc) => match self.0.vote(rpc).await {
                    Ok(res) => {
                        sink.chunk(&(res.term, res.granted));
                        sink.choke();
                    }
                    Err(_) => sink.error(0, "raft is shutting down"),
                },
                Err(err) => sink.error(0, err.to_string()),
            },
            "apply" => match serde_json::from_value::<ApplyRequest>(args) {
                Ok(rpc) => match self.0.apply(rpc).await {
                    Ok(res) => {
                        sink.chunk(&(res.term, res.success));
                        sink.choke();
                    }
                    Err(_) => sink.error(0, "raft is shutting down"),
                },
                Err(err) => sink.error(0, err.to_string()),
            },
            other => sink.error(0, format!("unknown event: {}", other)),
        }
    }
}

/// A minimal locator answering `resolve` from a fixed table; what the peer
/// replicators talk to when locating remote raft services.
pub struct ResolverService {
    pub services: HashMap<String, ResolveInfo>,
}

#[async_trait]
impl InvokeService for ResolverService {
    async fn invoke(&self, event: String, args: Value, sink: Sink) {
        if event != "resolve" {
            sink.error(0, format!("unknown event: {}", event));
            return;
        }
        let (name, _seed) = match serde_json::from_value::<(String, String)>(args) {
            Ok(args) => args,
            Err(err) => {
                sink.error(0, err.to_string());
                return;
            }
        };
        match self.services.get(&name) {
            Some(info) => {
                sink.chunk(info);
                sink.choke();
            }
            None => sink.error(2, "service is not available"),
        }
    }
}

/// Exposes a real [`Locator`] over the wire protocol.
pub struct LocatorService(pub Locator);

#[async_trait]
impl InvokeService for LocatorService {
    async fn invoke(&self, event: String, args: Value, sink: Sink) {
        match event.as_str() {
            "resolve" => {
                let (name, seed) = match serde_json::from_value::<(String, String)>(args) {
                    Ok(args) => args,
                    Err(err) => return sink.error(0, err.to_string()),
                };
                match self.0.resolve(&name, &seed).await {
                    Ok(info) => {
                        sink.chunk(&info);
                        sink.choke();
                    }
                    Err(err) => sink.error(err.code(), err.to_string()),
                }
            }
            "connect" => {
                let (uuid,) = match serde_json::from_value::<(String,)>(args) {
                    Ok(args) => args,
                    Err(err) => return sink.error(0, err.to_string()),
                };
                match self.0.connect(&uuid).await {
                    Ok(mut stream) => {
                        while let Some(update) = stream.recv().await {
                            // Dropping the stream on a dead connection lets
                            // the locator evict it.
                            if !sink.chunk(&update) {
                                return;
                            }
                        }
                        sink.choke();
                    }
                    Err(err) => sink.error(err.code(), err.to_string()),
                }
            }
            "refresh" => {
                let groups = match serde_json::from_value::<Vec<String>>(args) {
                    Ok(args) => args,
                    Err(err) => return sink.error(0, err.to_string()),
                };
                match self.0.refresh(groups).await {
                    Ok(()) => {
                        sink.chunk(&());
                        sink.choke();
                    }
                    Err(err) => sink.error(err.code(), err.to_string()),
                }
            }
            "cluster" => match self.0.cluster().await {
                Ok(cluster) => {
                    sink.chunk(&cluster);
                    sink.choke();
                }
                Err(err) => sink.error(err.code(), err.to_string()),
            },
            other => sink.error(0, format!("unknown event: {}", other)),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Scripted peers.

/// Everything a scripted raft service observed, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordedCall {
    Vote { term: u64 },
    Append { prev: LogPosition, entries: usize, commit: u64 },
    Apply { snapshot: LogPosition, commit: u64 },
}

type VoteScript = Box<dyn Fn(&VoteRequest) -> (u64, bool) + Send + Sync>;
type AppendScript = Box<dyn Fn(&AppendRequest<ClientRequest>) -> (u64, bool) + Send + Sync>;
type ApplyScript = Box<dyn Fn(&ApplyRequest) -> (u64, bool) + Send + Sync>;

/// A raft service whose replies are driven by closures, recording every
/// request it sees.
pub struct ScriptedRaft {
    calls: mpsc::UnboundedSender<RecordedCall>,
    pub vote: VoteScript,
    pub append: AppendScript,
    pub apply: ApplyScript,
}

impl ScriptedRaft {
    /// A scripted service which grants votes and accepts everything.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RecordedCall>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scripted = Self {
            calls: tx,
            vote: Box::new(|req| (req.term, true)),
            append: Box::new(|req| (req.term, true)),
            apply: Box::new(|req| (req.term, true)),
        };
        (scripted, rx)
    }
}

#[async_trait]
impl InvokeService for ScriptedRaft {
    async fn invoke(&self, event: String, args: Value, sink: Sink) {
        let reply = match event.as_str() {
            "request_vote" => match serde_json::from_value::<VoteRequest>(args) {
                Ok(rpc) => {
                    let _ = self.calls.send(RecordedCall::Vote { term: rpc.term });
                    (self.vote)(&rpc)
                }
                Err(err) => return sink.error(0, err.to_string()),
            },
            "append" => match serde_json::from_value::<AppendRequest<ClientRequest>>(args) {
                Ok(rpc) => {
                    let _ = self.calls.send(RecordedCall::Append {
                        prev: rpc.prev,
                        entries: rpc.entries.len(),
                        commit: rpc.leader_commit,
                    });
                    (self.append)(&rpc)
                }
                Err(err) => return sink.error(0, err.to_string()),
            },
            "apply" => match serde_json::from_value::<ApplyRequest>(args) {
                Ok(rpc) => {
                    let _ = self.calls.send(RecordedCall::Apply {
                        snapshot: rpc.snapshot,
                        commit: rpc.leader_commit,
                    });
                    (self.apply)(&rpc)
                }
                Err(err) => return sink.error(0, err.to_string()),
            },
            other => return sink.error(0, format!("unknown event: {}", other)),
        };
        sink.chunk(&reply);
        sink.choke();
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Cluster harness.

/// An in-memory raft cluster: real nodes, scripted nodes, and the locator
/// endpoints the peer replicators resolve through.
pub struct RaftFixture {
    pub net: Arc<MemNetwork>,
    pub config: Arc<Config>,
    pub nodes: BTreeMap<u16, MemRaft>,
    pub logs: BTreeMap<u16, Arc<MemLog<ClientRequest>>>,
}

impl RaftFixture {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            net: MemNetwork::new(),
            config,
            nodes: BTreeMap::new(),
            logs: BTreeMap::new(),
        }
    }

    /// The fast test config: short heartbeats, short elections.
    pub fn quick_config() -> Arc<Config> {
        Arc::new(
            Config::build("raft".into())
                .heartbeat_interval(50)
                .election_timeout(150, 300)
                .validate()
                .expect("failed to build test config"),
        )
    }

    /// Serve the locator-side resolver for node `i`, pointing the raft
    /// service name at the node's raft endpoint.
    fn serve_resolver(&self, i: u16) {
        let mut services = HashMap::new();
        services.insert(
            self.config.service_name.clone(),
            ResolveInfo {
                endpoints: vec![raft_addr(i)],
                version: PROTOCOL_VERSION,
                graph: Default::default(),
            },
        );
        let endpoint = node_id(i).endpoint().expect("test hosts are literal addresses");
        serve(self.net.bind(endpoint), Arc::new(ResolverService { services }));
    }

    /// Spawn a real raft node as member `i`, backed by `log`.
    pub fn spawn_node(&mut self, i: u16, members: Vec<NodeId>, log: Arc<MemLog<ClientRequest>>) -> MemRaft {
        let raft = Raft::spawn(
            node_id(i),
            MACHINE,
            self.config.clone(),
            members,
            log.clone(),
            self.net.clone() as Arc<dyn Connector>,
        );
        self.serve_resolver(i);
        serve(self.net.bind(raft_addr(i)), Arc::new(RaftService(raft.clone())));
        self.nodes.insert(i, raft.clone());
        self.logs.insert(i, log);
        raft
    }

    /// Serve a scripted raft service as member `i`.
    pub fn spawn_scripted(&self, i: u16, scripted: ScriptedRaft) {
        self.serve_resolver(i);
        serve(self.net.bind(raft_addr(i)), Arc::new(scripted));
    }

    /// Spawn `n` real nodes as one cluster with empty logs.
    pub fn spawn_cluster(config: Arc<Config>, n: u16) -> Self {
        let mut fixture = Self::new(config);
        let members: Vec<NodeId> = (0..n).map(node_id).collect();
        for i in 0..n {
            fixture.spawn_node(i, members.clone(), Arc::new(MemLog::new()));
        }
        fixture
    }

    /// Wait for some real node to assume leadership.
    pub async fn wait_for_leader(&self, dur: Duration) -> Result<u16> {
        let deadline = tokio::time::Instant::now() + dur;
        loop {
            for (i, node) in &self.nodes {
                if node.metrics().borrow().role.is_leader() {
                    return Ok(*i);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("no leader emerged within {:?}", dur));
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Gateway instrumentation for locator tests.

#[derive(Clone, Debug, PartialEq)]
pub enum GatewayEvent {
    Consume { uuid: String, name: String },
    Cleanup { uuid: String, name: String },
}

/// A gateway recording every consume/cleanup while delegating to the
/// round-robin implementation.
#[derive(Debug)]
pub struct RecordingGateway {
    inner: fabric::gateway::RoundRobin,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl RecordingGateway {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gateway = Arc::new(Self {
            inner: fabric::gateway::RoundRobin::new(),
            tx,
        });
        (gateway, rx)
    }
}

impl Gateway for RecordingGateway {
    fn resolve(&self, name: &str) -> Result<ResolveInfo, LocatorError> {
        self.inner.resolve(name)
    }

    fn consume(&self, uuid: &str, name: &str, info: ResolveInfo) {
        let _ = self.tx.send(GatewayEvent::Consume {
            uuid: uuid.to_string(),
            name: name.to_string(),
        });
        self.inner.consume(uuid, name, info);
    }

    fn cleanup(&self, uuid: &str, name: &str) {
        let _ = self.tx.send(GatewayEvent::Cleanup {
            uuid: uuid.to_string(),
            name: name.to_string(),
        });
        self.inner.cleanup(uuid, name);
    }
}
