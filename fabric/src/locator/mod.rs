//! The locator: the service-discovery endpoint of a fabric process.
//!
//! One task per process owns the local service registry, the outbound
//! synchronization streams to every peer that called `connect` on us, the
//! inbound sessions to every peer we linked to, and the routing-group
//! table. The public [`Locator`] handle posts messages into the task.

mod remote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::LocatorError;
use crate::error::StartError;
use crate::gateway::Gateway;
use crate::locator::remote::RemoteSession;
use crate::registry::Discovery;
use crate::registry::Registry;
use crate::resolve::ResolveInfo;
use crate::routing::Continuum;
use crate::routing::GroupDefinition;
use crate::routing::GroupStore;
use crate::routing::GROUPS_COLLECTION;
use crate::routing::GROUP_TAGS;
use crate::rpc::Client;
use crate::rpc::Connector;

/// One update on a synchronization stream: the announcing node's uuid and
/// a batch of service changes. A service announced with no endpoints has
/// been deactivated on the announcing node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectUpdate {
    pub uuid: String,
    pub services: BTreeMap<String, ResolveInfo>,
}

/// The receiving half of a synchronization stream opened via `connect`.
pub type ConnectStream = mpsc::UnboundedReceiver<ConnectUpdate>;

/// A `{ kind, args }` component section resolved through the registry.
#[derive(Clone, Debug)]
pub struct ComponentConfig {
    pub kind: String,
    pub args: Value,
}

impl ComponentConfig {
    pub fn new(kind: impl Into<String>, args: Value) -> Self {
        Self {
            kind: kind.into(),
            args,
        }
    }
}

/// The locator's configuration.
#[derive(Clone, Debug)]
pub struct LocatorConfig {
    /// The instance name. Always part of the restricted set: a locator
    /// never announces itself.
    pub name: String,
    /// The process identity; random when not configured.
    pub uuid: String,
    /// Service names that must never be advertised to peers.
    pub restricted: BTreeSet<String>,
    /// The cluster discovery driver, if clustering is enabled.
    pub cluster: Option<ComponentConfig>,
    /// The gateway aggregating remote services, if configured.
    pub gateway: Option<ComponentConfig>,
}

impl LocatorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut restricted = BTreeSet::new();
        restricted.insert(name.clone());
        Self {
            name,
            uuid: Uuid::new_v4().to_string(),
            restricted,
            cluster: None,
            gateway: None,
        }
    }

    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    pub fn restrict(mut self, name: impl Into<String>) -> Self {
        self.restricted.insert(name.into());
        self
    }

    pub fn cluster(mut self, component: ComponentConfig) -> Self {
        self.cluster = Some(component);
        self
    }

    pub fn gateway(mut self, component: ComponentConfig) -> Self {
        self.gateway = Some(component);
        self
    }
}

/// A message posted into the locator task.
pub(crate) enum LocatorMsg {
    Resolve {
        name: String,
        seed: String,
        tx: oneshot::Sender<Result<ResolveInfo, LocatorError>>,
    },
    Connect {
        uuid: String,
        tx: oneshot::Sender<ConnectStream>,
    },
    Refresh {
        groups: Vec<String>,
        tx: oneshot::Sender<Result<(), LocatorError>>,
    },
    Cluster {
        tx: oneshot::Sender<BTreeMap<String, SocketAddr>>,
    },
    Exposed {
        name: String,
        info: ResolveInfo,
    },
    Removed {
        name: String,
    },
    LinkNode {
        uuid: String,
        endpoints: Vec<SocketAddr>,
    },
    DropNode {
        uuid: String,
    },
    LinkEstablished {
        uuid: String,
        client: Client,
        endpoint: SocketAddr,
    },
    Announce {
        uuid: String,
        update: ConnectUpdate,
    },
    SessionEnded {
        uuid: String,
    },
    Shutdown {
        tx: oneshot::Sender<()>,
    },
}

/// The handle used by discovery drivers to announce cluster membership
/// changes to the locator.
#[derive(Clone)]
pub struct LocatorLink {
    tx: mpsc::UnboundedSender<LocatorMsg>,
}

impl LocatorLink {
    /// Link a newly discovered node reachable at the given locator
    /// endpoints.
    pub fn link_node(&self, uuid: impl Into<String>, endpoints: Vec<SocketAddr>) {
        let _ = self.tx.send(LocatorMsg::LinkNode {
            uuid: uuid.into(),
            endpoints,
        });
    }

    /// Disconnect a departed node.
    pub fn drop_node(&self, uuid: impl Into<String>) {
        let _ = self.tx.send(LocatorMsg::DropNode { uuid: uuid.into() });
    }
}

/// The public handle to a running locator.
#[derive(Clone)]
pub struct Locator {
    tx: mpsc::UnboundedSender<LocatorMsg>,
    uuid: String,
}

impl Locator {
    /// Construct the configured components, load the routing groups from
    /// the store, and spawn the locator task.
    pub async fn spawn(
        cfg: LocatorConfig,
        registry: &Registry,
        connector: Arc<dyn Connector>,
        store: Arc<dyn GroupStore>,
    ) -> Result<Locator, StartError> {
        let gateway = match &cfg.gateway {
            Some(component) => {
                tracing::info!(kind = %component.kind, "using gateway as a cluster accessor");
                Some(registry.gateway(&component.kind, &component.args)?)
            }
            None => None,
        };

        let mut routers = HashMap::new();
        let groups = store.find(GROUPS_COLLECTION, GROUP_TAGS).await.map_err(|_| StartError::Routing)?;
        if !groups.is_empty() {
            tracing::info!(count = groups.len(), "populating routing groups");
        }
        for name in groups {
            let definition = store.read(GROUPS_COLLECTION, &name).await.map_err(|_| StartError::Routing)?;
            match Continuum::new(&name, &definition) {
                Some(continuum) => {
                    routers.insert(name, continuum);
                }
                None => tracing::warn!(group = %name, "skipping empty routing group"),
            }
        }

        if !cfg.restricted.is_empty() {
            tracing::info!(count = cfg.restricted.len(), services = ?cfg.restricted, "restricting services");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Locator {
            tx: tx.clone(),
            uuid: cfg.uuid.clone(),
        };

        let discovery = match &cfg.cluster {
            Some(component) => {
                tracing::info!(kind = %component.kind, "using driver for cluster discovery");
                Some(registry.discovery(&component.kind, &component.args, handle.link())?)
            }
            None => None,
        };

        let uuid = cfg.uuid.clone();
        let core = LocatorCore {
            has_cluster: cfg.cluster.is_some(),
            cfg,
            gateway,
            discovery,
            connector,
            store,
            services: BTreeMap::new(),
            snapshot: BTreeMap::new(),
            streams: HashMap::new(),
            remotes: HashMap::new(),
            routers,
            tx_self: tx,
        };
        tokio::spawn(core.main(rx).instrument(tracing::debug_span!("locator", uuid = %uuid)));

        Ok(handle)
    }

    /// The process identity announced to peers.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// A link handle for discovery drivers.
    pub fn link(&self) -> LocatorLink {
        LocatorLink { tx: self.tx.clone() }
    }

    /// Resolve a service, remapping routing-group names through the
    /// routing table first.
    pub async fn resolve(&self, name: &str, seed: &str) -> Result<ResolveInfo, LocatorError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(LocatorMsg::Resolve {
                name: name.to_string(),
                seed: seed.to_string(),
                tx,
            })
            .map_err(|_| LocatorError::ShuttingDown)?;
        rx.await.map_err(|_| LocatorError::ShuttingDown)?
    }

    /// Open a synchronization stream for the remote node `uuid`. The
    /// stream carries the current snapshot followed by every local service
    /// change; it closes immediately when no cluster is configured.
    pub async fn connect(&self, uuid: &str) -> Result<ConnectStream, LocatorError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(LocatorMsg::Connect {
                uuid: uuid.to_string(),
                tx,
            })
            .map_err(|_| LocatorError::ShuttingDown)?;
        rx.await.map_err(|_| LocatorError::ShuttingDown)
    }

    /// Reload the named routing groups from the authoritative store.
    pub async fn refresh(&self, groups: Vec<String>) -> Result<(), LocatorError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(LocatorMsg::Refresh { groups, tx })
            .map_err(|_| LocatorError::ShuttingDown)?;
        rx.await.map_err(|_| LocatorError::ShuttingDown)?
    }

    /// The remote endpoint of every currently linked peer.
    pub async fn cluster(&self) -> Result<BTreeMap<String, SocketAddr>, LocatorError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(LocatorMsg::Cluster { tx }).map_err(|_| LocatorError::ShuttingDown)?;
        rx.await.map_err(|_| LocatorError::ShuttingDown)
    }

    /// Signal that a local service has been exposed.
    pub fn expose(&self, name: impl Into<String>, info: ResolveInfo) {
        let _ = self.tx.send(LocatorMsg::Exposed {
            name: name.into(),
            info,
        });
    }

    /// Signal that a local service has been removed.
    pub fn retract(&self, name: impl Into<String>) {
        let _ = self.tx.send(LocatorMsg::Removed { name: name.into() });
    }

    /// Shut the locator down: close every outbound stream, disconnect all
    /// remote nodes and release the cluster components.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(LocatorMsg::Shutdown { tx }).is_ok() {
            let _ = rx.await;
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The locator task state.
struct LocatorCore {
    cfg: LocatorConfig,
    has_cluster: bool,
    gateway: Option<Arc<dyn Gateway>>,
    /// Kept only to pin the discovery driver's lifetime to ours.
    discovery: Option<Box<dyn Discovery>>,
    connector: Arc<dyn Connector>,
    store: Arc<dyn GroupStore>,

    /// All locally exposed services, consulted by `resolve`.
    services: BTreeMap<String, ResolveInfo>,
    /// The announced subset of `services`: everything not restricted.
    snapshot: BTreeMap<String, ResolveInfo>,
    /// Outbound synchronization streams, keyed by remote uuid.
    streams: HashMap<String, mpsc::UnboundedSender<ConnectUpdate>>,
    /// Inbound sessions to the peers we have linked to.
    remotes: HashMap<String, RemoteSession>,
    /// The routing-group table.
    routers: HashMap<String, Continuum>,

    tx_self: mpsc::UnboundedSender<LocatorMsg>,
}

impl LocatorCore {
    async fn main(mut self, mut rx: mpsc::UnboundedReceiver<LocatorMsg>) {
        loop {
            let msg = match rx.recv().await {
                Some(msg) => msg,
                None => break,
            };
            match msg {
                LocatorMsg::Resolve { name, seed, tx } => {
                    let _ = tx.send(self.on_resolve(&name, &seed));
                }
                LocatorMsg::Connect { uuid, tx } => {
                    let _ = tx.send(self.on_connect(uuid));
                }
                LocatorMsg::Refresh { groups, tx } => {
                    let _ = tx.send(self.on_refresh(groups).await);
                }
                LocatorMsg::Cluster { tx } => {
                    let _ = tx.send(self.on_cluster());
                }
                LocatorMsg::Exposed { name, info } => self.on_service(name, info, true),
                LocatorMsg::Removed { name } => self.on_service(name, ResolveInfo::default(), false),
                LocatorMsg::LinkNode { uuid, endpoints } => self.on_link_node(uuid, endpoints),
                LocatorMsg::DropNode { uuid } => self.drop_node(&uuid),
                LocatorMsg::LinkEstablished {
                    uuid,
                    client,
                    endpoint,
                } => self.on_link_established(uuid, client, endpoint),
                LocatorMsg::Announce { uuid, update } => self.on_announce(uuid, update),
                LocatorMsg::SessionEnded { uuid } => self.drop_node(&uuid),
                LocatorMsg::Shutdown { tx } => {
                    self.on_shutdown();
                    let _ = tx.send(());
                    return;
                }
            }
        }
        self.on_shutdown();
    }

    fn on_resolve(&self, name: &str, seed: &str) -> Result<ResolveInfo, LocatorError> {
        let remapped = match self.routers.get(name) {
            Some(continuum) if seed.is_empty() => continuum.get().to_string(),
            Some(continuum) => continuum.get_seeded(seed).to_string(),
            None => name.to_string(),
        };
        if let Some(info) = self.services.get(&remapped) {
            tracing::debug!(service = %remapped, "providing service using the local registry");
            return Ok(info.clone());
        }
        match &self.gateway {
            Some(gateway) => gateway.resolve(&remapped),
            None => Err(LocatorError::ServiceNotAvailable),
        }
    }

    fn on_connect(&mut self, uuid: String) -> ConnectStream {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.has_cluster {
            // No cluster means there are no streams; dropping the sender
            // closes the stream right away.
            return rx;
        }
        if self.streams.remove(&uuid).is_some() {
            tracing::warn!(uuid = %uuid, "replacing stale synchronization stream for remote node");
        } else {
            tracing::info!(uuid = %uuid, "creating synchronization stream for remote node");
        }
        if !self.snapshot.is_empty() {
            let _ = tx.send(ConnectUpdate {
                uuid: self.cfg.uuid.clone(),
                services: self.snapshot.clone(),
            });
        }
        self.streams.insert(uuid, tx);
        rx
    }

    async fn on_refresh(&mut self, groups: Vec<String>) -> Result<(), LocatorError> {
        let mut values: HashMap<String, GroupDefinition> = HashMap::new();
        let active = self
            .store
            .find(GROUPS_COLLECTION, GROUP_TAGS)
            .await
            .map_err(|_| LocatorError::RoutingStorage)?;
        for name in &groups {
            if !active.contains(name) {
                continue;
            }
            let definition = self
                .store
                .read(GROUPS_COLLECTION, name)
                .await
                .map_err(|_| LocatorError::RoutingStorage)?;
            values.insert(name.clone(), definition);
        }

        for name in &groups {
            // Continuums can't be updated in place, only erased and
            // reconstructed; refresh replaces the whole entry.
            self.routers.remove(name);
            let updated = match values.get(name).and_then(|definition| Continuum::new(name, definition)) {
                Some(continuum) => {
                    self.routers.insert(name.clone(), continuum);
                    true
                }
                None => false,
            };
            tracing::info!(group = %name, "{} routing group", if updated { "updated" } else { "removed" });
        }
        Ok(())
    }

    fn on_cluster(&self) -> BTreeMap<String, SocketAddr> {
        self.remotes
            .iter()
            .map(|(uuid, session)| (uuid.clone(), session.endpoint))
            .collect()
    }

    /// A local service signal: update the registry, then push one update to
    /// every open synchronization stream unless the name is restricted.
    fn on_service(&mut self, name: String, info: ResolveInfo, active: bool) {
        if active {
            self.services.insert(name.clone(), info.clone());
        } else {
            self.services.remove(&name);
        }
        if self.cfg.restricted.contains(&name) {
            return;
        }

        if !self.streams.is_empty() {
            let mut services = BTreeMap::new();
            services.insert(name.clone(), info.clone());
            let update = ConnectUpdate {
                uuid: self.cfg.uuid.clone(),
                services,
            };
            // A failed write evicts the stream.
            self.streams.retain(|_, tx| tx.send(update.clone()).is_ok());
            tracing::debug!(service = %name, nodes = self.streams.len(), "synchronized metadata with remote nodes");
        }

        if active {
            self.snapshot.insert(name, info);
        } else {
            self.snapshot.remove(&name);
        }
    }

    fn on_link_node(&mut self, uuid: String, endpoints: Vec<SocketAddr>) {
        if self.gateway.is_none() || self.remotes.contains_key(&uuid) || uuid == self.cfg.uuid {
            return;
        }
        tracing::info!(uuid = %uuid, routes = endpoints.len(), "initiating link to remote node");
        tokio::spawn(remote::run(
            uuid,
            endpoints,
            self.cfg.uuid.clone(),
            self.connector.clone(),
            self.tx_self.clone(),
        ));
    }

    fn on_link_established(&mut self, uuid: String, client: Client, endpoint: SocketAddr) {
        if self.remotes.contains_key(&uuid) {
            // A concurrent link attempt won the race.
            client.close();
            return;
        }
        self.remotes.insert(
            uuid,
            RemoteSession {
                client,
                endpoint,
                active: Default::default(),
            },
        );
    }

    fn on_announce(&mut self, uuid: String, update: ConnectUpdate) {
        if !self.remotes.contains_key(&uuid) {
            return;
        }
        if update.uuid != uuid {
            tracing::error!(expected = %uuid, announced = %update.uuid, "remote node id mismatch");
            self.drop_node(&uuid);
            return;
        }
        let gateway = match &self.gateway {
            Some(gateway) => gateway.clone(),
            None => return,
        };
        let session = self.remotes.get_mut(&uuid).expect("presence checked above");
        for (name, info) in &update.services {
            // Deactivated services are announced with no endpoints.
            if info.endpoints.is_empty() {
                gateway.cleanup(&uuid, name);
                session.active.remove(name);
            } else {
                gateway.consume(&uuid, name, info.clone());
                session.active.insert(name.clone());
            }
        }
        tracing::info!(uuid = %uuid, services = update.services.len(), "remote node updated services");
    }

    /// Stop synchronizing with a node in both directions: tear down our
    /// session to it and any stream it holds to us.
    fn drop_node(&mut self, uuid: &str) {
        if self.gateway.is_some() {
            if let Some(session) = self.remotes.remove(uuid) {
                tracing::info!(uuid = %uuid, "stopping synchronization with remote node");
                if let Some(gateway) = &self.gateway {
                    for name in &session.active {
                        gateway.cleanup(uuid, name);
                    }
                }
                session.client.close();
            }
        }
        // Chances are, this node is also connected back to us as a consumer.
        self.streams.remove(uuid);
    }

    fn on_shutdown(&mut self) {
        if !self.streams.is_empty() {
            tracing::debug!(count = self.streams.len(), "cleaning up remote node streams");
        }
        self.streams.clear();

        if !self.remotes.is_empty() {
            tracing::debug!(count = self.remotes.len(), "cleaning up remote node clients");
        }
        for (uuid, session) in self.remotes.drain() {
            if let Some(gateway) = &self.gateway {
                for name in &session.active {
                    gateway.cleanup(&uuid, name);
                }
            }
            session.client.close();
        }

        tracing::debug!("shutting down distributed components");
        self.discovery = None;
    }
}
