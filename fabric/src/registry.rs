//! The component registry: pluggable gateways and cluster discovery
//! drivers, wired at startup from `{ kind, args }` configuration sections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::error::ComponentError;
use crate::gateway::Gateway;
use crate::gateway::RoundRobin;
use crate::locator::LocatorLink;

/// A cluster discovery driver. The driver announces peers to the locator
/// through the [`LocatorLink`] it is constructed with; the returned object
/// only pins the driver's lifetime to the locator's.
pub trait Discovery: Send + 'static {}

type GatewayFactory = dyn Fn(&Value) -> Result<Arc<dyn Gateway>, ComponentError> + Send + Sync;
type DiscoveryFactory = dyn Fn(&Value, LocatorLink) -> Result<Box<dyn Discovery>, ComponentError> + Send + Sync;

/// The registry of component factories, keyed by type name.
#[derive(Default)]
pub struct Registry {
    gateways: HashMap<String, Box<GatewayFactory>>,
    discoveries: HashMap<String, Box<DiscoveryFactory>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in components: the `"round-robin"`
    /// gateway and the `"static"` discovery driver.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_gateway("round-robin", |_| Ok(Arc::new(RoundRobin::new())));
        registry.register_discovery("static", |args, link| {
            let nodes = StaticNodes::deserialize(args).map_err(|err| ComponentError::Config(err.to_string()))?;
            for (uuid, endpoints) in nodes.nodes {
                link.link_node(uuid, endpoints);
            }
            Ok(Box::new(StaticDiscovery))
        });
        registry
    }

    pub fn register_gateway<F>(&mut self, kind: impl Into<String>, factory: F)
    where F: Fn(&Value) -> Result<Arc<dyn Gateway>, ComponentError> + Send + Sync + 'static {
        self.gateways.insert(kind.into(), Box::new(factory));
    }

    pub fn register_discovery<F>(&mut self, kind: impl Into<String>, factory: F)
    where F: Fn(&Value, LocatorLink) -> Result<Box<dyn Discovery>, ComponentError> + Send + Sync + 'static {
        self.discoveries.insert(kind.into(), Box::new(factory));
    }

    /// Construct the gateway of the given kind.
    pub fn gateway(&self, kind: &str, args: &Value) -> Result<Arc<dyn Gateway>, ComponentError> {
        let factory = self.gateways.get(kind).ok_or_else(|| ComponentError::NotFound(kind.to_string()))?;
        factory(args)
    }

    /// Construct the discovery driver of the given kind.
    pub fn discovery(&self, kind: &str, args: &Value, link: LocatorLink) -> Result<Box<dyn Discovery>, ComponentError> {
        let factory = self.discoveries.get(kind).ok_or_else(|| ComponentError::NotFound(kind.to_string()))?;
        factory(args, link)
    }
}

/// The arguments of the `"static"` discovery driver: a fixed map of peer
/// UUIDs to their locator endpoints, announced once at startup.
#[derive(Debug, Deserialize)]
struct StaticNodes {
    #[serde(default)]
    nodes: HashMap<String, Vec<SocketAddr>>,
}

struct StaticDiscovery;

impl Discovery for StaticDiscovery {}
