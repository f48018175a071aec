//! A service-location fabric backed by a Raft-replicated routing core.
//!
//! The crate has two halves. The `raft` module implements the replication
//! engine of a single Raft participant: a cluster of per-peer replicators
//! driving vote solicitation, log replication, snapshot installation and
//! heartbeating against each remote. The `locator` module implements the
//! service-discovery endpoint which federates local service registries
//! across a cluster over long-lived synchronization streams, aggregates
//! remote services behind a pluggable gateway, and remaps routing groups
//! through consistent-hashing continuums.
//!
//! Both halves reach their remotes through the same plumbing: a multiplexed
//! RPC [`rpc::Client`] over an abstract [`rpc::Transport`], located via the
//! [`resolve::Resolver`]. The wire codec itself is supplied by the caller
//! behind the transport traits; the `memstore` companion crate provides an
//! in-memory implementation used by the test suite.

use std::fmt;
use std::fmt::Debug;
use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

pub mod config;
pub mod error;
pub mod gateway;
pub mod locator;
pub mod metrics;
pub mod raft;
pub mod registry;
pub mod resolve;
pub mod routing;
pub mod rpc;

pub use async_trait::async_trait;
pub use config::Config;
pub use error::ClientError;
pub use error::LocatorError;
pub use error::RaftError;
pub use error::ResolveError;
pub use metrics::RaftMetrics;
pub use metrics::Wait;
pub use raft::Entry;
pub use raft::LogPosition;
pub use raft::LogStore;
pub use raft::LogView;
pub use raft::Raft;
pub use raft::Role;
pub use resolve::ProtocolGraph;
pub use resolve::ResolveInfo;
pub use resolve::Resolver;
pub use rpc::Client;
pub use rpc::Connector;
pub use rpc::Transport;

/// A trait defining application specific log entry payloads.
///
/// The intention of this trait is that applications which are using this
/// crate define their own concrete payload type which implements this trait.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// The identity of a cluster member: the host and port of its locator
/// endpoint. A separate opaque UUID identifies processes at the locator
/// layer; this type identifies Raft participants.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub host: String,
    pub port: u16,
}

impl NodeId {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The node's locator endpoint. Hosts are expected to be literal
    /// addresses; name resolution belongs to the transport layer.
    pub fn endpoint(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
