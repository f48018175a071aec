//! The service resolver.
//!
//! Given a service name, the resolver asks a remote locator for the
//! service's endpoints, verifies the protocol version, and hands back a
//! connected [`Client`] bound to one of the returned endpoints.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use lazy_static::lazy_static;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::CallError;
use crate::error::ResolveError;
use crate::rpc::Client;
use crate::rpc::Connector;

lazy_static! {
    /// The locator endpoints used when none are provided.
    static ref DEFAULT_ENDPOINTS: Vec<SocketAddr> = vec!["127.0.0.1:10053".parse().unwrap()];
}

/// A protocol graph: the method table of a service, keyed by slot id.
pub type ProtocolGraph = BTreeMap<u32, String>;

/// The description of a resolved service: where to reach it, which protocol
/// version it speaks, and its method graph.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolveInfo {
    pub endpoints: Vec<SocketAddr>,
    pub version: u32,
    pub graph: ProtocolGraph,
}

/// A resolver bound to one locator.
///
/// The locator connection is established lazily and shared; concurrent
/// lookups are serialized behind it, so resolves issued while one is in
/// flight queue up and drain in order.
pub struct Resolver {
    connector: Arc<dyn Connector>,
    endpoints: Vec<SocketAddr>,
    locator: Mutex<Option<Client>>,
}

impl Resolver {
    /// Create a resolver asking the locator reachable at `endpoints`. An
    /// empty list falls back to the default locator endpoint set.
    pub fn new(connector: Arc<dyn Connector>, endpoints: Vec<SocketAddr>) -> Self {
        let endpoints = if endpoints.is_empty() {
            DEFAULT_ENDPOINTS.clone()
        } else {
            endpoints
        };
        Self {
            connector,
            endpoints,
            locator: Mutex::new(None),
        }
    }

    /// Resolve `name` and connect to it, verifying that the advertised
    /// protocol version equals `version`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn resolve(&self, name: &str, version: u32) -> Result<Client, ResolveError> {
        let info = self.query(name).await?;
        if info.version != version {
            tracing::debug!(
                advertised = info.version,
                expected = version,
                "remote service speaks an unexpected protocol version"
            );
            return Err(ResolveError::VersionMismatch);
        }
        connect_any(&*self.connector, &info.endpoints).await
    }

    /// Ask the locator for the service metadata, reusing or establishing
    /// the shared locator connection.
    async fn query(&self, name: &str) -> Result<ResolveInfo, ResolveError> {
        let mut guard = self.locator.lock().await;
        if guard.is_none() {
            *guard = Some(connect_any(&*self.connector, &self.endpoints).await?);
        }
        let client = guard.as_ref().expect("locator client was just installed").clone();

        let upstream = match client.call("resolve", &(name, "")) {
            Ok(upstream) => upstream,
            Err(err) => {
                guard.take();
                return Err(err.into());
            }
        };
        match upstream.result::<ResolveInfo>().await {
            Ok(info) => Ok(info),
            Err(CallError::Remote { code: 2, .. }) => Err(ResolveError::NotAvailable),
            Err(err) => {
                // The locator channel is suspect; reconnect on the next call.
                guard.take();
                Err(ResolveError::Unreachable(err.to_string()))
            }
        }
    }
}

/// Connect to the first reachable endpoint of `endpoints`, in order.
async fn connect_any(connector: &dyn Connector, endpoints: &[SocketAddr]) -> Result<Client, ResolveError> {
    let mut last_error = "no endpoints to connect to".to_string();
    for endpoint in endpoints {
        match connector.connect(*endpoint).await {
            Ok(transport) => {
                tracing::debug!(%endpoint, "connected");
                return Ok(Client::attach(*endpoint, transport));
            }
            Err(err) => {
                tracing::debug!(%endpoint, error = %err, "endpoint is unreachable, trying the next one");
                last_error = err.to_string();
            }
        }
    }
    Err(ResolveError::Unreachable(last_error))
}
