//! Error types exposed by this crate.

use thiserror::Error;

/// Error variants of the RPC client channel.
///
/// A client becomes permanently terminal on the first transport failure; a
/// fresh one must be constructed to talk to the remote again.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    /// The channel to the remote has failed or was closed.
    #[error("client channel is disconnected")]
    Disconnected,
    /// An argument payload could not be encoded.
    #[error("unable to encode invocation arguments: {0}")]
    Codec(String),
}

/// Error variants of a single invocation's reply stream.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallError {
    /// The remote answered with an error frame.
    #[error("remote error [{code}]: {message}")]
    Remote { code: u32, message: String },
    /// The reply stream ended without a chunk, either cleanly or because the
    /// channel failed.
    #[error("reply stream closed without a result")]
    Closed,
    /// The reply chunk could not be decoded into the expected type.
    #[error("unable to decode reply: {0}")]
    Codec(String),
}

/// Error variants of the service resolver.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResolveError {
    /// The remote service speaks a different protocol version than the one
    /// expected by the caller.
    #[error("protocol version mismatch")]
    VersionMismatch,
    /// The remote locator does not provide the requested service.
    #[error("service is not available")]
    NotAvailable,
    /// None of the candidate endpoints could be reached.
    #[error("no endpoint could be reached: {0}")]
    Unreachable(String),
    /// The locator channel failed mid-lookup.
    #[error(transparent)]
    Channel(#[from] ClientError),
}

impl ResolveError {
    /// The stable wire code of this error.
    pub fn code(&self) -> u32 {
        match self {
            ResolveError::VersionMismatch => 1,
            ResolveError::NotAvailable => 2,
            _ => 0,
        }
    }
}

/// Error variants of the locator service.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LocatorError {
    /// Neither the local registry nor the gateway provide the service.
    #[error("service is not available")]
    ServiceNotAvailable,
    /// The routing group store could not be read; the previous routing
    /// tables remain in effect.
    #[error("routing storage is unavailable")]
    RoutingStorage,
    /// The locator task has shut down.
    #[error("locator is shutting down")]
    ShuttingDown,
}

impl LocatorError {
    /// The stable wire code of this error.
    pub fn code(&self) -> u32 {
        match self {
            LocatorError::ServiceNotAvailable => 2,
            LocatorError::RoutingStorage => 3,
            LocatorError::ShuttingDown => 0,
        }
    }
}

/// Error variants of the Raft actor's public API.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RaftError {
    /// The operation requires leadership which this node does not hold.
    #[error("this node is not the cluster leader")]
    NotLeader,
    /// The Raft task has shut down.
    #[error("raft is shutting down")]
    ShuttingDown,
}

/// Error variants of component construction through the registry.
#[derive(Debug, Error)]
pub enum ComponentError {
    /// No component of the requested kind is registered.
    #[error("component '{0}' is not registered")]
    NotFound(String),
    /// The component rejected its configuration arguments.
    #[error("component configuration rejected: {0}")]
    Config(String),
}

impl ComponentError {
    /// The stable wire code of this error.
    pub fn code(&self) -> u32 {
        match self {
            ComponentError::NotFound(_) => 4,
            ComponentError::Config(_) => 0,
        }
    }
}

/// Error variants of locator startup.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Component(#[from] ComponentError),
    /// The routing group store could not be read during initialization.
    #[error("unable to initialize routing groups")]
    Routing,
}

/// Error variants of `Config` validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The election timeout window must sit strictly above the heartbeat
    /// interval, else a healthy leader could starve its followers into
    /// campaigning.
    #[error("election timeout must be greater than the heartbeat interval")]
    ElectionTimeoutTooSmall,
    /// The election timeout window must be a valid range.
    #[error("election timeout max must be greater than election timeout min")]
    InvalidElectionTimeoutRange,
    /// At least one entry must fit into an append message.
    #[error("message size must be at least 1")]
    InvalidMessageSize,
}
