//! The multiplexed RPC channel model.
//!
//! The wire codec and TCP framing are supplied by the caller behind the
//! [`Transport`] and [`Connector`] traits; this module only defines the
//! frame vocabulary and the client-side channel multiplexer. Every
//! invocation opens a logical channel; replies on that channel are a
//! sequence of `Chunk` frames terminated by either an `Error` or a `Choke`
//! (clean end-of-stream).

mod client;

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

pub use client::Client;
pub use client::Upstream;

/// A single frame on an RPC connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// The logical channel this frame belongs to.
    pub channel: u64,
    pub kind: FrameKind,
}

/// Frame payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FrameKind {
    /// An invocation of the named event, opening a new channel.
    Invoke { event: String, args: Value },
    /// A single reply value on an open channel.
    Chunk(Value),
    /// A terminal error on an open channel.
    Error { code: u32, message: String },
    /// Clean end-of-stream on an open channel.
    Choke,
}

/// An event received on an invocation's reply channel.
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming {
    Chunk(Value),
    Error { code: u32, message: String },
    Choke,
}

/// An established, ordered duplex of frames to a single remote.
///
/// Implementations are expected to preserve the submission order of sent
/// frames and to report transport failure through the error channel of both
/// methods. A `recv` of `Ok(None)` is a clean close by the peer.
#[async_trait]
pub trait Transport: Send + std::fmt::Debug + 'static {
    async fn send(&mut self, frame: Frame) -> io::Result<()>;
    async fn recv(&mut self) -> io::Result<Option<Frame>>;
}

/// A factory of [`Transport`]s, one per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: SocketAddr) -> io::Result<Box<dyn Transport>>;
}
