//! The client side of a multiplexed RPC connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::error::CallError;
use crate::error::ClientError;
use crate::rpc::Frame;
use crate::rpc::FrameKind;
use crate::rpc::Incoming;
use crate::rpc::Transport;

/// A handle to a single multiplexed connection to a remote endpoint.
///
/// The handle is cheap to clone; all clones share one underlying channel.
/// Invocations submitted through [`Client::call`] are delivered in
/// submission order. On transport failure the client becomes permanently
/// terminal: pending reply channels observe an error, the bound error
/// handler fires once, and subsequent calls fail locally.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.inner.endpoint)
            .finish()
    }
}

struct ClientInner {
    endpoint: SocketAddr,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    channels: Mutex<HashMap<u64, mpsc::UnboundedSender<Incoming>>>,
    next_channel: AtomicU64,
    broken: AtomicBool,
    on_error: Mutex<Option<Box<dyn FnOnce(ClientError) + Send>>>,
}

impl Client {
    /// Adopt a connected transport, spawning the I/O task that owns it.
    pub fn attach(endpoint: SocketAddr, transport: Box<dyn Transport>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            endpoint,
            outbound: Mutex::new(Some(tx)),
            channels: Mutex::new(HashMap::new()),
            next_channel: AtomicU64::new(1),
            broken: AtomicBool::new(false),
            on_error: Mutex::new(None),
        });

        let io = inner.clone();
        tokio::spawn(
            io_loop(io, transport, rx).instrument(tracing::debug_span!("rpc-client", endpoint = %endpoint)),
        );

        Self { inner }
    }

    /// The remote endpoint this client is connected to.
    pub fn endpoint(&self) -> SocketAddr {
        self.inner.endpoint
    }

    /// Invoke the named event and return the reply channel.
    pub fn call<A: Serialize>(&self, event: &str, args: &A) -> Result<Upstream, ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = self.invoke(event, args, Some(tx))?;
        Ok(Upstream { channel, rx })
    }

    /// Invoke the named event without a reply dispatch (fire-and-forget).
    pub fn call_mute<A: Serialize>(&self, event: &str, args: &A) -> Result<(), ClientError> {
        self.invoke(event, args, None).map(|_| ())
    }

    fn invoke<A: Serialize>(
        &self,
        event: &str,
        args: &A,
        dispatch: Option<mpsc::UnboundedSender<Incoming>>,
    ) -> Result<u64, ClientError> {
        if self.inner.broken.load(Ordering::SeqCst) {
            return Err(ClientError::Disconnected);
        }
        let args = serde_json::to_value(args).map_err(|err| ClientError::Codec(err.to_string()))?;

        let channel = self.inner.next_channel.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = dispatch {
            self.inner.channels.lock().expect("channel table poisoned").insert(channel, tx);
        }

        let outbound = {
            let guard = self.inner.outbound.lock().expect("outbound slot poisoned");
            guard.clone()
        };
        let sent = outbound
            .map(|tx| {
                tx.send(Frame {
                    channel,
                    kind: FrameKind::Invoke {
                        event: event.to_string(),
                        args,
                    },
                })
                .is_ok()
            })
            .unwrap_or(false);
        if !sent {
            self.inner.channels.lock().expect("channel table poisoned").remove(&channel);
            return Err(ClientError::Disconnected);
        }
        Ok(channel)
    }

    /// Register a callback invoked once when the channel fails. If the
    /// channel has already failed, the callback is invoked immediately.
    pub fn bind<F>(&self, handler: F)
    where F: FnOnce(ClientError) + Send + 'static {
        if self.inner.broken.load(Ordering::SeqCst) {
            handler(ClientError::Disconnected);
            return;
        }
        let mut slot = self.inner.on_error.lock().expect("error slot poisoned");
        // Re-check under the lock so a concurrent failure can't lose the
        // callback.
        if self.inner.broken.load(Ordering::SeqCst) {
            drop(slot);
            handler(ClientError::Disconnected);
        } else {
            *slot = Some(Box::new(handler));
        }
    }

    /// Tear the connection down. Idempotent; pending reply channels observe
    /// a clean end-of-stream.
    pub fn close(&self) {
        self.inner.outbound.lock().expect("outbound slot poisoned").take();
    }
}

impl Clone for Client {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl ClientInner {
    fn route(&self, frame: Frame) {
        let mut channels = self.channels.lock().expect("channel table poisoned");
        let terminal = !matches!(frame.kind, FrameKind::Chunk(_));
        let entry = if terminal {
            channels.remove(&frame.channel)
        } else {
            channels.get(&frame.channel).cloned()
        };
        let tx = match entry {
            Some(tx) => tx,
            None => return,
        };
        let incoming = match frame.kind {
            FrameKind::Chunk(value) => Incoming::Chunk(value),
            FrameKind::Error { code, message } => Incoming::Error { code, message },
            FrameKind::Choke => Incoming::Choke,
            // Invocations flow the other way; a remote sending one here is
            // a protocol violation and is dropped.
            FrameKind::Invoke { .. } => return,
        };
        let _ = tx.send(incoming);
    }

    /// Transition into the terminal state. `error` is `None` for a locally
    /// requested close, `Some` for a transport failure.
    fn fail(&self, error: Option<String>) {
        if self.broken.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbound.lock().expect("outbound slot poisoned").take();

        let drained: Vec<_> = self.channels.lock().expect("channel table poisoned").drain().collect();
        for (_, tx) in drained {
            let incoming = match &error {
                Some(message) => Incoming::Error {
                    code: 0,
                    message: message.clone(),
                },
                None => Incoming::Choke,
            };
            let _ = tx.send(incoming);
        }

        if let Some(message) = error {
            tracing::debug!(endpoint = %self.endpoint, error = %message, "connection error");
            if let Some(handler) = self.on_error.lock().expect("error slot poisoned").take() {
                handler(ClientError::Disconnected);
            }
        }
    }
}

async fn io_loop(
    inner: Arc<ClientInner>,
    mut transport: Box<dyn Transport>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) {
    let error = loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(frame) => {
                    if let Err(err) = transport.send(frame).await {
                        break Some(err.to_string());
                    }
                }
                // All senders dropped: the client was closed locally.
                None => break None,
            },
            incoming = transport.recv() => match incoming {
                Ok(Some(frame)) => inner.route(frame),
                Ok(None) => break Some("connection closed by peer".to_string()),
                Err(err) => break Some(err.to_string()),
            },
        }
    };
    inner.fail(error);
}

/// The reply channel of a single invocation.
pub struct Upstream {
    #[allow(dead_code)]
    channel: u64,
    rx: mpsc::UnboundedReceiver<Incoming>,
}

impl Upstream {
    /// Receive the next reply event; `None` once the stream is finished.
    pub async fn recv(&mut self) -> Option<Incoming> {
        self.rx.recv().await
    }

    /// Await a unary reply: a single chunk decoded as `T`. Errors, chokes
    /// without a chunk, and channel teardown all map onto [`CallError`].
    pub async fn result<T: DeserializeOwned>(mut self) -> Result<T, CallError> {
        match self.rx.recv().await {
            Some(Incoming::Chunk(value)) => {
                serde_json::from_value(value).map_err(|err| CallError::Codec(err.to_string()))
            }
            Some(Incoming::Error { code, message }) => Err(CallError::Remote { code, message }),
            Some(Incoming::Choke) | None => Err(CallError::Closed),
        }
    }
}
