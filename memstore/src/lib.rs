//! In-memory implementations of the `fabric` storage and transport traits,
//! used by the integration test suite and example setups.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use fabric::raft::Entry;
use fabric::routing::GroupDefinition;
use fabric::routing::GroupStore;
use fabric::rpc::Frame;
use fabric::AppData;
use fabric::Connector;
use fabric::LogStore;
use fabric::LogView;
use fabric::Transport;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;

/// The application data type used by the test suite.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    /// The ID of the client which submitted this request.
    pub client: String,
    /// The serial number of this request.
    pub serial: u64,
}

impl ClientRequest {
    pub fn new(client: impl Into<String>, serial: u64) -> Self {
        Self {
            client: client.into(),
            serial,
        }
    }
}

impl AppData for ClientRequest {}

//////////////////////////////////////////////////////////////////////////////////////////////////

struct LogInner<D: AppData> {
    snapshot_index: u64,
    snapshot_term: u64,
    snapshot: Vec<u8>,
    /// The materialized tail, covering `snapshot_index + 1 ..= last_index`.
    entries: Vec<Entry<D>>,
}

/// An in-memory Raft log.
pub struct MemLog<D: AppData> {
    inner: Mutex<LogInner<D>>,
}

impl<D: AppData> MemLog<D> {
    /// An empty log with no snapshot.
    pub fn new() -> Self {
        Self::with_snapshot(0, 0, Vec::new(), Vec::new())
    }

    /// A log preloaded with entries starting at index 1.
    pub fn with_entries(entries: Vec<Entry<D>>) -> Self {
        Self::with_snapshot(0, 0, Vec::new(), entries)
    }

    /// A log with a snapshot prefix at `(index, term)` followed by
    /// `entries` starting at `index + 1`.
    pub fn with_snapshot(index: u64, term: u64, snapshot: Vec<u8>, entries: Vec<Entry<D>>) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                snapshot_index: index,
                snapshot_term: term,
                snapshot,
                entries,
            }),
        }
    }
}

impl<D: AppData> Default for MemLog<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: AppData> LogView<D> for MemLog<D> {
    fn last_index(&self) -> u64 {
        let inner = self.inner.lock().expect("log mutex poisoned");
        inner.snapshot_index + inner.entries.len() as u64
    }

    fn last_term(&self) -> u64 {
        let inner = self.inner.lock().expect("log mutex poisoned");
        inner.entries.last().map(|entry| entry.term).unwrap_or(inner.snapshot_term)
    }

    fn snapshot_index(&self) -> u64 {
        self.inner.lock().expect("log mutex poisoned").snapshot_index
    }

    fn snapshot_term(&self) -> u64 {
        self.inner.lock().expect("log mutex poisoned").snapshot_term
    }

    fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().expect("log mutex poisoned").snapshot.clone()
    }

    fn entry(&self, index: u64) -> Entry<D> {
        let inner = self.inner.lock().expect("log mutex poisoned");
        let last = inner.snapshot_index + inner.entries.len() as u64;
        assert!(
            index > inner.snapshot_index && index <= last,
            "log access outside the snapshot window: index {}, window ({}, {}]",
            index,
            inner.snapshot_index,
            last
        );
        inner.entries[(index - inner.snapshot_index - 1) as usize].clone()
    }
}

impl<D: AppData> LogStore<D> for MemLog<D> {
    fn append(&self, mut entries: Vec<Entry<D>>) {
        let mut inner = self.inner.lock().expect("log mutex poisoned");
        inner.entries.append(&mut entries);
    }

    fn truncate(&self, from: u64) {
        let mut inner = self.inner.lock().expect("log mutex poisoned");
        assert!(
            from > inner.snapshot_index,
            "cannot truncate into the snapshot prefix: index {}, snapshot {}",
            from,
            inner.snapshot_index
        );
        let keep = (from - inner.snapshot_index - 1) as usize;
        inner.entries.truncate(keep);
    }

    fn install_snapshot(&self, index: u64, term: u64, data: Vec<u8>) {
        let mut inner = self.inner.lock().expect("log mutex poisoned");
        if index <= inner.snapshot_index {
            return;
        }
        let last = inner.snapshot_index + inner.entries.len() as u64;
        if index >= last {
            inner.entries.clear();
        } else {
            let covered = (index - inner.snapshot_index) as usize;
            inner.entries.drain(..covered);
        }
        inner.snapshot_index = index;
        inner.snapshot_term = term;
        inner.snapshot = data;
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An in-memory routing group store.
///
/// `set_failing(true)` makes every read fail, simulating an unavailable
/// storage backend.
#[derive(Default)]
pub struct MemGroups {
    groups: Mutex<BTreeMap<String, GroupDefinition>>,
    failing: AtomicBool,
}

impl MemGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: impl Into<String>, definition: GroupDefinition) {
        self.groups.lock().expect("group table poisoned").insert(name.into(), definition);
    }

    pub fn remove(&self, name: &str) {
        self.groups.lock().expect("group table poisoned").remove(name);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl GroupStore for MemGroups {
    async fn find(&self, _collection: &str, _tags: &[&str]) -> anyhow::Result<Vec<String>> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("group storage is unavailable");
        }
        Ok(self.groups.lock().expect("group table poisoned").keys().cloned().collect())
    }

    async fn read(&self, _collection: &str, name: &str) -> anyhow::Result<GroupDefinition> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("group storage is unavailable");
        }
        self.groups
            .lock()
            .expect("group table poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such group: {}", name))
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An in-memory network of frame transports, addressed by socket address.
///
/// Servers `bind` an address and receive one [`MemTransport`] per accepted
/// connection; the [`Connector`] implementation hands the matching half to
/// the dialer. Unbound addresses refuse connections.
#[derive(Default)]
pub struct MemNetwork {
    listeners: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<MemTransport>>>,
}

impl MemNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Listen on `addr`, replacing any previous listener.
    pub fn bind(&self, addr: SocketAddr) -> mpsc::UnboundedReceiver<MemTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().expect("listener table poisoned").insert(addr, tx);
        rx
    }

    /// Stop listening on `addr`; established transports stay up until one
    /// side drops.
    pub fn unbind(&self, addr: SocketAddr) {
        self.listeners.lock().expect("listener table poisoned").remove(&addr);
    }
}

#[async_trait]
impl Connector for MemNetwork {
    async fn connect(&self, endpoint: SocketAddr) -> io::Result<Box<dyn Transport>> {
        let listener = self.listeners.lock().expect("listener table poisoned").get(&endpoint).cloned();
        let listener = match listener {
            Some(listener) => listener,
            None => {
                tracing::debug!(%endpoint, "connection refused, nothing is listening");
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"));
            }
        };
        let (local, peer) = MemTransport::pair();
        listener
            .send(peer)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener is gone"))?;
        Ok(Box::new(local))
    }
}

/// One half of an in-memory duplex frame pipe.
#[derive(Debug)]
pub struct MemTransport {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl MemTransport {
    /// A connected pair of transports.
    pub fn pair() -> (MemTransport, MemTransport) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (MemTransport { tx: tx_a, rx: rx_b }, MemTransport { tx: tx_b, rx: rx_a })
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn send(&mut self, frame: Frame) -> io::Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed the connection"))
    }

    async fn recv(&mut self) -> io::Result<Option<Frame>> {
        Ok(self.rx.recv().await)
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
