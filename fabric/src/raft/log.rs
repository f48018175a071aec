//! The log abstraction backing the replication engine.

use crate::raft::Entry;
use crate::AppData;

/// A read-only projection of the Raft log, backed by an external store.
///
/// The log carries a possibly non-empty snapshot prefix at
/// `(snapshot_index, snapshot_term)`; entries at indices at or below
/// `snapshot_index` are no longer materialized. Accessing an index outside
/// the window `(snapshot_index, last_index]` is a precondition violation
/// and panics; callers guard by the snapshot window.
pub trait LogView<D: AppData>: Send + Sync + 'static {
    /// The index of the last entry, or `snapshot_index` for an empty tail.
    fn last_index(&self) -> u64;

    /// The term of the last entry, or `snapshot_term` for an empty tail.
    fn last_term(&self) -> u64;

    /// The index the current snapshot covers, inclusive; 0 when none.
    fn snapshot_index(&self) -> u64;

    /// The term of the entry at `snapshot_index`; 0 when none.
    fn snapshot_term(&self) -> u64;

    /// The current snapshot blob.
    fn snapshot(&self) -> Vec<u8>;

    /// The entry at `index`, which must lie inside the snapshot window.
    fn entry(&self, index: u64) -> Entry<D>;
}

/// The mutation surface of the log store, used by the follower side of the
/// actor when accepting entries and snapshots from a leader.
pub trait LogStore<D: AppData>: LogView<D> {
    /// Append entries after the current last index.
    fn append(&self, entries: Vec<Entry<D>>);

    /// Drop every entry at `from` and above. `from` must be above the
    /// snapshot index.
    fn truncate(&self, from: u64);

    /// Replace the log prefix up to `index` with the given snapshot.
    /// Entries above `index` are retained.
    fn install_snapshot(&self, index: u64, term: u64, data: Vec<u8>);
}
