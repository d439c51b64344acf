//! Storage boundary for the update log, clock tables and blob store.
//!
//! A [`Store`] backend persists the only shared mutable state of the engine:
//! per-document update fragments plus one compacted snapshot, four clock
//! tables, and content-addressed blobs. Anything that satisfies this trait
//! can sit underneath the engine: the in-memory [`memory::Store`], the
//! redb-backed [`fs::Store`], or a native platform store.

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{BlobKey, DocClock, DocId, PeerId};

pub mod fs;
pub mod memory;

/// One update fragment in a document's log.
///
/// Immutable once written; destroyed only by compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredUpdate {
    /// Locally assigned timestamp, unique per document.
    pub timestamp: u64,
    /// Opaque CRDT update bytes.
    pub data: Bytes,
}

/// The compacted fold of a document's fragments up to a timestamp.
///
/// A document has zero or one snapshot at any instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Timestamp of the latest fragment folded into this snapshot.
    pub timestamp: u64,
    /// Opaque merged update bytes.
    pub data: Bytes,
}

/// A stored binary object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    /// Content-derived key.
    pub key: BlobKey,
    /// The blob bytes.
    pub data: Bytes,
    /// Mime type as reported on insert.
    pub mime: String,
    /// Size in bytes.
    pub size: u64,
    /// Insert time, millis since the unix epoch.
    pub created_at: u64,
    /// Soft-deletion time, if the blob is tombstoned.
    pub deleted_at: Option<u64>,
}

impl Blob {
    /// The listing entry for this blob.
    pub fn meta(&self) -> BlobMeta {
        BlobMeta {
            key: self.key,
            mime: self.mime.clone(),
            size: self.size,
            created_at: self.created_at,
        }
    }
}

/// Listing entry for a blob, without the content bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMeta {
    /// Content-derived key.
    pub key: BlobKey,
    /// Mime type as reported on insert.
    pub mime: String,
    /// Size in bytes.
    pub size: u64,
    /// Insert time, millis since the unix epoch.
    pub created_at: u64,
}

/// Which per-peer clock boundary to read or write.
///
/// The three peer tables plus the local clock are kept as separate maps so
/// that monotonicity is enforced at each table's write boundary rather than
/// by convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerClockKind {
    /// Latest timestamp we believe the peer has produced (advisory).
    Remote,
    /// Latest local timestamp we have successfully transmitted to the peer.
    Pushed,
    /// Latest peer-produced timestamp we have successfully merged locally.
    Pulled,
}

/// Tunables for a store and the compaction policy running on top of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    /// Number of fragments a document may accumulate past its snapshot
    /// before a push folds them.
    ///
    /// `1` folds on every push (always keep at most one loose fragment),
    /// which trades write amplification for minimal replay cost. The
    /// default of 16 is a middle ground.
    pub merge_threshold: usize,
    /// How long a soft-deleted blob is kept before [`Store::release_blobs`]
    /// may purge it.
    pub blob_retention: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            merge_threshold: 16,
            blob_retention: Duration::from_secs(60 * 60 * 24 * 7),
        }
    }
}

/// Persistence boundary for the sync engine.
///
/// Implementations are cheap-to-clone handles onto shared state and must
/// provide read-after-write consistency within a process. All mutating
/// methods are atomic with respect to each other; serialization of logical
/// sequences (read clock, append, advance clock) is the caller's job, via
/// [`crate::KeyedLock`].
pub trait Store: std::fmt::Debug + Clone + Send + Sync + 'static {
    // ---- document update log ----

    /// Append an update fragment, assigning a fresh local timestamp.
    ///
    /// The timestamp is `max(now_millis, last + 1)`: unique and strictly
    /// increasing per document. Advances the document's local clock.
    fn append_update(&self, doc: DocId, update: Bytes) -> Result<StoredUpdate>;

    /// All fragments after the snapshot, ascending by timestamp.
    fn updates(&self, doc: DocId) -> Result<Vec<StoredUpdate>>;

    /// The document's snapshot, if a compaction ran before.
    fn snapshot(&self, doc: DocId) -> Result<Option<Snapshot>>;

    /// Install `snapshot` and remove exactly the fragments with the given
    /// timestamps, atomically.
    ///
    /// On error nothing is removed; the pre-compaction fragment set stays
    /// intact.
    fn replace_updates(&self, doc: DocId, folded: &[u64], snapshot: Snapshot) -> Result<()>;

    /// All documents with at least one fragment or snapshot.
    fn docs(&self) -> Result<Vec<DocId>>;

    // ---- clock tables ----

    /// Latest timestamp written to this document's log, if any.
    fn local_clock(&self, doc: DocId) -> Result<Option<u64>>;

    /// Read one per-peer clock.
    fn peer_clock(&self, kind: PeerClockKind, peer: PeerId, doc: DocId) -> Result<Option<u64>>;

    /// Advance one per-peer clock.
    ///
    /// Moving a clock backward is a silent no-op: stale or out-of-order
    /// network acks must not regress sync state.
    fn set_peer_clock(
        &self,
        kind: PeerClockKind,
        peer: PeerId,
        doc: DocId,
        timestamp: u64,
    ) -> Result<()>;

    /// Batch read of a peer's pulled clocks, one entry per document the
    /// peer has been pulled for.
    fn peer_clocks(&self, peer: PeerId) -> Result<Vec<DocClock>>;

    /// Administrative reset: wipe all clock tables for a peer.
    ///
    /// The only path allowed to move clocks backward. Used when the peer's
    /// own storage is known to have been wiped, to force a full re-sync.
    fn clear_peer_clocks(&self, peer: PeerId) -> Result<()>;

    // ---- blobs ----

    /// Read a blob. Soft-deleted blobs are still returned so that a peer
    /// mid-download keeps working; check [`Blob::deleted_at`] if that
    /// matters to you.
    fn get_blob(&self, key: &BlobKey) -> Result<Option<Blob>>;

    /// Insert a blob. Idempotent for identical content; re-inserting a
    /// soft-deleted blob clears its tombstone.
    ///
    /// Fails if `key` does not match the content (the key is the blake3
    /// hash of `data`).
    fn put_blob(&self, key: BlobKey, data: Bytes, mime: &str) -> Result<()>;

    /// Delete a blob. `permanently: false` tombstones it (recoverable,
    /// excluded from listings, still readable); `true` removes the bytes
    /// and any per-peer upload marks.
    fn delete_blob(&self, key: &BlobKey, permanently: bool) -> Result<()>;

    /// List all blobs that are not soft-deleted.
    fn list_blobs(&self) -> Result<Vec<BlobMeta>>;

    /// Purge soft-deleted blobs older than the configured retention.
    /// Returns the number of blobs purged.
    fn release_blobs(&self) -> Result<usize>;

    /// When the peer last confirmed receipt of the blob, if ever.
    fn blob_uploaded_at(&self, peer: PeerId, key: &BlobKey) -> Result<Option<u64>>;

    /// Record (or clear, with `None`) a peer's receipt of a blob.
    fn set_blob_uploaded_at(
        &self,
        peer: PeerId,
        key: &BlobKey,
        timestamp: Option<u64>,
    ) -> Result<()>;

    // ---- convenience ----

    /// Read the advisory remote clock.
    fn peer_remote_clock(&self, peer: PeerId, doc: DocId) -> Result<Option<u64>> {
        self.peer_clock(PeerClockKind::Remote, peer, doc)
    }

    /// Read the pushed clock.
    fn peer_pushed_clock(&self, peer: PeerId, doc: DocId) -> Result<Option<u64>> {
        self.peer_clock(PeerClockKind::Pushed, peer, doc)
    }

    /// Read the pulled clock.
    fn peer_pulled_clock(&self, peer: PeerId, doc: DocId) -> Result<Option<u64>> {
        self.peer_clock(PeerClockKind::Pulled, peer, doc)
    }
}
