//! Local-first synchronization engine for CRDT documents and blobs.
//!
//! Many independent peers (other devices, sibling tabs or workers, a server)
//! each hold a local, possibly-offline copy of a collection of documents and
//! binary blobs. This crate decides, per document and per peer, what to send,
//! what to receive, and when local history may be compacted, while multiple
//! local contexts race to read and write the same store.
//!
//! The engine is a replication and compaction layer, not a conflict
//! resolution layer: the CRDT primitives themselves (merge, diff, state
//! vectors) are consumed through the [`Crdt`] trait, and the bytes that move
//! between peers are opaque to everything in this crate.
//!
//! The main entry point is [`SyncEngine`], which drives push/pull sessions
//! per (peer, document) pair on top of a [`Store`] backend (in-memory or on
//! disk) and a [`Transport`] provided by the caller.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod clocks;
pub mod crdt;
pub mod engine;
pub mod keys;
pub mod lock;
pub mod log;
pub mod net;
pub mod notifier;
pub mod store;

pub use self::clocks::{ClockTable, DocClock};
pub use self::crdt::Crdt;
pub use self::engine::{DocSyncState, SyncEngine, SyncEvent, SyncState};
pub use self::keys::{BlobKey, DocId, PeerId};
pub use self::lock::{KeyedLock, LockGuard};
pub use self::log::{DocDiff, UpdateLog};
pub use self::net::{Ack, Payload, Transport};
pub use self::notifier::{DocChanged, Notifier, NotifierHandle};
pub use self::store::{Blob, BlobMeta, Options, Snapshot, Store, StoredUpdate};

/// Current time as milliseconds since the unix epoch.
///
/// Timestamps in this crate only need to be unique and monotonic per
/// document, not globally ordered; wall clock millis are good enough as a
/// base, with the store bumping by one on collision.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
