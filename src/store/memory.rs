//! In-memory storage backend.
//!
//! Useful on its own for tests and ephemeral contexts, and as the reference
//! for what the persistent backends must do.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use anyhow::{bail, Result};
use bytes::Bytes;
use parking_lot::RwLock;

use crate::{
    now_millis,
    store::{Blob, BlobMeta, Options, PeerClockKind, Snapshot, StoredUpdate},
    BlobKey, ClockTable, DocClock, DocId, PeerId,
};

/// In-memory [`crate::Store`] implementation.
///
/// A cheap-to-clone handle; all clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct Store {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    docs: RwLock<HashMap<DocId, DocState>>,
    local: RwLock<ClockTable>,
    peer_clocks: RwLock<HashMap<(PeerClockKind, PeerId), ClockTable>>,
    blobs: RwLock<BTreeMap<BlobKey, Blob>>,
    uploads: RwLock<HashMap<(PeerId, BlobKey), u64>>,
    options: Options,
}

#[derive(Debug, Default)]
struct DocState {
    updates: BTreeMap<u64, Bytes>,
    snapshot: Option<Snapshot>,
}

impl Store {
    /// Create a store with default [`Options`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with the given options.
    pub fn with_options(options: Options) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                ..Default::default()
            }),
        }
    }
}

impl crate::Store for Store {
    fn append_update(&self, doc: DocId, update: Bytes) -> Result<StoredUpdate> {
        let mut docs = self.inner.docs.write();
        let mut local = self.inner.local.write();
        let last = local.get(&doc).unwrap_or_default();
        let timestamp = now_millis().max(last + 1);
        docs.entry(doc)
            .or_default()
            .updates
            .insert(timestamp, update.clone());
        local.insert(doc, timestamp);
        Ok(StoredUpdate {
            timestamp,
            data: update,
        })
    }

    fn updates(&self, doc: DocId) -> Result<Vec<StoredUpdate>> {
        let docs = self.inner.docs.read();
        Ok(docs
            .get(&doc)
            .map(|state| {
                state
                    .updates
                    .iter()
                    .map(|(timestamp, data)| StoredUpdate {
                        timestamp: *timestamp,
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn snapshot(&self, doc: DocId) -> Result<Option<Snapshot>> {
        let docs = self.inner.docs.read();
        Ok(docs.get(&doc).and_then(|state| state.snapshot.clone()))
    }

    fn replace_updates(&self, doc: DocId, folded: &[u64], snapshot: Snapshot) -> Result<()> {
        let mut docs = self.inner.docs.write();
        let Some(state) = docs.get_mut(&doc) else {
            bail!("unknown doc {}", doc.fmt_short());
        };
        state.snapshot = Some(snapshot);
        for timestamp in folded {
            state.updates.remove(timestamp);
        }
        Ok(())
    }

    fn docs(&self) -> Result<Vec<DocId>> {
        let docs = self.inner.docs.read();
        Ok(docs.keys().copied().collect())
    }

    fn local_clock(&self, doc: DocId) -> Result<Option<u64>> {
        Ok(self.inner.local.read().get(&doc))
    }

    fn peer_clock(&self, kind: PeerClockKind, peer: PeerId, doc: DocId) -> Result<Option<u64>> {
        let clocks = self.inner.peer_clocks.read();
        Ok(clocks.get(&(kind, peer)).and_then(|table| table.get(&doc)))
    }

    fn set_peer_clock(
        &self,
        kind: PeerClockKind,
        peer: PeerId,
        doc: DocId,
        timestamp: u64,
    ) -> Result<()> {
        let mut clocks = self.inner.peer_clocks.write();
        clocks
            .entry((kind, peer))
            .or_default()
            .insert(doc, timestamp);
        Ok(())
    }

    fn peer_clocks(&self, peer: PeerId) -> Result<Vec<DocClock>> {
        let clocks = self.inner.peer_clocks.read();
        Ok(clocks
            .get(&(PeerClockKind::Pulled, peer))
            .map(|table| table.to_doc_clocks())
            .unwrap_or_default())
    }

    fn clear_peer_clocks(&self, peer: PeerId) -> Result<()> {
        let mut clocks = self.inner.peer_clocks.write();
        for kind in [
            PeerClockKind::Remote,
            PeerClockKind::Pushed,
            PeerClockKind::Pulled,
        ] {
            clocks.remove(&(kind, peer));
        }
        Ok(())
    }

    fn get_blob(&self, key: &BlobKey) -> Result<Option<Blob>> {
        Ok(self.inner.blobs.read().get(key).cloned())
    }

    fn put_blob(&self, key: BlobKey, data: Bytes, mime: &str) -> Result<()> {
        if BlobKey::for_content(&data) != key {
            bail!("blob key {} does not match content", key.fmt_short());
        }
        let mut blobs = self.inner.blobs.write();
        match blobs.get_mut(&key) {
            Some(blob) => {
                // Same content by construction; just clear the tombstone.
                blob.deleted_at = None;
            }
            None => {
                blobs.insert(
                    key,
                    Blob {
                        key,
                        size: data.len() as u64,
                        data,
                        mime: mime.to_string(),
                        created_at: now_millis(),
                        deleted_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    fn delete_blob(&self, key: &BlobKey, permanently: bool) -> Result<()> {
        let mut blobs = self.inner.blobs.write();
        if permanently {
            blobs.remove(key);
            self.inner
                .uploads
                .write()
                .retain(|(_, blob), _| blob != key);
        } else if let Some(blob) = blobs.get_mut(key) {
            blob.deleted_at.get_or_insert_with(now_millis);
        }
        Ok(())
    }

    fn list_blobs(&self) -> Result<Vec<BlobMeta>> {
        let blobs = self.inner.blobs.read();
        Ok(blobs
            .values()
            .filter(|blob| blob.deleted_at.is_none())
            .map(Blob::meta)
            .collect())
    }

    fn release_blobs(&self) -> Result<usize> {
        let cutoff = now_millis().saturating_sub(self.inner.options.blob_retention.as_millis() as u64);
        let mut blobs = self.inner.blobs.write();
        let purged: Vec<BlobKey> = blobs
            .values()
            .filter(|blob| matches!(blob.deleted_at, Some(at) if at <= cutoff))
            .map(|blob| blob.key)
            .collect();
        for key in &purged {
            blobs.remove(key);
        }
        if !purged.is_empty() {
            self.inner
                .uploads
                .write()
                .retain(|(_, blob), _| !purged.contains(blob));
        }
        Ok(purged.len())
    }

    fn blob_uploaded_at(&self, peer: PeerId, key: &BlobKey) -> Result<Option<u64>> {
        Ok(self.inner.uploads.read().get(&(peer, *key)).copied())
    }

    fn set_blob_uploaded_at(
        &self,
        peer: PeerId,
        key: &BlobKey,
        timestamp: Option<u64>,
    ) -> Result<()> {
        let mut uploads = self.inner.uploads.write();
        match timestamp {
            Some(at) => {
                uploads.insert((peer, *key), at);
            }
            None => {
                uploads.remove(&(peer, *key));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::Store as _;

    #[test]
    fn test_append_assigns_unique_increasing_timestamps() {
        let store = Store::new();
        let doc = DocId::from([1u8; 32]);
        let mut last = 0;
        for _ in 0..10 {
            let stored = store.append_update(doc, Bytes::from_static(b"u")).unwrap();
            assert!(stored.timestamp > last);
            last = stored.timestamp;
        }
        assert_eq!(store.local_clock(doc).unwrap(), Some(last));
        assert_eq!(store.updates(doc).unwrap().len(), 10);
    }

    #[test]
    fn test_replace_updates_is_exact() {
        let store = Store::new();
        let doc = DocId::from([1u8; 32]);
        let a = store.append_update(doc, Bytes::from_static(b"a")).unwrap();
        let b = store.append_update(doc, Bytes::from_static(b"b")).unwrap();
        let c = store.append_update(doc, Bytes::from_static(b"c")).unwrap();
        store
            .replace_updates(
                doc,
                &[a.timestamp, b.timestamp],
                Snapshot {
                    timestamp: b.timestamp,
                    data: Bytes::from_static(b"ab"),
                },
            )
            .unwrap();
        let rest = store.updates(doc).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].timestamp, c.timestamp);
        assert_eq!(store.snapshot(doc).unwrap().unwrap().timestamp, b.timestamp);
    }

    #[test]
    fn test_peer_clock_monotonic_and_reset() {
        let store = Store::new();
        let doc = DocId::from([1u8; 32]);
        let peer = PeerId::from([2u8; 32]);
        store
            .set_peer_clock(PeerClockKind::Pushed, peer, doc, 10)
            .unwrap();
        // Backward write is a no-op.
        store
            .set_peer_clock(PeerClockKind::Pushed, peer, doc, 4)
            .unwrap();
        assert_eq!(
            store.peer_clock(PeerClockKind::Pushed, peer, doc).unwrap(),
            Some(10)
        );
        // Administrative reset does go backward.
        store.clear_peer_clocks(peer).unwrap();
        assert_eq!(
            store.peer_clock(PeerClockKind::Pushed, peer, doc).unwrap(),
            None
        );
    }

    #[test]
    fn test_peer_clocks_lists_pulled_docs() {
        let store = Store::new();
        let peer = PeerId::from([7u8; 32]);
        let doc_a = DocId::from([1u8; 32]);
        let doc_b = DocId::from([2u8; 32]);
        store
            .set_peer_clock(PeerClockKind::Pulled, peer, doc_a, 5)
            .unwrap();
        store
            .set_peer_clock(PeerClockKind::Pulled, peer, doc_b, 9)
            .unwrap();
        // Other clock kinds do not show up in the batch.
        store
            .set_peer_clock(PeerClockKind::Pushed, peer, doc_a, 11)
            .unwrap();
        assert_eq!(
            store.peer_clocks(peer).unwrap(),
            vec![
                DocClock {
                    doc: doc_a,
                    timestamp: 5
                },
                DocClock {
                    doc: doc_b,
                    timestamp: 9
                },
            ]
        );
        assert!(store.peer_clocks(PeerId::from([8u8; 32])).unwrap().is_empty());
    }

    #[test]
    fn test_blob_soft_delete_then_restore() {
        let store = Store::new();
        let data = Bytes::from_static(b"blob content");
        let key = BlobKey::for_content(&data);
        store.put_blob(key, data.clone(), "text/plain").unwrap();
        store.delete_blob(&key, false).unwrap();
        // Still readable for the sync path, but excluded from listings.
        assert!(store.get_blob(&key).unwrap().is_some());
        assert!(store.list_blobs().unwrap().is_empty());
        // Re-inserting clears the tombstone.
        store.put_blob(key, data, "text/plain").unwrap();
        assert_eq!(store.list_blobs().unwrap().len(), 1);
    }

    #[test]
    fn test_put_blob_rejects_wrong_key() {
        let store = Store::new();
        let key = BlobKey::for_content(b"other content");
        assert!(store
            .put_blob(key, Bytes::from_static(b"data"), "text/plain")
            .is_err());
    }

    #[test]
    fn test_release_respects_retention() {
        let store = Store::with_options(Options {
            blob_retention: Duration::ZERO,
            ..Default::default()
        });
        let keep = Bytes::from_static(b"keep");
        let drop = Bytes::from_static(b"drop");
        let keep_key = BlobKey::for_content(&keep);
        let drop_key = BlobKey::for_content(&drop);
        store.put_blob(keep_key, keep, "application/octet-stream").unwrap();
        store.put_blob(drop_key, drop, "application/octet-stream").unwrap();
        store.delete_blob(&drop_key, false).unwrap();
        assert_eq!(store.release_blobs().unwrap(), 1);
        assert!(store.get_blob(&drop_key).unwrap().is_none());
        assert!(store.get_blob(&keep_key).unwrap().is_some());
    }

    #[test]
    fn test_uploaded_at_roundtrip() {
        let store = Store::new();
        let peer = PeerId::from([9u8; 32]);
        let key = BlobKey::for_content(b"payload");
        assert_eq!(store.blob_uploaded_at(peer, &key).unwrap(), None);
        store.set_blob_uploaded_at(peer, &key, Some(42)).unwrap();
        assert_eq!(store.blob_uploaded_at(peer, &key).unwrap(), Some(42));
        store.set_blob_uploaded_at(peer, &key, None).unwrap();
        assert_eq!(store.blob_uploaded_at(peer, &key).unwrap(), None);
    }
}
