//! On-disk storage backend, backed by [`redb`].
//!
//! All state lives in a single database file. Every mutating method is one
//! write transaction, so the atomicity the [`crate::Store`] contract asks
//! for (notably in `append_update` and `replace_updates`) comes directly
//! from redb's transaction semantics.

use std::{path::Path, sync::Arc};

use anyhow::{bail, Result};
use bytes::Bytes;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::{
    now_millis,
    store::{Blob, BlobMeta, Options, PeerClockKind, Snapshot, StoredUpdate},
    BlobKey, DocClock, DocId, PeerId,
};

/// Update fragments by (doc, timestamp).
const UPDATES_TABLE: TableDefinition<(&[u8; 32], u64), &[u8]> = TableDefinition::new("updates-v1");

/// Snapshot by doc: (timestamp, data).
const SNAPSHOTS_TABLE: TableDefinition<&[u8; 32], (u64, &[u8])> =
    TableDefinition::new("snapshots-v1");

/// Clock tables by (kind, peer, doc). Kind 0 is the local clock and uses a
/// zeroed peer id.
const CLOCKS_TABLE: TableDefinition<(u8, &[u8; 32], &[u8; 32]), u64> =
    TableDefinition::new("clocks-v1");

/// Blob records by key, postcard-encoded.
const BLOBS_TABLE: TableDefinition<&[u8; 32], &[u8]> = TableDefinition::new("blobs-v1");

/// Per-peer blob upload marks by (peer, blob key).
const UPLOADS_TABLE: TableDefinition<(&[u8; 32], &[u8; 32]), u64> =
    TableDefinition::new("uploads-v1");

const LOCAL_KIND: u8 = 0;
const NO_PEER: &[u8; 32] = &[0u8; 32];

fn kind_byte(kind: PeerClockKind) -> u8 {
    match kind {
        PeerClockKind::Remote => 1,
        PeerClockKind::Pushed => 2,
        PeerClockKind::Pulled => 3,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobRecord {
    mime: String,
    size: u64,
    created_at: u64,
    deleted_at: Option<u64>,
    data: Vec<u8>,
}

impl BlobRecord {
    fn into_blob(self, key: BlobKey) -> Blob {
        Blob {
            key,
            data: self.data.into(),
            mime: self.mime,
            size: self.size,
            created_at: self.created_at,
            deleted_at: self.deleted_at,
        }
    }
}

/// On-disk [`crate::Store`] implementation.
#[derive(Debug, Clone)]
pub struct Store {
    db: Arc<Database>,
    options: Options,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        Self::persistent_with_options(path, Options::default())
    }

    /// Open or create a store at the given path with the given options.
    pub fn persistent_with_options(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        let db = Database::create(path)?;
        // Create all tables so reads never race an empty database.
        let write_tx = db.begin_write()?;
        {
            let _updates = write_tx.open_table(UPDATES_TABLE)?;
            let _snapshots = write_tx.open_table(SNAPSHOTS_TABLE)?;
            let _clocks = write_tx.open_table(CLOCKS_TABLE)?;
            let _blobs = write_tx.open_table(BLOBS_TABLE)?;
            let _uploads = write_tx.open_table(UPLOADS_TABLE)?;
        }
        write_tx.commit()?;
        Ok(Self {
            db: Arc::new(db),
            options,
        })
    }
}

impl crate::Store for Store {
    fn append_update(&self, doc: DocId, update: Bytes) -> Result<StoredUpdate> {
        let write_tx = self.db.begin_write()?;
        let timestamp = {
            let mut updates = write_tx.open_table(UPDATES_TABLE)?;
            let mut clocks = write_tx.open_table(CLOCKS_TABLE)?;
            let last = clocks
                .get((LOCAL_KIND, NO_PEER, doc.as_bytes()))?
                .map(|t| t.value())
                .unwrap_or_default();
            let timestamp = now_millis().max(last + 1);
            updates.insert((doc.as_bytes(), timestamp), update.as_ref())?;
            clocks.insert((LOCAL_KIND, NO_PEER, doc.as_bytes()), timestamp)?;
            timestamp
        };
        write_tx.commit()?;
        Ok(StoredUpdate {
            timestamp,
            data: update,
        })
    }

    fn updates(&self, doc: DocId) -> Result<Vec<StoredUpdate>> {
        let read_tx = self.db.begin_read()?;
        let updates = read_tx.open_table(UPDATES_TABLE)?;
        let start = (doc.as_bytes(), 0u64);
        let end = (doc.as_bytes(), u64::MAX);
        let mut out = Vec::new();
        for entry in updates.range(start..=end)? {
            let (key, value) = entry?;
            out.push(StoredUpdate {
                timestamp: key.value().1,
                data: Bytes::copy_from_slice(value.value()),
            });
        }
        Ok(out)
    }

    fn snapshot(&self, doc: DocId) -> Result<Option<Snapshot>> {
        let read_tx = self.db.begin_read()?;
        let snapshots = read_tx.open_table(SNAPSHOTS_TABLE)?;
        Ok(snapshots.get(doc.as_bytes())?.map(|entry| {
            let (timestamp, data) = entry.value();
            Snapshot {
                timestamp,
                data: Bytes::copy_from_slice(data),
            }
        }))
    }

    fn replace_updates(&self, doc: DocId, folded: &[u64], snapshot: Snapshot) -> Result<()> {
        let write_tx = self.db.begin_write()?;
        {
            let clocks = write_tx.open_table(CLOCKS_TABLE)?;
            if clocks
                .get((LOCAL_KIND, NO_PEER, doc.as_bytes()))?
                .is_none()
            {
                bail!("unknown doc {}", doc.fmt_short());
            }
            let mut snapshots = write_tx.open_table(SNAPSHOTS_TABLE)?;
            snapshots.insert(
                doc.as_bytes(),
                (snapshot.timestamp, snapshot.data.as_ref()),
            )?;
            let mut updates = write_tx.open_table(UPDATES_TABLE)?;
            for timestamp in folded {
                updates.remove((doc.as_bytes(), *timestamp))?;
            }
        }
        write_tx.commit()?;
        Ok(())
    }

    fn docs(&self) -> Result<Vec<DocId>> {
        let read_tx = self.db.begin_read()?;
        let clocks = read_tx.open_table(CLOCKS_TABLE)?;
        let start = (LOCAL_KIND, NO_PEER, &[0u8; 32]);
        let end = (LOCAL_KIND, &[u8::MAX; 32], &[u8::MAX; 32]);
        let mut out = Vec::new();
        for entry in clocks.range(start..=end)? {
            let (key, _) = entry?;
            out.push(DocId::from(*key.value().2));
        }
        Ok(out)
    }

    fn local_clock(&self, doc: DocId) -> Result<Option<u64>> {
        let read_tx = self.db.begin_read()?;
        let clocks = read_tx.open_table(CLOCKS_TABLE)?;
        Ok(clocks
            .get((LOCAL_KIND, NO_PEER, doc.as_bytes()))?
            .map(|t| t.value()))
    }

    fn peer_clock(&self, kind: PeerClockKind, peer: PeerId, doc: DocId) -> Result<Option<u64>> {
        let read_tx = self.db.begin_read()?;
        let clocks = read_tx.open_table(CLOCKS_TABLE)?;
        Ok(clocks
            .get((kind_byte(kind), peer.as_bytes(), doc.as_bytes()))?
            .map(|t| t.value()))
    }

    fn set_peer_clock(
        &self,
        kind: PeerClockKind,
        peer: PeerId,
        doc: DocId,
        timestamp: u64,
    ) -> Result<()> {
        let write_tx = self.db.begin_write()?;
        {
            let mut clocks = write_tx.open_table(CLOCKS_TABLE)?;
            let key = (kind_byte(kind), peer.as_bytes(), doc.as_bytes());
            let current = clocks.get(key)?.map(|t| t.value()).unwrap_or_default();
            if timestamp > current {
                clocks.insert(key, timestamp)?;
            }
        }
        write_tx.commit()?;
        Ok(())
    }

    fn peer_clocks(&self, peer: PeerId) -> Result<Vec<DocClock>> {
        let read_tx = self.db.begin_read()?;
        let clocks = read_tx.open_table(CLOCKS_TABLE)?;
        let kind = kind_byte(PeerClockKind::Pulled);
        let start = (kind, peer.as_bytes(), &[0u8; 32]);
        let end = (kind, peer.as_bytes(), &[u8::MAX; 32]);
        let mut out = Vec::new();
        for entry in clocks.range(start..=end)? {
            let (key, value) = entry?;
            out.push(DocClock {
                doc: DocId::from(*key.value().2),
                timestamp: value.value(),
            });
        }
        Ok(out)
    }

    fn clear_peer_clocks(&self, peer: PeerId) -> Result<()> {
        let write_tx = self.db.begin_write()?;
        {
            let mut clocks = write_tx.open_table(CLOCKS_TABLE)?;
            for kind in [
                PeerClockKind::Remote,
                PeerClockKind::Pushed,
                PeerClockKind::Pulled,
            ] {
                let kind = kind_byte(kind);
                let start = (kind, peer.as_bytes(), &[0u8; 32]);
                let end = (kind, peer.as_bytes(), &[u8::MAX; 32]);
                let docs: Vec<[u8; 32]> = clocks
                    .range(start..=end)?
                    .map(|entry| entry.map(|(key, _)| *key.value().2))
                    .collect::<Result<_, _>>()?;
                for doc in docs {
                    clocks.remove((kind, peer.as_bytes(), &doc))?;
                }
            }
        }
        write_tx.commit()?;
        Ok(())
    }

    fn get_blob(&self, key: &BlobKey) -> Result<Option<Blob>> {
        let read_tx = self.db.begin_read()?;
        let blobs = read_tx.open_table(BLOBS_TABLE)?;
        match blobs.get(key.as_bytes())? {
            Some(entry) => {
                let record: BlobRecord = postcard::from_bytes(entry.value())?;
                Ok(Some(record.into_blob(*key)))
            }
            None => Ok(None),
        }
    }

    fn put_blob(&self, key: BlobKey, data: Bytes, mime: &str) -> Result<()> {
        if BlobKey::for_content(&data) != key {
            bail!("blob key {} does not match content", key.fmt_short());
        }
        let write_tx = self.db.begin_write()?;
        {
            let mut blobs = write_tx.open_table(BLOBS_TABLE)?;
            let record = match blobs.get(key.as_bytes())? {
                Some(entry) => {
                    let mut record: BlobRecord = postcard::from_bytes(entry.value())?;
                    record.deleted_at = None;
                    record
                }
                None => BlobRecord {
                    mime: mime.to_string(),
                    size: data.len() as u64,
                    created_at: now_millis(),
                    deleted_at: None,
                    data: data.to_vec(),
                },
            };
            let encoded = postcard::to_stdvec(&record)?;
            blobs.insert(key.as_bytes(), encoded.as_slice())?;
        }
        write_tx.commit()?;
        Ok(())
    }

    fn delete_blob(&self, key: &BlobKey, permanently: bool) -> Result<()> {
        let write_tx = self.db.begin_write()?;
        {
            let mut blobs = write_tx.open_table(BLOBS_TABLE)?;
            if permanently {
                blobs.remove(key.as_bytes())?;
                let mut uploads = write_tx.open_table(UPLOADS_TABLE)?;
                let stale: Vec<[u8; 32]> = uploads
                    .iter()?
                    .filter_map(|entry| match entry {
                        Ok((k, _)) => {
                            let (peer, blob) = k.value();
                            (blob == key.as_bytes()).then_some(Ok(*peer))
                        }
                        Err(err) => Some(Err(err)),
                    })
                    .collect::<Result<_, _>>()?;
                for peer in stale {
                    uploads.remove((&peer, key.as_bytes()))?;
                }
            } else {
                // Decode in its own scope so the read guard is gone before
                // the tombstoned record is written back.
                let record = match blobs.get(key.as_bytes())? {
                    Some(entry) => Some(postcard::from_bytes::<BlobRecord>(entry.value())?),
                    None => None,
                };
                if let Some(mut record) = record {
                    if record.deleted_at.is_none() {
                        record.deleted_at = Some(now_millis());
                        let encoded = postcard::to_stdvec(&record)?;
                        blobs.insert(key.as_bytes(), encoded.as_slice())?;
                    }
                }
            }
        }
        write_tx.commit()?;
        Ok(())
    }

    fn list_blobs(&self) -> Result<Vec<BlobMeta>> {
        let read_tx = self.db.begin_read()?;
        let blobs = read_tx.open_table(BLOBS_TABLE)?;
        let mut out = Vec::new();
        for entry in blobs.iter()? {
            let (key, value) = entry?;
            let record: BlobRecord = postcard::from_bytes(value.value())?;
            if record.deleted_at.is_none() {
                out.push(BlobMeta {
                    key: BlobKey::from(*key.value()),
                    mime: record.mime,
                    size: record.size,
                    created_at: record.created_at,
                });
            }
        }
        Ok(out)
    }

    fn release_blobs(&self) -> Result<usize> {
        let cutoff = now_millis().saturating_sub(self.options.blob_retention.as_millis() as u64);
        let write_tx = self.db.begin_write()?;
        let purged = {
            let mut blobs = write_tx.open_table(BLOBS_TABLE)?;
            let mut purged: Vec<[u8; 32]> = Vec::new();
            for entry in blobs.iter()? {
                let (key, value) = entry?;
                let record: BlobRecord = postcard::from_bytes(value.value())?;
                if matches!(record.deleted_at, Some(at) if at <= cutoff) {
                    purged.push(*key.value());
                }
            }
            for key in &purged {
                blobs.remove(key)?;
            }
            if !purged.is_empty() {
                let mut uploads = write_tx.open_table(UPLOADS_TABLE)?;
                let stale: Vec<([u8; 32], [u8; 32])> = uploads
                    .iter()?
                    .filter_map(|entry| match entry {
                        Ok((k, _)) => {
                            let (peer, blob) = k.value();
                            purged.contains(blob).then_some(Ok((*peer, *blob)))
                        }
                        Err(err) => Some(Err(err)),
                    })
                    .collect::<Result<_, _>>()?;
                for (peer, blob) in stale {
                    uploads.remove((&peer, &blob))?;
                }
            }
            purged.len()
        };
        write_tx.commit()?;
        Ok(purged)
    }

    fn blob_uploaded_at(&self, peer: PeerId, key: &BlobKey) -> Result<Option<u64>> {
        let read_tx = self.db.begin_read()?;
        let uploads = read_tx.open_table(UPLOADS_TABLE)?;
        Ok(uploads
            .get((peer.as_bytes(), key.as_bytes()))?
            .map(|t| t.value()))
    }

    fn set_blob_uploaded_at(
        &self,
        peer: PeerId,
        key: &BlobKey,
        timestamp: Option<u64>,
    ) -> Result<()> {
        let write_tx = self.db.begin_write()?;
        {
            let mut uploads = write_tx.open_table(UPLOADS_TABLE)?;
            match timestamp {
                Some(at) => {
                    uploads.insert((peer.as_bytes(), key.as_bytes()), at)?;
                }
                None => {
                    uploads.remove((peer.as_bytes(), key.as_bytes()))?;
                }
            }
        }
        write_tx.commit()?;
        Ok(())
    }
}
