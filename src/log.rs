//! Append-only per-document update log with snapshot compaction.
//!
//! A document's history is a snapshot (the fold of everything compacted so
//! far) plus a tail of update fragments. [`UpdateLog`] owns the policy
//! around that shape: appending new updates, folding the tail back into the
//! snapshot once it grows past the merge threshold, and producing deltas
//! against a peer's state vector.
//!
//! All mutations of one document are serialized through a [`KeyedLock`], so
//! concurrent pushes from several contexts cannot interleave a read-fold
//! sequence with an append.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::{
    store::{Options, Snapshot, StoredUpdate},
    Crdt, DocId, KeyedLock, Store,
};

/// A delta of one document against some peer's state vector.
#[derive(Debug, Clone)]
pub struct DocDiff {
    /// Update bytes the peer is missing.
    pub delta: Bytes,
    /// State vector of our full merged document.
    pub state_vector: Bytes,
    /// Latest local timestamp folded into the delta.
    pub timestamp: u64,
}

/// The per-document update log.
///
/// Cheap to clone; clones share the store handle and the lock set.
#[derive(Debug)]
pub struct UpdateLog<S, C> {
    store: S,
    crdt: Arc<C>,
    locks: KeyedLock<DocId>,
    options: Options,
}

impl<S: Clone, C> Clone for UpdateLog<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            crdt: self.crdt.clone(),
            locks: self.locks.clone(),
            options: self.options.clone(),
        }
    }
}

impl<S: Store, C: Crdt> UpdateLog<S, C> {
    /// Create a log over the given store.
    pub fn new(store: S, crdt: Arc<C>, options: Options) -> Self {
        Self {
            store,
            crdt,
            locks: KeyedLock::new(),
            options,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The CRDT runtime.
    pub fn crdt(&self) -> &Arc<C> {
        &self.crdt
    }

    /// Append an update to a document's log.
    ///
    /// Returns `None` without touching the log when the update is empty or
    /// when the document already contains everything the update carries.
    /// The latter is what keeps two peers from bouncing the same delta back
    /// and forth forever.
    ///
    /// May fold the fragment tail into the snapshot afterwards; a failed
    /// fold is logged and swallowed, the appended update is durable either
    /// way.
    pub async fn push(&self, doc: DocId, update: Bytes) -> Result<Option<StoredUpdate>> {
        if self.crdt.is_empty(&update) {
            trace!(doc = %doc.fmt_short(), "push: skipping empty update");
            return Ok(None);
        }
        let guard = self.locks.acquire(doc).await;
        let res = self.push_locked(doc, update);
        guard.release();
        res
    }

    fn push_locked(&self, doc: DocId, update: Bytes) -> Result<Option<StoredUpdate>> {
        if let Some(merged) = self.merged_locked(doc)? {
            let state_vector = self.crdt.state_vector(&merged)?;
            let delta = self.crdt.diff(&update, Some(&state_vector))?;
            if self.crdt.is_empty(&delta) {
                trace!(doc = %doc.fmt_short(), "push: nothing new, skipping");
                return Ok(None);
            }
        }
        let stored = self.store.append_update(doc, update)?;
        debug!(doc = %doc.fmt_short(), timestamp = stored.timestamp, "appended update");

        let fragments = self.store.updates(doc)?.len();
        if fragments > self.options.merge_threshold {
            if let Err(err) = self.compact_locked(doc) {
                warn!(doc = %doc.fmt_short(), ?err, "compaction failed, keeping fragments");
            }
        }
        Ok(Some(stored))
    }

    /// Compute the delta a peer with `state_vector` is missing.
    ///
    /// `None` for the state vector means the peer has nothing and receives
    /// the full document. Returns `None` only when the document itself is
    /// empty; a peer that already has everything gets a diff with an empty
    /// delta, which still carries our state vector and clock.
    pub async fn pull(&self, doc: DocId, state_vector: Option<&[u8]>) -> Result<Option<DocDiff>> {
        let guard = self.locks.acquire(doc).await;
        let res = self.pull_locked(doc, state_vector);
        guard.release();
        res
    }

    fn pull_locked(&self, doc: DocId, state_vector: Option<&[u8]>) -> Result<Option<DocDiff>> {
        let Some(merged) = self.merged_locked(doc)? else {
            return Ok(None);
        };
        let delta = self.crdt.diff(&merged, state_vector)?;
        if self.crdt.is_empty(&delta) {
            trace!(doc = %doc.fmt_short(), "pull: peer is up to date");
        }
        let timestamp = self.store.local_clock(doc)?.unwrap_or_default();
        Ok(Some(DocDiff {
            delta,
            state_vector: self.crdt.state_vector(&merged)?,
            timestamp,
        }))
    }

    /// The full merged state of a document, if it has any.
    pub async fn merged(&self, doc: DocId) -> Result<Option<Bytes>> {
        let guard = self.locks.acquire(doc).await;
        let res = self.merged_locked(doc);
        guard.release();
        res
    }

    /// The state vector of a document's full merged state.
    pub async fn state_vector(&self, doc: DocId) -> Result<Option<Bytes>> {
        match self.merged(doc).await? {
            Some(merged) => Ok(Some(self.crdt.state_vector(&merged)?)),
            None => Ok(None),
        }
    }

    /// Fold the fragment tail into the snapshot now, regardless of the
    /// merge threshold. Returns whether anything was folded.
    pub async fn compact(&self, doc: DocId) -> Result<bool> {
        let guard = self.locks.acquire(doc).await;
        let res = self.compact_locked(doc);
        guard.release();
        res
    }

    fn merged_locked(&self, doc: DocId) -> Result<Option<Bytes>> {
        let snapshot = self.store.snapshot(doc)?;
        let fragments = self.store.updates(doc)?;
        if snapshot.is_none() && fragments.is_empty() {
            return Ok(None);
        }
        let mut parts: Vec<Bytes> = Vec::with_capacity(fragments.len() + 1);
        if let Some(snapshot) = snapshot {
            parts.push(snapshot.data);
        }
        parts.extend(fragments.into_iter().map(|fragment| fragment.data));
        Ok(Some(self.crdt.merge(&parts)?))
    }

    fn compact_locked(&self, doc: DocId) -> Result<bool> {
        let snapshot = self.store.snapshot(doc)?;
        let fragments = self.store.updates(doc)?;
        if fragments.is_empty() {
            return Ok(false);
        }
        let folded: Vec<u64> = fragments.iter().map(|fragment| fragment.timestamp).collect();
        let timestamp = folded
            .iter()
            .copied()
            .chain(snapshot.as_ref().map(|s| s.timestamp))
            .max()
            .unwrap_or_default();
        let mut parts: Vec<Bytes> = Vec::with_capacity(fragments.len() + 1);
        if let Some(snapshot) = snapshot {
            parts.push(snapshot.data);
        }
        parts.extend(fragments.into_iter().map(|fragment| fragment.data));
        let data = self.crdt.merge(&parts)?;
        self.store
            .replace_updates(doc, &folded, Snapshot { timestamp, data })?;
        debug!(
            doc = %doc.fmt_short(),
            folded = folded.len(),
            timestamp,
            "compacted fragments into snapshot"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crdt::GSet,
        store::{memory, PeerClockKind},
    };

    fn log(merge_threshold: usize) -> UpdateLog<memory::Store, GSet> {
        UpdateLog::new(
            memory::Store::new(),
            Arc::new(GSet),
            Options {
                merge_threshold,
                ..Default::default()
            },
        )
    }

    fn doc(byte: u8) -> DocId {
        DocId::from([byte; 32])
    }

    #[tokio::test]
    async fn test_push_skips_empty_and_known() -> Result<()> {
        let log = log(16);
        let doc = doc(1);
        assert!(log.push(doc, GSet::empty()).await?.is_none());

        let update = GSet::update(1, 1..=3);
        assert!(log.push(doc, update.clone()).await?.is_some());
        // The same update again carries nothing new.
        assert!(log.push(doc, update).await?.is_none());
        // A subset carries nothing new either.
        assert!(log.push(doc, GSet::update(1, [2])).await?.is_none());
        // A superset does.
        assert!(log.push(doc, GSet::update(1, 1..=4)).await?.is_some());
        assert_eq!(log.store().updates(doc)?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_pull_against_state_vector() -> Result<()> {
        let log = log(16);
        let doc = doc(1);
        assert!(log.pull(doc, None).await?.is_none());

        log.push(doc, GSet::update(1, 1..=3)).await?;
        log.push(doc, GSet::update(2, 1..=2)).await?;

        // A fresh peer gets the full document.
        let diff = log.pull(doc, None).await?.unwrap();
        let full = log.merged(doc).await?.unwrap();
        assert_eq!(diff.delta, full);
        assert_eq!(diff.timestamp, log.store().local_clock(doc)?.unwrap());

        // A peer that has author 1 gets only author 2.
        let partial = GSet.state_vector(&GSet::update(1, 1..=3))?;
        let diff = log.pull(doc, Some(&partial)).await?.unwrap();
        assert_eq!(diff.delta, GSet::update(2, 1..=2));

        // A peer that has everything gets an empty delta, but still our
        // state vector and clock.
        let diff = log.pull(doc, Some(&diff.state_vector)).await?.unwrap();
        assert!(GSet.is_empty(&diff.delta));
        assert_eq!(diff.timestamp, log.store().local_clock(doc)?.unwrap());
        Ok(())
    }

    #[tokio::test]
    async fn test_compaction_at_threshold() -> Result<()> {
        let log = log(3);
        let doc = doc(1);
        for seq in 1..=3u64 {
            log.push(doc, GSet::update(1, [seq])).await?;
        }
        assert!(log.store().snapshot(doc)?.is_none());
        assert_eq!(log.store().updates(doc)?.len(), 3);

        // The fourth push crosses the threshold and folds everything.
        let before = log.merged(doc).await?.unwrap();
        log.push(doc, GSet::update(1, [4])).await?;
        let snapshot = log.store().snapshot(doc)?.unwrap();
        assert!(log.store().updates(doc)?.is_empty());
        assert_eq!(snapshot.timestamp, log.store().local_clock(doc)?.unwrap());

        // Compaction must not change the merged state.
        let after = log.merged(doc).await?.unwrap();
        assert_eq!(after, GSet.merge(&[before, GSet::update(1, [4])])?);
        Ok(())
    }

    #[tokio::test]
    async fn test_manual_compact() -> Result<()> {
        let log = log(100);
        let doc = doc(1);
        assert!(!log.compact(doc).await?);
        log.push(doc, GSet::update(1, [1])).await?;
        log.push(doc, GSet::update(2, [1])).await?;
        assert!(log.compact(doc).await?);
        assert!(!log.compact(doc).await?);
        assert!(log.store().updates(doc)?.is_empty());
        let merged = log.merged(doc).await?.unwrap();
        assert_eq!(
            merged,
            GSet.merge(&[GSet::update(1, [1]), GSet::update(2, [1])])?
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_push_after_compaction_still_dedupes() -> Result<()> {
        let log = log(1);
        let doc = doc(1);
        log.push(doc, GSet::update(1, [1])).await?;
        log.push(doc, GSet::update(1, [2])).await?;
        // History now lives in the snapshot only.
        assert!(log.store().updates(doc)?.is_empty());
        assert!(log.push(doc, GSet::update(1, 1..=2)).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_clock_advances_with_push() -> Result<()> {
        let log = log(16);
        let doc = doc(1);
        let peer = crate::PeerId::from([9u8; 32]);
        let stored = log.push(doc, GSet::update(1, [1])).await?.unwrap();
        log.store()
            .set_peer_clock(PeerClockKind::Pulled, peer, doc, stored.timestamp)?;
        assert_eq!(
            log.store().peer_pulled_clock(peer, doc)?,
            Some(stored.timestamp)
        );
        Ok(())
    }
}
