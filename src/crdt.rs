//! The CRDT collaborator boundary.
//!
//! The engine never interprets update bytes itself; everything it needs from
//! the document runtime is expressed through [`Crdt`]. Any runtime whose
//! merge is commutative, associative and idempotent can sit behind this
//! trait (yrs, loro, automerge, or the bundled [`GSet`] reference engine
//! which the test suite runs against).

use anyhow::Result;
use bytes::Bytes;

/// Operations the sync engine needs from a CRDT document runtime.
///
/// All payloads are opaque byte strings produced by the same runtime.
/// Required laws:
///
/// * `merge` is commutative, associative and idempotent,
/// * `diff(u, sv)` returns an empty update iff `sv` already dominates every
///   causal frontier encoded in `u`,
/// * `state_vector(merge([a, b]))` dominates both `state_vector(a)` and
///   `state_vector(b)`.
pub trait Crdt: std::fmt::Debug + Send + Sync + 'static {
    /// Fold a set of updates into a single canonical update.
    fn merge(&self, updates: &[Bytes]) -> Result<Bytes>;

    /// Compute the delta of `update` against a peer's state vector.
    ///
    /// `None` means the peer has nothing; the delta is then the full update.
    fn diff(&self, update: &[u8], state_vector: Option<&[u8]>) -> Result<Bytes>;

    /// Compute the state vector describing the causal frontier of `update`.
    fn state_vector(&self, update: &[u8]) -> Result<Bytes>;

    /// Whether `update` carries no changes at all.
    fn is_empty(&self, update: &[u8]) -> bool;
}

use std::collections::{BTreeMap, BTreeSet};

type Doc = BTreeMap<u64, BTreeSet<u64>>;
type StateVector = BTreeMap<u64, u64>;

/// Grow-only set CRDT, the bundled reference engine.
///
/// A document is a set of `(author, seq)` pairs; an update is any subset of
/// such pairs, postcard-encoded. Merge is set union, the state vector is the
/// per-author maximum. Assumes each author issues dense sequence numbers
/// (1, 2, 3, ...), which makes the max a faithful frontier descriptor.
///
/// This is not meant to carry application data. It exists so the engine's
/// own behavior (compaction, clocks, convergence) can be exercised without
/// pulling in a document runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct GSet;

impl GSet {
    /// Encode an update inserting `seqs` for `author`.
    pub fn update(author: u64, seqs: impl IntoIterator<Item = u64>) -> Bytes {
        let mut doc = Doc::new();
        doc.insert(author, seqs.into_iter().collect());
        Self::encode(&doc)
    }

    /// The empty update.
    pub fn empty() -> Bytes {
        Self::encode(&Doc::new())
    }

    fn encode(doc: &Doc) -> Bytes {
        postcard::to_stdvec(doc)
            .expect("btree maps of integers always serialize")
            .into()
    }

    fn decode(bytes: &[u8]) -> Result<Doc> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

impl Crdt for GSet {
    fn merge(&self, updates: &[Bytes]) -> Result<Bytes> {
        let mut doc = Doc::new();
        for update in updates {
            for (author, seqs) in Self::decode(update)? {
                doc.entry(author).or_default().extend(seqs);
            }
        }
        Ok(Self::encode(&doc))
    }

    fn diff(&self, update: &[u8], state_vector: Option<&[u8]>) -> Result<Bytes> {
        let doc = Self::decode(update)?;
        let sv: StateVector = match state_vector {
            Some(bytes) => postcard::from_bytes(bytes)?,
            None => StateVector::new(),
        };
        let mut delta = Doc::new();
        for (author, seqs) in doc {
            let seen = sv.get(&author).copied().unwrap_or_default();
            let news: BTreeSet<u64> = seqs.into_iter().filter(|seq| *seq > seen).collect();
            if !news.is_empty() {
                delta.insert(author, news);
            }
        }
        Ok(Self::encode(&delta))
    }

    fn state_vector(&self, update: &[u8]) -> Result<Bytes> {
        let doc = Self::decode(update)?;
        let sv: StateVector = doc
            .into_iter()
            .filter_map(|(author, seqs)| seqs.last().copied().map(|max| (author, max)))
            .collect();
        Ok(postcard::to_stdvec(&sv)?.into())
    }

    fn is_empty(&self, update: &[u8]) -> bool {
        match Self::decode(update) {
            Ok(doc) => doc.values().all(|seqs| seqs.is_empty()),
            Err(_) => update.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_merge_idempotent() {
        let crdt = GSet;
        let update = GSet::update(1, 1..=3);
        let once = crdt.merge(&[update.clone()]).unwrap();
        let twice = crdt.merge(&[update.clone(), update]).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_diff_dominance() {
        let crdt = GSet;
        let update = crdt
            .merge(&[GSet::update(1, 1..=3), GSet::update(2, 1..=2)])
            .unwrap();
        let sv = crdt.state_vector(&update).unwrap();
        // A state vector that saw everything yields an empty delta.
        assert!(crdt.is_empty(&crdt.diff(&update, Some(&sv)).unwrap()));
        // A state vector missing author 2 yields only author 2's entries.
        let partial = crdt.state_vector(&GSet::update(1, 1..=3)).unwrap();
        let delta = crdt.diff(&update, Some(&partial)).unwrap();
        assert!(!crdt.is_empty(&delta));
        assert_eq!(delta, GSet::update(2, 1..=2));
    }

    #[test]
    fn test_diff_without_state_vector_is_full() {
        let crdt = GSet;
        let update = GSet::update(7, 1..=4);
        assert_eq!(crdt.diff(&update, None).unwrap(), update);
    }

    #[test]
    fn test_empty_update() {
        let crdt = GSet;
        assert!(crdt.is_empty(&GSet::empty()));
        assert!(!crdt.is_empty(&GSet::update(1, [1])));
    }

    proptest! {
        #[test]
        fn prop_merge_order_independent(
            fragments in prop::collection::vec((0u64..4, 1u64..20), 1..8),
            seed in any::<u64>(),
        ) {
            use rand::{seq::SliceRandom, SeedableRng};

            let crdt = GSet;
            let updates: Vec<Bytes> = fragments
                .iter()
                .map(|(author, max)| GSet::update(*author, 1..=*max))
                .collect();
            let mut shuffled = updates.clone();
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            shuffled.shuffle(&mut rng);

            let a = crdt.merge(&updates).unwrap();
            let b = crdt.merge(&shuffled).unwrap();
            prop_assert_eq!(
                crdt.state_vector(&a).unwrap(),
                crdt.state_vector(&b).unwrap()
            );
            prop_assert_eq!(a, b);
        }
    }
}
