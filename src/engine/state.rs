//! Per-(peer, doc) sync session bookkeeping.
//!
//! Each pair tracks two independent directions: pushing our history out
//! and pulling the peer's history in. A direction moves through
//! `Idle -> Diffing -> AwaitingAck | AwaitingDelta -> Idle`, landing in
//! `Error` when a transfer fails or goes stale; `Error` is a resting state
//! the retry sweep restarts from.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use bytes::Bytes;

use crate::{DocId, PeerId};

/// State of one direction of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum SyncState {
    /// Nothing in flight.
    #[default]
    Idle,
    /// Computing what the peer is missing.
    Diffing,
    /// A delta was sent, waiting for the peer's ack.
    AwaitingAck,
    /// A pull request was sent, waiting for the peer's delta.
    AwaitingDelta,
    /// The last attempt failed; eligible for retry.
    Error,
}

/// Both directions of a (peer, doc) pair's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DocSyncState {
    /// Outbound direction (our history towards the peer).
    pub push: SyncState,
    /// Inbound direction (the peer's history towards us).
    pub pull: SyncState,
}

/// Which direction of a session an operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Dir {
    Push,
    Pull,
}

#[derive(Debug)]
struct DirState {
    state: SyncState,
    since: Instant,
}

impl Default for DirState {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            since: Instant::now(),
        }
    }
}

impl DirState {
    fn set(&mut self, state: SyncState) {
        self.state = state;
        self.since = Instant::now();
    }

    fn in_flight(&self) -> bool {
        matches!(
            self.state,
            SyncState::Diffing | SyncState::AwaitingAck | SyncState::AwaitingDelta
        )
    }
}

#[derive(Debug, Default)]
struct Session {
    push: DirState,
    pull: DirState,
    /// Last state vector the peer reported for this doc, from an ack or a
    /// pull request. Lets the next push send a precise delta.
    peer_state_vector: Option<Bytes>,
}

impl Session {
    fn dir(&self, dir: Dir) -> &DirState {
        match dir {
            Dir::Push => &self.push,
            Dir::Pull => &self.pull,
        }
    }

    fn dir_mut(&mut self, dir: Dir) -> &mut DirState {
        match dir {
            Dir::Push => &mut self.push,
            Dir::Pull => &mut self.pull,
        }
    }
}

/// All live sessions of one engine.
#[derive(Debug, Default)]
pub(super) struct SessionStates {
    sessions: HashMap<(PeerId, DocId), Session>,
}

impl SessionStates {
    /// Try to move a direction from `Idle` or `Error` into `Diffing`.
    /// Returns false while a transfer is already in flight.
    pub fn start(&mut self, peer: PeerId, doc: DocId, dir: Dir) -> bool {
        let session = self.sessions.entry((peer, doc)).or_default();
        let state = session.dir_mut(dir);
        if state.in_flight() {
            return false;
        }
        state.set(SyncState::Diffing);
        true
    }

    /// Record that the transfer for a direction is now in flight.
    pub fn sent(&mut self, peer: PeerId, doc: DocId, dir: Dir) {
        let state = match dir {
            Dir::Push => SyncState::AwaitingAck,
            Dir::Pull => SyncState::AwaitingDelta,
        };
        self.sessions
            .entry((peer, doc))
            .or_default()
            .dir_mut(dir)
            .set(state);
    }

    /// Mark a direction finished.
    pub fn finish(&mut self, peer: PeerId, doc: DocId, dir: Dir) {
        self.sessions
            .entry((peer, doc))
            .or_default()
            .dir_mut(dir)
            .set(SyncState::Idle);
    }

    /// Mark a direction failed; the retry sweep will pick it up.
    pub fn fail(&mut self, peer: PeerId, doc: DocId, dir: Dir) {
        self.sessions
            .entry((peer, doc))
            .or_default()
            .dir_mut(dir)
            .set(SyncState::Error);
    }

    /// The peer's last reported state vector for a doc.
    pub fn peer_state_vector(&self, peer: PeerId, doc: DocId) -> Option<&Bytes> {
        self.sessions
            .get(&(peer, doc))
            .and_then(|session| session.peer_state_vector.as_ref())
    }

    /// Remember the peer's state vector for a doc.
    pub fn set_peer_state_vector(&mut self, peer: PeerId, doc: DocId, state_vector: Bytes) {
        self.sessions
            .entry((peer, doc))
            .or_default()
            .peer_state_vector = Some(state_vector);
    }

    /// Both directions of a pair, `Idle` if the pair was never seen.
    pub fn doc_state(&self, peer: PeerId, doc: DocId) -> DocSyncState {
        self.sessions
            .get(&(peer, doc))
            .map(|session| DocSyncState {
                push: session.push.state,
                pull: session.pull.state,
            })
            .unwrap_or_default()
    }

    /// Move directions that have been in flight longer than `timeout` to
    /// `Error`, returning them for retry.
    pub fn sweep_stale(&mut self, timeout: Duration) -> Vec<(PeerId, DocId, Dir)> {
        let now = Instant::now();
        let mut stale = Vec::new();
        for ((peer, doc), session) in self.sessions.iter_mut() {
            for dir in [Dir::Push, Dir::Pull] {
                let state = session.dir_mut(dir);
                if state.in_flight() && now.duration_since(state.since) >= timeout {
                    state.set(SyncState::Error);
                    stale.push((*peer, *doc, dir));
                }
            }
        }
        stale
    }

    /// All directions currently resting in `Error`.
    pub fn failed(&self) -> Vec<(PeerId, DocId, Dir)> {
        let mut out = Vec::new();
        for ((peer, doc), session) in self.sessions.iter() {
            for dir in [Dir::Push, Dir::Pull] {
                if session.dir(dir).state == SyncState::Error {
                    out.push((*peer, *doc, dir));
                }
            }
        }
        out
    }

    /// Forget everything about a peer.
    pub fn clear_peer(&mut self, peer: PeerId) {
        self.sessions.retain(|(p, _), _| *p != peer);
    }
}
