//! The live sync actor.
//!
//! Owns all mutable sync state of one engine instance: the set of known
//! peers, the per-(peer, doc) session machines, and the in-flight transfer
//! tasks. Everything reaches it as a [`ToLiveActor`] message; transfers run
//! on a [`JoinSet`] so a slow peer never stalls the loop.

use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
};
use tracing::{debug, error, trace, warn};

use super::state::{Dir, DocSyncState, SessionStates};
use crate::{
    now_millis, notifier::DocChanged, store::PeerClockKind, Ack, BlobKey, Crdt, DocId,
    NotifierHandle, Payload, PeerId, Store, Transport, UpdateLog,
};

/// How often failed sessions are retried and stale ones swept.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// How long a transfer may stay in flight before it counts as stale.
const STALE_TIMEOUT: Duration = Duration::from_secs(30);

/// Messages for the live actor.
#[derive(derive_more::Debug, strum::Display)]
pub(super) enum ToLiveActor {
    AddPeer {
        peer: PeerId,
    },
    RemovePeer {
        peer: PeerId,
    },
    Commit {
        doc: DocId,
        #[debug("{} bytes", update.len())]
        update: Bytes,
        reply: oneshot::Sender<Result<u64>>,
    },
    SyncDoc {
        doc: DocId,
    },
    SyncAll,
    SyncBlobs,
    Deliver {
        peer: PeerId,
        doc: DocId,
        payload: Payload,
        reply: oneshot::Sender<Result<Ack>>,
    },
    ClearClocks {
        peer: PeerId,
        reply: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        reply: oneshot::Sender<flume::Receiver<SyncEvent>>,
    },
    GetState {
        peer: PeerId,
        doc: DocId,
        reply: oneshot::Sender<DocSyncState>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Events observable through [`crate::SyncEngine::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// We pushed a delta and the peer acked it.
    PushFinished {
        /// The peer that acked.
        peer: PeerId,
        /// The document pushed.
        doc: DocId,
        /// Our local clock at send time, now the peer's pushed clock.
        timestamp: u64,
    },
    /// A pull completed and the peer's delta was merged.
    PullFinished {
        /// The peer pulled from.
        peer: PeerId,
        /// The document pulled.
        doc: DocId,
        /// The peer's clock carried by the delta.
        timestamp: u64,
    },
    /// A peer pushed a delta to us and it was merged.
    RemoteApplied {
        /// The sending peer.
        peer: PeerId,
        /// The document changed.
        doc: DocId,
        /// Our local clock after merging.
        timestamp: u64,
    },
    /// Both directions for the pair are known to be caught up.
    CaughtUp {
        /// The peer.
        peer: PeerId,
        /// The document.
        doc: DocId,
    },
    /// A transfer failed or went stale; it will be retried.
    SyncFailed {
        /// The peer.
        peer: PeerId,
        /// The document.
        doc: DocId,
    },
    /// A blob transfer was confirmed by the peer.
    BlobPushed {
        /// The receiving peer.
        peer: PeerId,
        /// The blob.
        key: BlobKey,
    },
}

/// What a finished transfer task reports back to the loop.
#[derive(Debug)]
enum SendOutcome {
    Push {
        peer: PeerId,
        doc: DocId,
        sent_timestamp: u64,
        res: Result<Ack>,
    },
    PullRequest {
        peer: PeerId,
        doc: DocId,
        res: Result<Ack>,
    },
    PullServe {
        peer: PeerId,
        doc: DocId,
        sent_timestamp: u64,
        res: Result<Ack>,
    },
    Blob {
        peer: PeerId,
        key: BlobKey,
        res: Result<Ack>,
    },
}

pub(super) struct LiveActor<S: Store, C: Crdt, T: Transport> {
    log: UpdateLog<S, C>,
    transport: Arc<T>,
    inbox: mpsc::Receiver<ToLiveActor>,
    notifier: NotifierHandle,
    notifications: flume::Receiver<DocChanged>,
    notifications_open: bool,
    peers: HashSet<PeerId>,
    sessions: SessionStates,
    subscribers: Vec<flume::Sender<SyncEvent>>,
    running_tasks: JoinSet<SendOutcome>,
    pending_blobs: HashSet<(PeerId, BlobKey)>,
    failed_blobs: HashSet<(PeerId, BlobKey)>,
}

impl<S: Store, C: Crdt, T: Transport> LiveActor<S, C, T> {
    pub fn new(
        log: UpdateLog<S, C>,
        transport: Arc<T>,
        inbox: mpsc::Receiver<ToLiveActor>,
        notifier: NotifierHandle,
    ) -> Self {
        let notifications = notifier.subscribe();
        Self {
            log,
            transport,
            inbox,
            notifier,
            notifications,
            notifications_open: true,
            peers: HashSet::new(),
            sessions: SessionStates::default(),
            subscribers: Vec::new(),
            running_tasks: JoinSet::new(),
            pending_blobs: HashSet::new(),
            failed_blobs: HashSet::new(),
        }
    }

    pub async fn run(mut self) {
        let mut retries = tokio::time::interval(RETRY_INTERVAL);
        retries.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else {
                        break;
                    };
                    trace!(%msg, "actor message");
                    match msg {
                        ToLiveActor::Shutdown { reply } => {
                            reply.send(()).ok();
                            break;
                        }
                        msg => {
                            if let Err(err) = self.on_actor_message(msg).await {
                                error!(?err, "failed to handle actor message");
                            }
                        }
                    }
                }
                Some(res) = self.running_tasks.join_next() => {
                    match res {
                        Ok(outcome) => {
                            if let Err(err) = self.on_send_outcome(outcome).await {
                                error!(?err, "failed to handle transfer outcome");
                            }
                        }
                        Err(err) if err.is_cancelled() => {}
                        Err(err) => error!(?err, "transfer task panicked"),
                    }
                }
                event = self.notifications.recv_async(), if self.notifications_open => {
                    match event {
                        Ok(event) => {
                            if let Err(err) = self.on_doc_changed(event).await {
                                error!(?err, "failed to handle doc change");
                            }
                        }
                        Err(_) => self.notifications_open = false,
                    }
                }
                _ = retries.tick() => {
                    if let Err(err) = self.on_tick().await {
                        error!(?err, "retry sweep failed");
                    }
                }
            }
        }
        self.running_tasks.abort_all();
        debug!("live actor stopped");
    }

    async fn on_actor_message(&mut self, msg: ToLiveActor) -> Result<()> {
        match msg {
            ToLiveActor::AddPeer { peer } => {
                if self.peers.insert(peer) {
                    debug!(peer = %peer.fmt_short(), "peer added");
                    self.sync_with_peer(peer).await?;
                    self.push_blobs(peer)?;
                }
            }
            ToLiveActor::RemovePeer { peer } => {
                self.peers.remove(&peer);
                self.sessions.clear_peer(peer);
                self.pending_blobs.retain(|(p, _)| *p != peer);
                self.failed_blobs.retain(|(p, _)| *p != peer);
            }
            ToLiveActor::Commit { doc, update, reply } => {
                let res = self.commit(doc, update).await;
                reply.send(res).ok();
            }
            ToLiveActor::SyncDoc { doc } => {
                for peer in self.peers.clone() {
                    self.push_doc(peer, doc).await?;
                    self.pull_doc(peer, doc).await?;
                }
            }
            ToLiveActor::SyncAll => {
                for peer in self.peers.clone() {
                    self.sync_with_peer(peer).await?;
                }
            }
            ToLiveActor::SyncBlobs => {
                for peer in self.peers.clone() {
                    self.push_blobs(peer)?;
                }
            }
            ToLiveActor::Deliver {
                peer,
                doc,
                payload,
                reply,
            } => {
                let res = self.on_deliver(peer, doc, payload).await;
                reply.send(res).ok();
            }
            ToLiveActor::ClearClocks { peer, reply } => {
                let res = self.log.store().clear_peer_clocks(peer);
                self.sessions.clear_peer(peer);
                reply.send(res).ok();
            }
            ToLiveActor::Subscribe { reply } => {
                let (tx, rx) = flume::bounded(64);
                self.subscribers.push(tx);
                reply.send(rx).ok();
            }
            ToLiveActor::GetState { peer, doc, reply } => {
                reply.send(self.sessions.doc_state(peer, doc)).ok();
            }
            ToLiveActor::Shutdown { .. } => unreachable!("handled in run"),
        }
        Ok(())
    }

    /// Append a locally produced update, notify sibling contexts and kick
    /// off pushes. Returns the document's local clock afterwards.
    async fn commit(&mut self, doc: DocId, update: Bytes) -> Result<u64> {
        if let Some(stored) = self.log.push(doc, update).await? {
            self.notifier.publish(doc, stored.timestamp);
            for peer in self.peers.clone() {
                self.push_doc(peer, doc).await?;
            }
            return Ok(stored.timestamp);
        }
        Ok(self.log.store().local_clock(doc)?.unwrap_or_default())
    }

    async fn sync_with_peer(&mut self, peer: PeerId) -> Result<()> {
        for doc in self.log.store().docs()? {
            self.push_doc(peer, doc).await?;
            self.pull_doc(peer, doc).await?;
        }
        Ok(())
    }

    /// Start the push direction for one pair, if there is anything to push
    /// and nothing is already in flight.
    async fn push_doc(&mut self, peer: PeerId, doc: DocId) -> Result<()> {
        if !self.sessions.start(peer, doc, Dir::Push) {
            return Ok(());
        }
        let store = self.log.store();
        let local = store.local_clock(doc)?.unwrap_or_default();
        let pushed = store.peer_pushed_clock(peer, doc)?.unwrap_or_default();
        if local <= pushed {
            self.sessions.finish(peer, doc, Dir::Push);
            return Ok(());
        }
        let state_vector = self.sessions.peer_state_vector(peer, doc).cloned();
        match self.log.pull(doc, state_vector.as_deref()).await? {
            None => {
                self.sessions.finish(peer, doc, Dir::Push);
            }
            Some(diff) if self.log.crdt().is_empty(&diff.delta) => {
                // The peer's state vector already dominates; only the clock
                // was behind.
                self.log
                    .store()
                    .set_peer_clock(PeerClockKind::Pushed, peer, doc, local)?;
                self.sessions.finish(peer, doc, Dir::Push);
                self.emit(SyncEvent::CaughtUp { peer, doc });
            }
            Some(diff) => {
                debug!(
                    peer = %peer.fmt_short(),
                    doc = %doc.fmt_short(),
                    timestamp = diff.timestamp,
                    "pushing delta"
                );
                self.sessions.sent(peer, doc, Dir::Push);
                let sent_timestamp = diff.timestamp;
                let payload = Payload::Push {
                    delta: diff.delta,
                    timestamp: diff.timestamp,
                };
                let transport = self.transport.clone();
                self.running_tasks.spawn(async move {
                    let res = transport.send(peer, doc, payload).await;
                    SendOutcome::Push {
                        peer,
                        doc,
                        sent_timestamp,
                        res,
                    }
                });
            }
        }
        Ok(())
    }

    /// Start the pull direction for one pair, if the peer may have news.
    async fn pull_doc(&mut self, peer: PeerId, doc: DocId) -> Result<()> {
        if !self.sessions.start(peer, doc, Dir::Pull) {
            return Ok(());
        }
        let store = self.log.store();
        let remote = store.peer_remote_clock(peer, doc)?;
        let pulled = store.peer_pulled_clock(peer, doc)?.unwrap_or_default();
        // An unknown remote clock means we have to ask at least once.
        if matches!(remote, Some(remote) if remote <= pulled) {
            self.sessions.finish(peer, doc, Dir::Pull);
            return Ok(());
        }
        let state_vector = self.log.state_vector(doc).await?;
        debug!(peer = %peer.fmt_short(), doc = %doc.fmt_short(), "requesting delta");
        self.sessions.sent(peer, doc, Dir::Pull);
        let payload = Payload::PullRequest { state_vector };
        let transport = self.transport.clone();
        self.running_tasks.spawn(async move {
            let res = transport.send(peer, doc, payload).await;
            SendOutcome::PullRequest { peer, doc, res }
        });
        Ok(())
    }

    /// Send every blob the peer has not confirmed yet.
    fn push_blobs(&mut self, peer: PeerId) -> Result<()> {
        for meta in self.log.store().list_blobs()? {
            self.push_blob(peer, meta.key)?;
        }
        Ok(())
    }

    /// Send one blob, unless it is confirmed or already in flight.
    fn push_blob(&mut self, peer: PeerId, key: BlobKey) -> Result<()> {
        let store = self.log.store();
        if store.blob_uploaded_at(peer, &key)?.is_some() {
            return Ok(());
        }
        if !self.pending_blobs.insert((peer, key)) {
            return Ok(());
        }
        let Some(blob) = store.get_blob(&key)? else {
            self.pending_blobs.remove(&(peer, key));
            return Ok(());
        };
        debug!(peer = %peer.fmt_short(), key = %key.fmt_short(), "pushing blob");
        let payload = Payload::BlobPush {
            key: blob.key,
            data: blob.data,
            mime: blob.mime,
        };
        let transport = self.transport.clone();
        // Blobs have no doc; address the transfer by the key itself.
        let channel = DocId::from(key.to_bytes());
        self.running_tasks.spawn(async move {
            let res = transport.send(peer, channel, payload).await;
            SendOutcome::Blob { peer, key, res }
        });
        Ok(())
    }

    /// Handle an inbound payload and produce the ack the sender awaits.
    async fn on_deliver(&mut self, peer: PeerId, doc: DocId, payload: Payload) -> Result<Ack> {
        trace!(peer = %peer.fmt_short(), doc = %doc.fmt_short(), %payload, "inbound payload");
        match payload {
            Payload::Push { delta, timestamp } => {
                self.apply_remote_delta(peer, doc, delta, timestamp).await?;
                self.ack_for(doc).await
            }
            Payload::PullRequest { state_vector } => {
                if let Some(sv) = state_vector.clone() {
                    self.sessions.set_peer_state_vector(peer, doc, sv);
                }
                if let Some(diff) = self.log.pull(doc, state_vector.as_deref()).await? {
                    let sent_timestamp = diff.timestamp;
                    let payload = Payload::PullResponse {
                        delta: diff.delta,
                        state_vector: diff.state_vector,
                        timestamp: diff.timestamp,
                    };
                    let transport = self.transport.clone();
                    self.running_tasks.spawn(async move {
                        let res = transport.send(peer, doc, payload).await;
                        SendOutcome::PullServe {
                            peer,
                            doc,
                            sent_timestamp,
                            res,
                        }
                    });
                }
                self.ack_for(doc).await
            }
            Payload::PullResponse {
                delta,
                state_vector,
                timestamp,
            } => {
                self.sessions.set_peer_state_vector(peer, doc, state_vector);
                self.apply_remote_delta(peer, doc, delta, timestamp).await?;
                self.ack_for(doc).await
            }
            Payload::BlobPush { key, data, mime } => {
                self.log.store().put_blob(key, data, &mime)?;
                // The sender evidently has the blob; never push it back.
                self.log
                    .store()
                    .set_blob_uploaded_at(peer, &key, Some(now_millis()))?;
                Ok(Ack::default())
            }
        }
    }

    /// Merge a delta received from `peer` and advance its clocks.
    ///
    /// Also resolves a pending pull for the pair: a pushed delta carries at
    /// least as much as the response to our request would have.
    async fn apply_remote_delta(
        &mut self,
        peer: PeerId,
        doc: DocId,
        delta: Bytes,
        timestamp: u64,
    ) -> Result<()> {
        let applied = self.log.push(doc, delta).await?;
        let store = self.log.store();
        store.set_peer_clock(PeerClockKind::Remote, peer, doc, timestamp)?;
        store.set_peer_clock(PeerClockKind::Pulled, peer, doc, timestamp)?;
        self.sessions.finish(peer, doc, Dir::Pull);
        self.emit(SyncEvent::PullFinished {
            peer,
            doc,
            timestamp,
        });
        if let Some(stored) = applied {
            debug!(
                peer = %peer.fmt_short(),
                doc = %doc.fmt_short(),
                timestamp = stored.timestamp,
                "merged remote delta"
            );
            self.notifier.publish(doc, stored.timestamp);
            self.emit(SyncEvent::RemoteApplied {
                peer,
                doc,
                timestamp: stored.timestamp,
            });
            // Forward the news, but never straight back to its source.
            for other in self.peers.clone() {
                if other != peer {
                    self.push_doc(other, doc).await?;
                }
            }
        }
        Ok(())
    }

    async fn ack_for(&self, doc: DocId) -> Result<Ack> {
        Ok(Ack {
            timestamp: self.log.store().local_clock(doc)?,
            state_vector: self.log.state_vector(doc).await?,
        })
    }

    async fn on_send_outcome(&mut self, outcome: SendOutcome) -> Result<()> {
        match outcome {
            SendOutcome::Push {
                peer,
                doc,
                sent_timestamp,
                res,
            } => match res {
                Ok(ack) => {
                    let store = self.log.store();
                    store.set_peer_clock(PeerClockKind::Pushed, peer, doc, sent_timestamp)?;
                    if let Some(timestamp) = ack.timestamp {
                        store.set_peer_clock(PeerClockKind::Remote, peer, doc, timestamp)?;
                    }
                    if let Some(sv) = ack.state_vector {
                        self.sessions.set_peer_state_vector(peer, doc, sv);
                    }
                    self.sessions.finish(peer, doc, Dir::Push);
                    self.emit(SyncEvent::PushFinished {
                        peer,
                        doc,
                        timestamp: sent_timestamp,
                    });
                    // The doc may have moved on while the transfer ran.
                    self.push_doc(peer, doc).await?;
                }
                Err(err) => {
                    warn!(peer = %peer.fmt_short(), doc = %doc.fmt_short(), ?err, "push failed");
                    self.sessions.fail(peer, doc, Dir::Push);
                    self.emit(SyncEvent::SyncFailed { peer, doc });
                }
            },
            SendOutcome::PullRequest { peer, doc, res } => match res {
                Ok(ack) => {
                    let store = self.log.store();
                    if let Some(sv) = ack.state_vector {
                        self.sessions.set_peer_state_vector(peer, doc, sv);
                    }
                    let pulled = store.peer_pulled_clock(peer, doc)?.unwrap_or_default();
                    match ack.timestamp {
                        Some(timestamp) if timestamp > pulled => {
                            store.set_peer_clock(PeerClockKind::Remote, peer, doc, timestamp)?;
                            // The delta is on its way; stay in AwaitingDelta.
                        }
                        _ => {
                            // The peer has nothing we miss.
                            self.sessions.finish(peer, doc, Dir::Pull);
                            self.emit(SyncEvent::CaughtUp { peer, doc });
                        }
                    }
                }
                Err(err) => {
                    warn!(peer = %peer.fmt_short(), doc = %doc.fmt_short(), ?err, "pull request failed");
                    self.sessions.fail(peer, doc, Dir::Pull);
                    self.emit(SyncEvent::SyncFailed { peer, doc });
                }
            },
            SendOutcome::PullServe {
                peer,
                doc,
                sent_timestamp,
                res,
            } => match res {
                Ok(ack) => {
                    let store = self.log.store();
                    store.set_peer_clock(PeerClockKind::Pushed, peer, doc, sent_timestamp)?;
                    if let Some(timestamp) = ack.timestamp {
                        store.set_peer_clock(PeerClockKind::Remote, peer, doc, timestamp)?;
                    }
                    if let Some(sv) = ack.state_vector {
                        self.sessions.set_peer_state_vector(peer, doc, sv);
                    }
                    self.emit(SyncEvent::PushFinished {
                        peer,
                        doc,
                        timestamp: sent_timestamp,
                    });
                }
                Err(err) => {
                    // The requester will ask again; nothing to roll back.
                    warn!(peer = %peer.fmt_short(), doc = %doc.fmt_short(), ?err, "serving pull failed");
                }
            },
            SendOutcome::Blob { peer, key, res } => {
                self.pending_blobs.remove(&(peer, key));
                match res {
                    Ok(_) => {
                        self.log
                            .store()
                            .set_blob_uploaded_at(peer, &key, Some(now_millis()))?;
                        self.emit(SyncEvent::BlobPushed { peer, key });
                    }
                    Err(err) => {
                        warn!(peer = %peer.fmt_short(), key = %key.fmt_short(), ?err, "blob push failed");
                        self.failed_blobs.insert((peer, key));
                    }
                }
            }
        }
        Ok(())
    }

    /// A sibling context wrote a document; push the news out.
    async fn on_doc_changed(&mut self, event: DocChanged) -> Result<()> {
        trace!(doc = %event.doc.fmt_short(), timestamp = event.timestamp, "doc changed elsewhere");
        for peer in self.peers.clone() {
            self.push_doc(peer, event.doc).await?;
        }
        Ok(())
    }

    /// Sweep stale transfers into `Error` and retry everything failed.
    async fn on_tick(&mut self) -> Result<()> {
        for (peer, doc, _) in self.sessions.sweep_stale(STALE_TIMEOUT) {
            warn!(peer = %peer.fmt_short(), doc = %doc.fmt_short(), "transfer went stale");
            self.emit(SyncEvent::SyncFailed { peer, doc });
        }
        for (peer, doc, dir) in self.sessions.failed() {
            if !self.peers.contains(&peer) {
                continue;
            }
            match dir {
                Dir::Push => self.push_doc(peer, doc).await?,
                Dir::Pull => self.pull_doc(peer, doc).await?,
            }
        }
        let failed_blobs: Vec<(PeerId, BlobKey)> = self.failed_blobs.drain().collect();
        for (peer, key) in failed_blobs {
            if !self.peers.contains(&peer) {
                continue;
            }
            self.push_blob(peer, key)?;
        }
        Ok(())
    }

    fn emit(&mut self, event: SyncEvent) {
        self.subscribers
            .retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(flume::TrySendError::Full(_)) => {
                    warn!("subscriber lagging, dropping event");
                    true
                }
                Err(flume::TrySendError::Disconnected(_)) => false,
            });
    }
}

/// Error used by the public handle when the actor is gone.
pub(super) fn actor_gone() -> anyhow::Error {
    anyhow!("sync engine is shut down")
}
