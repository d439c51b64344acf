//! The sync coordinator.
//!
//! [`SyncEngine`] spawns one [`live::LiveActor`] per context and hides its
//! message channel behind plain async methods. The handle is cheap to
//! clone; the actor stops when [`SyncEngine::shutdown`] is called or the
//! last handle is dropped.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{error_span, Instrument};

use crate::{Ack, Crdt, DocId, NotifierHandle, Payload, PeerId, Store, Transport, UpdateLog};

mod live;
mod state;

use self::live::{actor_gone, LiveActor, ToLiveActor};
pub use self::live::SyncEvent;
pub use self::state::{DocSyncState, SyncState};

const ACTOR_INBOX_CAP: usize = 64;

/// Handle onto a running sync engine.
///
/// One engine instance per context (tab, worker, process); instances over
/// the same store coordinate through the [`crate::Notifier`] bus.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    to_actor: mpsc::Sender<ToLiveActor>,
    _task: Arc<AbortOnDrop>,
}

#[derive(Debug)]
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl SyncEngine {
    /// Spawn the engine over a store, a CRDT runtime and a transport.
    ///
    /// `notifier` must come from the [`crate::Notifier`] bus shared by all
    /// contexts over the same store.
    pub fn spawn<S: Store, C: Crdt, T: Transport>(
        store: S,
        crdt: C,
        transport: T,
        notifier: NotifierHandle,
        options: crate::Options,
    ) -> Self {
        let (to_actor, inbox) = mpsc::channel(ACTOR_INBOX_CAP);
        let log = UpdateLog::new(store, Arc::new(crdt), options);
        let actor = LiveActor::new(log, Arc::new(transport), inbox, notifier);
        let task = tokio::task::spawn(actor.run().instrument(error_span!("sync-engine")));
        Self {
            to_actor,
            _task: Arc::new(AbortOnDrop(task)),
        }
    }

    /// Start syncing with a peer: full push/pull over all known documents
    /// and all unconfirmed blobs.
    pub async fn add_peer(&self, peer: PeerId) -> Result<()> {
        self.send(ToLiveActor::AddPeer { peer }).await
    }

    /// Stop syncing with a peer and drop its session state. Clocks are
    /// kept, so a later [`SyncEngine::add_peer`] resumes incrementally.
    pub async fn remove_peer(&self, peer: PeerId) -> Result<()> {
        self.send(ToLiveActor::RemovePeer { peer }).await
    }

    /// Append a locally produced update to a document and push it out.
    ///
    /// Returns the document's local clock after the commit. Committing an
    /// update the document already contains is a no-op.
    pub async fn commit(&self, doc: DocId, update: Bytes) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(ToLiveActor::Commit { doc, update, reply }).await?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Re-evaluate sync for one document against all peers.
    pub async fn sync_doc(&self, doc: DocId) -> Result<()> {
        self.send(ToLiveActor::SyncDoc { doc }).await
    }

    /// Re-evaluate sync for all documents against all peers.
    pub async fn sync_all(&self) -> Result<()> {
        self.send(ToLiveActor::SyncAll).await
    }

    /// Push unconfirmed blobs to all peers.
    pub async fn sync_blobs(&self) -> Result<()> {
        self.send(ToLiveActor::SyncBlobs).await
    }

    /// Hand an inbound payload from `peer` to the engine.
    ///
    /// This is the receiving half of the protocol: the caller's transport
    /// server feeds payloads in here and returns the produced [`Ack`] to
    /// the sender.
    pub async fn deliver(&self, peer: PeerId, doc: DocId, payload: Payload) -> Result<Ack> {
        let (reply, rx) = oneshot::channel();
        self.send(ToLiveActor::Deliver {
            peer,
            doc,
            payload,
            reply,
        })
        .await?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Administrative reset of everything known about a peer's sync
    /// progress, forcing a full re-sync on the next session.
    pub async fn clear_peer_clocks(&self, peer: PeerId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ToLiveActor::ClearClocks { peer, reply }).await?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Subscribe to sync events.
    pub async fn subscribe(&self) -> Result<flume::Receiver<SyncEvent>> {
        let (reply, rx) = oneshot::channel();
        self.send(ToLiveActor::Subscribe { reply }).await?;
        rx.await.map_err(|_| actor_gone())
    }

    /// The session state of one (peer, doc) pair.
    pub async fn state(&self, peer: PeerId, doc: DocId) -> Result<DocSyncState> {
        let (reply, rx) = oneshot::channel();
        self.send(ToLiveActor::GetState { peer, doc, reply }).await?;
        rx.await.map_err(|_| actor_gone())
    }

    /// Stop the actor, waiting for it to wind down.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ToLiveActor::Shutdown { reply }).await?;
        rx.await.map_err(|_| actor_gone())
    }

    async fn send(&self, msg: ToLiveActor) -> Result<()> {
        self.to_actor.send(msg).await.map_err(|_| actor_gone())
    }
}
