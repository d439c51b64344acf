//! The transport boundary between peers.
//!
//! The engine does not open sockets. The caller supplies a [`Transport`]
//! that can deliver a [`Payload`] to a peer and return its [`Ack`];
//! anything request/response shaped fits (HTTP, a QUIC stream, a message
//! port between browser contexts). Inbound traffic enters through
//! [`crate::SyncEngine::deliver`] on the receiving side, which produces the
//! `Ack` the sender's transport resolves with.

use std::future::Future;

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{BlobKey, DocId, PeerId};

/// A message sent to a peer during a sync session.
#[derive(Debug, Clone, Serialize, Deserialize, strum::Display)]
pub enum Payload {
    /// A delta the receiver is (believed to be) missing.
    Push {
        /// Update bytes to merge.
        delta: Bytes,
        /// The sender's local clock for the doc at send time.
        timestamp: u64,
    },
    /// A request for everything newer than the sender's state vector.
    PullRequest {
        /// The requester's state vector; `None` requests the full document.
        state_vector: Option<Bytes>,
    },
    /// The answer to a [`Payload::PullRequest`].
    PullResponse {
        /// Update bytes the requester was missing. Empty when the requester
        /// already had everything.
        delta: Bytes,
        /// The responder's full state vector.
        state_vector: Bytes,
        /// The responder's local clock for the doc.
        timestamp: u64,
    },
    /// A blob the receiver has not confirmed yet.
    BlobPush {
        /// Content-derived key.
        key: BlobKey,
        /// Blob bytes.
        data: Bytes,
        /// Mime type as stored.
        mime: String,
    },
}

/// The receiver's reply to a [`Payload`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ack {
    /// The receiver's local clock for the doc after applying the payload,
    /// if it has one.
    pub timestamp: Option<u64>,
    /// The receiver's state vector after applying the payload, so the
    /// sender can diff precisely next time.
    pub state_vector: Option<Bytes>,
}

/// Delivers payloads to peers.
///
/// `send` resolves once the peer has durably applied the payload; an error
/// means the payload may or may not have arrived, and the engine will
/// retry. Implementations must be safe to call concurrently for different
/// (peer, doc) pairs.
pub trait Transport: Send + Sync + 'static {
    /// Deliver `payload` to `peer` for `doc` and await its ack.
    fn send(
        &self,
        peer: PeerId,
        doc: DocId,
        payload: Payload,
    ) -> impl Future<Output = Result<Ack>> + Send;
}
