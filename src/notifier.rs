//! Change notification between sibling contexts.
//!
//! Several engine instances can run over the same store in one process
//! (think tabs or workers sharing a local database). When one of them
//! writes a document, the others need to find out so they can refresh
//! their in-memory view and re-evaluate sync. [`Notifier`] is that bus:
//! at-least-once delivery to every context except the publishing one.
//!
//! A context that publishes already knows about its own write, so it never
//! receives it back. Duplicate delivery is allowed; consumers treat a
//! notification as "go look at the store", which is idempotent.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::DocId;

/// A document changed in the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocChanged {
    /// The document that changed.
    pub doc: DocId,
    /// The local clock of the document after the change.
    pub timestamp: u64,
}

#[derive(Debug, Default)]
struct Shared {
    subscribers: Vec<Subscriber>,
    next_ctx: u64,
}

#[derive(Debug)]
struct Subscriber {
    ctx: u64,
    tx: flume::Sender<DocChanged>,
}

/// The notification bus shared by all contexts over one store.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    inner: Arc<Mutex<Shared>>,
}

impl Notifier {
    /// Create a new bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new context on the bus.
    pub fn register(&self) -> NotifierHandle {
        let mut shared = self.inner.lock();
        let ctx = shared.next_ctx;
        shared.next_ctx += 1;
        NotifierHandle {
            ctx,
            inner: self.inner.clone(),
        }
    }
}

/// One context's handle onto the [`Notifier`] bus.
#[derive(Debug, Clone)]
pub struct NotifierHandle {
    ctx: u64,
    inner: Arc<Mutex<Shared>>,
}

impl NotifierHandle {
    /// Subscribe to changes published by other contexts.
    ///
    /// Changes published through this handle are not delivered to the
    /// returned receiver. Dropping the receiver unsubscribes; the dead
    /// channel is pruned on the next publish.
    pub fn subscribe(&self) -> flume::Receiver<DocChanged> {
        let (tx, rx) = flume::unbounded();
        self.inner.lock().subscribers.push(Subscriber {
            ctx: self.ctx,
            tx,
        });
        rx
    }

    /// Publish a change to every other context.
    pub fn publish(&self, doc: DocId, timestamp: u64) {
        let event = DocChanged { doc, timestamp };
        let mut shared = self.inner.lock();
        shared
            .subscribers
            .retain(|sub| sub.ctx == self.ctx || sub.tx.send(event).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(byte: u8) -> DocId {
        DocId::from([byte; 32])
    }

    #[test]
    fn test_not_delivered_to_self() {
        let bus = Notifier::new();
        let a = bus.register();
        let b = bus.register();
        let a_rx = a.subscribe();
        let b_rx = b.subscribe();

        a.publish(doc(1), 10);
        assert_eq!(b_rx.try_recv().unwrap(), DocChanged { doc: doc(1), timestamp: 10 });
        assert!(a_rx.try_recv().is_err());
    }

    #[test]
    fn test_fan_out_and_order() {
        let bus = Notifier::new();
        let publisher = bus.register();
        let rx1 = bus.register().subscribe();
        let rx2 = bus.register().subscribe();

        publisher.publish(doc(1), 1);
        publisher.publish(doc(2), 2);
        for rx in [rx1, rx2] {
            assert_eq!(rx.try_recv().unwrap().doc, doc(1));
            assert_eq!(rx.try_recv().unwrap().doc, doc(2));
        }
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let bus = Notifier::new();
        let publisher = bus.register();
        let listener = bus.register();
        drop(listener.subscribe());
        let live = listener.subscribe();

        publisher.publish(doc(1), 1);
        assert_eq!(live.try_recv().unwrap().doc, doc(1));
        // Only the live subscriber remains registered.
        assert_eq!(publisher.inner.lock().subscribers.len(), 1);
    }
}
