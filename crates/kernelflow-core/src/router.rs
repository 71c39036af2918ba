//! Actor-to-actor message routing.
//!
//! Every actor registers one unbounded mailbox. Deliveries inside a run are
//! counted on the run so the engine can wait for in-flight work to drain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::error::{EngineError, Result};
use crate::message::{ActorMessage, Envelope};
use crate::run::RunContext;
use crate::types::ActorId;

/// Receiving half of an actor mailbox.
pub type Mailbox = mpsc::UnboundedReceiver<Envelope>;

/// Routes messages to actor mailboxes by [`ActorId`].
pub struct ActorRouter {
    endpoints: RwLock<HashMap<ActorId, mpsc::UnboundedSender<Envelope>>>,
    delivered: AtomicU64,
}

impl ActorRouter {
    /// Create an empty router.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: RwLock::new(HashMap::new()),
            delivered: AtomicU64::new(0),
        })
    }

    /// Register an actor and return its mailbox.
    pub fn register(&self, actor_id: ActorId) -> Mailbox {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.endpoints.write().insert(actor_id, sender);
        receiver
    }

    /// Deliver a run message.
    pub fn send(&self, run: &Arc<RunContext>, to: &ActorId, message: ActorMessage) -> Result<()> {
        let endpoints = self.endpoints.read();
        let sender = endpoints.get(to).ok_or_else(|| {
            EngineError::protocol(to.as_str(), "message addressed to unknown actor")
        })?;

        trace!(run = %run.id(), to = %to, kind = message.kind(), iteration = message.iteration(), "deliver");
        run.message_sent();
        let envelope = Envelope::Run {
            run: Arc::clone(run),
            message,
        };
        if sender.send(envelope).is_err() {
            run.message_done();
            return Err(EngineError::Internal(format!("mailbox of '{}' is closed", to)));
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Ask every actor to drop its pending state. Resolves once all have done so.
    pub fn broadcast_reset(&self) -> Vec<oneshot::Receiver<()>> {
        let endpoints = self.endpoints.read();
        endpoints
            .values()
            .filter_map(|sender| {
                let (tx, rx) = oneshot::channel();
                sender.send(Envelope::Reset(tx)).ok().map(|_| rx)
            })
            .collect()
    }

    /// Stop every mailbox loop and forget the endpoints.
    pub fn stop_all(&self) {
        let mut endpoints = self.endpoints.write();
        for sender in endpoints.values() {
            let _ = sender.send(Envelope::Stop);
        }
        endpoints.clear();
    }

    /// Get statistics.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            registered_endpoints: self.endpoints.read().len(),
            messages_delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ActorRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorRouter")
            .field("endpoints", &self.endpoints.read().len())
            .field("delivered", &self.delivered.load(Ordering::Relaxed))
            .finish()
    }
}

/// Router statistics.
#[derive(Debug, Clone, Default)]
pub struct RouterStats {
    /// Number of registered mailboxes.
    pub registered_endpoints: usize,
    /// Total messages delivered.
    pub messages_delivered: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunContext;
    use crate::store::DeviceTensorStore;
    use crate::types::RunId;

    fn run() -> Arc<RunContext> {
        RunContext::new(RunId(1), Vec::new(), 1, Arc::new(DeviceTensorStore::new()), false).0
    }

    #[tokio::test]
    async fn test_delivery_counts_in_flight() {
        let router = ActorRouter::new();
        let mut mailbox = router.register(ActorId::new("b"));
        let run = run();

        router
            .send(
                &run,
                &ActorId::new("b"),
                ActorMessage::Control {
                    iteration: 0,
                    from: ActorId::new("a"),
                    skipped: false,
                },
            )
            .unwrap();
        assert_eq!(run.in_flight(), 1);
        assert_eq!(router.stats().messages_delivered, 1);

        match mailbox.try_recv().unwrap() {
            Envelope::Run { message, .. } => assert_eq!(message.kind(), "control"),
            other => panic!("unexpected envelope {:?}", other),
        }
        run.message_done();
        assert_eq!(run.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let router = ActorRouter::new();
        let run = run();
        let err = router
            .send(&run, &ActorId::new("ghost"), ActorMessage::Start)
            .unwrap_err();
        assert!(err.is_protocol());
        assert_eq!(run.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_reset_acks() {
        let router = ActorRouter::new();
        let mut mailbox = router.register(ActorId::new("a"));
        let acks = router.broadcast_reset();
        assert_eq!(acks.len(), 1);

        match mailbox.recv().await.unwrap() {
            Envelope::Reset(ack) => ack.send(()).unwrap(),
            other => panic!("unexpected envelope {:?}", other),
        }
        for ack in acks {
            ack.await.unwrap();
        }
    }
}
