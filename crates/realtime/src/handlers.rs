// Event handler registry for client message types that are not handled
// internally by the service.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, RwLock},
};

use tandem_common::protocol::ws::{Envelope, MessageType};
use tracing::{debug, error};

use crate::{broadcast::EventPublisher, connection::ConnectionId, error::RealtimeError};

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

pub type EventHandler = Arc<dyn Fn(HandlerContext, Envelope) -> HandlerFuture + Send + Sync>;

/// What a handler knows about the sender.
#[derive(Clone)]
pub struct HandlerContext {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub publisher: EventPublisher,
}

/// Types the service consumes itself; registering a handler for them would
/// never run, so it is rejected.
pub const RESERVED_TYPES: [MessageType; 6] = [
    MessageType::Authenticate,
    MessageType::Ping,
    MessageType::UserPresence,
    MessageType::UserTyping,
    MessageType::CursorPosition,
    MessageType::SyncRequest,
];

#[derive(Default)]
pub struct EventHandlerRegistry {
    handlers: RwLock<HashMap<MessageType, Vec<EventHandler>>>,
}

impl EventHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `handler` for `message_type`. Handlers run in registration
    /// order.
    pub fn on<F, Fut>(&self, message_type: MessageType, handler: F) -> Result<(), RealtimeError>
    where
        F: Fn(HandlerContext, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if RESERVED_TYPES.contains(&message_type) {
            return Err(RealtimeError::ReservedMessageType(message_type));
        }
        let handler: EventHandler = Arc::new(move |context, envelope| -> HandlerFuture {
            Box::pin(handler(context, envelope))
        });
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(message_type)
            .or_default()
            .push(handler);
        debug!(message_type = %message_type, "registered event handler");
        Ok(())
    }

    pub fn has_handlers(&self, message_type: MessageType) -> bool {
        self.snapshot(message_type).is_some_and(|handlers| !handlers.is_empty())
    }

    fn snapshot(&self, message_type: MessageType) -> Option<Vec<EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&message_type)
            .cloned()
    }

    /// Runs every handler for the envelope's type in order. A failing or
    /// panicking handler does not stop the ones after it; the failures are
    /// folded into a single `MessageHandling` error.
    pub async fn dispatch(
        &self,
        context: HandlerContext,
        envelope: Envelope,
    ) -> Result<(), RealtimeError> {
        let message_type = envelope.message_type;
        let Some(handlers) = self.snapshot(message_type).filter(|handlers| !handlers.is_empty())
        else {
            return Err(RealtimeError::Unsupported(message_type));
        };

        let mut failures = Vec::new();
        for (index, handler) in handlers.into_iter().enumerate() {
            let task = tokio::spawn(handler(context.clone(), envelope.clone()));
            let reason = match task.await {
                Ok(Ok(())) => continue,
                Ok(Err(failure)) => failure.to_string(),
                Err(join_error) if join_error.is_panic() => "handler panicked".to_string(),
                Err(join_error) => join_error.to_string(),
            };
            error!(
                connection_id = %context.connection_id,
                message_type = %message_type,
                handler = index,
                reason = %reason,
                "event handler failed"
            );
            failures.push(reason);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RealtimeError::MessageHandling { message_type, reason: failures.join("; ") })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broadcast::BroadcastEngine, cache::InMemoryCache, connection::ConnectionRegistry,
        offline::OfflineEventStore, room::RoomManager,
    };
    use std::time::Duration;
    use tokio::sync::Mutex;

    fn context() -> HandlerContext {
        let cache = Arc::new(InMemoryCache::new());
        let engine = BroadcastEngine::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(RoomManager::new()),
            Arc::new(OfflineEventStore::new(cache, 10, Duration::from_secs(60))),
        );
        HandlerContext {
            connection_id: ConnectionId::new(),
            user_id: "u1".into(),
            publisher: EventPublisher::new(Arc::new(engine)),
        }
    }

    fn envelope(message_type: MessageType) -> Envelope {
        Envelope::new(message_type, serde_json::json!({ "id": "t1" }))
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let registry = EventHandlerRegistry::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second"] {
            let calls = calls.clone();
            registry
                .on(MessageType::TaskCreated, move |_, _| {
                    let calls = calls.clone();
                    async move {
                        calls.lock().await.push(label);
                        Ok(())
                    }
                })
                .expect("registration should succeed");
        }

        registry
            .dispatch(context(), envelope(MessageType::TaskCreated))
            .await
            .expect("dispatch should succeed");

        assert_eq!(*calls.lock().await, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_later_handlers() {
        let registry = EventHandlerRegistry::new();
        let reached = Arc::new(Mutex::new(false));
        registry
            .on(MessageType::TaskUpdated, |_, _| async { Err(anyhow::anyhow!("storage offline")) })
            .expect("registration should succeed");
        let flag = reached.clone();
        registry
            .on(MessageType::TaskUpdated, move |_, _| {
                let flag = flag.clone();
                async move {
                    *flag.lock().await = true;
                    Ok(())
                }
            })
            .expect("registration should succeed");

        let result = registry.dispatch(context(), envelope(MessageType::TaskUpdated)).await;

        match result {
            Err(RealtimeError::MessageHandling { message_type, reason }) => {
                assert_eq!(message_type, MessageType::TaskUpdated);
                assert!(reason.contains("storage offline"));
            }
            other => panic!("expected handling error, got {other:?}"),
        }
        assert!(*reached.lock().await);
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let registry = EventHandlerRegistry::new();
        registry
            .on(MessageType::TaskMoved, |_, envelope| async move {
                assert!(envelope.data.is_null(), "handler bug");
                Ok(())
            })
            .expect("registration should succeed");

        let result = registry.dispatch(context(), envelope(MessageType::TaskMoved)).await;

        assert!(matches!(result, Err(RealtimeError::MessageHandling { .. })));
    }

    #[tokio::test]
    async fn handler_receives_sender_identity() {
        let registry = EventHandlerRegistry::new();
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        registry
            .on(MessageType::ConflictResolution, move |context, envelope| {
                let slot = slot.clone();
                async move {
                    *slot.lock().await = Some((context.user_id, envelope.data["id"].clone()));
                    Ok(())
                }
            })
            .expect("registration should succeed");

        registry
            .dispatch(context(), envelope(MessageType::ConflictResolution))
            .await
            .expect("dispatch should succeed");

        assert_eq!(*seen.lock().await, Some(("u1".to_string(), serde_json::json!("t1"))));
    }

    #[test]
    fn internal_types_cannot_be_registered() {
        let registry = EventHandlerRegistry::new();
        for message_type in RESERVED_TYPES {
            let result = registry.on(message_type, |_, _| async { Ok(()) });
            assert!(matches!(result, Err(RealtimeError::ReservedMessageType(t)) if t == message_type));
        }
        assert!(!registry.has_handlers(MessageType::Ping));
    }

    #[tokio::test]
    async fn types_without_handlers_are_unsupported() {
        let registry = EventHandlerRegistry::new();
        let result = registry.dispatch(context(), envelope(MessageType::TaskDeleted)).await;
        assert!(matches!(result, Err(RealtimeError::Unsupported(MessageType::TaskDeleted))));
    }
}
