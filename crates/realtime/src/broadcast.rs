// Broadcast engine: best-effort fan-out to rooms and users, plus the
// domain-event entry points that also persist to the offline log.

use std::{collections::HashSet, sync::Arc};

use serde_json::Value;
use tandem_common::protocol::ws::{Envelope, MessageType, TaskEventType, WorkspaceEventType};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnectionId, ConnectionRegistry},
    offline::OfflineEventStore,
    room::RoomManager,
};

/// Outcome of a domain-event broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub persisted: bool,
}

pub struct BroadcastEngine {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
    offline: Arc<OfflineEventStore>,
}

impl BroadcastEngine {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomManager>,
        offline: Arc<OfflineEventStore>,
    ) -> Self {
        Self { registry, rooms, offline }
    }

    /// Delivers to every authenticated member of the room except `exclude`.
    /// Returns the number of connections the message was queued for.
    pub async fn broadcast_to_room(
        &self,
        workspace_id: &str,
        envelope: Envelope,
        exclude: Option<ConnectionId>,
    ) -> usize {
        self.deliver_to_room(workspace_id, envelope, exclude).await.len()
    }

    /// Delivers to every authenticated connection of `user_id`, regardless
    /// of room membership.
    pub async fn broadcast_to_user(&self, user_id: &str, envelope: Envelope) -> usize {
        self.registry
            .user_recipients(user_id)
            .await
            .into_iter()
            .filter(|recipient| recipient.deliver(envelope.clone()))
            .count()
    }

    pub async fn broadcast_task_event(
        &self,
        event: TaskEventType,
        workspace_id: &str,
        data: Value,
    ) -> BroadcastReport {
        let message_type = MessageType::from(event);
        let persisted = self.persist(workspace_id, message_type, &data).await;
        let envelope = Envelope::new(message_type, data).with_workspace(workspace_id);
        let delivered = self.broadcast_to_room(workspace_id, envelope, None).await;
        BroadcastReport { delivered, persisted }
    }

    /// Membership events also reach the affected user (`data.userId`) on
    /// connections outside the room.
    pub async fn broadcast_workspace_event(
        &self,
        event: WorkspaceEventType,
        workspace_id: &str,
        data: Value,
    ) -> BroadcastReport {
        let message_type = MessageType::from(event);
        let persisted = self.persist(workspace_id, message_type, &data).await;
        let member = event
            .targets_member()
            .then(|| data.get("userId").and_then(Value::as_str).map(ToOwned::to_owned))
            .flatten();
        let envelope = Envelope::new(message_type, data).with_workspace(workspace_id);

        let reached = self.deliver_to_room(workspace_id, envelope.clone(), None).await;
        let mut delivered = reached.len();
        if let Some(user_id) = member {
            let reached: HashSet<ConnectionId> = reached.into_iter().collect();
            delivered += self
                .registry
                .user_recipients(&user_id)
                .await
                .into_iter()
                .filter(|recipient| !reached.contains(&recipient.id))
                .filter(|recipient| recipient.deliver(envelope.clone()))
                .count();
        }
        BroadcastReport { delivered, persisted }
    }

    async fn deliver_to_room(
        &self,
        workspace_id: &str,
        mut envelope: Envelope,
        exclude: Option<ConnectionId>,
    ) -> Vec<ConnectionId> {
        let now = Instant::now();
        let members = match self.rooms.members(workspace_id).await {
            Some(members) => {
                self.rooms.touch(workspace_id, now).await;
                members
            }
            None => {
                let joined = self.registry.joined_connections(workspace_id).await;
                if joined.is_empty() {
                    debug!(workspace_id, "broadcast to empty workspace");
                    return Vec::new();
                }
                self.rooms.restore(workspace_id, &joined, now).await;
                info!(workspace_id, members = joined.len(), "reconstituted reaped room");
                joined
            }
        };

        if envelope.workspace_id.is_none() {
            envelope.workspace_id = Some(workspace_id.to_string());
        }

        self.registry
            .authenticated_recipients(&members, exclude)
            .await
            .into_iter()
            .filter(|recipient| recipient.deliver(envelope.clone()))
            .map(|recipient| recipient.id)
            .collect()
    }

    async fn persist(&self, workspace_id: &str, message_type: MessageType, data: &Value) -> bool {
        match self.offline.record_event(workspace_id, message_type.as_str(), data.clone()).await {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    error = %error,
                    workspace_id,
                    event_type = message_type.as_str(),
                    "failed to persist offline event"
                );
                false
            }
        }
    }
}

/// Narrow, cloneable handle given to domain write-paths. Publishing never
/// fails from the caller's point of view.
#[derive(Clone)]
pub struct EventPublisher {
    engine: Arc<BroadcastEngine>,
}

impl EventPublisher {
    pub fn new(engine: Arc<BroadcastEngine>) -> Self {
        Self { engine }
    }

    pub async fn task_event(
        &self,
        event: TaskEventType,
        workspace_id: &str,
        data: Value,
    ) -> BroadcastReport {
        self.engine.broadcast_task_event(event, workspace_id, data).await
    }

    pub async fn workspace_event(
        &self,
        event: WorkspaceEventType,
        workspace_id: &str,
        data: Value,
    ) -> BroadcastReport {
        self.engine.broadcast_workspace_event(event, workspace_id, data).await
    }

    /// Publishes in the background so the caller's request is never delayed.
    pub fn spawn_task_event(&self, event: TaskEventType, workspace_id: String, data: Value) {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            engine.broadcast_task_event(event, &workspace_id, data).await;
        });
    }

    pub fn spawn_workspace_event(
        &self,
        event: WorkspaceEventType,
        workspace_id: String,
        data: Value,
    ) {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            engine.broadcast_workspace_event(event, &workspace_id, data).await;
        });
    }
}
