// RealtimeService: one explicit instance owns the registry, rooms, presence,
// offline log, broadcast engine, handlers and maintenance tasks.
//
// Socket tasks call `open_connection`, feed inbound text to `handle_text`
// and call `close_connection` when the transport ends. Domain write-paths
// get an `EventPublisher` from `publisher()`.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tandem_common::{
    protocol::ws::{
        decode_envelope, AuthenticateRequest, AuthenticateResponse, Envelope, MessageType,
    },
    types::{ConnectionStats, PresenceStatus},
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    auth::IdentityVerifier,
    broadcast::{BroadcastEngine, EventPublisher},
    cache::{CacheError, SharedCache},
    config::ServiceSettings,
    connection::{ConnectionId, ConnectionRegistry, ConnectionState, OutboundSender, StaleReason},
    error::RealtimeError,
    handlers::{EventHandlerRegistry, HandlerContext},
    maintenance::MaintenanceHandle,
    offline::OfflineEventStore,
    presence::PresenceTracker,
    room::RoomManager,
};

pub struct RealtimeService {
    settings: ServiceSettings,
    verifier: Arc<dyn IdentityVerifier>,
    cache: Arc<dyn SharedCache>,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
    presence: PresenceTracker,
    offline: Arc<OfflineEventStore>,
    broadcast: Arc<BroadcastEngine>,
    publisher: EventPublisher,
    handlers: EventHandlerRegistry,
    maintenance: MaintenanceHandle,
}

impl RealtimeService {
    pub fn new(
        settings: ServiceSettings,
        verifier: Arc<dyn IdentityVerifier>,
        cache: Arc<dyn SharedCache>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomManager::new());
        let offline = Arc::new(OfflineEventStore::new(
            cache.clone(),
            settings.offline_max_events,
            settings.offline_ttl,
        ));
        let broadcast =
            Arc::new(BroadcastEngine::new(registry.clone(), rooms.clone(), offline.clone()));
        Self {
            settings,
            verifier,
            registry,
            rooms,
            presence: PresenceTracker::new(cache.clone(), settings.presence_ttl),
            cache,
            offline,
            publisher: EventPublisher::new(broadcast.clone()),
            broadcast,
            handlers: EventHandlerRegistry::new(),
            maintenance: MaintenanceHandle::new(),
        }
    }

    pub fn settings(&self) -> ServiceSettings {
        self.settings
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn broadcast(&self) -> &BroadcastEngine {
        &self.broadcast
    }

    /// Narrow handle for task/workspace write-paths.
    pub fn publisher(&self) -> EventPublisher {
        self.publisher.clone()
    }

    pub fn handlers(&self) -> &EventHandlerRegistry {
        &self.handlers
    }

    // ── Connection lifecycle ────────────────────────────────────────

    pub async fn open_connection(&self, outbound: OutboundSender) -> ConnectionId {
        let id = self.registry.admit(outbound).await;
        info!(connection_id = %id, "connection opened");
        id
    }

    /// Decodes one inbound text frame and handles it. Errors are reported
    /// to the peer; only authentication failures close the connection.
    pub async fn handle_text(&self, id: ConnectionId, raw: &str) {
        match decode_envelope(raw) {
            Ok(envelope) => self.handle_envelope(id, envelope).await,
            Err(error) => {
                debug!(connection_id = %id, error = %error, "rejecting malformed message");
                self.report(id, &RealtimeError::Parse(error.to_string()), None).await;
            }
        }
    }

    pub async fn handle_envelope(&self, id: ConnectionId, envelope: Envelope) {
        let request_id = envelope.request_id.clone();
        if let Err(error) = self.dispatch(id, envelope).await {
            self.report(id, &error, request_id).await;
        }
    }

    async fn report(&self, id: ConnectionId, error: &RealtimeError, request_id: Option<String>) {
        self.registry.send_to(id, error.to_envelope(request_id)).await;
        if error.is_fatal() {
            self.close_connection(id).await;
        }
    }

    async fn dispatch(&self, id: ConnectionId, envelope: Envelope) -> Result<(), RealtimeError> {
        match envelope.message_type {
            MessageType::Authenticate => {
                let request = authenticate_request(&envelope.data)?;
                self.authenticate(id, request, envelope.request_id).await.map(|_| ())
            }
            MessageType::Ping => {
                let now = Instant::now();
                self.registry.touch(id, now).await;
                self.refresh_presence(id, now).await;
                let pong = Envelope::new(MessageType::Pong, json!({}))
                    .with_request_id(envelope.request_id);
                self.registry.send_to(id, pong).await;
                Ok(())
            }
            message_type => {
                let user_id = self.registry.user_id(id).await.ok_or(RealtimeError::Unauthorized)?;
                match message_type {
                    MessageType::UserPresence => self.handle_presence(id, &user_id, envelope).await,
                    MessageType::UserTyping | MessageType::CursorPosition => {
                        self.relay(id, &user_id, envelope).await
                    }
                    MessageType::SyncRequest => self.handle_sync_request(id, envelope).await,
                    _ => {
                        let context = HandlerContext {
                            connection_id: id,
                            user_id,
                            publisher: self.publisher.clone(),
                        };
                        self.handlers.dispatch(context, envelope).await
                    }
                }
            }
        }
    }

    /// Verifies the token, promotes the connection, joins the requested
    /// workspaces, marks the user online there and replies with the
    /// resolved user id.
    pub async fn authenticate(
        &self,
        id: ConnectionId,
        request: AuthenticateRequest,
        request_id: Option<String>,
    ) -> Result<String, RealtimeError> {
        match self.registry.state(id).await {
            ConnectionState::Unauthenticated => {}
            ConnectionState::Authenticated => return Err(RealtimeError::AlreadyAuthenticated),
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(RealtimeError::ConnectionNotFound(id));
            }
        }

        let identity = match self.verifier.verify(&request.token).await {
            Ok(identity) => identity,
            Err(error) => {
                warn!(connection_id = %id, error = %error, "authentication failed");
                return Err(error.into());
            }
        };
        self.registry.mark_authenticated(id, &identity.user_id).await?;

        let mut joined = Vec::with_capacity(request.workspace_ids.len());
        for workspace_id in &request.workspace_ids {
            self.join_room(id, workspace_id).await?;
            joined.push(workspace_id.clone());
        }
        self.mark_online(id, &identity.user_id, &joined).await?;

        info!(
            connection_id = %id,
            user_id = %identity.user_id,
            workspaces = joined.len(),
            "connection authenticated"
        );
        let reply = AuthenticateResponse { success: true, user_id: identity.user_id.clone() };
        let envelope = Envelope::new(MessageType::Authenticate, json!(reply)).with_request_id(request_id);
        self.registry.send_to(id, envelope).await;
        Ok(identity.user_id)
    }

    /// Idempotent teardown: leaves every room, marks the user offline where
    /// no other connection of theirs remains, then removes the record.
    pub async fn close_connection(&self, id: ConnectionId) -> bool {
        let Some(closing) = self.registry.begin_close(id).await else {
            return false;
        };
        closing.close_transport();

        for workspace_id in &closing.joined_workspaces {
            self.rooms.leave(id, workspace_id).await;
        }

        if let (true, Some(user_id)) = (closing.was_authenticated, closing.user_id.as_deref()) {
            let departed = self.departed_workspaces(user_id, &closing.joined_workspaces).await;
            self.set_presence(user_id, &departed, PresenceStatus::Offline, None).await;
        }

        self.registry.finish_close(id).await;
        info!(
            connection_id = %id,
            user_id = closing.user_id.as_deref().unwrap_or("-"),
            "connection closed"
        );
        true
    }

    // ── Rooms and presence ──────────────────────────────────────────

    /// Joins an authenticated connection to a workspace room and marks the
    /// user online there.
    pub async fn join_workspace(
        &self,
        id: ConnectionId,
        workspace_id: &str,
    ) -> Result<(), RealtimeError> {
        let user_id = self.registry.user_id(id).await.ok_or(RealtimeError::Unauthorized)?;
        self.join_room(id, workspace_id).await?;
        self.mark_online(id, &user_id, &[workspace_id.to_string()]).await
    }

    /// Returns whether the connection was a member.
    pub async fn leave_workspace(
        &self,
        id: ConnectionId,
        workspace_id: &str,
    ) -> Result<bool, RealtimeError> {
        let user_id = self.registry.user_id(id).await.ok_or(RealtimeError::Unauthorized)?;
        let recorded = self.registry.record_leave(id, workspace_id).await;
        let outcome = self.rooms.leave(id, workspace_id).await;
        if recorded && !self.registry.user_present_in(&user_id, workspace_id).await {
            self.set_presence(&user_id, &[workspace_id.to_string()], PresenceStatus::Offline, None)
                .await;
        }
        Ok(recorded || outcome.was_member)
    }

    async fn join_room(&self, id: ConnectionId, workspace_id: &str) -> Result<(), RealtimeError> {
        self.registry.record_join(id, workspace_id).await?;
        let outcome = self.rooms.join(id, workspace_id, Instant::now()).await;
        // Teardown may have captured the joined set before the room insert.
        if self.registry.state(id).await != ConnectionState::Authenticated {
            self.rooms.leave(id, workspace_id).await;
            return Err(RealtimeError::ConnectionNotFound(id));
        }
        if outcome.room_created {
            // A reaped room may still have live members elsewhere in the registry.
            let members = self.registry.joined_connections(workspace_id).await;
            self.rooms.restore(workspace_id, &members, Instant::now()).await;
            debug!(workspace_id, members = members.len(), "room created");
        }
        Ok(())
    }

    /// Workspaces among `workspace_ids` where `user_id` has no authenticated
    /// connection left.
    async fn departed_workspaces(&self, user_id: &str, workspace_ids: &[String]) -> Vec<String> {
        let mut departed = Vec::new();
        for workspace_id in workspace_ids {
            if !self.registry.user_present_in(user_id, workspace_id).await {
                departed.push(workspace_id.clone());
            }
        }
        departed
    }

    /// Marks the user online for a connection that is still authenticated.
    /// If teardown ran while the records were written, they are withdrawn
    /// again.
    async fn mark_online(
        &self,
        id: ConnectionId,
        user_id: &str,
        workspace_ids: &[String],
    ) -> Result<(), RealtimeError> {
        if self.registry.state(id).await != ConnectionState::Authenticated {
            return Err(RealtimeError::ConnectionNotFound(id));
        }
        self.set_presence(user_id, workspace_ids, PresenceStatus::Online, Some(id)).await;
        if self.registry.state(id).await != ConnectionState::Authenticated {
            let departed = self.departed_workspaces(user_id, workspace_ids).await;
            self.set_presence(user_id, &departed, PresenceStatus::Offline, None).await;
            return Err(RealtimeError::ConnectionNotFound(id));
        }
        Ok(())
    }

    /// Keeps presence records of a pinging connection from expiring. Runs
    /// at most once per half TTL per connection.
    async fn refresh_presence(&self, id: ConnectionId, now: Instant) {
        let every = self.settings.presence_ttl / 2;
        let Some(due) = self.registry.presence_refresh_due(id, now, every).await else {
            return;
        };
        match self.presence.refresh(&due.user_id, &due.workspace_ids).await {
            Ok(refreshed) => {
                debug!(connection_id = %id, user_id = %due.user_id, refreshed, "presence refreshed")
            }
            Err(error) => {
                warn!(connection_id = %id, user_id = %due.user_id, error = %error, "presence refresh failed")
            }
        }
    }

    /// Writes presence for `user_id` in each workspace and announces it to
    /// those rooms.
    pub async fn update_presence(
        &self,
        user_id: &str,
        workspace_ids: &[String],
        status: PresenceStatus,
    ) -> Result<(), CacheError> {
        let result = self.presence.update_presence(user_id, workspace_ids, status).await;
        self.announce_presence(user_id, workspace_ids, status, None).await;
        result
    }

    async fn set_presence(
        &self,
        user_id: &str,
        workspace_ids: &[String],
        status: PresenceStatus,
        exclude: Option<ConnectionId>,
    ) {
        if workspace_ids.is_empty() {
            return;
        }
        // Failures are already logged by the tracker.
        let _ = self.presence.update_presence(user_id, workspace_ids, status).await;
        self.announce_presence(user_id, workspace_ids, status, exclude).await;
    }

    async fn announce_presence(
        &self,
        user_id: &str,
        workspace_ids: &[String],
        status: PresenceStatus,
        exclude: Option<ConnectionId>,
    ) {
        for workspace_id in workspace_ids {
            let envelope = Envelope::new(
                MessageType::UserPresence,
                json!({ "userId": user_id, "status": status }),
            )
            .with_workspace(workspace_id.as_str());
            self.broadcast.broadcast_to_room(workspace_id, envelope, exclude).await;
        }
    }

    async fn handle_presence(
        &self,
        id: ConnectionId,
        user_id: &str,
        envelope: Envelope,
    ) -> Result<(), RealtimeError> {
        let status: PresenceStatus = serde_json::from_value(
            envelope.data.get("status").cloned().unwrap_or(Value::Null),
        )
        .map_err(|error| RealtimeError::Parse(format!("invalid presence status: {error}")))?;

        let workspace_ids = match envelope.workspace_id {
            Some(workspace_id) => {
                if !self.registry.has_joined(id, &workspace_id).await {
                    return Err(RealtimeError::NotJoined(workspace_id));
                }
                vec![workspace_id]
            }
            None => self.registry.joined_workspaces(id).await,
        };
        self.registry.touch(id, Instant::now()).await;
        self.set_presence(user_id, &workspace_ids, status, Some(id)).await;
        Ok(())
    }

    /// Relays typing and cursor updates to the other members of the room.
    async fn relay(
        &self,
        id: ConnectionId,
        user_id: &str,
        envelope: Envelope,
    ) -> Result<(), RealtimeError> {
        let workspace_id = self.joined_workspace_of(id, &envelope).await?;
        let Value::Object(mut data) = envelope.data else {
            return Err(RealtimeError::Parse("data must be an object".into()));
        };
        data.insert("userId".into(), Value::String(user_id.to_string()));

        let relayed =
            Envelope::new(envelope.message_type, Value::Object(data)).with_workspace(workspace_id.as_str());
        self.broadcast.broadcast_to_room(&workspace_id, relayed, Some(id)).await;
        Ok(())
    }

    async fn handle_sync_request(
        &self,
        id: ConnectionId,
        envelope: Envelope,
    ) -> Result<(), RealtimeError> {
        let workspace_id = self.joined_workspace_of(id, &envelope).await?;
        let since = match envelope.data.get("since").and_then(Value::as_str) {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|since| since.with_timezone(&Utc))
                .map_err(|error| RealtimeError::Parse(format!("invalid since: {error}")))?,
            None => chrono::Duration::from_std(self.settings.offline_ttl)
                .ok()
                .and_then(|retention| Utc::now().checked_sub_signed(retention))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        };

        let events = self.offline.events_since(&workspace_id, since).await.map_err(|error| {
            RealtimeError::MessageHandling {
                message_type: MessageType::SyncRequest,
                reason: error.to_string(),
            }
        })?;
        let response = Envelope::new(
            MessageType::SyncResponse,
            json!({ "workspaceId": workspace_id, "since": since, "events": events }),
        )
        .with_workspace(workspace_id.as_str())
        .with_request_id(envelope.request_id);
        self.registry.send_to(id, response).await;
        Ok(())
    }

    async fn joined_workspace_of(
        &self,
        id: ConnectionId,
        envelope: &Envelope,
    ) -> Result<String, RealtimeError> {
        let workspace_id = envelope
            .workspace_id
            .clone()
            .ok_or_else(|| RealtimeError::Parse("workspaceId is required".into()))?;
        if !self.registry.has_joined(id, &workspace_id).await {
            return Err(RealtimeError::NotJoined(workspace_id));
        }
        Ok(workspace_id)
    }

    // ── Sweeps ──────────────────────────────────────────────────────

    /// Closes connections whose heartbeat (or auth deadline) lapsed at `now`.
    pub async fn sweep_stale_connections(&self, now: Instant) -> Vec<ConnectionId> {
        let stale = self.registry.stale_connections(now, self.settings.connection_timeout).await;
        let mut closed = Vec::with_capacity(stale.len());
        for (id, reason) in stale {
            let error = RealtimeError::StaleConnection(id);
            match reason {
                StaleReason::HeartbeatTimeout => {
                    info!(connection_id = %id, error = %error, "heartbeat timeout, disconnecting")
                }
                StaleReason::AuthDeadline => {
                    info!(connection_id = %id, "authentication deadline passed, disconnecting")
                }
            }
            if self.close_connection(id).await {
                closed.push(id);
            }
        }
        closed
    }

    /// Removes empty or idle rooms as of `now`.
    pub async fn reap_rooms(&self, now: Instant) -> Vec<String> {
        let reaped = self.rooms.reap(now, self.settings.room_inactivity).await;
        if !reaped.is_empty() {
            info!(rooms = reaped.len(), "reaped inactive rooms");
        }
        reaped
    }

    /// Drops expired cache entries, such as offline logs nobody reads.
    pub async fn purge_expired_cache(&self) -> usize {
        match self.cache.purge_expired().await {
            Ok(purged) => {
                if purged > 0 {
                    debug!(keys = purged, "purged expired cache entries");
                }
                purged
            }
            Err(error) => {
                warn!(error = %error, "cache purge failed");
                0
            }
        }
    }

    pub async fn stats(&self) -> ConnectionStats {
        let counts = self.registry.counts().await;
        ConnectionStats {
            total_connections: counts.total,
            authenticated_connections: counts.authenticated,
            unique_users: counts.unique_users,
            rooms: self.rooms.room_count().await,
            room_memberships: self.rooms.membership_count().await,
        }
    }

    // ── Background tasks and shutdown ───────────────────────────────

    /// Starts the heartbeat monitor, room reaper and cache purge.
    pub async fn start_maintenance(self: &Arc<Self>) {
        let service = Arc::downgrade(self);
        self.maintenance
            .spawn_recurring("heartbeat", self.settings.heartbeat_interval, move || {
                let service = service.clone();
                async move {
                    if let Some(service) = Weak::upgrade(&service) {
                        service.sweep_stale_connections(Instant::now()).await;
                    }
                }
            })
            .await;

        let service = Arc::downgrade(self);
        self.maintenance
            .spawn_recurring("room_reaper", self.settings.room_reap_interval, move || {
                let service = service.clone();
                async move {
                    if let Some(service) = Weak::upgrade(&service) {
                        service.reap_rooms(Instant::now()).await;
                    }
                }
            })
            .await;

        let service = Arc::downgrade(self);
        self.maintenance
            .spawn_recurring("cache_purge", self.settings.room_reap_interval, move || {
                let service = service.clone();
                async move {
                    if let Some(service) = Weak::upgrade(&service) {
                        service.purge_expired_cache().await;
                    }
                }
            })
            .await;
    }

    /// Stops maintenance and tears down every connection. Safe to call
    /// more than once.
    pub async fn shutdown(&self) {
        self.maintenance.shutdown().await;
        let ids = self.registry.ids().await;
        let mut closed = 0;
        for id in ids {
            if self.close_connection(id).await {
                closed += 1;
            }
        }
        if closed > 0 {
            info!(connections = closed, "closed connections on shutdown");
        }
    }
}

fn authenticate_request(data: &Value) -> Result<AuthenticateRequest, RealtimeError> {
    let token = data.get("token").and_then(Value::as_str).unwrap_or_default().to_string();
    let workspace_ids = match data.get("workspaceIds") {
        None | Some(Value::Null) => Vec::new(),
        Some(raw) => serde_json::from_value(raw.clone())
            .map_err(|error| RealtimeError::Parse(format!("invalid workspaceIds: {error}")))?,
    };
    Ok(AuthenticateRequest { token, workspace_ids })
}
