// Connection registry: every live socket and its per-connection state.
//
// Records are keyed by `ConnectionId`; rooms refer to connections only by
// id. A record exists while the connection is Unauthenticated, Authenticated
// or Closing. Removal is the Closed state.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    time::Duration,
};

use chrono::{DateTime, Utc};
use tandem_common::protocol::ws::Envelope;
use tokio::{
    sync::{mpsc, RwLock},
    time::Instant,
};
use tracing::debug;
use uuid::Uuid;

use crate::error::RealtimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated,
    Closing,
    Closed,
}

/// Frames queued for the socket task that owns the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Message(Envelope),
    Close,
}

pub type OutboundSender = mpsc::UnboundedSender<OutboundFrame>;

#[derive(Debug)]
struct ConnectionRecord {
    state: ConnectionState,
    user_id: Option<String>,
    joined_workspaces: BTreeSet<String>,
    last_ping_at: Instant,
    presence_refreshed_at: Instant,
    opened_at: Instant,
    connected_at: DateTime<Utc>,
    outbound: OutboundSender,
}

impl ConnectionRecord {
    fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Authenticated
    }
}

/// Read-only view of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub user_id: Option<String>,
    pub joined_workspaces: Vec<String>,
    pub connected_at: DateTime<Utc>,
}

/// State captured when a connection enters Closing, used for teardown.
#[derive(Debug)]
pub struct ClosingConnection {
    pub id: ConnectionId,
    pub user_id: Option<String>,
    pub was_authenticated: bool,
    pub joined_workspaces: Vec<String>,
    outbound: OutboundSender,
}

impl ClosingConnection {
    /// Asks the socket task to close the transport.
    pub fn close_transport(&self) {
        let _ = self.outbound.send(OutboundFrame::Close);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// Authenticated and no ping within the timeout.
    HeartbeatTimeout,
    /// Never authenticated within the timeout.
    AuthDeadline,
}

/// A recipient resolved for delivery.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub id: ConnectionId,
    sender: OutboundSender,
}

impl Recipient {
    /// Best-effort send. Returns false when the socket task is gone.
    pub fn deliver(&self, envelope: Envelope) -> bool {
        match self.sender.send(OutboundFrame::Message(envelope)) {
            Ok(()) => true,
            Err(_) => {
                debug!(connection_id = %self.id, "dropping message for closed connection");
                false
            }
        }
    }
}

/// Presence records an authenticated connection should keep alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRefresh {
    pub user_id: String,
    pub workspace_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub total: usize,
    pub authenticated: usize,
    pub unique_users: usize,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionRecord>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a freshly opened transport in the Unauthenticated state.
    pub async fn admit(&self, outbound: OutboundSender) -> ConnectionId {
        let id = ConnectionId::new();
        let now = Instant::now();
        self.connections.write().await.insert(
            id,
            ConnectionRecord {
                state: ConnectionState::Unauthenticated,
                user_id: None,
                joined_workspaces: BTreeSet::new(),
                last_ping_at: now,
                presence_refreshed_at: now,
                opened_at: now,
                connected_at: Utc::now(),
                outbound,
            },
        );
        id
    }

    pub async fn state(&self, id: ConnectionId) -> ConnectionState {
        self.connections
            .read()
            .await
            .get(&id)
            .map(|record| record.state)
            .unwrap_or(ConnectionState::Closed)
    }

    pub async fn info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.read().await.get(&id).map(|record| ConnectionInfo {
            id,
            state: record.state,
            user_id: record.user_id.clone(),
            joined_workspaces: record.joined_workspaces.iter().cloned().collect(),
            connected_at: record.connected_at,
        })
    }

    pub async fn user_id(&self, id: ConnectionId) -> Option<String> {
        self.connections
            .read()
            .await
            .get(&id)
            .filter(|record| record.is_authenticated())
            .and_then(|record| record.user_id.clone())
    }

    /// Promotes Unauthenticated -> Authenticated. A second authentication is
    /// rejected and leaves the existing identity in place.
    pub async fn mark_authenticated(
        &self,
        id: ConnectionId,
        user_id: &str,
    ) -> Result<(), RealtimeError> {
        let mut guard = self.connections.write().await;
        let record = guard.get_mut(&id).ok_or(RealtimeError::ConnectionNotFound(id))?;
        match record.state {
            ConnectionState::Unauthenticated => {
                record.state = ConnectionState::Authenticated;
                record.user_id = Some(user_id.to_string());
                let now = Instant::now();
                record.last_ping_at = now;
                record.presence_refreshed_at = now;
                Ok(())
            }
            ConnectionState::Authenticated => Err(RealtimeError::AlreadyAuthenticated),
            ConnectionState::Closing | ConnectionState::Closed => {
                Err(RealtimeError::ConnectionNotFound(id))
            }
        }
    }

    /// Records that an authenticated connection joined `workspace_id`.
    pub async fn record_join(
        &self,
        id: ConnectionId,
        workspace_id: &str,
    ) -> Result<(), RealtimeError> {
        let mut guard = self.connections.write().await;
        let record = guard.get_mut(&id).ok_or(RealtimeError::ConnectionNotFound(id))?;
        match record.state {
            ConnectionState::Authenticated => {
                record.joined_workspaces.insert(workspace_id.to_string());
                Ok(())
            }
            ConnectionState::Unauthenticated => Err(RealtimeError::Unauthorized),
            ConnectionState::Closing | ConnectionState::Closed => {
                Err(RealtimeError::ConnectionNotFound(id))
            }
        }
    }

    pub async fn record_leave(&self, id: ConnectionId, workspace_id: &str) -> bool {
        self.connections
            .write()
            .await
            .get_mut(&id)
            .map(|record| record.joined_workspaces.remove(workspace_id))
            .unwrap_or(false)
    }

    pub async fn has_joined(&self, id: ConnectionId, workspace_id: &str) -> bool {
        self.connections
            .read()
            .await
            .get(&id)
            .map(|record| record.is_authenticated() && record.joined_workspaces.contains(workspace_id))
            .unwrap_or(false)
    }

    pub async fn joined_workspaces(&self, id: ConnectionId) -> Vec<String> {
        self.connections
            .read()
            .await
            .get(&id)
            .map(|record| record.joined_workspaces.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Refreshes the liveness timestamp. Returns false for unknown ids.
    pub async fn touch(&self, id: ConnectionId, now: Instant) -> bool {
        match self.connections.write().await.get_mut(&id) {
            Some(record) if record.state != ConnectionState::Closing => {
                record.last_ping_at = now;
                true
            }
            _ => false,
        }
    }

    /// Claims a presence refresh for `id` when the last one is at least
    /// `every` old. Only authenticated connections with joined workspaces
    /// qualify.
    pub async fn presence_refresh_due(
        &self,
        id: ConnectionId,
        now: Instant,
        every: Duration,
    ) -> Option<PresenceRefresh> {
        let mut guard = self.connections.write().await;
        let record = guard.get_mut(&id).filter(|record| record.is_authenticated())?;
        if record.joined_workspaces.is_empty()
            || now.saturating_duration_since(record.presence_refreshed_at) < every
        {
            return None;
        }
        record.presence_refreshed_at = now;
        Some(PresenceRefresh {
            user_id: record.user_id.clone()?,
            workspace_ids: record.joined_workspaces.iter().cloned().collect(),
        })
    }

    /// Sends directly to one connection regardless of authentication, used
    /// for handshake replies and errors.
    pub async fn send_to(&self, id: ConnectionId, envelope: Envelope) -> bool {
        let sender = self
            .connections
            .read()
            .await
            .get(&id)
            .filter(|record| record.state != ConnectionState::Closing)
            .map(|record| Recipient { id, sender: record.outbound.clone() });
        sender.map(|recipient| recipient.deliver(envelope)).unwrap_or(false)
    }

    /// Authenticated recipients among `ids`, minus `exclude`.
    pub async fn authenticated_recipients(
        &self,
        ids: &[ConnectionId],
        exclude: Option<ConnectionId>,
    ) -> Vec<Recipient> {
        let guard = self.connections.read().await;
        ids.iter()
            .filter(|id| Some(**id) != exclude)
            .filter_map(|id| {
                guard
                    .get(id)
                    .filter(|record| record.is_authenticated())
                    .map(|record| Recipient { id: *id, sender: record.outbound.clone() })
            })
            .collect()
    }

    /// Every authenticated connection belonging to `user_id`.
    pub async fn user_recipients(&self, user_id: &str) -> Vec<Recipient> {
        self.connections
            .read()
            .await
            .iter()
            .filter(|(_, record)| {
                record.is_authenticated() && record.user_id.as_deref() == Some(user_id)
            })
            .map(|(id, record)| Recipient { id: *id, sender: record.outbound.clone() })
            .collect()
    }

    /// Authenticated connections that list `workspace_id` as joined.
    pub async fn joined_connections(&self, workspace_id: &str) -> Vec<ConnectionId> {
        self.connections
            .read()
            .await
            .iter()
            .filter(|(_, record)| {
                record.is_authenticated() && record.joined_workspaces.contains(workspace_id)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Whether `user_id` still has an authenticated connection in `workspace_id`.
    pub async fn user_present_in(&self, user_id: &str, workspace_id: &str) -> bool {
        self.connections.read().await.values().any(|record| {
            record.is_authenticated()
                && record.user_id.as_deref() == Some(user_id)
                && record.joined_workspaces.contains(workspace_id)
        })
    }

    /// Moves a connection into Closing. Returns `None` if it is already
    /// closing or gone, which makes teardown idempotent.
    pub async fn begin_close(&self, id: ConnectionId) -> Option<ClosingConnection> {
        let mut guard = self.connections.write().await;
        let record = guard.get_mut(&id)?;
        if record.state == ConnectionState::Closing {
            return None;
        }
        let was_authenticated = record.is_authenticated();
        record.state = ConnectionState::Closing;
        Some(ClosingConnection {
            id,
            user_id: record.user_id.clone(),
            was_authenticated,
            joined_workspaces: record.joined_workspaces.iter().cloned().collect(),
            outbound: record.outbound.clone(),
        })
    }

    /// Final transition to Closed.
    pub async fn finish_close(&self, id: ConnectionId) -> bool {
        self.connections.write().await.remove(&id).is_some()
    }

    /// Connections past their deadline at `now`, from a snapshot taken under
    /// the read lock so callers can close them without holding it.
    pub async fn stale_connections(
        &self,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(ConnectionId, StaleReason)> {
        self.connections
            .read()
            .await
            .iter()
            .filter_map(|(id, record)| match record.state {
                ConnectionState::Authenticated
                    if now.saturating_duration_since(record.last_ping_at) > timeout =>
                {
                    Some((*id, StaleReason::HeartbeatTimeout))
                }
                ConnectionState::Unauthenticated
                    if now.saturating_duration_since(record.opened_at) > timeout =>
                {
                    Some((*id, StaleReason::AuthDeadline))
                }
                _ => None,
            })
            .collect()
    }

    pub async fn ids(&self) -> Vec<ConnectionId> {
        self.connections.read().await.keys().copied().collect()
    }

    pub async fn counts(&self) -> RegistryCounts {
        let guard = self.connections.read().await;
        let authenticated = guard.values().filter(|record| record.is_authenticated()).count();
        let unique_users = guard
            .values()
            .filter(|record| record.is_authenticated())
            .filter_map(|record| record.user_id.as_deref())
            .collect::<HashSet<_>>()
            .len();
        RegistryCounts { total: guard.len(), authenticated, unique_users }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_common::protocol::ws::MessageType;

    async fn admitted(registry: &ConnectionRegistry) -> (ConnectionId, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.admit(tx).await, rx)
    }

    #[tokio::test]
    async fn admitted_connections_start_unauthenticated() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = admitted(&registry).await;

        assert_eq!(registry.state(id).await, ConnectionState::Unauthenticated);
        assert_eq!(registry.user_id(id).await, None);
        assert_eq!(registry.state(ConnectionId::new()).await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn second_authentication_is_rejected_and_keeps_identity() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = admitted(&registry).await;

        registry.mark_authenticated(id, "u1").await.expect("first auth should succeed");
        let second = registry.mark_authenticated(id, "u2").await;

        assert!(matches!(second, Err(RealtimeError::AlreadyAuthenticated)));
        assert_eq!(registry.user_id(id).await.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn join_requires_authentication() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = admitted(&registry).await;

        assert!(matches!(registry.record_join(id, "w1").await, Err(RealtimeError::Unauthorized)));
        assert!(!registry.has_joined(id, "w1").await);

        registry.mark_authenticated(id, "u1").await.expect("auth should succeed");
        registry.record_join(id, "w1").await.expect("join should succeed");
        assert!(registry.has_joined(id, "w1").await);
    }

    #[tokio::test]
    async fn begin_close_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (id, mut rx) = admitted(&registry).await;
        registry.mark_authenticated(id, "u1").await.expect("auth should succeed");
        registry.record_join(id, "w1").await.expect("join should succeed");

        let closing = registry.begin_close(id).await.expect("first close should capture state");
        assert!(closing.was_authenticated);
        assert_eq!(closing.joined_workspaces, vec!["w1".to_string()]);
        assert!(registry.begin_close(id).await.is_none());

        closing.close_transport();
        assert_eq!(rx.recv().await, Some(OutboundFrame::Close));

        assert!(registry.finish_close(id).await);
        assert!(!registry.finish_close(id).await);
        assert!(registry.begin_close(id).await.is_none());
    }

    #[tokio::test]
    async fn closing_connections_do_not_receive_messages() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = admitted(&registry).await;
        registry.mark_authenticated(id, "u1").await.expect("auth should succeed");
        registry.begin_close(id).await.expect("close should start");

        assert!(registry.authenticated_recipients(&[id], None).await.is_empty());
        assert!(!registry.send_to(id, Envelope::new(MessageType::Pong, serde_json::json!({}))).await);
    }

    #[tokio::test]
    async fn stale_detection_uses_ping_age_and_auth_deadline() {
        let registry = ConnectionRegistry::new();
        let (authed, _rx_a) = admitted(&registry).await;
        let (pending, _rx_b) = admitted(&registry).await;
        registry.mark_authenticated(authed, "u1").await.expect("auth should succeed");
        let timeout = Duration::from_secs(60);

        let now = Instant::now();
        assert!(registry.stale_connections(now, timeout).await.is_empty());

        let later = now + Duration::from_secs(61);
        let mut stale = registry.stale_connections(later, timeout).await;
        stale.sort_by_key(|(id, _)| *id == pending);
        assert_eq!(
            stale,
            vec![(authed, StaleReason::HeartbeatTimeout), (pending, StaleReason::AuthDeadline)]
        );

        registry.touch(authed, later).await;
        let stale = registry.stale_connections(later, timeout).await;
        assert_eq!(stale, vec![(pending, StaleReason::AuthDeadline)]);
    }

    #[tokio::test]
    async fn user_recipients_span_devices() {
        let registry = ConnectionRegistry::new();
        let (phone, _rx_a) = admitted(&registry).await;
        let (laptop, _rx_b) = admitted(&registry).await;
        let (other, _rx_c) = admitted(&registry).await;
        registry.mark_authenticated(phone, "u1").await.expect("auth should succeed");
        registry.mark_authenticated(laptop, "u1").await.expect("auth should succeed");
        registry.mark_authenticated(other, "u2").await.expect("auth should succeed");

        let mut ids: Vec<_> = registry.user_recipients("u1").await.into_iter().map(|r| r.id).collect();
        ids.sort();
        let mut expected = vec![phone, laptop];
        expected.sort();
        assert_eq!(ids, expected);

        let counts = registry.counts().await;
        assert_eq!(counts, RegistryCounts { total: 3, authenticated: 3, unique_users: 2 });
    }

    #[tokio::test]
    async fn presence_refresh_is_throttled_per_connection() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = admitted(&registry).await;
        let (lurker, _rx_lurker) = admitted(&registry).await;
        registry.mark_authenticated(id, "u1").await.expect("auth should succeed");
        registry.mark_authenticated(lurker, "u2").await.expect("auth should succeed");
        registry.record_join(id, "w1").await.expect("join should succeed");
        let every = Duration::from_secs(150);
        let now = Instant::now();

        assert_eq!(registry.presence_refresh_due(id, now + Duration::from_secs(149), every).await, None);
        assert_eq!(
            registry.presence_refresh_due(id, now + Duration::from_secs(150), every).await,
            Some(PresenceRefresh { user_id: "u1".into(), workspace_ids: vec!["w1".into()] })
        );
        assert_eq!(registry.presence_refresh_due(id, now + Duration::from_secs(200), every).await, None);
        assert_eq!(registry.presence_refresh_due(lurker, now + Duration::from_secs(600), every).await, None);
    }
}
