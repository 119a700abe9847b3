// Presence, offline-log, and stats types shared across tandem crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl PresenceStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Away => "away",
            Self::Offline => "offline",
        }
    }

    /// Whether this status is backed by a cache record.
    pub const fn is_present(self) -> bool {
        !matches!(self, Self::Offline)
    }
}

/// A user's status within one workspace. Only `online`/`away` records are
/// ever stored; an absent record means offline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub workspace_id: String,
    pub status: PresenceStatus,
    pub last_seen_at: DateTime<Utc>,
}

/// Payload published on a workspace presence channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceChange {
    pub user_id: String,
    pub workspace_id: String,
    pub status: PresenceStatus,
    pub timestamp: DateTime<Utc>,
}

/// One entry of a workspace's offline event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OfflineEvent {
    pub event_type: String,
    pub payload: Value,
    pub workspace_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time connection counts, recomputed on every request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub authenticated_connections: usize,
    pub unique_users: usize,
    pub rooms: usize,
    pub room_memberships: usize,
}
