// Workspace rooms: workspace id -> member connection ids.
//
// Every check-then-mutate sequence runs under a single write guard with no
// await in between, so concurrent joins of a new workspace create one room.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use tokio::{sync::RwLock, time::Instant};

use crate::connection::ConnectionId;

#[derive(Debug)]
struct Room {
    members: HashSet<ConnectionId>,
    last_activity_at: Instant,
}

impl Room {
    fn new(now: Instant) -> Self {
        Self { members: HashSet::new(), last_activity_at: now }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub room_created: bool,
    pub newly_joined: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub was_member: bool,
    pub room_removed: bool,
}

#[derive(Debug, Default)]
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Room>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `connection_id` to the room, creating the room if absent.
    pub async fn join(&self, connection_id: ConnectionId, workspace_id: &str, now: Instant) -> JoinOutcome {
        let mut guard = self.rooms.write().await;
        let room_created = !guard.contains_key(workspace_id);
        let room = guard.entry(workspace_id.to_string()).or_insert_with(|| Room::new(now));
        let newly_joined = room.members.insert(connection_id);
        room.last_activity_at = now;
        JoinOutcome { room_created, newly_joined }
    }

    /// Removes the membership and drops the room once it is empty.
    pub async fn leave(&self, connection_id: ConnectionId, workspace_id: &str) -> LeaveOutcome {
        let mut guard = self.rooms.write().await;
        let Some(room) = guard.get_mut(workspace_id) else {
            return LeaveOutcome { was_member: false, room_removed: false };
        };
        let was_member = room.members.remove(&connection_id);
        let room_removed = room.members.is_empty();
        if room_removed {
            guard.remove(workspace_id);
        }
        LeaveOutcome { was_member, room_removed }
    }

    /// Recreates a reaped room from the connections that still claim it.
    /// Existing rooms gain any missing members.
    pub async fn restore(&self, workspace_id: &str, members: &[ConnectionId], now: Instant) -> bool {
        if members.is_empty() {
            return false;
        }
        let mut guard = self.rooms.write().await;
        let created = !guard.contains_key(workspace_id);
        let room = guard.entry(workspace_id.to_string()).or_insert_with(|| Room::new(now));
        room.members.extend(members.iter().copied());
        room.last_activity_at = now;
        created
    }

    /// Member ids of the room, or `None` when the room does not exist.
    pub async fn members(&self, workspace_id: &str) -> Option<Vec<ConnectionId>> {
        self.rooms
            .read()
            .await
            .get(workspace_id)
            .map(|room| room.members.iter().copied().collect())
    }

    pub async fn touch(&self, workspace_id: &str, now: Instant) {
        if let Some(room) = self.rooms.write().await.get_mut(workspace_id) {
            room.last_activity_at = now;
        }
    }

    pub async fn contains(&self, workspace_id: &str) -> bool {
        self.rooms.read().await.contains_key(workspace_id)
    }

    /// Removes rooms that are empty or idle longer than `inactivity`,
    /// including idle rooms whose members were never reaped.
    pub async fn reap(&self, now: Instant, inactivity: Duration) -> Vec<String> {
        let mut guard = self.rooms.write().await;
        let expired: Vec<String> = guard
            .iter()
            .filter(|(_, room)| {
                room.members.is_empty()
                    || now.saturating_duration_since(room.last_activity_at) > inactivity
            })
            .map(|(workspace_id, _)| workspace_id.clone())
            .collect();
        for workspace_id in &expired {
            guard.remove(workspace_id);
        }
        expired
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn membership_count(&self) -> usize {
        self.rooms.read().await.values().map(|room| room.members.len()).sum()
    }
}
