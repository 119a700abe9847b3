// Offline event log: a bounded, newest-first, TTL'd list of domain events
// per workspace, kept for clients that reconnect later.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tandem_common::types::OfflineEvent;

use crate::cache::{offline_events_key, CacheError, SharedCache};

pub struct OfflineEventStore {
    cache: Arc<dyn SharedCache>,
    max_events: usize,
    ttl: Duration,
}

impl OfflineEventStore {
    pub fn new(cache: Arc<dyn SharedCache>, max_events: usize, ttl: Duration) -> Self {
        Self { cache, max_events: max_events.max(1), ttl }
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    /// Appends an event. Capacity trimming and expiry are enforced by the
    /// backing store.
    pub async fn record_event(
        &self,
        workspace_id: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<(), CacheError> {
        let event = OfflineEvent {
            event_type: event_type.to_string(),
            payload,
            workspace_id: workspace_id.to_string(),
            timestamp: Utc::now(),
        };
        let encoded = serde_json::to_string(&event)?;
        self.cache
            .append_and_trim(&offline_events_key(workspace_id), encoded, self.max_events, self.ttl)
            .await
    }

    /// Replay contract for reconnecting clients.
    ///
    /// Replay is not implemented yet: this always returns an empty list so
    /// callers can depend on the shape without relying on invented
    /// semantics.
    // TODO: read the workspace list and return entries newer than `since`, oldest first.
    pub async fn events_since(
        &self,
        _workspace_id: &str,
        _since: DateTime<Utc>,
    ) -> Result<Vec<OfflineEvent>, CacheError> {
        Ok(Vec::new())
    }
}
