// Presence tracking (online/away/offline per user and workspace).
//
// Records live only in the shared cache under a TTL; an absent record is
// offline. Every transition is published on the workspace presence channel
// so subscribers in other processes can fan it out to their own rooms.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tandem_common::types::{PresenceChange, PresenceRecord, PresenceStatus};
use tracing::warn;

use crate::cache::{presence_channel, presence_key, CacheError, SharedCache};

pub struct PresenceTracker {
    cache: Arc<dyn SharedCache>,
    ttl: Duration,
}

impl PresenceTracker {
    pub fn new(cache: Arc<dyn SharedCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    /// Writes (online/away) or deletes (offline) the record for each
    /// workspace and publishes the change. All workspaces are attempted;
    /// the first failure is returned.
    pub async fn update_presence(
        &self,
        user_id: &str,
        workspace_ids: &[String],
        status: PresenceStatus,
    ) -> Result<(), CacheError> {
        let mut first_error = None;
        for workspace_id in workspace_ids {
            if let Err(error) = self.update_one(user_id, workspace_id, status).await {
                warn!(
                    error = %error,
                    user_id,
                    workspace_id = %workspace_id,
                    status = status.as_str(),
                    "presence update failed"
                );
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn update_one(
        &self,
        user_id: &str,
        workspace_id: &str,
        status: PresenceStatus,
    ) -> Result<(), CacheError> {
        let now = Utc::now();
        let key = presence_key(workspace_id, user_id);
        if status.is_present() {
            let record = PresenceRecord {
                user_id: user_id.to_string(),
                workspace_id: workspace_id.to_string(),
                status,
                last_seen_at: now,
            };
            self.cache.set(&key, serde_json::to_string(&record)?, self.ttl).await?;
        } else {
            self.cache.del(&key).await?;
        }

        let change = PresenceChange {
            user_id: user_id.to_string(),
            workspace_id: workspace_id.to_string(),
            status,
            timestamp: now,
        };
        self.cache.publish(&presence_channel(workspace_id), serde_json::to_string(&change)?).await
    }

    /// Re-writes the records that still exist with a fresh TTL, keeping
    /// their status. Missing records stay missing. Nothing is published
    /// since the status did not change. Returns how many were extended.
    pub async fn refresh(&self, user_id: &str, workspace_ids: &[String]) -> Result<usize, CacheError> {
        let mut refreshed = 0;
        for workspace_id in workspace_ids {
            let Some(mut record) = self.get_presence(user_id, workspace_id).await? else {
                continue;
            };
            record.last_seen_at = Utc::now();
            self.cache
                .set(&presence_key(workspace_id, user_id), serde_json::to_string(&record)?, self.ttl)
                .await?;
            refreshed += 1;
        }
        Ok(refreshed)
    }

    pub async fn get_presence(
        &self,
        user_id: &str,
        workspace_id: &str,
    ) -> Result<Option<PresenceRecord>, CacheError> {
        let Some(raw) = self.cache.get(&presence_key(workspace_id, user_id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }
}
