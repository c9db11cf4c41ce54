use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use shared::{
    domain::{ChannelId, UserId},
    protocol::{MessageRecord, UserChannelPatch},
};
use tracing::info;

use crate::service::ChatSyncService;

/// Counts messages from other users newer than `last_read`. Without a read
/// marker every message from someone else is unread.
pub fn compute_unread(
    messages: &[MessageRecord],
    user_id: &UserId,
    last_read: Option<DateTime<Utc>>,
) -> u32 {
    let count = messages
        .iter()
        .filter(|message| &message.user_id != user_id && !message.is_deleted())
        .filter(|message| last_read.map_or(true, |read_at| message.created_at > read_at))
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

impl ChatSyncService {
    /// Unread count from the locally loaded messages and read marker.
    pub async fn unread_count(&self, channel_id: &ChannelId) -> u32 {
        let inner = self.inner.lock().await;
        let Some(user) = inner.user.as_ref() else {
            return 0;
        };
        let Some(messages) = inner.messages.get(channel_id) else {
            return 0;
        };
        let top_level: Vec<MessageRecord> = messages
            .iter()
            .filter(|message| message.parent_id.is_none())
            .cloned()
            .collect();
        let last_read = inner.last_read.get(channel_id).copied();
        compute_unread(&top_level, &user.id, last_read)
    }

    async fn cached_unread(&self, channel_id: &ChannelId) -> u32 {
        let cached = self
            .cache
            .lock()
            .await
            .entry(channel_id)
            .map(|channel| channel.unread_count);
        match cached {
            Some(count) => count,
            None => self.unread_count(channel_id).await,
        }
    }

    /// Re-watches the channel and recomputes its unread count from fresh
    /// state. Falls back to the cached count, or the locally computed one
    /// when the channel is not cached, if the backend call fails.
    pub async fn force_refresh_unread(&self, channel_id: &ChannelId) -> u32 {
        let cached = self.cached_unread(channel_id).await;
        match self.refresh_unread_from_backend(channel_id).await {
            Ok(count) => {
                self.cache.lock().await.update(
                    channel_id,
                    UserChannelPatch {
                        unread_count: Some(count),
                        ..Default::default()
                    },
                );
                self.notify_unread(channel_id, count).await;
                count
            }
            Err(err) => {
                self.log_degraded("unread refresh", Some(channel_id), &err);
                cached
            }
        }
    }

    async fn refresh_unread_from_backend(&self, channel_id: &ChannelId) -> Result<u32> {
        let user = self.require_user().await?;
        let record = self
            .request(|| self.backend.watch(channel_id))
            .await
            .context("failed to re-watch channel")?;
        self.mark_watched(channel_id).await;

        let last_read = record.last_read_for(&user.id);
        let count = compute_unread(&record.messages, &user.id, last_read);
        let mut inner = self.inner.lock().await;
        inner.store_messages(channel_id, record.messages);
        match last_read {
            Some(at) => {
                inner.last_read.insert(channel_id.clone(), at);
            }
            None => {
                inner.last_read.remove(channel_id);
            }
        }
        Ok(count)
    }

    /// Force-refreshes every cached channel, e.g. after the app returns to
    /// the foreground.
    pub async fn refresh_unread_counts(&self) -> HashMap<ChannelId, u32> {
        let channel_ids = self.cache.lock().await.channel_ids();
        let refreshes = channel_ids.iter().map(|channel_id| async move {
            let count = self.force_refresh_unread(channel_id).await;
            (channel_id.clone(), count)
        });
        join_all(refreshes).await.into_iter().collect()
    }

    /// Marks the channel read on the backend and zeroes the local count.
    pub async fn mark_channel_read(&self, channel_id: &ChannelId) -> Result<()> {
        self.require_user().await?;
        self.request(|| self.backend.mark_read(channel_id))
            .await
            .with_context(|| format!("failed to mark channel {channel_id} read"))?;

        {
            let mut inner = self.inner.lock().await;
            let newest = inner
                .messages
                .get(channel_id)
                .and_then(|messages| messages.iter().map(|message| message.created_at).max());
            let now = Utc::now();
            let read_at = newest.map_or(now, |newest| newest.max(now));
            inner.last_read.insert(channel_id.clone(), read_at);
        }
        self.cache.lock().await.update(
            channel_id,
            UserChannelPatch {
                unread_count: Some(0),
                ..Default::default()
            },
        );
        self.notify_unread(channel_id, 0).await;
        info!(channel_id = %channel_id, "sync: channel marked read");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/unread_tests.rs"]
mod tests;
