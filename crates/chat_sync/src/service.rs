use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use shared::{
    domain::{ChannelId, ChannelKind, MessageId},
    protocol::{
        ChatUser, CreateChannelRequest, GameData, IdentityProfile, MessageRecord, UserChannel,
    },
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    cache::ChannelCache, config::SyncSettings, error::SyncError, retry::RateLimitRetrier,
    throttle::ConcurrencyThrottler, ChannelUpdateObserver, ChatBackend, UnreadCountObserver,
};

/// Owns the channel cache, request throttling and live-event listeners for
/// one signed-in session.
pub struct ChatSyncService {
    pub(crate) backend: Arc<dyn ChatBackend>,
    pub(crate) settings: SyncSettings,
    pub(crate) retrier: RateLimitRetrier,
    pub(crate) throttler: ConcurrencyThrottler,
    pub(crate) cache: Mutex<ChannelCache>,
    pub(crate) inner: Mutex<SessionState>,
    pub(crate) listeners: Mutex<HashMap<ChannelId, JoinHandle<()>>>,
    /// Message ids with a like toggle in flight.
    pub(crate) liking: StdMutex<HashSet<MessageId>>,
    pub(crate) on_unread_count_update: Mutex<Option<UnreadCountObserver>>,
}

#[derive(Default)]
pub(crate) struct SessionState {
    pub(crate) user: Option<ChatUser>,
    pub(crate) active_channel: Option<ChannelId>,
    pub(crate) watched: HashSet<ChannelId>,
    /// Locally loaded top-level messages and thread replies per channel.
    pub(crate) messages: HashMap<ChannelId, Vec<MessageRecord>>,
    pub(crate) last_read: HashMap<ChannelId, DateTime<Utc>>,
}

impl SessionState {
    pub(crate) fn store_messages(&mut self, channel_id: &ChannelId, messages: Vec<MessageRecord>) {
        let replies: Vec<MessageRecord> = self
            .messages
            .remove(channel_id)
            .unwrap_or_default()
            .into_iter()
            .filter(|message| {
                message.parent_id.is_some() && !messages.iter().any(|m| m.id == message.id)
            })
            .collect();
        let mut merged = messages;
        merged.extend(replies);
        self.messages.insert(channel_id.clone(), merged);
    }

    /// Inserts or replaces a single message; returns true when it was new.
    pub(crate) fn upsert_message(
        &mut self,
        channel_id: &ChannelId,
        message: MessageRecord,
    ) -> bool {
        let messages = self.messages.entry(channel_id.clone()).or_default();
        let existing = messages
            .iter_mut()
            .find(|existing| existing.id == message.id);
        match existing {
            Some(existing) => {
                *existing = message;
                false
            }
            None => {
                messages.push(message);
                true
            }
        }
    }

    pub(crate) fn find_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Option<&MessageRecord> {
        self.messages
            .get(channel_id)?
            .iter()
            .find(|message| &message.id == message_id)
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

impl ChatSyncService {
    pub fn new(backend: Arc<dyn ChatBackend>, settings: SyncSettings) -> Arc<Self> {
        Arc::new(Self {
            backend,
            retrier: RateLimitRetrier::from_settings(&settings),
            throttler: ConcurrencyThrottler::new(settings.max_concurrent_requests),
            cache: Mutex::new(ChannelCache::new(settings.cache_ttl)),
            inner: Mutex::new(SessionState::default()),
            listeners: Mutex::new(HashMap::new()),
            liking: StdMutex::new(HashSet::new()),
            on_unread_count_update: Mutex::new(None),
            settings,
        })
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn throttler(&self) -> &ConcurrencyThrottler {
        &self.throttler
    }

    /// Runs a backend call behind the throttler, retrying on rate limits.
    pub(crate) async fn request<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.throttler
            .throttle(|| self.retrier.retry(operation))
            .await
    }

    pub async fn connect_user(&self, identity: IdentityProfile) -> Result<ChatUser> {
        let user = ChatUser::from(identity);
        let previous = self.inner.lock().await.user.clone();
        match previous {
            Some(current) if current.id == user.id => return Ok(current),
            Some(current) => {
                info!(
                    previous_user = %current.id,
                    next_user = %user.id,
                    "sync: identity changed; tearing down previous session"
                );
                self.disconnect().await?;
            }
            None => {}
        }

        self.request(|| self.backend.connect_user(&user))
            .await
            .with_context(|| format!("failed to connect chat user {}", user.id))?;
        self.inner.lock().await.user = Some(user.clone());
        info!(user_id = %user.id, "sync: chat user connected");
        Ok(user)
    }

    /// Signs out: drops every listener and all cached state.
    pub async fn disconnect(&self) -> Result<()> {
        self.detach_all().await;
        self.cache.lock().await.invalidate();
        self.liking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let had_user = {
            let mut inner = self.inner.lock().await;
            let had_user = inner.user.is_some();
            inner.clear();
            had_user
        };
        if had_user {
            self.backend
                .disconnect_user()
                .await
                .context("failed to disconnect chat user")?;
            info!("sync: chat user disconnected");
        }
        Ok(())
    }

    pub async fn current_user(&self) -> Option<ChatUser> {
        self.inner.lock().await.user.clone()
    }

    pub(crate) async fn require_user(&self) -> Result<ChatUser, SyncError> {
        self.inner
            .lock()
            .await
            .user
            .clone()
            .ok_or(SyncError::NotConnected)
    }

    pub async fn set_active_channel(&self, channel_id: ChannelId) {
        self.inner.lock().await.active_channel = Some(channel_id);
    }

    pub async fn clear_active_channel(&self) {
        self.inner.lock().await.active_channel = None;
    }

    pub async fn active_channel(&self) -> Option<ChannelId> {
        self.inner.lock().await.active_channel.clone()
    }

    pub async fn set_on_unread_count_update(&self, observer: Option<UnreadCountObserver>) {
        *self.on_unread_count_update.lock().await = observer;
    }

    pub async fn set_on_channel_update(&self, observer: Option<ChannelUpdateObserver>) {
        self.cache.lock().await.set_observer(observer);
    }

    pub(crate) async fn notify_unread(&self, channel_id: &ChannelId, count: u32) {
        let observer = self.on_unread_count_update.lock().await.clone();
        if let Some(observer) = observer {
            observer(channel_id, count);
        }
    }

    pub async fn invalidate_cache(&self) {
        self.cache.lock().await.invalidate();
    }

    /// Serves the cached list while it is fresh, otherwise rediscovers.
    pub async fn get_user_channels(self: &Arc<Self>, force_refresh: bool) -> Vec<UserChannel> {
        if !force_refresh {
            if let Some(cached) = self.cache.lock().await.get() {
                return cached;
            }
        }
        let channels = self.discover_channels().await;
        self.cache.lock().await.set(channels.clone());
        channels
    }

    pub async fn send_message(
        &self,
        channel_id: &ChannelId,
        text: &str,
        parent_id: Option<&MessageId>,
    ) -> Result<MessageRecord> {
        self.require_user().await?;
        let message = self
            .request(|| self.backend.send_message(channel_id, text, parent_id))
            .await
            .with_context(|| format!("failed to send message to channel {channel_id}"))?;
        self.inner
            .lock()
            .await
            .upsert_message(channel_id, message.clone());
        Ok(message)
    }

    /// Creates (or reuses) the public channel for a game. The channel list
    /// changes, so the cache is dropped.
    pub async fn create_game_channel(
        &self,
        game: &GameData,
        name: Option<String>,
    ) -> Result<ChannelId> {
        let user = self.require_user().await?;
        let channel_id = ChannelId::new(format!(
            "{}{}",
            self.settings.game_channel_prefix, game.game_id
        ));
        let data = match serde_json::to_value(game)? {
            Value::Object(map) => {
                let mut data = Map::new();
                data.insert("game".into(), Value::Object(map));
                data
            }
            _ => Map::new(),
        };
        let request = CreateChannelRequest {
            id: channel_id.clone(),
            kind: ChannelKind::Public,
            name,
            members: vec![user.id],
            data,
        };
        self.request(|| self.backend.create_channel(&request))
            .await
            .with_context(|| format!("failed to create game channel {channel_id}"))?;
        self.invalidate_cache().await;
        info!(channel_id = %channel_id, "sync: game channel ready");
        Ok(channel_id)
    }

    pub(crate) async fn is_watched(&self, channel_id: &ChannelId) -> bool {
        self.inner.lock().await.watched.contains(channel_id)
    }

    pub(crate) async fn mark_watched(&self, channel_id: &ChannelId) {
        self.inner.lock().await.watched.insert(channel_id.clone());
    }

    pub(crate) fn log_degraded(
        &self,
        what: &str,
        channel_id: Option<&ChannelId>,
        err: &anyhow::Error,
    ) {
        match channel_id {
            Some(channel_id) => warn!(
                channel_id = %channel_id,
                rate_limited = crate::error::is_rate_limited(err),
                "sync: {what} failed: {err:#}"
            ),
            None => warn!(
                rate_limited = crate::error::is_rate_limited(err),
                "sync: {what} failed: {err:#}"
            ),
        }
    }
}

#[cfg(test)]
#[path = "tests/service_tests.rs"]
mod tests;
