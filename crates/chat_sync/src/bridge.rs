use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use shared::{
    domain::{ChannelId, MessageId, UserId},
    protocol::{
        ChannelEvent, LastMessageSummary, MessageRecord, ReactionRecord, UserChannelPatch,
    },
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::service::ChatSyncService;

impl ChatSyncService {
    /// Starts the live-event listener for a channel. Returns `false` when one
    /// is already running.
    pub async fn attach(self: &Arc<Self>, channel_id: &ChannelId) -> Result<bool> {
        if self.is_attached(channel_id).await {
            return Ok(false);
        }

        let mut events = self
            .backend
            .subscribe(channel_id)
            .await
            .with_context(|| format!("failed to subscribe to channel {channel_id}"))?;
        let mut listeners = self.listeners.lock().await;
        // another attach won the race while we were subscribing
        if listeners
            .get(channel_id)
            .is_some_and(|task| !task.is_finished())
        {
            return Ok(false);
        }
        let service: Weak<Self> = Arc::downgrade(self);
        let listened = channel_id.clone();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(service) = service.upgrade() else {
                            break;
                        };
                        service.apply_channel_event(event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            channel_id = %listened,
                            skipped,
                            "bridge: listener lagged behind"
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(channel_id = %listened, "bridge: listener stopped");
        });
        listeners.insert(channel_id.clone(), task);
        debug!(channel_id = %channel_id, "bridge: listener attached");
        Ok(true)
    }

    pub async fn detach(&self, channel_id: &ChannelId) -> bool {
        let Some(task) = self.listeners.lock().await.remove(channel_id) else {
            return false;
        };
        task.abort();
        debug!(channel_id = %channel_id, "bridge: listener detached");
        true
    }

    pub async fn detach_all(&self) {
        let tasks: Vec<_> = self.listeners.lock().await.drain().collect();
        let count = tasks.len();
        for (_, task) in tasks {
            task.abort();
        }
        if count > 0 {
            info!(count, "bridge: detached all listeners");
        }
    }

    /// A listener whose stream closed no longer counts as attached.
    pub async fn is_attached(&self, channel_id: &ChannelId) -> bool {
        self.listeners
            .lock()
            .await
            .get(channel_id)
            .is_some_and(|task| !task.is_finished())
    }

    pub async fn attached_channels(&self) -> Vec<ChannelId> {
        let mut listeners = self.listeners.lock().await;
        listeners.retain(|_, task| !task.is_finished());
        listeners.keys().cloned().collect()
    }

    pub(crate) async fn apply_channel_event(&self, event: ChannelEvent) {
        let user_id = self
            .inner
            .lock()
            .await
            .user
            .as_ref()
            .map(|user| user.id.clone());
        let Some(user_id) = user_id else {
            return;
        };
        match event {
            ChannelEvent::MessageNew {
                channel_id,
                message,
            } => self.on_message_new(&channel_id, &user_id, message).await,
            ChannelEvent::MessageUpdated {
                channel_id,
                message,
            } => self.on_message_updated(&channel_id, message).await,
            ChannelEvent::MessageDeleted {
                channel_id,
                message,
            } => self.on_message_deleted(&channel_id, &message.id).await,
            ChannelEvent::ReactionNew {
                channel_id,
                message,
                reaction,
            } => {
                self.on_reaction(&channel_id, &user_id, message, reaction, true)
                    .await;
            }
            ChannelEvent::ReactionDeleted {
                channel_id,
                message,
                reaction,
            } => {
                self.on_reaction(&channel_id, &user_id, message, reaction, false)
                    .await;
            }
        }
    }

    async fn on_message_new(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
        message: MessageRecord,
    ) {
        let summary = LastMessageSummary::from(&message);
        let is_reply = message.parent_id.is_some();
        let own = &message.user_id == user_id;
        self.inner.lock().await.upsert_message(channel_id, message);
        if is_reply {
            return;
        }

        let unread = {
            let mut cache = self.cache.lock().await;
            let Some(current) = cache.entry(channel_id).cloned() else {
                return;
            };
            let mut patch = UserChannelPatch {
                last_activity: Some(summary.created_at),
                last_message: Some(summary.clone()),
                ..Default::default()
            };
            if own {
                patch.user_message_count = Some(current.user_message_count.saturating_add(1));
                patch.last_user_message = Some(summary);
            } else {
                patch.unread_count = Some(current.unread_count.saturating_add(1));
            }
            cache
                .update(channel_id, patch)
                .map(|merged| merged.unread_count)
        };

        if let (false, Some(count)) = (own, unread) {
            self.notify_unread(channel_id, count).await;
        }
    }

    async fn on_message_updated(&self, channel_id: &ChannelId, message: MessageRecord) {
        let summary = LastMessageSummary::from(&message);
        {
            let mut inner = self.inner.lock().await;
            let own_reactions = inner
                .find_message(channel_id, &message.id)
                .map(|existing| existing.own_reactions.clone());
            let mut message = message;
            if let Some(own_reactions) = own_reactions {
                message.own_reactions = own_reactions;
            }
            inner.upsert_message(channel_id, message);
        }

        let mut cache = self.cache.lock().await;
        let refers_to_last = cache
            .entry(channel_id)
            .and_then(|channel| channel.last_message.as_ref())
            .is_some_and(|last| last.message_id == summary.message_id);
        if refers_to_last {
            cache.update(
                channel_id,
                UserChannelPatch {
                    last_message: Some(summary),
                    ..Default::default()
                },
            );
        }
    }

    async fn on_message_deleted(&self, channel_id: &ChannelId, message_id: &MessageId) {
        let replacement = {
            let mut inner = self.inner.lock().await;
            let Some(messages) = inner.messages.get_mut(channel_id) else {
                return;
            };
            messages.retain(|existing| &existing.id != message_id);
            messages
                .iter()
                .filter(|message| !message.is_deleted() && message.parent_id.is_none())
                .max_by_key(|message| message.created_at)
                .map(LastMessageSummary::from)
        };

        let mut cache = self.cache.lock().await;
        let refers_to_deleted = cache
            .entry(channel_id)
            .and_then(|channel| channel.last_message.as_ref())
            .is_some_and(|last| &last.message_id == message_id);
        if let (true, Some(replacement)) = (refers_to_deleted, replacement) {
            cache.update(
                channel_id,
                UserChannelPatch {
                    last_message: Some(replacement),
                    ..Default::default()
                },
            );
        }
    }

    /// Reaction events carry the message without the viewer's own reactions,
    /// so those are carried over from local state unless the event is ours.
    async fn on_reaction(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
        mut message: MessageRecord,
        reaction: ReactionRecord,
        added: bool,
    ) {
        let mut inner = self.inner.lock().await;
        let mut own_reactions = inner
            .find_message(channel_id, &message.id)
            .map(|existing| existing.own_reactions.clone())
            .unwrap_or_default();
        if &reaction.user_id == user_id {
            own_reactions.retain(|own| own.kind != reaction.kind);
            if added {
                own_reactions.push(reaction);
            }
        }
        message.own_reactions = own_reactions;
        inner.upsert_message(channel_id, message);
    }
}

#[cfg(test)]
#[path = "tests/bridge_tests.rs"]
mod tests;
