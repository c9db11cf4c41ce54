use std::{
    collections::HashSet,
    sync::{Mutex as StdMutex, PoisonError},
};

use anyhow::{Context, Result};
use shared::{
    domain::{ChannelId, MessageId, UserId, LIKE_REACTION},
    protocol::{MessageLikeState, MessageRecord},
};
use tracing::{debug, info};

use crate::{
    error::{is_not_found, SyncError},
    service::ChatSyncService,
};

/// Like state of `message` as seen by `user_id`, taken from the backend's
/// reaction counts and reaction lists.
pub fn like_state_from(message: &MessageRecord, user_id: &UserId) -> MessageLikeState {
    let user_likes = message
        .latest_reactions
        .iter()
        .chain(message.own_reactions.iter())
        .filter(|reaction| reaction.kind == LIKE_REACTION)
        .map(|reaction| reaction.user_id.clone())
        .collect();
    let is_liked = message
        .own_reactions
        .iter()
        .any(|reaction| reaction.kind == LIKE_REACTION && &reaction.user_id == user_id);
    MessageLikeState {
        is_liked,
        like_count: message.reaction_count(LIKE_REACTION),
        user_likes,
    }
}

/// Holds a message id in the in-flight set until dropped, so a cancelled
/// toggle releases it too.
struct LikeGuard<'a> {
    liking: &'a StdMutex<HashSet<MessageId>>,
    message_id: MessageId,
}

impl<'a> LikeGuard<'a> {
    fn acquire(
        liking: &'a StdMutex<HashSet<MessageId>>,
        message_id: &MessageId,
    ) -> Result<Self, SyncError> {
        let mut in_flight = liking.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(message_id.clone()) {
            return Err(SyncError::LikeInFlight(message_id.clone()));
        }
        Ok(Self {
            liking,
            message_id: message_id.clone(),
        })
    }
}

impl Drop for LikeGuard<'_> {
    fn drop(&mut self) {
        self.liking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.message_id);
    }
}

impl ChatSyncService {
    pub fn is_liking(&self, message_id: &MessageId) -> bool {
        self.liking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(message_id)
    }

    async fn active_context(&self) -> Result<(ChannelId, UserId), SyncError> {
        let inner = self.inner.lock().await;
        let channel_id = inner
            .active_channel
            .clone()
            .ok_or(SyncError::NoActiveChannel)?;
        let user_id = inner
            .user
            .as_ref()
            .map(|user| user.id.clone())
            .ok_or(SyncError::NotConnected)?;
        Ok((channel_id, user_id))
    }

    /// Finds the message in local state, then among the replies of
    /// `parent_id`, then by re-querying the channel.
    async fn resolve_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        parent_id: Option<&MessageId>,
    ) -> Result<Option<MessageRecord>> {
        let local = self
            .inner
            .lock()
            .await
            .find_message(channel_id, message_id)
            .cloned();
        if local.is_some() {
            return Ok(local);
        }

        if let Some(parent_id) = parent_id {
            match self
                .request(|| self.backend.get_replies(channel_id, parent_id))
                .await
            {
                Ok(replies) => {
                    let found = replies
                        .iter()
                        .find(|reply| &reply.id == message_id)
                        .cloned();
                    let mut inner = self.inner.lock().await;
                    for reply in replies {
                        inner.upsert_message(channel_id, reply);
                    }
                    if found.is_some() {
                        return Ok(found);
                    }
                }
                Err(err) if is_not_found(&err) => {
                    debug!(
                        channel_id = %channel_id,
                        message_id = %message_id,
                        "reactions: parent thread not found; re-querying channel"
                    );
                }
                Err(err) => return Err(err.context("failed to load thread replies")),
            }
        }

        let limit = self.settings.message_fallback_limit;
        let messages = self
            .request(|| self.backend.query_messages(channel_id, limit))
            .await
            .context("failed to re-query channel messages")?;
        let found = messages
            .iter()
            .find(|message| &message.id == message_id)
            .cloned();
        self.inner.lock().await.store_messages(channel_id, messages);
        Ok(found)
    }

    async fn resolve_like_state(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
        message_id: &MessageId,
        parent_id: Option<&MessageId>,
    ) -> Result<MessageLikeState> {
        Ok(self
            .resolve_message(channel_id, message_id, parent_id)
            .await?
            .map(|message| like_state_from(&message, user_id))
            .unwrap_or_default())
    }

    /// Current like state; lookup failures yield the default state.
    pub async fn message_like_state(
        &self,
        message_id: &MessageId,
        parent_id: Option<&MessageId>,
    ) -> MessageLikeState {
        let Ok((channel_id, user_id)) = self.active_context().await else {
            return MessageLikeState::default();
        };
        match self
            .resolve_like_state(&channel_id, &user_id, message_id, parent_id)
            .await
        {
            Ok(state) => state,
            Err(err) => {
                self.log_degraded("like state lookup", Some(&channel_id), &err);
                MessageLikeState::default()
            }
        }
    }

    /// Flips the current user's like on a message in the active channel and
    /// returns the state reported back by the backend.
    pub async fn toggle_like(
        &self,
        message_id: &MessageId,
        parent_id: Option<&MessageId>,
    ) -> Result<MessageLikeState> {
        let (channel_id, user_id) = self.active_context().await?;
        let _guard = LikeGuard::acquire(&self.liking, message_id)?;

        let current = self
            .resolve_like_state(&channel_id, &user_id, message_id, parent_id)
            .await?;
        self.send_like(&channel_id, &user_id, message_id, !current.is_liked)
            .await
    }

    pub async fn like_message(&self, message_id: &MessageId) -> Result<MessageLikeState> {
        let (channel_id, user_id) = self.active_context().await?;
        self.send_like(&channel_id, &user_id, message_id, true).await
    }

    pub async fn unlike_message(&self, message_id: &MessageId) -> Result<MessageLikeState> {
        let (channel_id, user_id) = self.active_context().await?;
        self.send_like(&channel_id, &user_id, message_id, false).await
    }

    async fn send_like(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
        message_id: &MessageId,
        like: bool,
    ) -> Result<MessageLikeState> {
        let message = if like {
            self.request(|| {
                self.backend
                    .send_reaction(channel_id, message_id, LIKE_REACTION)
            })
            .await
            .with_context(|| format!("failed to like message {message_id}"))?
        } else {
            self.request(|| {
                self.backend
                    .delete_reaction(channel_id, message_id, LIKE_REACTION)
            })
            .await
            .with_context(|| format!("failed to unlike message {message_id}"))?
        };

        let state = like_state_from(&message, user_id);
        self.inner.lock().await.upsert_message(channel_id, message);
        info!(
            channel_id = %channel_id,
            message_id = %message_id,
            liked = state.is_liked,
            like_count = state.like_count,
            "reactions: like state updated"
        );
        Ok(state)
    }
}

#[cfg(test)]
#[path = "tests/reactions_tests.rs"]
mod tests;
