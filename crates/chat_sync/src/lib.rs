use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{ChannelId, MessageId},
    protocol::{
        ChannelEvent, ChannelFilter, ChannelRecord, ChannelSort, ChatUser, CreateChannelRequest,
        MessageRecord, QueryOptions, UserChannel,
    },
};
use tokio::sync::broadcast;

mod bridge;
pub mod cache;
pub mod config;
mod discovery;
pub mod error;
pub mod memory;
mod reactions;
pub mod retry;
mod service;
#[cfg(test)]
mod test_support;
pub mod throttle;
mod unread;

pub use cache::ChannelCache;
pub use config::{load_settings, load_settings_from, SyncSettings};
pub use discovery::{extract_game_data, is_game_channel, merge_channel_sets};
pub use error::{is_rate_limited, SyncError};
pub use memory::InMemoryChatBackend;
pub use reactions::like_state_from;
pub use retry::RateLimitRetrier;
pub use service::ChatSyncService;
pub use throttle::ConcurrencyThrottler;
pub use unread::compute_unread;

/// Called with the new unread count whenever a channel's count changes.
pub type UnreadCountObserver = Arc<dyn Fn(&ChannelId, u32) + Send + Sync>;
/// Called with the merged row whenever a cached channel is updated in place.
pub type ChannelUpdateObserver = Arc<dyn Fn(&ChannelId, &UserChannel) + Send + Sync>;

/// The slice of the chat SDK the sync service depends on.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn connect_user(&self, user: &ChatUser) -> Result<()>;
    async fn disconnect_user(&self) -> Result<()>;
    async fn query_channels(
        &self,
        filter: &ChannelFilter,
        sort: ChannelSort,
        options: &QueryOptions,
    ) -> Result<Vec<ChannelRecord>>;
    /// Starts watching a channel and returns its freshly loaded state.
    async fn watch(&self, channel_id: &ChannelId) -> Result<ChannelRecord>;
    async fn query_messages(&self, channel_id: &ChannelId, limit: u32)
        -> Result<Vec<MessageRecord>>;
    async fn get_replies(
        &self,
        channel_id: &ChannelId,
        parent_id: &MessageId,
    ) -> Result<Vec<MessageRecord>>;
    async fn send_reaction(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        kind: &str,
    ) -> Result<MessageRecord>;
    async fn delete_reaction(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        kind: &str,
    ) -> Result<MessageRecord>;
    async fn mark_read(&self, channel_id: &ChannelId) -> Result<()>;
    async fn send_message(
        &self,
        channel_id: &ChannelId,
        text: &str,
        parent_id: Option<&MessageId>,
    ) -> Result<MessageRecord>;
    async fn create_channel(&self, request: &CreateChannelRequest) -> Result<ChannelRecord>;
    async fn subscribe(&self, channel_id: &ChannelId) -> Result<broadcast::Receiver<ChannelEvent>>;
}
