use std::time::Duration;

use shared::{
    domain::ChannelId,
    protocol::{UserChannel, UserChannelPatch},
};
use tokio::time::Instant;

use crate::ChannelUpdateObserver;

/// Channel list cache. Validity is tracked for the list as a whole, not per
/// entry.
#[derive(Default)]
pub struct ChannelCache {
    channels: Vec<UserChannel>,
    last_cache_time: Option<Instant>,
    ttl: Duration,
    on_channel_update: Option<ChannelUpdateObserver>,
}

impl ChannelCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            channels: Vec::new(),
            last_cache_time: None,
            ttl,
            on_channel_update: None,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_valid(&self) -> bool {
        self.last_cache_time
            .is_some_and(|cached_at| cached_at.elapsed() < self.ttl)
    }

    pub fn get(&self) -> Option<Vec<UserChannel>> {
        self.is_valid().then(|| self.channels.clone())
    }

    pub fn set(&mut self, channels: Vec<UserChannel>) {
        self.channels = channels;
        self.last_cache_time = Some(Instant::now());
    }

    /// Peeks at a single entry, ignoring the TTL.
    pub fn entry(&self, channel_id: &ChannelId) -> Option<&UserChannel> {
        self.channels
            .iter()
            .find(|channel| &channel.id == channel_id)
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels
            .iter()
            .map(|channel| channel.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Merges `patch` into the entry for `channel_id` and hands the merged row
    /// to the channel observer. Unknown ids are ignored.
    pub fn update(
        &mut self,
        channel_id: &ChannelId,
        patch: UserChannelPatch,
    ) -> Option<UserChannel> {
        let channel = self
            .channels
            .iter_mut()
            .find(|channel| &channel.id == channel_id)?;
        channel.apply(patch);
        let merged = channel.clone();
        if let Some(observer) = &self.on_channel_update {
            observer(channel_id, &merged);
        }
        Some(merged)
    }

    pub fn invalidate(&mut self) {
        self.channels.clear();
        self.last_cache_time = None;
    }

    pub fn set_observer(&mut self, observer: Option<ChannelUpdateObserver>) {
        self.on_channel_update = observer;
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
