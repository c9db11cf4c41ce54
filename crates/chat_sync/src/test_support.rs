//! Fixtures shared by the unit test modules.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use shared::{
    domain::{ChannelId, ChannelKind, UserId},
    protocol::{ChannelRecord, IdentityProfile, MessageRecord, ProfileData, ReadState},
};

use crate::{config::SyncSettings, memory::InMemoryChatBackend, service::ChatSyncService};

pub(crate) const ME: &str = "user-me";
pub(crate) const FRIEND: &str = "user-friend";
pub(crate) const STRANGER: &str = "user-stranger";

pub(crate) fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + ChronoDuration::minutes(minute)
}

pub(crate) fn fast_settings() -> SyncSettings {
    SyncSettings {
        max_retry_attempts: 3,
        retry_base_delay: Duration::from_millis(10),
        retry_max_jitter: Duration::ZERO,
        discovery_phase_delay: Duration::ZERO,
        ..SyncSettings::default()
    }
}

pub(crate) fn identity(user_id: &str) -> IdentityProfile {
    IdentityProfile {
        auth_token: user_id.to_string(),
        user_data: ProfileData {
            name: user_id.to_string(),
            email: format!("{user_id}@example.com"),
            display_name: None,
            avatar_path: None,
        },
    }
}

pub(crate) fn message(id: &str, user_id: &str, minute: i64) -> MessageRecord {
    MessageRecord::new(id, user_id, format!("text of {id}"), at(minute))
}

pub(crate) fn reply(id: &str, user_id: &str, parent: &str, minute: i64) -> MessageRecord {
    let mut reply = message(id, user_id, minute);
    reply.parent_id = Some(parent.into());
    reply
}

pub(crate) fn channel(id: &str, members: &[&str], messages: Vec<MessageRecord>) -> ChannelRecord {
    let mut record = ChannelRecord::new(id, ChannelKind::Messaging, at(-60));
    record.members = members.iter().map(|member| UserId::new(*member)).collect();
    record.member_count = Some(members.len() as u32);
    record.messages = messages;
    record
}

pub(crate) fn read_marker(record: &mut ChannelRecord, user_id: &str, minute: i64) {
    record.read.push(ReadState {
        user_id: UserId::new(user_id),
        last_read: at(minute),
    });
}

pub(crate) fn channel_id(id: &str) -> ChannelId {
    ChannelId::new(id)
}

pub(crate) async fn connected(
    channels: Vec<ChannelRecord>,
) -> (Arc<InMemoryChatBackend>, Arc<ChatSyncService>) {
    let backend = Arc::new(InMemoryChatBackend::with_channels(channels));
    let service = ChatSyncService::new(backend.clone(), fast_settings());
    service.connect_user(identity(ME)).await.unwrap();
    (backend, service)
}

/// Lets spawned listener tasks drain their queues. Only meaningful on a
/// paused clock, where the sleep completes once every task is idle.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}
