use std::sync::{Arc, Mutex as StdMutex};

use chrono::{TimeZone, Utc};
use shared::domain::ChannelKind;

use super::*;

fn channel(id: &str, unread_count: u32) -> UserChannel {
    UserChannel {
        id: ChannelId::new(id),
        name: id.to_uppercase(),
        kind: ChannelKind::Messaging,
        last_message: None,
        unread_count,
        member_count: 2,
        game_data: None,
        last_activity: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        user_message_count: 1,
        last_user_message: None,
    }
}

#[tokio::test(start_paused = true)]
async fn get_returns_what_was_set_within_ttl() {
    let mut cache = ChannelCache::new(Duration::from_secs(300));
    let channels = vec![channel("a", 0), channel("b", 3)];
    cache.set(channels.clone());

    assert_eq!(cache.get(), Some(channels));
}

#[tokio::test(start_paused = true)]
async fn get_expires_after_ttl() {
    let mut cache = ChannelCache::new(Duration::from_secs(300));
    cache.set(vec![channel("a", 0)]);

    tokio::time::advance(Duration::from_secs(299)).await;
    assert!(cache.get().is_some());

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(cache.get(), None);
    // stale entries stay reachable for live updates
    assert!(cache.entry(&ChannelId::new("a")).is_some());
}

#[tokio::test(start_paused = true)]
async fn empty_cache_is_invalid_until_set() {
    let mut cache = ChannelCache::new(Duration::from_secs(300));
    assert_eq!(cache.get(), None);

    cache.set(Vec::new());
    assert_eq!(cache.get(), Some(Vec::new()));
}

#[tokio::test(start_paused = true)]
async fn update_merges_and_notifies_observer() {
    let mut cache = ChannelCache::new(Duration::from_secs(300));
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    cache.set_observer(Some(Arc::new(move |id: &ChannelId, updated: &UserChannel| {
        sink.lock()
            .expect("observer lock")
            .push((id.clone(), updated.unread_count));
    })));
    cache.set(vec![channel("a", 1), channel("b", 0)]);

    let merged = cache
        .update(
            &ChannelId::new("a"),
            UserChannelPatch {
                unread_count: Some(4),
                ..Default::default()
            },
        )
        .expect("entry exists");

    assert_eq!(merged.unread_count, 4);
    assert_eq!(merged.name, "A");
    assert_eq!(cache.entry(&ChannelId::new("a")), Some(&merged));
    assert_eq!(
        *seen.lock().expect("observer lock"),
        vec![(ChannelId::new("a"), 4)]
    );
}

#[tokio::test(start_paused = true)]
async fn update_ignores_unknown_channels() {
    let mut cache = ChannelCache::new(Duration::from_secs(300));
    cache.set(vec![channel("a", 1)]);

    let merged = cache.update(
        &ChannelId::new("zzz"),
        UserChannelPatch {
            unread_count: Some(9),
            ..Default::default()
        },
    );
    assert!(merged.is_none());
    assert_eq!(cache.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn invalidate_forces_refetch() {
    let mut cache = ChannelCache::new(Duration::from_secs(300));
    cache.set(vec![channel("a", 1)]);

    cache.invalidate();

    assert_eq!(cache.get(), None);
    assert!(cache.is_empty());
}
