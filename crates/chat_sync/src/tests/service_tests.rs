use std::time::Duration;

use shared::domain::UserId;

use super::*;
use crate::{
    memory::BackendOp,
    test_support::{channel, channel_id, connected, identity, message, FRIEND, ME},
};

fn dm() -> shared::protocol::ChannelRecord {
    channel(
        "dm",
        &[ME, FRIEND],
        vec![message("m1", FRIEND, 0), message("m2", ME, 1)],
    )
}

#[tokio::test]
async fn connecting_the_same_identity_twice_is_a_no_op() {
    let (backend, service) = connected(vec![dm()]).await;

    let user = service.connect_user(identity(ME)).await.unwrap();

    assert_eq!(user.id, UserId::new(ME));
    assert_eq!(backend.call_count(BackendOp::ConnectUser).await, 1);
    assert_eq!(backend.call_count(BackendOp::DisconnectUser).await, 0);
}

#[tokio::test]
async fn switching_identity_tears_down_the_previous_session() {
    let (backend, service) = connected(vec![dm()]).await;
    assert_eq!(service.get_user_channels(false).await.len(), 1);
    assert!(service.is_attached(&channel_id("dm")).await);
    service.set_active_channel(channel_id("dm")).await;

    let user = service.connect_user(identity(FRIEND)).await.unwrap();

    assert_eq!(user.id, UserId::new(FRIEND));
    assert_eq!(backend.call_count(BackendOp::DisconnectUser).await, 1);
    assert!(service.attached_channels().await.is_empty());
    assert!(service.cache.lock().await.get().is_none());
    assert_eq!(service.active_channel().await, None);
    assert_eq!(
        service.current_user().await.map(|user| user.id),
        Some(UserId::new(FRIEND))
    );
}

#[tokio::test]
async fn disconnect_clears_session_state() {
    let (backend, service) = connected(vec![dm()]).await;
    service.get_user_channels(false).await;

    service.disconnect().await.unwrap();

    assert!(service.current_user().await.is_none());
    assert!(service.attached_channels().await.is_empty());
    assert_eq!(backend.call_count(BackendOp::DisconnectUser).await, 1);
    let err = service
        .send_message(&channel_id("dm"), "hello?", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::NotConnected)
    ));
}

#[tokio::test]
async fn disconnect_without_a_user_skips_the_backend() {
    let backend = Arc::new(crate::InMemoryChatBackend::new());
    let service = ChatSyncService::new(backend.clone(), crate::test_support::fast_settings());

    service.disconnect().await.unwrap();

    assert_eq!(backend.total_calls().await, 0);
}

#[tokio::test(start_paused = true)]
async fn channel_list_is_served_from_cache_until_it_expires() {
    let (backend, service) = connected(vec![dm()]).await;

    let first = service.get_user_channels(false).await;
    let queries = backend.call_count(BackendOp::QueryChannels).await;
    assert_eq!(queries, 3);

    let second = service.get_user_channels(false).await;
    assert_eq!(first, second);
    assert_eq!(backend.call_count(BackendOp::QueryChannels).await, queries);

    tokio::time::advance(service.settings().cache_ttl + Duration::from_secs(1)).await;
    service.get_user_channels(false).await;
    assert_eq!(
        backend.call_count(BackendOp::QueryChannels).await,
        queries * 2
    );
}

#[tokio::test]
async fn force_refresh_and_invalidation_bypass_the_cache() {
    let (backend, service) = connected(vec![dm()]).await;
    service.get_user_channels(false).await;

    service.get_user_channels(true).await;
    assert_eq!(backend.call_count(BackendOp::QueryChannels).await, 6);

    service.invalidate_cache().await;
    service.get_user_channels(false).await;
    assert_eq!(backend.call_count(BackendOp::QueryChannels).await, 9);
}

#[tokio::test]
async fn empty_result_is_cached_too() {
    let (backend, service) = connected(Vec::new()).await;

    assert!(service.get_user_channels(false).await.is_empty());
    assert!(service.get_user_channels(false).await.is_empty());

    assert_eq!(backend.call_count(BackendOp::QueryChannels).await, 3);
}

#[tokio::test(start_paused = true)]
async fn connect_retries_through_rate_limits() {
    let backend = Arc::new(crate::InMemoryChatBackend::new());
    backend.rate_limit_next(BackendOp::ConnectUser, 2).await;
    let service = ChatSyncService::new(backend.clone(), crate::test_support::fast_settings());

    service.connect_user(identity(ME)).await.unwrap();

    assert_eq!(backend.call_count(BackendOp::ConnectUser).await, 3);
}

#[tokio::test]
async fn game_channel_is_created_once_and_drops_the_cache() {
    let (backend, service) = connected(Vec::new()).await;
    service.get_user_channels(false).await;
    let game = GameData {
        game_id: "401".into(),
        home_team: Some("Hawks".into()),
        away_team: Some("Owls".into()),
        ..GameData::default()
    };

    let first = service.create_game_channel(&game, None).await.unwrap();
    let second = service
        .create_game_channel(&game, Some("Rematch".into()))
        .await
        .unwrap();

    assert_eq!(first, channel_id("game-401"));
    assert_eq!(first, second);
    assert!(service.cache.lock().await.get().is_none());
    let record = backend.channel(&first).await.unwrap();
    assert_eq!(record.kind, ChannelKind::Public);
    assert_eq!(record.name, None);
    assert_eq!(crate::extract_game_data(&record), Some(game));
    assert!(record.members.contains(&UserId::new(ME)));
}

#[tokio::test]
async fn sent_messages_are_kept_locally() {
    let (_backend, service) = connected(vec![dm()]).await;

    let sent = service
        .send_message(&channel_id("dm"), "see you there", None)
        .await
        .unwrap();

    let inner = service.inner.lock().await;
    let stored = inner.find_message(&channel_id("dm"), &sent.id).unwrap();
    assert_eq!(stored.text, "see you there");
    assert_eq!(stored.user_id, UserId::new(ME));
}
