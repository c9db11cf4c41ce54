use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chat_sync::{memory::BackendOp, ChatSyncService, InMemoryChatBackend, SyncSettings};
use chrono::{TimeZone, Utc};
use shared::{
    domain::{ChannelId, ChannelKind, MessageId, UserId},
    protocol::{ChannelRecord, IdentityProfile, MessageRecord, ProfileData},
};

const FAN: &str = "fan-1";
const RIVAL: &str = "fan-2";

fn settings() -> SyncSettings {
    SyncSettings {
        retry_base_delay: Duration::from_millis(5),
        retry_max_jitter: Duration::ZERO,
        discovery_phase_delay: Duration::from_millis(50),
        ..SyncSettings::default()
    }
}

fn fan() -> IdentityProfile {
    IdentityProfile {
        auth_token: FAN.into(),
        user_data: ProfileData {
            name: "Fan One".into(),
            email: "fan@example.com".into(),
            display_name: Some("Fan".into()),
            avatar_path: None,
        },
    }
}

fn lobby() -> ChannelRecord {
    let opened = Utc.with_ymd_and_hms(2024, 6, 1, 18, 0, 0).unwrap();
    let mut record = ChannelRecord::new("lobby", ChannelKind::Messaging, opened);
    record.members = vec![UserId::new(FAN), UserId::new(RIVAL)];
    let minute = chrono::Duration::minutes(1);
    record.messages = vec![
        MessageRecord::new("k1", RIVAL, "kickoff soon", opened + minute),
        MessageRecord::new("k2", FAN, "ready", opened + minute * 2),
    ];
    record
}

#[tokio::test(start_paused = true)]
async fn full_session_round_trip() {
    let backend = Arc::new(InMemoryChatBackend::with_channels(vec![lobby()]));
    let service = ChatSyncService::new(backend.clone(), settings());
    let lobby_id = ChannelId::new("lobby");

    let user = service.connect_user(fan()).await.unwrap();
    assert_eq!(user.display_name.as_deref(), Some("Fan"));

    let unread_updates = Arc::new(Mutex::new(Vec::new()));
    let sink = unread_updates.clone();
    service
        .set_on_unread_count_update(Some(Arc::new(move |_: &ChannelId, count: u32| {
            sink.lock().unwrap().push(count);
        })))
        .await;

    let channels = service.get_user_channels(false).await;
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].unread_count, 1);

    let game = service
        .create_game_channel(
            &shared::protocol::GameData {
                game_id: "88".into(),
                home_team: Some("Hawks".into()),
                away_team: Some("Owls".into()),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    service
        .send_message(&game, "first!", None)
        .await
        .unwrap();

    let channels = service.get_user_channels(false).await;
    let names: Vec<&str> = channels
        .iter()
        .map(|channel| channel.name.as_str())
        .collect();
    assert_eq!(names, ["Owls vs Hawks", "lobby"]);

    let mut late = MessageRecord::new("k3", RIVAL, "goal", Utc::now());
    late.user_name = Some("Rival".into());
    backend.post_message(&lobby_id, late).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*unread_updates.lock().unwrap(), [2]);

    service.mark_channel_read(&lobby_id).await.unwrap();
    assert_eq!(service.unread_count(&lobby_id).await, 0);

    service.set_active_channel(lobby_id.clone()).await;
    let liked = service
        .toggle_like(&MessageId::new("k3"), None)
        .await
        .unwrap();
    assert!(liked.is_liked);
    assert_eq!(backend.call_count(BackendOp::SendReaction).await, 1);

    service.disconnect().await.unwrap();
    assert!(service.current_user().await.is_none());
    assert!(service.attached_channels().await.is_empty());
}
