use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{ChannelId, ChannelKind, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUser {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileData {
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_path: Option<String>,
}

/// What the identity provider hands over after sign-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityProfile {
    pub auth_token: String,
    pub user_data: ProfileData,
}

impl From<IdentityProfile> for ChatUser {
    fn from(value: IdentityProfile) -> Self {
        Self {
            id: UserId(value.auth_token),
            name: value.user_data.name,
            email: value.user_data.email,
            display_name: value.user_data.display_name,
            avatar: value.user_data.avatar_path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRecord {
    pub kind: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    #[serde(default)]
    pub text: String,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reaction_counts: HashMap<String, u32>,
    /// Reactions left by the connected user.
    #[serde(default)]
    pub own_reactions: Vec<ReactionRecord>,
    #[serde(default)]
    pub latest_reactions: Vec<ReactionRecord>,
}

impl MessageRecord {
    pub fn new(
        id: impl Into<MessageId>,
        user_id: impl Into<UserId>,
        text: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            user_id: user_id.into(),
            user_name: None,
            created_at,
            parent_id: None,
            deleted_at: None,
            reaction_counts: HashMap::new(),
            own_reactions: Vec::new(),
            latest_reactions: Vec::new(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn reaction_count(&self, kind: &str) -> u32 {
        self.reaction_counts.get(kind).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadState {
    pub user_id: UserId,
    pub last_read: DateTime<Utc>,
}

/// Channel as returned by the chat backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: ChannelId,
    #[serde(default)]
    pub kind: ChannelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_count: Option<u32>,
    #[serde(default)]
    pub members: Vec<UserId>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
    #[serde(default)]
    pub read: Vec<ReadState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ChannelRecord {
    pub fn new(id: impl Into<ChannelId>, kind: ChannelKind, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: None,
            created_by: None,
            member_count: None,
            members: Vec::new(),
            data: Map::new(),
            messages: Vec::new(),
            read: Vec::new(),
            last_message_at: None,
            created_at,
        }
    }

    pub fn last_read_for(&self, user_id: &UserId) -> Option<DateTime<Utc>> {
        self.read
            .iter()
            .find(|state| &state.user_id == user_id)
            .map(|state| state.last_read)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessageSummary {
    pub message_id: MessageId,
    pub text: String,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&MessageRecord> for LastMessageSummary {
    fn from(message: &MessageRecord) -> Self {
        Self {
            message_id: message.id.clone(),
            text: message.text.clone(),
            sender_id: message.user_id.clone(),
            sender_name: message.user_name.clone(),
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GameData {
    pub game_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub away_team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_team_logo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub away_team_logo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Channel list row handed to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserChannel {
    pub id: ChannelId,
    pub name: String,
    pub kind: ChannelKind,
    pub last_message: Option<LastMessageSummary>,
    pub unread_count: u32,
    pub member_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_data: Option<GameData>,
    pub last_activity: DateTime<Utc>,
    pub user_message_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_user_message: Option<LastMessageSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserChannelPatch {
    pub name: Option<String>,
    pub last_message: Option<LastMessageSummary>,
    pub unread_count: Option<u32>,
    pub member_count: Option<u32>,
    pub game_data: Option<GameData>,
    pub last_activity: Option<DateTime<Utc>>,
    pub user_message_count: Option<u32>,
    pub last_user_message: Option<LastMessageSummary>,
}

impl UserChannel {
    pub fn apply(&mut self, patch: UserChannelPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(last_message) = patch.last_message {
            self.last_message = Some(last_message);
        }
        if let Some(unread_count) = patch.unread_count {
            self.unread_count = unread_count;
        }
        if let Some(member_count) = patch.member_count {
            self.member_count = member_count.max(1);
        }
        if let Some(game_data) = patch.game_data {
            self.game_data = Some(game_data);
        }
        if let Some(last_activity) = patch.last_activity {
            self.last_activity = last_activity;
        }
        if let Some(user_message_count) = patch.user_message_count {
            self.user_message_count = user_message_count;
        }
        if let Some(last_user_message) = patch.last_user_message {
            self.last_user_message = Some(last_user_message);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageLikeState {
    pub is_liked: bool,
    pub like_count: u32,
    pub user_likes: BTreeSet<UserId>,
}

/// Live event pushed by the backend for a watched channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelEvent {
    #[serde(rename = "message.new")]
    MessageNew {
        channel_id: ChannelId,
        message: MessageRecord,
    },
    #[serde(rename = "message.updated")]
    MessageUpdated {
        channel_id: ChannelId,
        message: MessageRecord,
    },
    #[serde(rename = "message.deleted")]
    MessageDeleted {
        channel_id: ChannelId,
        message: MessageRecord,
    },
    #[serde(rename = "reaction.new")]
    ReactionNew {
        channel_id: ChannelId,
        message: MessageRecord,
        reaction: ReactionRecord,
    },
    #[serde(rename = "reaction.deleted")]
    ReactionDeleted {
        channel_id: ChannelId,
        message: MessageRecord,
        reaction: ReactionRecord,
    },
}

impl ChannelEvent {
    pub fn channel_id(&self) -> &ChannelId {
        match self {
            Self::MessageNew { channel_id, .. }
            | Self::MessageUpdated { channel_id, .. }
            | Self::MessageDeleted { channel_id, .. }
            | Self::ReactionNew { channel_id, .. }
            | Self::ReactionDeleted { channel_id, .. } => channel_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum ChannelFilter {
    Member(UserId),
    Kind(ChannelKind),
    CreatedBy(UserId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelSort {
    #[default]
    LastMessageAtDesc,
    CreatedAtDesc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub watch: bool,
    pub state: bool,
    pub limit: u32,
    pub message_limit: u32,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            watch: false,
            state: true,
            limit: 30,
            message_limit: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateChannelRequest {
    pub id: ChannelId,
    pub kind: ChannelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub members: Vec<UserId>,
    #[serde(default)]
    pub data: Map<String, Value>,
}
