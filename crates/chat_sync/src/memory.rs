//! In-process [`ChatBackend`] with failure injection, used by the test
//! suites and the `sync-inspect` tool.

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use shared::{
    domain::{ChannelId, MessageId, UserId},
    error::{ApiException, ErrorCode},
    protocol::{
        ChannelEvent, ChannelFilter, ChannelRecord, ChannelSort, ChatUser, CreateChannelRequest,
        MessageRecord, QueryOptions, ReactionRecord, ReadState,
    },
};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::ChatBackend;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    ConnectUser,
    DisconnectUser,
    QueryChannels,
    Watch,
    QueryMessages,
    GetReplies,
    SendReaction,
    DeleteReaction,
    MarkRead,
    SendMessage,
    CreateChannel,
    Subscribe,
}

#[derive(Default)]
struct MemoryState {
    current_user: Option<ChatUser>,
    channels: Vec<ChannelRecord>,
    watched: HashSet<ChannelId>,
    rate_limited: HashMap<BackendOp, u32>,
    failing: HashMap<BackendOp, String>,
    failing_channels: HashMap<ChannelId, String>,
    calls: HashMap<BackendOp, u32>,
    queries: Vec<ChannelFilter>,
    senders: HashMap<ChannelId, broadcast::Sender<ChannelEvent>>,
}

impl MemoryState {
    fn gate(&mut self, op: BackendOp) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;
        if let Some(remaining) = self.rate_limited.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                let err = ApiException::rate_limited(format!("{op:?} rate limited"));
                return Err(err.into());
            }
        }
        if let Some(message) = self.failing.get(&op) {
            return Err(unavailable(message));
        }
        Ok(())
    }

    fn gate_channel(&self, channel_id: &ChannelId) -> Result<()> {
        if let Some(message) = self.failing_channels.get(channel_id) {
            return Err(unavailable(message));
        }
        Ok(())
    }

    fn user(&self) -> Result<&ChatUser> {
        let Some(user) = &self.current_user else {
            let err = ApiException::new(ErrorCode::Unauthorized, "no user connected");
            return Err(err.into());
        };
        Ok(user)
    }

    fn user_id(&self) -> Option<&UserId> {
        self.current_user.as_ref().map(|user| &user.id)
    }

    fn channel(&self, channel_id: &ChannelId) -> Result<&ChannelRecord> {
        self.channels
            .iter()
            .find(|channel| &channel.id == channel_id)
            .ok_or_else(|| not_found("channel", channel_id))
    }

    fn channel_mut(&mut self, channel_id: &ChannelId) -> Result<&mut ChannelRecord> {
        self.channels
            .iter_mut()
            .find(|channel| &channel.id == channel_id)
            .ok_or_else(|| not_found("channel", channel_id))
    }

    fn project_channel(
        &self,
        record: &ChannelRecord,
        include_state: bool,
        limit: u32,
    ) -> ChannelRecord {
        let mut projected = record.clone();
        if include_state {
            let top_level: Vec<&MessageRecord> = record
                .messages
                .iter()
                .filter(|message| message.parent_id.is_none())
                .collect();
            let skip = top_level.len().saturating_sub(limit as usize);
            projected.messages = top_level
                .into_iter()
                .skip(skip)
                .map(|message| project_message(message, self.user_id()))
                .collect();
        } else {
            projected.messages.clear();
            projected.read.clear();
        }
        projected
    }

    fn broadcast(&self, event: ChannelEvent) {
        if let Some(sender) = self.senders.get(event.channel_id()) {
            let _ = sender.send(event);
        }
    }
}

fn unavailable(message: &str) -> anyhow::Error {
    ApiException::new(ErrorCode::Unavailable, message).into()
}

fn not_found(what: &str, id: impl Display) -> anyhow::Error {
    ApiException::not_found(format!("{what} {id} not found")).into()
}

/// Fills `own_reactions` from the point of view of `viewer`.
fn project_message(message: &MessageRecord, viewer: Option<&UserId>) -> MessageRecord {
    let mut projected = message.clone();
    projected.own_reactions = match viewer {
        Some(viewer) => message
            .latest_reactions
            .iter()
            .filter(|reaction| &reaction.user_id == viewer)
            .cloned()
            .collect(),
        None => Vec::new(),
    };
    projected
}

fn recount_reactions(message: &mut MessageRecord) {
    message.reaction_counts.clear();
    for reaction in &message.latest_reactions {
        *message
            .reaction_counts
            .entry(reaction.kind.clone())
            .or_default() += 1;
    }
}

fn next_timestamp(channel: &ChannelRecord) -> DateTime<Utc> {
    let now = Utc::now();
    let latest = channel
        .messages
        .iter()
        .map(|message| message.created_at)
        .max();
    match latest {
        Some(latest) if latest >= now => latest + ChronoDuration::milliseconds(1),
        _ => now,
    }
}

fn newest_message_time(channel: &ChannelRecord) -> Option<DateTime<Utc>> {
    channel
        .messages
        .iter()
        .filter(|message| message.parent_id.is_none())
        .map(|message| message.created_at)
        .max()
}

fn activity_key(channel: &ChannelRecord) -> DateTime<Utc> {
    channel.last_message_at.unwrap_or(channel.created_at)
}

#[derive(Default)]
pub struct InMemoryChatBackend {
    state: Mutex<MemoryState>,
}

impl InMemoryChatBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channels(channels: Vec<ChannelRecord>) -> Self {
        let mut channels = channels;
        for channel in &mut channels {
            for message in &mut channel.messages {
                recount_reactions(message);
            }
            if channel.last_message_at.is_none() {
                channel.last_message_at = newest_message_time(channel);
            }
        }
        Self {
            state: Mutex::new(MemoryState {
                channels,
                ..MemoryState::default()
            }),
        }
    }

    pub async fn insert_channel(&self, mut record: ChannelRecord) {
        for message in &mut record.messages {
            recount_reactions(message);
        }
        if record.last_message_at.is_none() {
            record.last_message_at = newest_message_time(&record);
        }
        let mut state = self.state.lock().await;
        state.channels.retain(|channel| channel.id != record.id);
        state.channels.push(record);
    }

    pub async fn channel(&self, channel_id: &ChannelId) -> Option<ChannelRecord> {
        let state = self.state.lock().await;
        state.channel(channel_id).ok().cloned()
    }

    /// Appends a message written by someone else and pushes `message.new`.
    pub async fn post_message(&self, channel_id: &ChannelId, message: MessageRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        let channel = state.channel_mut(channel_id)?;
        if message.parent_id.is_none() {
            channel.last_message_at = Some(
                channel
                    .last_message_at
                    .map_or(message.created_at, |at| at.max(message.created_at)),
            );
        }
        channel.messages.push(message.clone());
        state.broadcast(ChannelEvent::MessageNew {
            channel_id: channel_id.clone(),
            message: project_message(&message, None),
        });
        Ok(())
    }

    /// Adds a reaction on behalf of another user and pushes `reaction.new`.
    pub async fn react_as(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        user_id: &UserId,
        kind: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let channel = state.channel_mut(channel_id)?;
        let (message, reaction) = add_reaction(channel, message_id, user_id, kind)?;
        state.broadcast(ChannelEvent::ReactionNew {
            channel_id: channel_id.clone(),
            message: project_message(&message, None),
            reaction,
        });
        Ok(())
    }

    pub async fn set_last_read(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let channel = state.channel_mut(channel_id)?;
        upsert_read(channel, user_id, at);
        Ok(())
    }

    /// The next `times` calls of `op` fail with a rate-limit error.
    pub async fn rate_limit_next(&self, op: BackendOp, times: u32) {
        self.state.lock().await.rate_limited.insert(op, times);
    }

    pub async fn fail_operation(&self, op: BackendOp, message: impl Into<String>) {
        self.state.lock().await.failing.insert(op, message.into());
    }

    pub async fn clear_failure(&self, op: BackendOp) {
        let mut state = self.state.lock().await;
        state.failing.remove(&op);
        state.rate_limited.remove(&op);
    }

    /// Per-channel calls (watch, message queries) fail for `channel_id`.
    pub async fn fail_channel(&self, channel_id: &ChannelId, message: impl Into<String>) {
        self.state
            .lock()
            .await
            .failing_channels
            .insert(channel_id.clone(), message.into());
    }

    /// Drops the event stream of `channel_id`; open receivers see it closed.
    pub async fn close_events(&self, channel_id: &ChannelId) {
        self.state.lock().await.senders.remove(channel_id);
    }

    pub async fn call_count(&self, op: BackendOp) -> u32 {
        let state = self.state.lock().await;
        state.calls.get(&op).copied().unwrap_or(0)
    }

    pub async fn total_calls(&self) -> u32 {
        self.state.lock().await.calls.values().sum()
    }

    pub async fn channel_queries(&self) -> Vec<ChannelFilter> {
        self.state.lock().await.queries.clone()
    }

    pub async fn is_watched(&self, channel_id: &ChannelId) -> bool {
        self.state.lock().await.watched.contains(channel_id)
    }

    pub async fn subscriber_count(&self, channel_id: &ChannelId) -> usize {
        self.state
            .lock()
            .await
            .senders
            .get(channel_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

fn add_reaction(
    channel: &mut ChannelRecord,
    message_id: &MessageId,
    user_id: &UserId,
    kind: &str,
) -> Result<(MessageRecord, ReactionRecord)> {
    let message = channel
        .messages
        .iter_mut()
        .find(|message| &message.id == message_id)
        .ok_or_else(|| not_found("message", message_id))?;
    message
        .latest_reactions
        .retain(|reaction| !(&reaction.user_id == user_id && reaction.kind == kind));
    let reaction = ReactionRecord {
        kind: kind.to_string(),
        user_id: user_id.clone(),
        created_at: Utc::now(),
    };
    message.latest_reactions.push(reaction.clone());
    recount_reactions(message);
    Ok((message.clone(), reaction))
}

fn remove_reaction(
    channel: &mut ChannelRecord,
    message_id: &MessageId,
    user_id: &UserId,
    kind: &str,
) -> Result<(MessageRecord, ReactionRecord)> {
    let message = channel
        .messages
        .iter_mut()
        .find(|message| &message.id == message_id)
        .ok_or_else(|| not_found("message", message_id))?;
    let removed = message
        .latest_reactions
        .iter()
        .find(|reaction| &reaction.user_id == user_id && reaction.kind == kind)
        .cloned()
        .unwrap_or_else(|| ReactionRecord {
            kind: kind.to_string(),
            user_id: user_id.clone(),
            created_at: Utc::now(),
        });
    message
        .latest_reactions
        .retain(|reaction| !(&reaction.user_id == user_id && reaction.kind == kind));
    recount_reactions(message);
    Ok((message.clone(), removed))
}

fn upsert_read(channel: &mut ChannelRecord, user_id: &UserId, at: DateTime<Utc>) {
    let existing = channel
        .read
        .iter_mut()
        .find(|state| &state.user_id == user_id);
    match existing {
        Some(state) => state.last_read = at,
        None => channel.read.push(ReadState {
            user_id: user_id.clone(),
            last_read: at,
        }),
    }
}

#[async_trait]
impl ChatBackend for InMemoryChatBackend {
    async fn connect_user(&self, user: &ChatUser) -> Result<()> {
        let mut state = self.state.lock().await;
        state.gate(BackendOp::ConnectUser)?;
        state.current_user = Some(user.clone());
        Ok(())
    }

    async fn disconnect_user(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.gate(BackendOp::DisconnectUser)?;
        state.current_user = None;
        state.watched.clear();
        Ok(())
    }

    async fn query_channels(
        &self,
        filter: &ChannelFilter,
        sort: ChannelSort,
        options: &QueryOptions,
    ) -> Result<Vec<ChannelRecord>> {
        let mut state = self.state.lock().await;
        state.gate(BackendOp::QueryChannels)?;
        state.user()?;
        state.queries.push(filter.clone());

        let mut matches: Vec<&ChannelRecord> = state
            .channels
            .iter()
            .filter(|channel| match filter {
                ChannelFilter::Member(user_id) => channel.members.contains(user_id),
                ChannelFilter::Kind(kind) => channel.kind == *kind,
                ChannelFilter::CreatedBy(user_id) => channel.created_by.as_ref() == Some(user_id),
            })
            .collect();
        match sort {
            ChannelSort::LastMessageAtDesc => {
                matches.sort_by_key(|channel| std::cmp::Reverse(activity_key(channel)));
            }
            ChannelSort::CreatedAtDesc => {
                matches.sort_by_key(|channel| std::cmp::Reverse(channel.created_at));
            }
        }

        let records: Vec<ChannelRecord> = matches
            .into_iter()
            .take(options.limit as usize)
            .map(|channel| state.project_channel(channel, options.state, options.message_limit))
            .collect();
        if options.watch {
            for record in &records {
                state.watched.insert(record.id.clone());
            }
        }
        Ok(records)
    }

    async fn watch(&self, channel_id: &ChannelId) -> Result<ChannelRecord> {
        let mut state = self.state.lock().await;
        state.gate(BackendOp::Watch)?;
        state.gate_channel(channel_id)?;
        state.user()?;
        let record = state.project_channel(state.channel(channel_id)?, true, 100);
        state.watched.insert(channel_id.clone());
        Ok(record)
    }

    async fn query_messages(
        &self,
        channel_id: &ChannelId,
        limit: u32,
    ) -> Result<Vec<MessageRecord>> {
        let mut state = self.state.lock().await;
        state.gate(BackendOp::QueryMessages)?;
        state.gate_channel(channel_id)?;
        let record = state.channel(channel_id)?;
        Ok(state.project_channel(record, true, limit).messages)
    }

    async fn get_replies(
        &self,
        channel_id: &ChannelId,
        parent_id: &MessageId,
    ) -> Result<Vec<MessageRecord>> {
        let mut state = self.state.lock().await;
        state.gate(BackendOp::GetReplies)?;
        state.gate_channel(channel_id)?;
        let channel = state.channel(channel_id)?;
        let known = channel
            .messages
            .iter()
            .any(|message| &message.id == parent_id);
        if !known {
            return Err(not_found("message", parent_id));
        }
        Ok(channel
            .messages
            .iter()
            .filter(|message| message.parent_id.as_ref() == Some(parent_id))
            .map(|message| project_message(message, state.user_id()))
            .collect())
    }

    async fn send_reaction(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        kind: &str,
    ) -> Result<MessageRecord> {
        let mut state = self.state.lock().await;
        state.gate(BackendOp::SendReaction)?;
        let user_id = state.user()?.id.clone();
        let channel = state.channel_mut(channel_id)?;
        let (message, reaction) = add_reaction(channel, message_id, &user_id, kind)?;
        state.broadcast(ChannelEvent::ReactionNew {
            channel_id: channel_id.clone(),
            message: project_message(&message, None),
            reaction,
        });
        Ok(project_message(&message, Some(&user_id)))
    }

    async fn delete_reaction(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        kind: &str,
    ) -> Result<MessageRecord> {
        let mut state = self.state.lock().await;
        state.gate(BackendOp::DeleteReaction)?;
        let user_id = state.user()?.id.clone();
        let channel = state.channel_mut(channel_id)?;
        let (message, reaction) = remove_reaction(channel, message_id, &user_id, kind)?;
        state.broadcast(ChannelEvent::ReactionDeleted {
            channel_id: channel_id.clone(),
            message: project_message(&message, None),
            reaction,
        });
        Ok(project_message(&message, Some(&user_id)))
    }

    async fn mark_read(&self, channel_id: &ChannelId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.gate(BackendOp::MarkRead)?;
        let user_id = state.user()?.id.clone();
        let channel = state.channel_mut(channel_id)?;
        let now = Utc::now();
        let at = newest_message_time(channel)
            .map_or(now, |newest| newest.max(now));
        upsert_read(channel, &user_id, at);
        Ok(())
    }

    async fn send_message(
        &self,
        channel_id: &ChannelId,
        text: &str,
        parent_id: Option<&MessageId>,
    ) -> Result<MessageRecord> {
        let mut state = self.state.lock().await;
        state.gate(BackendOp::SendMessage)?;
        let user = state.user()?.clone();
        let channel = state.channel_mut(channel_id)?;
        if let Some(parent_id) = parent_id {
            let known = channel
                .messages
                .iter()
                .any(|message| &message.id == parent_id);
            if !known {
                return Err(anyhow!("cannot reply to unknown message {parent_id}"));
            }
        }
        let created_at = next_timestamp(channel);
        let mut message = MessageRecord::new(
            MessageId::new(Uuid::new_v4().to_string()),
            user.id.clone(),
            text,
            created_at,
        );
        message.user_name = Some(user.display_name.clone().unwrap_or(user.name.clone()));
        message.parent_id = parent_id.cloned();
        if message.parent_id.is_none() {
            channel.last_message_at = Some(created_at);
        }
        channel.messages.push(message.clone());
        state.broadcast(ChannelEvent::MessageNew {
            channel_id: channel_id.clone(),
            message: project_message(&message, None),
        });
        Ok(project_message(&message, Some(&user.id)))
    }

    async fn create_channel(&self, request: &CreateChannelRequest) -> Result<ChannelRecord> {
        let mut state = self.state.lock().await;
        state.gate(BackendOp::CreateChannel)?;
        let user_id = state.user()?.id.clone();
        if let Ok(existing) = state.channel(&request.id) {
            return Ok(state.project_channel(existing, true, 100));
        }

        let mut record = ChannelRecord::new(request.id.clone(), request.kind, Utc::now());
        record.name = request.name.clone();
        record.created_by = Some(user_id.clone());
        record.data = request.data.clone();
        record.members = request.members.clone();
        if !record.members.contains(&user_id) {
            record.members.push(user_id);
        }
        record.member_count = u32::try_from(record.members.len()).ok();
        state.channels.push(record.clone());
        Ok(record)
    }

    async fn subscribe(&self, channel_id: &ChannelId) -> Result<broadcast::Receiver<ChannelEvent>> {
        let mut state = self.state.lock().await;
        state.gate(BackendOp::Subscribe)?;
        state.channel(channel_id)?;
        let sender = state
            .senders
            .entry(channel_id.clone())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0);
        Ok(sender.subscribe())
    }
}
