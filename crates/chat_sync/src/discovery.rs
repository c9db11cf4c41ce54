use std::{collections::HashSet, sync::Arc};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::{Map, Value};
use shared::{
    domain::{ChannelId, ChannelKind},
    protocol::{
        ChannelFilter, ChannelRecord, ChannelSort, ChatUser, GameData, LastMessageSummary,
        MessageRecord, QueryOptions, UserChannel,
    },
};
use tracing::{debug, info, warn};

use crate::{service::ChatSyncService, unread::compute_unread};

/// Merges discovery results by channel id. The first occurrence of an id
/// wins and insertion order is kept.
pub fn merge_channel_sets<I>(phases: I) -> Vec<ChannelRecord>
where
    I: IntoIterator<Item = Vec<ChannelRecord>>,
{
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for record in phases.into_iter().flatten() {
        if seen.insert(record.id.clone()) {
            merged.push(record);
        }
    }
    merged
}

pub fn is_game_channel(record: &ChannelRecord, prefix: &str) -> bool {
    (!prefix.is_empty() && record.id.as_str().starts_with(prefix))
        || record.data.contains_key("game_id")
        || record.data.contains_key("gameId")
        || record.data.get("game").is_some_and(Value::is_object)
}

fn string_field(data: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match data.get(*key)? {
        Value::String(value) if !value.is_empty() => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    })
}

fn time_field(data: &Map<String, Value>, keys: &[&str]) -> Option<DateTime<Utc>> {
    let raw = string_field(data, keys)?;
    DateTime::parse_from_rfc3339(&raw)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

const SCHEDULE_KEYS: &[&str] = &[
    "scheduled_at",
    "scheduled_time",
    "scheduledTime",
    "start_time",
];

/// Reads game metadata either from a nested `game` object or from top-level
/// channel data fields.
pub fn extract_game_data(record: &ChannelRecord) -> Option<GameData> {
    let (source, id_keys): (&Map<String, Value>, &[&str]) = match record.data.get("game") {
        Some(Value::Object(game)) => (game, &["game_id", "gameId", "id"][..]),
        _ => (&record.data, &["game_id", "gameId"][..]),
    };
    let game_id = string_field(source, id_keys)?;
    Some(GameData {
        game_id,
        home_team: string_field(source, &["home_team", "homeTeam"]),
        away_team: string_field(source, &["away_team", "awayTeam"]),
        home_team_logo: string_field(source, &["home_team_logo", "homeTeamLogo"]),
        away_team_logo: string_field(source, &["away_team_logo", "awayTeamLogo"]),
        scheduled_at: time_field(source, SCHEDULE_KEYS),
        status: string_field(source, &["status", "game_status"]),
    })
}

fn display_name(record: &ChannelRecord, game: Option<&GameData>) -> String {
    if let Some(name) = record.name.as_ref().filter(|name| !name.trim().is_empty()) {
        return name.clone();
    }
    if let Some(GameData {
        home_team: Some(home),
        away_team: Some(away),
        ..
    }) = game
    {
        return format!("{away} vs {home}");
    }
    record.id.to_string()
}

fn member_count(record: &ChannelRecord) -> u32 {
    let listed = u32::try_from(record.members.len()).ok();
    record
        .member_count
        .filter(|count| *count > 0)
        .or(listed.filter(|count| *count > 0))
        .unwrap_or(1)
}

fn latest_visible(messages: &[MessageRecord]) -> Option<&MessageRecord> {
    messages
        .iter()
        .filter(|message| !message.is_deleted() && message.parent_id.is_none())
        .max_by_key(|message| message.created_at)
}

impl ChatSyncService {
    async fn discovery_phase(
        &self,
        phase: &'static str,
        filter: ChannelFilter,
        sort: ChannelSort,
        options: QueryOptions,
    ) -> Vec<ChannelRecord> {
        match self
            .request(|| self.backend.query_channels(&filter, sort, &options))
            .await
        {
            Ok(records) => {
                debug!(
                    phase,
                    count = records.len(),
                    "sync: discovery phase finished"
                );
                records
            }
            Err(err) => {
                self.log_degraded(phase, None, &err);
                Vec::new()
            }
        }
    }

    async fn pause_between_phases(&self) {
        let delay = self.settings.discovery_phase_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Finds every channel the current user has posted in, newest activity
    /// first. Never fails: broken phases or channels are logged and skipped.
    pub async fn discover_channels(self: &Arc<Self>) -> Vec<UserChannel> {
        let Ok(user) = self.require_user().await else {
            warn!("sync: channel discovery requested without a connected user");
            return Vec::new();
        };
        let limit = self.settings.channel_query_limit;
        let message_limit = self.settings.message_fallback_limit;

        let member = self
            .discovery_phase(
                "member channel query",
                ChannelFilter::Member(user.id.clone()),
                ChannelSort::LastMessageAtDesc,
                QueryOptions {
                    watch: true,
                    state: true,
                    limit,
                    message_limit,
                },
            )
            .await;
        for record in &member {
            self.mark_watched(&record.id).await;
        }

        self.pause_between_phases().await;
        let prefix = self.settings.game_channel_prefix.as_str();
        let public: Vec<ChannelRecord> = self
            .discovery_phase(
                "public game channel query",
                ChannelFilter::Kind(ChannelKind::Public),
                ChannelSort::LastMessageAtDesc,
                QueryOptions {
                    watch: false,
                    state: true,
                    limit,
                    message_limit,
                },
            )
            .await
            .into_iter()
            .filter(|record| is_game_channel(record, prefix))
            .collect();

        self.pause_between_phases().await;
        let created = self
            .discovery_phase(
                "created channel query",
                ChannelFilter::CreatedBy(user.id.clone()),
                ChannelSort::CreatedAtDesc,
                QueryOptions {
                    watch: false,
                    state: true,
                    limit,
                    message_limit,
                },
            )
            .await;

        let merged = merge_channel_sets([member, public, created]);
        info!(candidates = merged.len(), "sync: merged discovery results");

        let builds = merged
            .into_iter()
            .map(|record| self.build_user_channel(record, &user));
        let results = join_all(builds).await;

        let mut channels: Vec<UserChannel> = results
            .into_iter()
            .filter_map(|(channel_id, result)| match result {
                Ok(channel) => channel,
                Err(err) => {
                    self.log_degraded("channel processing", Some(&channel_id), &err);
                    None
                }
            })
            .collect();
        channels.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        info!(
            channels = channels.len(),
            "sync: channel discovery complete"
        );
        channels
    }

    async fn build_user_channel(
        self: &Arc<Self>,
        record: ChannelRecord,
        user: &ChatUser,
    ) -> (ChannelId, Result<Option<UserChannel>>) {
        let channel_id = record.id.clone();
        let result = self.assemble_user_channel(record, user).await;
        (channel_id, result)
    }

    async fn assemble_user_channel(
        self: &Arc<Self>,
        record: ChannelRecord,
        user: &ChatUser,
    ) -> Result<Option<UserChannel>> {
        let channel_id = record.id.clone();
        let history = if record.messages.is_empty() {
            let limit = self.settings.message_fallback_limit;
            self.request(|| self.backend.query_messages(&channel_id, limit))
                .await
                .context("failed to load message history")?
        } else {
            record.messages.clone()
        };

        let mut authored: Vec<&MessageRecord> = history
            .iter()
            .filter(|message| message.user_id == user.id && !message.is_deleted())
            .collect();
        if authored.is_empty() {
            debug!(
                channel_id = %channel_id,
                "sync: skipping channel without own messages"
            );
            return Ok(None);
        }
        authored.sort_by_key(|message| message.created_at);
        let user_message_count = u32::try_from(authored.len()).unwrap_or(u32::MAX);
        let last_user_message = authored
            .last()
            .map(|message| LastMessageSummary::from(*message));

        let (record, messages) = if self.is_watched(&channel_id).await {
            (record, history)
        } else {
            let fresh = self
                .request(|| self.backend.watch(&channel_id))
                .await
                .context("failed to watch channel")?;
            self.mark_watched(&channel_id).await;
            let messages = if fresh.messages.is_empty() {
                history
            } else {
                fresh.messages.clone()
            };
            (fresh, messages)
        };
        if let Err(err) = self.attach(&channel_id).await {
            self.log_degraded("live event attach", Some(&channel_id), &err);
        }

        let last_read = record.last_read_for(&user.id);
        let unread_count = compute_unread(&messages, &user.id, last_read);
        let game_data = extract_game_data(&record);
        let last_message = latest_visible(&messages).map(LastMessageSummary::from);
        let last_activity = record
            .last_message_at
            .or_else(|| last_message.as_ref().map(|message| message.created_at))
            .unwrap_or(record.created_at);

        {
            let mut inner = self.inner.lock().await;
            inner.store_messages(&channel_id, messages);
            match last_read {
                Some(at) => {
                    inner.last_read.insert(channel_id.clone(), at);
                }
                None => {
                    inner.last_read.remove(&channel_id);
                }
            }
        }

        Ok(Some(UserChannel {
            name: display_name(&record, game_data.as_ref()),
            id: channel_id,
            kind: record.kind,
            last_message,
            unread_count,
            member_count: member_count(&record),
            game_data,
            last_activity,
            user_message_count,
            last_user_message,
        }))
    }
}

#[cfg(test)]
#[path = "tests/discovery_tests.rs"]
mod tests;
