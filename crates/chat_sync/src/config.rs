use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "chat_sync.toml";
const ENV_PREFIX: &str = "CHAT_SYNC__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub max_concurrent_requests: usize,
    pub max_retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_jitter: Duration,
    pub cache_ttl: Duration,
    /// Pause between the member, public and created-by discovery queries.
    pub discovery_phase_delay: Duration,
    pub channel_query_limit: u32,
    pub message_fallback_limit: u32,
    pub game_channel_prefix: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 3,
            max_retry_attempts: 5,
            retry_base_delay: Duration::from_millis(1000),
            retry_max_jitter: Duration::from_millis(1000),
            cache_ttl: Duration::from_secs(5 * 60),
            discovery_phase_delay: Duration::from_millis(250),
            channel_query_limit: 30,
            message_fallback_limit: 100,
            game_channel_prefix: "game-".into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    max_concurrent_requests: Option<usize>,
    max_retry_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_jitter_ms: Option<u64>,
    cache_ttl_secs: Option<u64>,
    discovery_phase_delay_ms: Option<u64>,
    channel_query_limit: Option<u32>,
    message_fallback_limit: Option<u32>,
    game_channel_prefix: Option<String>,
}

impl FileSettings {
    fn apply(self, settings: &mut SyncSettings) {
        if let Some(v) = self.max_concurrent_requests {
            settings.max_concurrent_requests = v;
        }
        if let Some(v) = self.max_retry_attempts {
            settings.max_retry_attempts = v;
        }
        if let Some(v) = self.retry_base_delay_ms {
            settings.retry_base_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.retry_max_jitter_ms {
            settings.retry_max_jitter = Duration::from_millis(v);
        }
        if let Some(v) = self.cache_ttl_secs {
            settings.cache_ttl = Duration::from_secs(v);
        }
        if let Some(v) = self.discovery_phase_delay_ms {
            settings.discovery_phase_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.channel_query_limit {
            settings.channel_query_limit = v;
        }
        if let Some(v) = self.message_fallback_limit {
            settings.message_fallback_limit = v;
        }
        if let Some(v) = self.game_channel_prefix {
            settings.game_channel_prefix = v;
        }
    }
}

/// Defaults, then `chat_sync.toml` in the working directory, then
/// `CHAT_SYNC__*` environment variables.
pub fn load_settings() -> SyncSettings {
    let mut settings = SyncSettings::default();
    let path = Path::new(DEFAULT_CONFIG_FILE);
    if path.exists() {
        if let Err(err) = apply_file(&mut settings, path) {
            warn!("config: ignoring {DEFAULT_CONFIG_FILE}: {err:#}");
        }
    }
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

/// Like [`load_settings`] but reads an explicit file, failing if it is unreadable.
pub fn load_settings_from(path: &Path) -> anyhow::Result<SyncSettings> {
    let mut settings = SyncSettings::default();
    apply_file(&mut settings, path)?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_file(settings: &mut SyncSettings, path: &Path) -> anyhow::Result<()> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    let file_cfg: FileSettings = toml::from_str(&raw)
        .with_context(|| format!("failed to parse settings file '{}'", path.display()))?;
    file_cfg.apply(settings);
    Ok(())
}

pub fn apply_env_overrides<F>(settings: &mut SyncSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| lookup(&format!("{ENV_PREFIX}{key}"));

    if let Some(v) = parse_var(&var, "MAX_CONCURRENT_REQUESTS") {
        settings.max_concurrent_requests = v;
    }
    if let Some(v) = parse_var(&var, "MAX_RETRY_ATTEMPTS") {
        settings.max_retry_attempts = v;
    }
    if let Some(v) = parse_var(&var, "RETRY_BASE_DELAY_MS") {
        settings.retry_base_delay = Duration::from_millis(v);
    }
    if let Some(v) = parse_var(&var, "RETRY_MAX_JITTER_MS") {
        settings.retry_max_jitter = Duration::from_millis(v);
    }
    if let Some(v) = parse_var(&var, "CACHE_TTL_SECS") {
        settings.cache_ttl = Duration::from_secs(v);
    }
    if let Some(v) = parse_var(&var, "DISCOVERY_PHASE_DELAY_MS") {
        settings.discovery_phase_delay = Duration::from_millis(v);
    }
    if let Some(v) = parse_var(&var, "CHANNEL_QUERY_LIMIT") {
        settings.channel_query_limit = v;
    }
    if let Some(v) = parse_var(&var, "MESSAGE_FALLBACK_LIMIT") {
        settings.message_fallback_limit = v;
    }
    if let Some(v) = var("GAME_CHANNEL_PREFIX") {
        settings.game_channel_prefix = v;
    }
}

fn parse_var<T, F>(var: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = var(key)?;
    match raw.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("config: ignoring malformed {ENV_PREFIX}{key}={raw}");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
