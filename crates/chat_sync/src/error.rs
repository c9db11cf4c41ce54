use shared::{domain::MessageId, error::ApiException};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("retries exhausted after {attempts} rate-limited attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("no chat user is connected")]
    NotConnected,
    #[error("no active channel selected")]
    NoActiveChannel,
    #[error("like toggle already in progress for message {0}")]
    LikeInFlight(MessageId),
    #[error("request throttler is closed")]
    ThrottlerClosed,
}

/// True when the backend asked us to slow down. A typed [`ApiException`]
/// decides on its own; message text is only consulted for untyped errors.
pub fn is_rate_limited(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(api) = cause.downcast_ref::<ApiException>() {
            return api.is_rate_limited();
        }
        if matches!(
            cause.downcast_ref::<SyncError>(),
            Some(SyncError::RetriesExhausted { .. })
        ) {
            return false;
        }
    }
    mentions_rate_limit(&format!("{err:#}"))
}

fn mentions_rate_limit(text: &str) -> bool {
    let text = text.to_ascii_lowercase();
    text.contains("rate limit")
        || text.contains("too many requests")
        || text
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| token == "429")
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<ApiException>()
            .is_some_and(ApiException::is_not_found)
    })
}
