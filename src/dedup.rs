use chrono::{DateTime, Duration, Utc};
use log::{trace, warn};

use crate::kv::{with_retry, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    New,
    Duplicate,
    Stale,
    FromFuture,
}

pub fn max_age() -> Duration {
    Duration::minutes(10)
}
pub fn max_clock_skew() -> Duration {
    Duration::minutes(1)
}
pub fn message_key(message_id: &str) -> String {
    format!("eventsub:msg:{}", message_id)
}

pub fn check_freshness(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> Option<DedupOutcome> {
    if timestamp < now - max_age() {
        Some(DedupOutcome::Stale)
    } else if timestamp > now + max_clock_skew() {
        Some(DedupOutcome::FromFuture)
    } else {
        None
    }
}

/// Rejects messages outside the freshness window and marks the rest as seen.
/// A failing store lets the message through rather than dropping the event.
pub async fn check_and_mark(
    store: &Store,
    message_id: &str,
    timestamp: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DedupOutcome {
    if let Some(outcome) = check_freshness(timestamp, now) {
        return outcome;
    }
    let key = message_key(message_id);
    let marker = now.timestamp_millis().to_string();
    match with_retry(&key, || store.set_nx(&key, &marker, Some(max_age()))).await {
        Ok(true) => DedupOutcome::New,
        Ok(false) => {
            trace!("Message {} was already processed", message_id);
            DedupOutcome::Duplicate
        }
        Err(e) => {
            warn!(
                "Dedup store unavailable for message {}, processing anyway: {:#}",
                message_id, e
            );
            DedupOutcome::New
        }
    }
}
