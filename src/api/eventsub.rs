use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use super::*;

pub const HEADER_MESSAGE_ID: &str = "twitch-eventsub-message-id";
pub const HEADER_MESSAGE_TIMESTAMP: &str = "twitch-eventsub-message-timestamp";
pub const HEADER_MESSAGE_SIGNATURE: &str = "twitch-eventsub-message-signature";
pub const HEADER_MESSAGE_TYPE: &str = "twitch-eventsub-message-type";
pub const HEADER_SUBSCRIPTION_TYPE: &str = "twitch-eventsub-subscription-type";

pub const PREDICTION_BEGIN: &str = "channel.prediction.begin";
pub const PREDICTION_LOCK: &str = "channel.prediction.lock";
pub const PREDICTION_END: &str = "channel.prediction.end";
pub const PREDICTION_SUBSCRIPTIONS: [&str; 3] = [PREDICTION_BEGIN, PREDICTION_LOCK, PREDICTION_END];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSubMessageType {
    Notification,
    WebhookCallbackVerification,
    Revocation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub id: String,
    pub status: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    #[serde(default)]
    pub condition: serde_json::Value,
}

/// Body of every EventSub webhook delivery. `challenge` is only present on
/// verification messages and `event` only on notifications.
#[derive(Debug, Serialize, Deserialize)]
pub struct EventSubPayload {
    pub subscription: Subscription,
    #[serde(default)]
    pub challenge: Option<String>,
    #[serde(default)]
    pub event: Option<Box<RawValue>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionOutcome {
    pub id: String,
    pub title: String,
    pub color: String,
    #[serde(default)]
    pub users: Option<u64>,
    #[serde(default)]
    pub channel_points: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionBeginEvent {
    pub id: TwitchPredictionId,
    pub broadcaster_user_id: TwitchUserId,
    pub broadcaster_user_login: String,
    pub broadcaster_user_name: String,
    pub title: String,
    pub outcomes: Vec<PredictionOutcome>,
    pub started_at: DateTime<Utc>,
    pub locks_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionLockEvent {
    pub id: TwitchPredictionId,
    pub broadcaster_user_id: TwitchUserId,
    pub broadcaster_user_login: String,
    pub broadcaster_user_name: String,
    pub title: String,
    pub outcomes: Vec<PredictionOutcome>,
    pub started_at: DateTime<Utc>,
    pub locked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PredictionEndStatus {
    Resolved,
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionEndEvent {
    pub id: TwitchPredictionId,
    pub broadcaster_user_id: TwitchUserId,
    pub broadcaster_user_login: String,
    pub broadcaster_user_name: String,
    pub title: String,
    pub winning_outcome_id: Option<String>,
    pub outcomes: Vec<PredictionOutcome>,
    pub status: PredictionEndStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TwitchEvent {
    PredictionBegin(PredictionBeginEvent),
    PredictionLock(PredictionLockEvent),
    PredictionEnd(PredictionEndEvent),
}
impl TwitchEvent {
    /// Returns `Ok(None)` for subscription types this service does not handle.
    pub fn from_notification(kind: &str, event: &RawValue) -> Result<Option<Self>> {
        let event = match kind {
            PREDICTION_BEGIN => Self::PredictionBegin(
                serde_json::from_str(event.get()).context("malformed prediction.begin event")?,
            ),
            PREDICTION_LOCK => Self::PredictionLock(
                serde_json::from_str(event.get()).context("malformed prediction.lock event")?,
            ),
            PREDICTION_END => Self::PredictionEnd(
                serde_json::from_str(event.get()).context("malformed prediction.end event")?,
            ),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
    pub fn prediction_id(&self) -> &str {
        match self {
            Self::PredictionBegin(e) => &e.id,
            Self::PredictionLock(e) => &e.id,
            Self::PredictionEnd(e) => &e.id,
        }
    }
    pub fn broadcaster_id(&self) -> &str {
        match self {
            Self::PredictionBegin(e) => &e.broadcaster_user_id,
            Self::PredictionLock(e) => &e.broadcaster_user_id,
            Self::PredictionEnd(e) => &e.broadcaster_user_id,
        }
    }
    pub fn subscription_type(&self) -> &'static str {
        match self {
            Self::PredictionBegin(_) => PREDICTION_BEGIN,
            Self::PredictionLock(_) => PREDICTION_LOCK,
            Self::PredictionEnd(_) => PREDICTION_END,
        }
    }
}
