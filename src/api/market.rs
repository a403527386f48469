use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub type TwitchUserId = String;
pub type TwitchPredictionId = String;
/// On-chain market id, a decimal integer kept as a string.
pub type MarketId = String;
pub type WalletAddress = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PredictionState {
    Pending,
    Active,
    Locked,
    Resolved,
    Voided,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PredictionData {
    pub market_id: Option<MarketId>,
    pub twitch_prediction_id: TwitchPredictionId,
    pub channel_id: TwitchUserId,
    pub question: String,
    pub outcomes: Vec<String>,
    pub outcome_map: HashMap<String, u32>,
    /// Unix seconds.
    pub locks_at: i64,
    /// Unix milliseconds.
    pub created_at: i64,
    pub state: PredictionState,
    pub streamer_wallet: WalletAddress,
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub profile_image_url: Option<String>,
    #[serde(default)]
    pub winning_outcome: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamerSession {
    pub twitch_user_id: TwitchUserId,
    pub login: String,
    pub display_name: String,
    pub wallet_address: WalletAddress,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds.
    pub expires_at: i64,
    pub profile_image_url: Option<String>,
    /// Unix milliseconds.
    pub connected_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamerSettings {
    pub auto_create_markets: bool,
    /// Overrides the Twitch lock time when set.
    pub market_duration_secs: Option<u32>,
}
impl Default for StreamerSettings {
    fn default() -> Self {
        Self {
            auto_create_markets: true,
            market_duration_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub status: OperationStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Unix milliseconds.
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StatKind {
    Created,
    Locked,
    Resolved,
    Voided,
    Failed,
}
impl StatKind {
    pub const ALL: [StatKind; 5] = [
        StatKind::Created,
        StatKind::Locked,
        StatKind::Resolved,
        StatKind::Voided,
        StatKind::Failed,
    ];
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}
