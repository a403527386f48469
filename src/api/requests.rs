use serde::{Deserialize, Serialize};

use super::*;

// Requests
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectStreamerRequest {
    pub code: String,
    pub redirect_uri: String,
    pub wallet_address: WalletAddress,
}
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettingsRequest {
    pub auto_create_markets: Option<bool>,
    pub market_duration_secs: Option<u32>,
}
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveMarketQuery {
    pub channel_id: Option<TwitchUserId>,
}
