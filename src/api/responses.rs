use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::*;

#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub store: bool,
    pub rpc_circuit: BreakerState,
    pub webhook_secret_configured: bool,
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StreamerProfileResponse {
    pub twitch_user_id: TwitchUserId,
    pub login: String,
    pub display_name: String,
    pub wallet_address: WalletAddress,
    pub profile_image_url: Option<String>,
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StreamerStatusResponse {
    pub connected: bool,
    pub wallet_address: Option<WalletAddress>,
    pub active_prediction: Option<PredictionData>,
    pub rpc_circuit: BreakerState,
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StreamerStatsResponse {
    pub channel_id: TwitchUserId,
    pub counts: HashMap<StatKind, i64>,
}
impl From<&StreamerSession> for StreamerProfileResponse {
    fn from(session: &StreamerSession) -> Self {
        Self {
            twitch_user_id: session.twitch_user_id.clone(),
            login: session.login.clone(),
            display_name: session.display_name.clone(),
            wallet_address: session.wallet_address.clone(),
            profile_image_url: session.profile_image_url.clone(),
        }
    }
}
