use anyhow::{bail, Result};
use reqwest::{Response, StatusCode};

use crate::api::*;

/// One EventSub delivery as Twitch would post it.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub message_id: String,
    pub message_type: EventSubMessageType,
    pub timestamp: String,
    pub signature: String,
    pub subscription_type: String,
    pub body: String,
}

pub struct Client {
    url: String,
    client: reqwest::Client,
}
impl Client {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::new();
        Self { url, client }
    }
    pub fn url(&self) -> &str {
        &self.url
    }
    pub async fn send_webhook(&self, delivery: &WebhookDelivery) -> Result<Response> {
        Ok(self
            .client
            .post(self.url.clone() + "/api/twitch/webhook")
            .header(HEADER_MESSAGE_ID, &delivery.message_id)
            .header(HEADER_MESSAGE_TYPE, delivery.message_type.to_string())
            .header(HEADER_MESSAGE_TIMESTAMP, &delivery.timestamp)
            .header(HEADER_MESSAGE_SIGNATURE, &delivery.signature)
            .header(HEADER_SUBSCRIPTION_TYPE, &delivery.subscription_type)
            .header("Content-Type", "application/json")
            .body(delivery.body.clone())
            .send()
            .await?)
    }
    pub async fn health(&self) -> Result<HealthResponse> {
        let response = self
            .client
            .get(self.url.clone() + "/api/health")
            .send()
            .await?;
        let response = bail_if_err(response, StatusCode::OK).await?;
        Ok(response.json().await?)
    }
    /// `None` when the channel has no active prediction.
    pub async fn active_market(&self, channel: &str) -> Result<Option<PredictionData>> {
        let response = self
            .client
            .get(self.url.clone() + "/api/markets/active")
            .query(&[("channelId", channel)])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = bail_if_err(response, StatusCode::OK).await?;
        Ok(Some(response.json().await?))
    }
    pub async fn connect_streamer(
        &self,
        request: ConnectStreamerRequest,
    ) -> Result<StreamerProfileResponse> {
        let response = self
            .client
            .post(self.url.clone() + "/api/streamer/connect")
            .json(&request)
            .send()
            .await?;
        let response = bail_if_err(response, StatusCode::OK).await?;
        Ok(response.json().await?)
    }
    pub async fn get_settings(&self, token: &str) -> Result<StreamerSettings> {
        let response = self
            .client
            .get(self.url.clone() + "/api/streamer/settings")
            .bearer_auth(token)
            .send()
            .await?;
        let response = bail_if_err(response, StatusCode::OK).await?;
        Ok(response.json().await?)
    }
    pub async fn update_settings(
        &self,
        token: &str,
        request: UpdateSettingsRequest,
    ) -> Result<StreamerSettings> {
        let response = self
            .client
            .post(self.url.clone() + "/api/streamer/settings")
            .bearer_auth(token)
            .json(&request)
            .send()
            .await?;
        let response = bail_if_err(response, StatusCode::OK).await?;
        Ok(response.json().await?)
    }
    pub async fn status(&self, token: &str) -> Result<StreamerStatusResponse> {
        let response = self
            .client
            .get(self.url.clone() + "/api/streamer/status")
            .bearer_auth(token)
            .send()
            .await?;
        let response = bail_if_err(response, StatusCode::OK).await?;
        Ok(response.json().await?)
    }
    pub async fn stats(&self, token: &str) -> Result<StreamerStatsResponse> {
        let response = self
            .client
            .get(self.url.clone() + "/api/streamer/stats")
            .bearer_auth(token)
            .send()
            .await?;
        let response = bail_if_err(response, StatusCode::OK).await?;
        Ok(response.json().await?)
    }
}

pub async fn bail_if_err(response: Response, expected: StatusCode) -> Result<Response> {
    if response.status() != expected {
        bail!("{}: {}", response.status(), response.text().await?)
    } else {
        Ok(response)
    }
}
