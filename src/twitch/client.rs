use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::api::PREDICTION_SUBSCRIPTIONS;
use crate::client::bail_if_err;
use crate::config::TwitchSettings;
use crate::twitch_api::{TokenInfo, TwitchApi, TwitchUser, UserToken};

/// Renew the app token this long before Twitch says it expires.
const APP_TOKEN_MARGIN: Duration = Duration::from_secs(60);

pub struct HelixClient {
    client: Client,
    settings: TwitchSettings,
    app_token: Mutex<Option<(String, Instant)>>,
}

impl HelixClient {
    pub fn new(settings: TwitchSettings) -> Self {
        Self {
            client: Client::new(),
            settings,
            app_token: Mutex::new(None),
        }
    }
    fn helix(&self, method: reqwest::Method, path: &str, token: &str) -> Result<RequestBuilder> {
        Ok(self
            .client
            .request(method, self.settings.helix_url.clone() + path)
            .header("Client-Id", self.settings.client_id()?)
            .bearer_auth(token))
    }
    async fn app_token(&self) -> Result<String> {
        let mut cached = self.app_token.lock().await;
        if let Some((token, expires)) = cached.as_ref() {
            if Instant::now() + APP_TOKEN_MARGIN < *expires {
                return Ok(token.clone());
            }
        }
        let request = ClientCredentialsRequest {
            client_id: self.settings.client_id()?,
            client_secret: self.settings.client_secret()?,
            grant_type: "client_credentials",
        };
        let response = self
            .client
            .post(self.settings.auth_url.clone() + "/token")
            .form(&request)
            .send()
            .await?;
        let token = bail_if_err(response, StatusCode::OK)
            .await
            .context("couldn't get app access token")?
            .json::<AppToken>()
            .await?;
        debug!("Fetched app access token valid for {}s", token.expires_in);
        let expires = Instant::now() + Duration::from_secs(token.expires_in);
        *cached = Some((token.access_token.clone(), expires));
        Ok(token.access_token)
    }
    async fn users(&self, request: RequestBuilder) -> Result<Vec<TwitchUser>> {
        let response = bail_if_err(request.send().await?, StatusCode::OK).await?;
        Ok(response.json::<HelixData<TwitchUser>>().await?.data)
    }
    async fn subscribe(&self, kind: &str, broadcaster: &str, token: &str) -> Result<()> {
        let request = CreateSubscriptionRequest {
            kind,
            version: "1",
            condition: Condition {
                broadcaster_user_id: broadcaster,
            },
            transport: Transport {
                method: "webhook",
                callback: self.settings.callback_url()?,
                secret: self.settings.webhook_secret()?,
            },
        };
        let response: Response = self
            .helix(reqwest::Method::POST, "/eventsub/subscriptions", token)?
            .json(&request)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            debug!("{} for {} already subscribed", kind, broadcaster);
            return Ok(());
        }
        bail_if_err(response, StatusCode::ACCEPTED)
            .await
            .with_context(|| format!("couldn't subscribe to {} for {}", kind, broadcaster))?;
        info!("Subscribed to {} for {}", kind, broadcaster);
        Ok(())
    }
}

#[async_trait]
impl TwitchApi for HelixClient {
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<UserToken> {
        let request = AuthorizationCodeRequest {
            client_id: self.settings.client_id()?,
            client_secret: self.settings.client_secret()?,
            code,
            grant_type: "authorization_code",
            redirect_uri,
        };
        let response = self
            .client
            .post(self.settings.auth_url.clone() + "/token")
            .form(&request)
            .send()
            .await?;
        let token = bail_if_err(response, StatusCode::OK)
            .await
            .context("couldn't exchange authorization code")?
            .json::<UserToken>()
            .await?;
        Ok(token)
    }
    async fn validate_token(&self, access_token: &str) -> Result<Option<TokenInfo>> {
        let response = self
            .client
            .get(self.settings.auth_url.clone() + "/validate")
            .header("Authorization", format!("OAuth {}", access_token))
            .send()
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let info = bail_if_err(response, StatusCode::OK)
            .await?
            .json::<TokenInfo>()
            .await?;
        Ok(Some(info))
    }
    async fn current_user(&self, access_token: &str) -> Result<TwitchUser> {
        let request = self.helix(reqwest::Method::GET, "/users", access_token)?;
        self.users(request)
            .await?
            .into_iter()
            .next()
            .context("Twitch returned no user for the access token")
    }
    async fn get_user(&self, user: &str) -> Result<Option<TwitchUser>> {
        let token = self.app_token().await?;
        let request = self
            .helix(reqwest::Method::GET, "/users", &token)?
            .query(&[("id", user)]);
        Ok(self.users(request).await?.into_iter().next())
    }
    async fn subscribe_predictions(&self, broadcaster: &str) -> Result<()> {
        let token = self.app_token().await?;
        for kind in PREDICTION_SUBSCRIPTIONS {
            self.subscribe(kind, broadcaster, &token).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ClientCredentialsRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'a str,
}
#[derive(Debug, Serialize)]
struct AuthorizationCodeRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    code: &'a str,
    grant_type: &'a str,
    redirect_uri: &'a str,
}
#[derive(Debug, Deserialize)]
struct AppToken {
    access_token: String,
    expires_in: u64,
}
#[derive(Debug, Deserialize)]
struct HelixData<T> {
    data: Vec<T>,
}
#[derive(Debug, Serialize)]
struct CreateSubscriptionRequest<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    version: &'a str,
    condition: Condition<'a>,
    transport: Transport<'a>,
}
#[derive(Debug, Serialize)]
struct Condition<'a> {
    broadcaster_user_id: &'a str,
}
#[derive(Debug, Serialize)]
struct Transport<'a> {
    method: &'a str,
    callback: &'a str,
    secret: &'a str,
}
