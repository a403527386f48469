use crate::api::TwitchUserId;
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires.
    pub expires_in: i64,
    #[serde(default)]
    pub scope: Vec<String>,
}

/// Result of `/oauth2/validate` for a user access token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenInfo {
    pub client_id: String,
    pub login: String,
    pub user_id: TwitchUserId,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub expires_in: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TwitchUser {
    pub id: TwitchUserId,
    pub login: String,
    pub display_name: String,
    #[serde(default)]
    pub profile_image_url: Option<String>,
}

#[async_trait]
pub trait TwitchApi {
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<UserToken>;
    /// `None` when Twitch rejects the token.
    async fn validate_token(&self, access_token: &str) -> Result<Option<TokenInfo>>;
    async fn current_user(&self, access_token: &str) -> Result<TwitchUser>;
    async fn get_user(&self, user: &str) -> Result<Option<TwitchUser>>;
    /// Registers the begin/lock/end webhooks for the broadcaster. Existing
    /// subscriptions are not an error.
    async fn subscribe_predictions(&self, broadcaster: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct TestTwitchState {
    codes: HashMap<String, (UserToken, TwitchUser)>,
    tokens: HashMap<String, TwitchUser>,
    users: HashMap<TwitchUserId, TwitchUser>,
    subscriptions: Vec<TwitchUserId>,
    user_delay: Option<std::time::Duration>,
}

/// In-memory Twitch used by tests and `--test` mode.
#[derive(Debug, Default)]
pub struct TestTwitchApi {
    state: Arc<Mutex<TestTwitchState>>,
}
impl TestTwitchApi {
    pub fn add_user(&self, user: TwitchUser, access_token: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.tokens.insert(access_token.to_string(), user.clone());
        state.users.insert(user.id.clone(), user);
    }
    /// Makes `code` exchangeable for `access_token`, which must belong to a
    /// user added with `add_user`.
    pub fn add_code(&self, code: &str, access_token: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(user) = state.tokens.get(access_token).cloned() {
            let token = UserToken {
                access_token: access_token.to_string(),
                refresh_token: Some(format!("refresh-{}", access_token)),
                expires_in: 14_400,
                scope: vec![],
            };
            state.codes.insert(code.to_string(), (token, user));
        }
    }
    /// Delays every `get_user` lookup.
    pub fn set_user_delay(&self, delay: std::time::Duration) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).user_delay = Some(delay);
    }
    pub fn subscriptions(&self) -> Vec<TwitchUserId> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscriptions
            .clone()
    }
}
#[async_trait]
impl TwitchApi for TestTwitchApi {
    async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> Result<UserToken> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.codes.remove(code) {
            Some((token, _)) => Ok(token),
            None => bail!("400 Bad Request: Invalid authorization code"),
        }
    }
    async fn validate_token(&self, access_token: &str) -> Result<Option<TokenInfo>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.tokens.get(access_token).map(|user| TokenInfo {
            client_id: "test-client".to_string(),
            login: user.login.clone(),
            user_id: user.id.clone(),
            scopes: vec![],
            expires_in: 3600,
        }))
    }
    async fn current_user(&self, access_token: &str) -> Result<TwitchUser> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.tokens.get(access_token) {
            Some(user) => Ok(user.clone()),
            None => bail!("401 Unauthorized: Invalid OAuth token"),
        }
    }
    async fn get_user(&self, user: &str) -> Result<Option<TwitchUser>> {
        let delay = self.state.lock().unwrap_or_else(|e| e.into_inner()).user_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.users.get(user).cloned())
    }
    async fn subscribe_predictions(&self, broadcaster: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.subscriptions.iter().any(|b| b == broadcaster) {
            state.subscriptions.push(broadcaster.to_string());
        }
        Ok(())
    }
}
