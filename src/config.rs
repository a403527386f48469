use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::ConfigError;

pub const ENV_PREFIX: &str = "BRIDGE";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub twitch: TwitchSettings,
    #[serde(default)]
    pub chain: ChainSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}
impl Settings {
    /// Reads the optional config file, then `BRIDGE__SECTION__KEY` environment
    /// variables on top of it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name("bridge").required(false)),
        };
        let settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .context("couldn't read configuration")?
            .try_deserialize::<Settings>()
            .context("couldn't deserialize configuration")?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: i64,
}
impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            cors_origin: default_cors_origin(),
            rate_limit_per_minute: default_rate_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TwitchSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub webhook_secret: Option<String>,
    /// Public URL of `/api/twitch/webhook`, registered with EventSub.
    pub callback_url: Option<String>,
    #[serde(default = "default_helix_url")]
    pub helix_url: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
}
impl Default for TwitchSettings {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            webhook_secret: None,
            callback_url: None,
            helix_url: default_helix_url(),
            auth_url: default_auth_url(),
        }
    }
}
impl TwitchSettings {
    pub fn webhook_secret(&self) -> Result<&str, ConfigError> {
        non_empty(&self.webhook_secret, "twitch.webhook_secret")
    }
    pub fn client_id(&self) -> Result<&str, ConfigError> {
        non_empty(&self.client_id, "twitch.client_id")
    }
    pub fn client_secret(&self) -> Result<&str, ConfigError> {
        non_empty(&self.client_secret, "twitch.client_secret")
    }
    pub fn callback_url(&self) -> Result<&str, ConfigError> {
        non_empty(&self.callback_url, "twitch.callback_url")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainSettings {
    pub rpc_url: Option<String>,
    pub contract_address: Option<String>,
    pub private_key: Option<String>,
    pub chain_id: Option<u64>,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
}
impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            rpc_url: None,
            contract_address: None,
            private_key: None,
            chain_id: None,
            rpc_timeout_secs: default_rpc_timeout(),
        }
    }
}
impl ChainSettings {
    pub fn rpc_url(&self) -> Result<&str, ConfigError> {
        non_empty(&self.rpc_url, "chain.rpc_url")
    }
    pub fn contract_address(&self) -> Result<&str, ConfigError> {
        non_empty(&self.contract_address, "chain.contract_address")
    }
    pub fn private_key(&self) -> Result<&str, ConfigError> {
        non_empty(&self.private_key, "chain.private_key")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_database_url")]
    pub database_url: String,
}
impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}
impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn non_empty<'a>(value: &'a Option<String>, key: &'static str) -> Result<&'a str, ConfigError> {
    match value.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8081
}
fn default_cors_origin() -> String {
    "*".to_string()
}
fn default_rate_limit() -> i64 {
    60
}
fn default_helix_url() -> String {
    "https://api.twitch.tv/helix".to_string()
}
fn default_auth_url() -> String {
    "https://id.twitch.tv/oauth2".to_string()
}
fn default_rpc_timeout() -> u64 {
    15
}
fn default_database_url() -> String {
    "sqlite://bridge.db?mode=rwc".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
