use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::*;
use crate::db::KeyValueStore;

pub type Store = Arc<dyn KeyValueStore + Send + Sync>;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 50;

pub fn prediction_ttl() -> Duration {
    Duration::hours(24)
}

pub fn prediction_key(prediction: &str) -> String {
    format!("prediction:{}", prediction)
}
pub fn profile_image_key(prediction: &str) -> String {
    format!("prediction:{}:image", prediction)
}
pub fn active_prediction_key(channel: &str) -> String {
    format!("channel:{}:active", channel)
}
pub fn streamer_key(user: &str) -> String {
    format!("streamer:{}", user)
}
pub fn settings_key(user: &str) -> String {
    format!("settings:{}", user)
}
pub fn stat_key(channel: &str, kind: StatKind) -> String {
    format!("stats:{}:{}", channel, kind)
}

/// Runs `op` up to three times with exponential backoff between attempts.
pub async fn with_retry<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = std::time::Duration::from_millis(RETRY_BASE_DELAY_MS);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < RETRY_ATTEMPTS => {
                warn!("{} failed on attempt {}: {:#}", what, attempt, e);
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e.context(format!("{} failed after {} attempts", what, attempt))),
        }
    }
}

/// Typed access to the records the bridge keeps in the key-value store.
#[derive(Clone)]
pub struct Kv {
    store: Store,
}
impl Kv {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
    pub fn store(&self) -> &Store {
        &self.store
    }
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw = with_retry(key, || self.store.get(key)).await?;
        match raw {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).with_context(|| format!("malformed record at {}", key))?,
            )),
            None => Ok(None),
        }
    }
    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        with_retry(key, || self.store.set(key, &raw, ttl)).await
    }
    pub async fn set_json_nx<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let raw = serde_json::to_string(value)?;
        with_retry(key, || self.store.set_nx(key, &raw, ttl)).await
    }
    pub async fn del(&self, key: &str) -> Result<bool> {
        with_retry(key, || self.store.del(key)).await
    }

    /// Loads a prediction record with its profile image merged in.
    pub async fn get_prediction(&self, prediction: &str) -> Result<Option<PredictionData>> {
        let Some(mut data) = self
            .get_json::<PredictionData>(&prediction_key(prediction))
            .await?
        else {
            return Ok(None);
        };
        let key = profile_image_key(prediction);
        if let Some(url) = with_retry(&key, || self.store.get(&key)).await? {
            data.profile_image_url = Some(url);
        }
        Ok(Some(data))
    }
    /// The image lives under its own key so that writing it never races
    /// with state transitions of the prediction record.
    pub async fn set_profile_image(&self, prediction: &str, url: &str) -> Result<()> {
        let key = profile_image_key(prediction);
        with_retry(&key, || self.store.set(&key, url, Some(prediction_ttl()))).await
    }
    pub async fn save_prediction(&self, data: &PredictionData) -> Result<()> {
        self.set_json(
            &prediction_key(&data.twitch_prediction_id),
            data,
            Some(prediction_ttl()),
        )
        .await
    }
    /// Stores the record only if no record exists yet for this prediction.
    pub async fn insert_prediction(&self, data: &PredictionData) -> Result<bool> {
        self.set_json_nx(
            &prediction_key(&data.twitch_prediction_id),
            data,
            Some(prediction_ttl()),
        )
        .await
    }
    /// Loads, mutates and stores a prediction record. Returns `None` when
    /// there is no record.
    pub async fn update_prediction<F>(
        &self,
        prediction: &str,
        update: F,
    ) -> Result<Option<PredictionData>>
    where
        F: FnOnce(&mut PredictionData),
    {
        let Some(mut data) = self.get_prediction(prediction).await? else {
            return Ok(None);
        };
        update(&mut data);
        self.save_prediction(&data).await?;
        Ok(Some(data))
    }

    pub async fn get_active_prediction_id(&self, channel: &str) -> Result<Option<String>> {
        let key = active_prediction_key(channel);
        with_retry(&key, || self.store.get(&key)).await
    }
    pub async fn set_active_prediction(&self, channel: &str, prediction: &str) -> Result<()> {
        let key = active_prediction_key(channel);
        with_retry(&key, || self.store.set(&key, prediction, Some(prediction_ttl()))).await
    }
    /// Only clears the pointer while it still points at `prediction`.
    pub async fn clear_active_prediction(&self, channel: &str, prediction: &str) -> Result<bool> {
        match self.get_active_prediction_id(channel).await? {
            Some(active) if active == prediction => {
                self.del(&active_prediction_key(channel)).await
            }
            Some(active) => {
                debug!(
                    "Channel {} now points at prediction {}, leaving it in place",
                    channel, active
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }
    pub async fn get_active_prediction(&self, channel: &str) -> Result<Option<PredictionData>> {
        match self.get_active_prediction_id(channel).await? {
            Some(prediction) => self.get_prediction(&prediction).await,
            None => Ok(None),
        }
    }

    pub async fn get_session(&self, user: &str) -> Result<Option<StreamerSession>> {
        self.get_json(&streamer_key(user)).await
    }
    pub async fn save_session(&self, session: &StreamerSession) -> Result<()> {
        self.set_json(&streamer_key(&session.twitch_user_id), session, None)
            .await
    }
    pub async fn get_settings(&self, user: &str) -> Result<StreamerSettings> {
        Ok(self
            .get_json(&settings_key(user))
            .await?
            .unwrap_or_default())
    }
    pub async fn save_settings(&self, user: &str, settings: &StreamerSettings) -> Result<()> {
        self.set_json(&settings_key(user), settings, None).await
    }

    pub async fn incr_stat(&self, channel: &str, kind: StatKind) -> Result<i64> {
        let key = stat_key(channel, kind);
        with_retry(&key, || self.store.incr(&key, None)).await
    }
    pub async fn get_stats(&self, channel: &str) -> Result<HashMap<StatKind, i64>> {
        let reads = StatKind::ALL.map(|kind| async move {
            let key = stat_key(channel, kind);
            let value = with_retry(&key, || self.store.get(&key)).await?;
            let count: i64 = match value {
                Some(value) => value
                    .parse()
                    .with_context(|| format!("{} holds non-integer value {}", key, value))?,
                None => 0,
            };
            Ok::<_, anyhow::Error>((kind, count))
        });
        futures_util::future::try_join_all(reads)
            .await
            .map(|counts| counts.into_iter().collect())
    }
}
