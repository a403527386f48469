use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};

use crate::api::*;
use crate::contract::CreateMarketParams;
use crate::idempotency::{create_market_once, is_unconfirmed, IdempotentOutcome};
use crate::kv::Kv;
use crate::market_service::{MarketService, WriteOutcome};
use crate::twitch_api::TwitchApi;

pub type Twitch = Arc<dyn TwitchApi + Send + Sync>;

/// Drives the on-chain market through the lifecycle of a Twitch prediction.
pub struct Bridge {
    kv: Kv,
    markets: Arc<MarketService>,
    twitch: Twitch,
}

impl Bridge {
    pub fn new(kv: Kv, markets: Arc<MarketService>, twitch: Twitch) -> Self {
        Self {
            kv,
            markets,
            twitch,
        }
    }
    pub fn kv(&self) -> &Kv {
        &self.kv
    }
    pub fn markets(&self) -> &MarketService {
        &self.markets
    }
    pub fn twitch(&self) -> &Twitch {
        &self.twitch
    }

    /// Contract failures are logged and stored on the prediction record.
    /// Only key-value store failures are returned.
    pub async fn handle_event(&self, event: TwitchEvent) -> Result<()> {
        debug!(
            "Handling {} for prediction {} on channel {}",
            event.subscription_type(),
            event.prediction_id(),
            event.broadcaster_id()
        );
        match event {
            TwitchEvent::PredictionBegin(event) => self.prediction_begin(event).await,
            TwitchEvent::PredictionLock(event) => self.prediction_lock(event).await,
            TwitchEvent::PredictionEnd(event) => self.prediction_end(event).await,
        }
    }

    pub async fn stats(&self, channel: &str) -> Result<HashMap<StatKind, i64>> {
        self.kv.get_stats(channel).await
    }

    async fn prediction_begin(&self, event: PredictionBeginEvent) -> Result<()> {
        let channel = &event.broadcaster_user_id;
        let Some(session) = self.kv.get_session(channel).await? else {
            info!(
                "No streamer connected for channel {}, ignoring prediction {}",
                channel, event.id
            );
            return Ok(());
        };
        let settings = self.kv.get_settings(channel).await?;
        if !settings.auto_create_markets {
            info!(
                "Market creation disabled for channel {}, ignoring prediction {}",
                channel, event.id
            );
            return Ok(());
        }
        let locks_at = match settings.market_duration_secs {
            Some(secs) => event.started_at.timestamp() + i64::from(secs),
            None => event.locks_at.timestamp(),
        };
        let data = PredictionData {
            market_id: None,
            twitch_prediction_id: event.id.clone(),
            channel_id: channel.clone(),
            question: event.title.clone(),
            outcomes: event.outcomes.iter().map(|o| o.title.clone()).collect(),
            outcome_map: event
                .outcomes
                .iter()
                .zip(0u32..)
                .map(|(o, index)| (o.id.clone(), index))
                .collect(),
            locks_at,
            created_at: now_millis(),
            state: PredictionState::Pending,
            streamer_wallet: session.wallet_address.clone(),
            tx_hash: None,
            error: None,
            profile_image_url: session.profile_image_url.clone(),
            winning_outcome: None,
        };
        if !self.kv.insert_prediction(&data).await? {
            debug!("Prediction {} already recorded", event.id);
        }
        match self.kv.get_active_prediction_id(channel).await? {
            Some(active) if active != event.id => warn!(
                "Channel {} still points at prediction {}, replacing it with {}",
                channel, active, event.id
            ),
            _ => {}
        }
        self.kv.set_active_prediction(channel, &event.id).await?;

        let params = CreateMarketParams {
            twitch_prediction_id: data.twitch_prediction_id.clone(),
            question: data.question.clone(),
            outcomes: data.outcomes.clone(),
            lock_time: data.locks_at,
            streamer: data.streamer_wallet.clone(),
        };
        let markets = &self.markets;
        let outcome = create_market_once(&self.kv, &event.id, || async {
            markets
                .create_market(&params)
                .await
                .map_err(anyhow::Error::from)
        })
        .await;
        match outcome {
            Ok(IdempotentOutcome::Executed(created)) => {
                self.kv
                    .update_prediction(&event.id, |p| {
                        p.state = PredictionState::Active;
                        p.market_id = Some(created.market_id.clone());
                        p.tx_hash = Some(created.tx_hash.clone());
                        p.error = None;
                    })
                    .await?;
                self.count(channel, StatKind::Created).await;
                self.spawn_profile_image_fetch(channel.clone(), event.id.clone());
            }
            Ok(IdempotentOutcome::AlreadyDone(market_id)) => {
                debug!("Prediction {} already has market {}", event.id, market_id);
                self.kv
                    .update_prediction(&event.id, |p| {
                        if p.market_id.is_none() {
                            p.market_id = Some(market_id);
                            p.state = PredictionState::Active;
                        }
                    })
                    .await?;
            }
            Ok(IdempotentOutcome::InProgress) => {
                info!("Market for prediction {} is being created elsewhere", event.id);
            }
            Err(e) if is_unconfirmed(&e) => {
                warn!(
                    "Market for prediction {} may exist without a receipt: {:#}",
                    event.id, e
                );
                self.record_error(&event.id, format!("{:#}", e)).await?;
            }
            Err(e) => {
                error!("Couldn't create market for prediction {}: {:#}", event.id, e);
                self.kv
                    .update_prediction(&event.id, |p| {
                        p.state = PredictionState::Failed;
                        p.error = Some(format!("{:#}", e));
                    })
                    .await?;
                self.count(channel, StatKind::Failed).await;
            }
        }
        Ok(())
    }

    async fn prediction_lock(&self, event: PredictionLockEvent) -> Result<()> {
        let Some(data) = self.kv.get_prediction(&event.id).await? else {
            debug!("Unknown prediction {} locked, ignoring", event.id);
            return Ok(());
        };
        let Some(market_id) = data.market_id else {
            if data.state.is_open() {
                self.kv
                    .update_prediction(&event.id, |p| p.state = PredictionState::Locked)
                    .await?;
            }
            return Ok(());
        };
        match self.markets.lock_market(&market_id).await {
            Ok(outcome) => {
                self.kv
                    .update_prediction(&event.id, |p| {
                        p.state = PredictionState::Locked;
                        p.error = None;
                        if let WriteOutcome::Submitted { tx_hash } = &outcome {
                            p.tx_hash = Some(tx_hash.clone());
                        }
                    })
                    .await?;
                if let WriteOutcome::Submitted { .. } = outcome {
                    self.count(&data.channel_id, StatKind::Locked).await;
                }
            }
            Err(e) => {
                error!("Couldn't lock market {} for {}: {}", market_id, event.id, e);
                self.record_error(&event.id, e.to_string()).await?;
            }
        }
        Ok(())
    }

    async fn prediction_end(&self, event: PredictionEndEvent) -> Result<()> {
        let Some(data) = self.kv.get_prediction(&event.id).await? else {
            debug!("Unknown prediction {} ended, ignoring", event.id);
            return Ok(());
        };
        let winner = match (event.status, &event.winning_outcome_id) {
            (PredictionEndStatus::Resolved, Some(outcome)) => {
                let index = data.outcome_map.get(outcome).copied();
                if index.is_none() {
                    warn!(
                        "Winning outcome {} of prediction {} is unknown, voiding instead",
                        outcome, event.id
                    );
                }
                index
            }
            _ => None,
        };
        let (state, stat) = match winner {
            Some(_) => (PredictionState::Resolved, StatKind::Resolved),
            None => (PredictionState::Voided, StatKind::Voided),
        };
        // the prediction is over on Twitch whatever happens on chain
        self.kv
            .clear_active_prediction(&data.channel_id, &event.id)
            .await?;

        let Some(market_id) = data.market_id else {
            self.kv
                .update_prediction(&event.id, |p| {
                    p.state = state;
                    p.winning_outcome = winner;
                })
                .await?;
            return Ok(());
        };
        let result = match winner {
            Some(index) => self.markets.resolve_market(&market_id, index).await,
            None => self.markets.void_market(&market_id).await,
        };
        match result {
            Ok(outcome) => {
                self.kv
                    .update_prediction(&event.id, |p| {
                        p.state = state;
                        p.winning_outcome = winner;
                        p.error = None;
                        if let WriteOutcome::Submitted { tx_hash } = &outcome {
                            p.tx_hash = Some(tx_hash.clone());
                        }
                    })
                    .await?;
                if let WriteOutcome::Submitted { .. } = outcome {
                    self.count(&data.channel_id, stat).await;
                }
            }
            Err(e) => {
                error!(
                    "Couldn't finish market {} for {} as {}: {}",
                    market_id, event.id, state, e
                );
                self.record_error(&event.id, e.to_string()).await?;
            }
        }
        Ok(())
    }

    async fn record_error(&self, prediction: &str, error: String) -> Result<()> {
        self.kv
            .update_prediction(prediction, |p| p.error = Some(error))
            .await?;
        Ok(())
    }

    async fn count(&self, channel: &str, kind: StatKind) {
        if let Err(e) = self.kv.incr_stat(channel, kind).await {
            warn!("Couldn't count {} for channel {}: {:#}", kind, channel, e);
        }
    }

    fn spawn_profile_image_fetch(&self, channel: TwitchUserId, prediction: TwitchPredictionId) {
        let kv = self.kv.clone();
        let twitch = self.twitch.clone();
        tokio::spawn(async move {
            if let Err(e) = store_profile_image(&kv, &twitch, &channel, &prediction).await {
                warn!(
                    "Couldn't store profile image for prediction {}: {:#}",
                    prediction, e
                );
            }
        });
    }
}

async fn store_profile_image(
    kv: &Kv,
    twitch: &Twitch,
    channel: &str,
    prediction: &str,
) -> Result<()> {
    let user = twitch
        .get_user(channel)
        .await?
        .with_context(|| format!("Twitch has no user {}", channel))?;
    let Some(url) = user.profile_image_url else {
        return Ok(());
    };
    kv.set_profile_image(prediction, &url).await
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::contract::TestMarketContract;
    use crate::kv::test::test_kv;
    use crate::twitch_api::{TestTwitchApi, TwitchUser};
    use chrono::{Duration, Utc};
    use std::time::Duration as StdDuration;

    pub(crate) const CHANNEL: &str = "1337";
    pub(crate) const WALLET: &str = "0x00000000000000000000000000000000000000aa";

    pub(crate) struct Harness {
        pub bridge: Arc<Bridge>,
        pub contract: Arc<TestMarketContract>,
        pub twitch: Arc<TestTwitchApi>,
    }

    pub(crate) fn streamer() -> TwitchUser {
        TwitchUser {
            id: CHANNEL.to_string(),
            login: "streamer".to_string(),
            display_name: "Streamer".to_string(),
            profile_image_url: Some("https://static-cdn.jtvnw.net/streamer.png".to_string()),
        }
    }

    pub(crate) fn session() -> StreamerSession {
        StreamerSession {
            twitch_user_id: CHANNEL.to_string(),
            login: "streamer".to_string(),
            display_name: "Streamer".to_string(),
            wallet_address: WALLET.to_string(),
            access_token: "user-token".to_string(),
            refresh_token: None,
            expires_at: Utc::now().timestamp() + 3600,
            profile_image_url: None,
            connected_at: now_millis(),
        }
    }

    pub(crate) async fn harness(connected: bool) -> Harness {
        let kv = test_kv().await;
        if connected {
            kv.save_session(&session()).await.unwrap();
        }
        let contract = Arc::new(TestMarketContract::default());
        let twitch = Arc::new(TestTwitchApi::default());
        twitch.add_user(streamer(), "user-token");
        let bridge = Bridge::new(
            kv,
            Arc::new(MarketService::new(contract.clone())),
            twitch.clone(),
        );
        Harness {
            bridge: Arc::new(bridge),
            contract,
            twitch,
        }
    }

    fn outcomes() -> Vec<PredictionOutcome> {
        ["Yes", "No"]
            .iter()
            .zip(["o1", "o2"])
            .map(|(title, id)| PredictionOutcome {
                id: id.to_string(),
                title: title.to_string(),
                color: "blue".to_string(),
                users: None,
                channel_points: None,
            })
            .collect()
    }

    pub(crate) fn begin(id: &str) -> PredictionBeginEvent {
        let now = Utc::now();
        PredictionBeginEvent {
            id: id.to_string(),
            broadcaster_user_id: CHANNEL.to_string(),
            broadcaster_user_login: "streamer".to_string(),
            broadcaster_user_name: "Streamer".to_string(),
            title: "Will the boss die first try?".to_string(),
            outcomes: outcomes(),
            started_at: now,
            locks_at: now + Duration::minutes(5),
        }
    }
    pub(crate) fn lock(id: &str) -> PredictionLockEvent {
        let now = Utc::now();
        PredictionLockEvent {
            id: id.to_string(),
            broadcaster_user_id: CHANNEL.to_string(),
            broadcaster_user_login: "streamer".to_string(),
            broadcaster_user_name: "Streamer".to_string(),
            title: "Will the boss die first try?".to_string(),
            outcomes: outcomes(),
            started_at: now - Duration::minutes(5),
            locked_at: now,
        }
    }
    pub(crate) fn end(id: &str, winner: Option<&str>) -> PredictionEndEvent {
        let now = Utc::now();
        PredictionEndEvent {
            id: id.to_string(),
            broadcaster_user_id: CHANNEL.to_string(),
            broadcaster_user_login: "streamer".to_string(),
            broadcaster_user_name: "Streamer".to_string(),
            title: "Will the boss die first try?".to_string(),
            winning_outcome_id: winner.map(str::to_string),
            outcomes: outcomes(),
            status: if winner.is_some() {
                PredictionEndStatus::Resolved
            } else {
                PredictionEndStatus::Canceled
            },
            started_at: now - Duration::minutes(10),
            ended_at: now,
        }
    }

    #[tokio::test]
    async fn prediction_lifecycle() {
        let h = harness(true).await;
        let kv = h.bridge.kv().clone();
        h.contract.set_write_delay(StdDuration::from_millis(100));

        let bridge = h.bridge.clone();
        let begin_task =
            tokio::spawn(async move { bridge.handle_event(TwitchEvent::PredictionBegin(begin("p1"))).await });
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        let pending = kv.get_prediction("p1").await.unwrap().unwrap();
        assert_eq!(pending.state, PredictionState::Pending);
        assert_eq!(pending.market_id, None);
        begin_task.await.unwrap().unwrap();

        let active = kv.get_prediction("p1").await.unwrap().unwrap();
        assert_eq!(active.state, PredictionState::Active);
        let market_id = active.market_id.clone().unwrap();
        assert!(active.tx_hash.is_some());
        assert_eq!(active.outcome_map["o2"], 1);
        assert_eq!(
            kv.get_active_prediction_id(CHANNEL).await.unwrap(),
            Some("p1".to_string())
        );

        h.bridge
            .handle_event(TwitchEvent::PredictionLock(lock("p1")))
            .await
            .unwrap();
        assert_eq!(
            kv.get_prediction("p1").await.unwrap().unwrap().state,
            PredictionState::Locked
        );

        h.bridge
            .handle_event(TwitchEvent::PredictionEnd(end("p1", Some("o2"))))
            .await
            .unwrap();
        let resolved = kv.get_prediction("p1").await.unwrap().unwrap();
        assert_eq!(resolved.state, PredictionState::Resolved);
        assert_eq!(resolved.winning_outcome, Some(1));
        assert_eq!(kv.get_active_prediction_id(CHANNEL).await.unwrap(), None);
        assert_eq!(h.contract.market(&market_id).unwrap().outcome, Some(1));

        let stats = h.bridge.stats(CHANNEL).await.unwrap();
        assert_eq!(stats[&StatKind::Created], 1);
        assert_eq!(stats[&StatKind::Locked], 1);
        assert_eq!(stats[&StatKind::Resolved], 1);
    }

    #[tokio::test]
    async fn concurrent_begins_create_one_market() {
        let h = harness(true).await;
        h.contract.set_write_delay(StdDuration::from_millis(50));
        let (a, b) = tokio::join!(
            h.bridge.handle_event(TwitchEvent::PredictionBegin(begin("p1"))),
            h.bridge.handle_event(TwitchEvent::PredictionBegin(begin("p1")))
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(h.contract.market_count(), 1);
        assert_eq!(h.contract.writes(), 1);
        let data = h.bridge.kv().get_prediction("p1").await.unwrap().unwrap();
        assert_eq!(data.state, PredictionState::Active);
    }

    #[tokio::test]
    async fn cancelled_prediction_voids_the_market() {
        let h = harness(true).await;
        h.bridge
            .handle_event(TwitchEvent::PredictionBegin(begin("p1")))
            .await
            .unwrap();
        h.bridge
            .handle_event(TwitchEvent::PredictionEnd(end("p1", None)))
            .await
            .unwrap();
        let data = h.bridge.kv().get_prediction("p1").await.unwrap().unwrap();
        assert_eq!(data.state, PredictionState::Voided);
        assert_eq!(data.winning_outcome, None);
        let market = h.contract.market(&data.market_id.unwrap()).unwrap();
        assert_eq!(market.state, crate::contract::OnChainState::Voided);
        assert_eq!(h.bridge.stats(CHANNEL).await.unwrap()[&StatKind::Voided], 1);
    }

    #[tokio::test]
    async fn unconnected_or_disabled_channels_are_skipped() {
        let h = harness(false).await;
        h.bridge
            .handle_event(TwitchEvent::PredictionBegin(begin("p1")))
            .await
            .unwrap();
        assert!(h.bridge.kv().get_prediction("p1").await.unwrap().is_none());

        let h = harness(true).await;
        let settings = StreamerSettings {
            auto_create_markets: false,
            market_duration_secs: None,
        };
        h.bridge.kv().save_settings(CHANNEL, &settings).await.unwrap();
        h.bridge
            .handle_event(TwitchEvent::PredictionBegin(begin("p1")))
            .await
            .unwrap();
        assert!(h.bridge.kv().get_prediction("p1").await.unwrap().is_none());
        assert_eq!(h.contract.writes(), 0);
    }

    #[tokio::test]
    async fn lost_receipt_blocks_a_second_market() {
        let h = harness(true).await;
        h.contract.lose_next_create_receipt();
        h.bridge
            .handle_event(TwitchEvent::PredictionBegin(begin("p1")))
            .await
            .unwrap();
        let data = h.bridge.kv().get_prediction("p1").await.unwrap().unwrap();
        assert_eq!(data.state, PredictionState::Pending);
        assert!(data.error.unwrap().contains("unconfirmed"));

        h.bridge
            .handle_event(TwitchEvent::PredictionBegin(begin("p1")))
            .await
            .unwrap();
        assert_eq!(h.contract.market_count(), 1);
        assert_eq!(h.contract.writes(), 1);
        assert_eq!(h.bridge.stats(CHANNEL).await.unwrap()[&StatKind::Failed], 0);
    }

    #[tokio::test]
    async fn failed_creation_is_recorded() {
        let h = harness(true).await;
        h.contract.revert_next_write();
        h.bridge
            .handle_event(TwitchEvent::PredictionBegin(begin("p1")))
            .await
            .unwrap();
        let data = h.bridge.kv().get_prediction("p1").await.unwrap().unwrap();
        assert_eq!(data.state, PredictionState::Failed);
        assert!(data.error.unwrap().contains("reverted"));
        assert_eq!(h.bridge.stats(CHANNEL).await.unwrap()[&StatKind::Failed], 1);

        // a lock for a prediction without market leaves the failure in place
        h.bridge
            .handle_event(TwitchEvent::PredictionLock(lock("p1")))
            .await
            .unwrap();
        let data = h.bridge.kv().get_prediction("p1").await.unwrap().unwrap();
        assert_eq!(data.state, PredictionState::Failed);
    }

    #[tokio::test]
    async fn market_duration_override_sets_lock_time() {
        let h = harness(true).await;
        let settings = StreamerSettings {
            auto_create_markets: true,
            market_duration_secs: Some(90),
        };
        h.bridge.kv().save_settings(CHANNEL, &settings).await.unwrap();
        let event = begin("p1");
        let started = event.started_at.timestamp();
        h.bridge
            .handle_event(TwitchEvent::PredictionBegin(event))
            .await
            .unwrap();
        let data = h.bridge.kv().get_prediction("p1").await.unwrap().unwrap();
        assert_eq!(data.locks_at, started + 90);
        let market = h.contract.market(&data.market_id.unwrap()).unwrap();
        assert_eq!(market.params.lock_time, started + 90);
        assert_eq!(market.params.streamer, WALLET);
    }

    #[tokio::test]
    async fn new_prediction_replaces_active_pointer() {
        let h = harness(true).await;
        for id in ["p1", "p2"] {
            h.bridge
                .handle_event(TwitchEvent::PredictionBegin(begin(id)))
                .await
                .unwrap();
        }
        let kv = h.bridge.kv();
        assert_eq!(
            kv.get_active_prediction_id(CHANNEL).await.unwrap(),
            Some("p2".to_string())
        );
        // ending the older prediction leaves the newer pointer alone
        h.bridge
            .handle_event(TwitchEvent::PredictionEnd(end("p1", Some("o1"))))
            .await
            .unwrap();
        assert_eq!(
            kv.get_active_prediction_id(CHANNEL).await.unwrap(),
            Some("p2".to_string())
        );
    }

    #[tokio::test]
    async fn profile_image_is_stored_in_the_background() {
        let h = harness(true).await;
        h.bridge
            .handle_event(TwitchEvent::PredictionBegin(begin("p1")))
            .await
            .unwrap();
        let mut image = None;
        for _ in 0..50 {
            let data = h.bridge.kv().get_prediction("p1").await.unwrap().unwrap();
            if data.profile_image_url.is_some() {
                image = data.profile_image_url;
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        assert_eq!(image, streamer().profile_image_url);
        assert!(h.twitch.subscriptions().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_profile_image_never_reverts_later_transitions() {
        for _ in 0..20 {
            let h = harness(true).await;
            h.twitch.set_user_delay(StdDuration::from_millis(10));
            h.bridge
                .handle_event(TwitchEvent::PredictionBegin(begin("p1")))
                .await
                .unwrap();
            tokio::time::sleep(StdDuration::from_millis(9)).await;
            h.bridge
                .handle_event(TwitchEvent::PredictionLock(lock("p1")))
                .await
                .unwrap();
            tokio::time::sleep(StdDuration::from_millis(30)).await;
            let data = h.bridge.kv().get_prediction("p1").await.unwrap().unwrap();
            assert_eq!(data.state, PredictionState::Locked);
            assert_eq!(data.profile_image_url, streamer().profile_image_url);
        }
    }

    #[tokio::test]
    async fn unknown_predictions_are_ignored() {
        let h = harness(true).await;
        h.bridge
            .handle_event(TwitchEvent::PredictionLock(lock("nope")))
            .await
            .unwrap();
        h.bridge
            .handle_event(TwitchEvent::PredictionEnd(end("nope", Some("o1"))))
            .await
            .unwrap();
        assert_eq!(h.contract.writes(), 0);
    }
}
