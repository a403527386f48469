use std::future::Future;

use anyhow::{bail, Result};
use chrono::Duration;
use log::{debug, error, info, warn};

use crate::api::{now_millis, MarketId, OperationRecord, OperationStatus};
use crate::error::BlockchainError;
use crate::kv::Kv;
use crate::market_service::CreatedMarket;

pub const CREATE_MARKET: &str = "create_market";

pub fn pending_ttl() -> Duration {
    Duration::minutes(5)
}
pub fn record_ttl() -> Duration {
    Duration::hours(24)
}
pub fn idempotency_key(operation: &str, key: &str) -> String {
    format!("idempotency:{}:{}", operation, key)
}

#[derive(Debug, Clone, PartialEq)]
pub enum IdempotentOutcome {
    Executed(CreatedMarket),
    AlreadyDone(MarketId),
    /// Another attempt holds the pending marker.
    InProgress,
}

fn record(
    status: OperationStatus,
    result: Option<String>,
    error: Option<String>,
) -> OperationRecord {
    OperationRecord {
        status,
        result,
        error,
        updated_at: now_millis(),
    }
}

/// Creates the market for `prediction` at most once across concurrent
/// deliveries and retries.
pub async fn create_market_once<F, Fut>(
    kv: &Kv,
    prediction: &str,
    op: F,
) -> Result<IdempotentOutcome>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CreatedMarket>>,
{
    if let Some(market_id) = kv
        .get_prediction(prediction)
        .await?
        .and_then(|data| data.market_id)
    {
        debug!("Prediction {} already has market {}", prediction, market_id);
        return Ok(IdempotentOutcome::AlreadyDone(market_id));
    }
    let key = idempotency_key(CREATE_MARKET, prediction);
    let pending = record(OperationStatus::Pending, None, None);
    if !kv.set_json_nx(&key, &pending, Some(pending_ttl())).await? {
        let existing: Option<OperationRecord> = kv.get_json(&key).await?;
        if let Some(existing) = &existing {
            debug!("{} is {}", key, existing.status);
        }
        match existing {
            Some(OperationRecord {
                status: OperationStatus::Completed,
                result: Some(market_id),
                ..
            }) => return Ok(IdempotentOutcome::AlreadyDone(market_id)),
            Some(OperationRecord {
                status: OperationStatus::Completed,
                result: None,
                ..
            }) => bail!("{} is completed but holds no result", key),
            Some(OperationRecord {
                status: OperationStatus::Pending,
                ..
            }) => {
                info!("Market creation for {} already in progress", prediction);
                return Ok(IdempotentOutcome::InProgress);
            }
            Some(OperationRecord {
                status: OperationStatus::Failed,
                error,
                ..
            }) => {
                warn!(
                    "Retrying market creation for {} after failure: {}",
                    prediction,
                    error.unwrap_or_default()
                );
                kv.del(&key).await?;
            }
            None => {}
        }
        if !kv.set_json_nx(&key, &pending, Some(pending_ttl())).await? {
            return Ok(IdempotentOutcome::InProgress);
        }
    }

    match op().await {
        Ok(created) => {
            let done = record(
                OperationStatus::Completed,
                Some(created.market_id.clone()),
                None,
            );
            // the market exists now, losing the record must not fail the creation
            if let Err(store_err) = kv.set_json(&key, &done, Some(record_ttl())).await {
                error!(
                    "Couldn't record market {} for {}: {:#}",
                    created.market_id, key, store_err
                );
            }
            Ok(IdempotentOutcome::Executed(created))
        }
        Err(e) => {
            // a market that may have been created keeps blocking retries
            let status = if is_unconfirmed(&e) {
                OperationStatus::Pending
            } else {
                OperationStatus::Failed
            };
            let outcome = record(status, None, Some(format!("{:#}", e)));
            if let Err(store_err) = kv.set_json(&key, &outcome, Some(record_ttl())).await {
                warn!("Couldn't record {} for {}: {:#}", status, key, store_err);
            }
            Err(e)
        }
    }
}

/// Whether the write may have landed on chain despite the error.
pub fn is_unconfirmed(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<BlockchainError>(),
        Some(BlockchainError::Unconfirmed { .. })
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::{KeyValueStore, SQLite};
    use crate::kv::test::{prediction, test_kv};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn created(id: &str) -> CreatedMarket {
        CreatedMarket {
            market_id: id.to_string(),
            tx_hash: "0xabc".to_string(),
        }
    }

    #[tokio::test]
    async fn second_call_reports_already_done() {
        let kv = test_kv().await;
        let first = create_market_once(&kv, "p1", || async {
            Ok::<_, anyhow::Error>(created("7"))
        })
        .await
        .unwrap();
        assert_eq!(first, IdempotentOutcome::Executed(created("7")));
        let second = create_market_once(&kv, "p1", || async {
            Ok::<_, anyhow::Error>(created("8"))
        })
        .await
        .unwrap();
        assert_eq!(second, IdempotentOutcome::AlreadyDone("7".to_string()));
    }

    #[tokio::test]
    async fn market_id_on_the_record_short_circuits() {
        let kv = test_kv().await;
        let mut data = prediction("p1");
        data.market_id = Some("3".to_string());
        kv.save_prediction(&data).await.unwrap();
        let outcome = create_market_once(&kv, "p1", || async {
            Err::<CreatedMarket, _>(anyhow!("must not run"))
        })
        .await
        .unwrap();
        assert_eq!(outcome, IdempotentOutcome::AlreadyDone("3".to_string()));
    }

    #[tokio::test]
    async fn concurrent_attempts_run_once() {
        let kv = test_kv().await;
        let runs = AtomicU32::new(0);
        let counter = &runs;
        let op = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Ok::<_, anyhow::Error>(created("1"))
        };
        let (a, b) = tokio::join!(
            create_market_once(&kv, "p1", op),
            create_market_once(&kv, "p1", op)
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(outcomes.contains(&IdempotentOutcome::InProgress));
        assert!(outcomes.contains(&IdempotentOutcome::Executed(created("1"))));
    }

    #[tokio::test]
    async fn failed_attempts_are_recorded_and_retried() {
        let kv = test_kv().await;
        create_market_once(&kv, "p1", || async {
            Err::<CreatedMarket, _>(anyhow!("rpc down"))
        })
        .await
        .unwrap_err();
        let stored: OperationRecord = kv
            .get_json(&idempotency_key(CREATE_MARKET, "p1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, OperationStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("rpc down"));

        let retried = create_market_once(&kv, "p1", || async {
            Ok::<_, anyhow::Error>(created("2"))
        })
        .await
        .unwrap();
        assert_eq!(retried, IdempotentOutcome::Executed(created("2")));
    }

    #[tokio::test]
    async fn unconfirmed_creation_is_never_retried() {
        let kv = test_kv().await;
        let e = create_market_once(&kv, "p1", || async {
            Err::<CreatedMarket, _>(anyhow::Error::from(BlockchainError::Unconfirmed {
                operation: "createMarket",
                tx_hash: "0xabc".to_string(),
                reason: "receipt timed out".to_string(),
            }))
        })
        .await
        .unwrap_err();
        assert!(is_unconfirmed(&e));
        let stored: OperationRecord = kv
            .get_json(&idempotency_key(CREATE_MARKET, "p1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, OperationStatus::Pending);

        let retried = create_market_once(&kv, "p1", || async {
            Err::<CreatedMarket, _>(anyhow!("must not run"))
        })
        .await
        .unwrap();
        assert_eq!(retried, IdempotentOutcome::InProgress);
    }

    #[tokio::test]
    async fn lost_completion_record_still_reports_the_market() {
        let kv = Kv::new(Arc::new(RecordsDown(SQLite::new(None).await.unwrap())));
        let outcome = create_market_once(&kv, "p1", || async {
            Ok::<_, anyhow::Error>(created("5"))
        })
        .await
        .unwrap();
        assert_eq!(outcome, IdempotentOutcome::Executed(created("5")));
    }

    /// Accepts the pending marker but fails every plain write.
    struct RecordsDown(SQLite);
    #[async_trait]
    impl KeyValueStore for RecordsDown {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key).await
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<()> {
            bail!("store unavailable")
        }
        async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
            self.0.set_nx(key, value, ttl).await
        }
        async fn del(&self, key: &str) -> Result<bool> {
            self.0.del(key).await
        }
        async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64> {
            self.0.incr(key, ttl).await
        }
        async fn ping(&self) -> Result<()> {
            self.0.ping().await
        }
    }
}
