use crate::api::{MarketId, TwitchPredictionId, WalletAddress};
use crate::error::BlockchainError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnChainState {
    NotFound,
    Open,
    Locked,
    Resolved,
    Voided,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateMarketParams {
    pub twitch_prediction_id: TwitchPredictionId,
    pub question: String,
    pub outcomes: Vec<String>,
    /// Unix seconds.
    pub lock_time: i64,
    pub streamer: WalletAddress,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxReceiptInfo {
    pub tx_hash: String,
    pub success: bool,
    /// Only set for market creation.
    pub market_id: Option<MarketId>,
}

/// The on-chain prediction-market contract. Writes return once the
/// transaction receipt is available, successful or not.
#[async_trait]
pub trait MarketContract {
    async fn market_state(&self, market: &MarketId) -> Result<OnChainState, BlockchainError>;
    async fn create_market(
        &self,
        params: &CreateMarketParams,
    ) -> Result<TxReceiptInfo, BlockchainError>;
    async fn lock_market(&self, market: &MarketId) -> Result<TxReceiptInfo, BlockchainError>;
    async fn resolve_market(
        &self,
        market: &MarketId,
        outcome: u32,
    ) -> Result<TxReceiptInfo, BlockchainError>;
    async fn void_market(&self, market: &MarketId) -> Result<TxReceiptInfo, BlockchainError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestMarket {
    pub params: CreateMarketParams,
    pub state: OnChainState,
    pub outcome: Option<u32>,
}

/// In-memory contract used by tests and `--test` mode.
#[derive(Debug, Default)]
pub struct TestMarketContract {
    markets: Arc<Mutex<HashMap<u64, TestMarket>>>,
    next_id: AtomicU64,
    tx_count: AtomicU64,
    writes: AtomicU32,
    fail_rpc: AtomicU32,
    revert_next: AtomicBool,
    unconfirm_next_create: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
}
impl TestMarketContract {
    /// The next `count` calls fail with an RPC error.
    pub fn fail_next_calls(&self, count: u32) {
        self.fail_rpc.store(count, Ordering::SeqCst);
    }
    pub fn revert_next_write(&self) {
        self.revert_next.store(true, Ordering::SeqCst);
    }
    /// The next market creation lands on chain but reports no receipt.
    pub fn lose_next_create_receipt(&self) {
        self.unconfirm_next_create.store(true, Ordering::SeqCst);
    }
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }
    /// Number of write transactions submitted, reverted ones included.
    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }
    pub fn market(&self, market: &MarketId) -> Option<TestMarket> {
        let id = market.parse::<u64>().ok()?;
        self.markets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }
    pub fn market_count(&self) -> usize {
        self.markets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
    fn check_rpc(&self, operation: &'static str) -> Result<(), BlockchainError> {
        let injected = self
            .fail_rpc
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(BlockchainError::rpc(operation, "injected rpc failure")),
            Err(_) => Ok(()),
        }
    }
    async fn begin_write(&self, operation: &'static str) -> Result<(String, bool), BlockchainError> {
        self.check_rpc(operation)?;
        let delay = *self.write_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let tx = self.tx_count.fetch_add(1, Ordering::SeqCst) + 1;
        let reverted = self.revert_next.swap(false, Ordering::SeqCst);
        Ok((format!("0x{:064x}", tx), !reverted))
    }
    fn transition(
        &self,
        market: &MarketId,
        tx_hash: String,
        success: bool,
        update: impl FnOnce(&mut TestMarket) -> bool,
    ) -> TxReceiptInfo {
        let mut success = success;
        if success {
            let mut markets = self.markets.lock().unwrap_or_else(|e| e.into_inner());
            success = match market.parse::<u64>().ok().and_then(|id| markets.get_mut(&id)) {
                Some(entry) => update(entry),
                None => false,
            };
        }
        TxReceiptInfo {
            tx_hash,
            success,
            market_id: None,
        }
    }
}
#[async_trait]
impl MarketContract for TestMarketContract {
    async fn market_state(&self, market: &MarketId) -> Result<OnChainState, BlockchainError> {
        self.check_rpc("getMarketState")?;
        Ok(self
            .market(market)
            .map(|m| m.state)
            .unwrap_or(OnChainState::NotFound))
    }
    async fn create_market(
        &self,
        params: &CreateMarketParams,
    ) -> Result<TxReceiptInfo, BlockchainError> {
        let (tx_hash, success) = self.begin_write("createMarket").await?;
        if !success {
            return Ok(TxReceiptInfo {
                tx_hash,
                success,
                market_id: None,
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.markets.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            TestMarket {
                params: params.clone(),
                state: OnChainState::Open,
                outcome: None,
            },
        );
        if self.unconfirm_next_create.swap(false, Ordering::SeqCst) {
            return Err(BlockchainError::Unconfirmed {
                operation: "createMarket",
                tx_hash,
                reason: "receipt timed out".to_string(),
            });
        }
        Ok(TxReceiptInfo {
            tx_hash,
            success,
            market_id: Some(id.to_string()),
        })
    }
    async fn lock_market(&self, market: &MarketId) -> Result<TxReceiptInfo, BlockchainError> {
        let (tx_hash, success) = self.begin_write("lockMarket").await?;
        Ok(self.transition(market, tx_hash, success, |m| {
            if m.state != OnChainState::Open {
                return false;
            }
            m.state = OnChainState::Locked;
            true
        }))
    }
    async fn resolve_market(
        &self,
        market: &MarketId,
        outcome: u32,
    ) -> Result<TxReceiptInfo, BlockchainError> {
        let (tx_hash, success) = self.begin_write("resolveMarket").await?;
        Ok(self.transition(market, tx_hash, success, |m| {
            let in_range = (outcome as usize) < m.params.outcomes.len();
            if !in_range || !matches!(m.state, OnChainState::Open | OnChainState::Locked) {
                return false;
            }
            m.state = OnChainState::Resolved;
            m.outcome = Some(outcome);
            true
        }))
    }
    async fn void_market(&self, market: &MarketId) -> Result<TxReceiptInfo, BlockchainError> {
        let (tx_hash, success) = self.begin_write("voidMarket").await?;
        Ok(self.transition(market, tx_hash, success, |m| {
            if !matches!(m.state, OnChainState::Open | OnChainState::Locked) {
                return false;
            }
            m.state = OnChainState::Voided;
            true
        }))
    }
}
