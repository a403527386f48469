use std::future::Future;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::api::{BreakerState, MarketId};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError};
use crate::contract::{CreateMarketParams, MarketContract, OnChainState, TxReceiptInfo};
use crate::error::{BlockchainError, TransactionRevertedError};

pub type Contract = Arc<dyn MarketContract + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedMarket {
    pub market_id: MarketId,
    pub tx_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Submitted { tx_hash: String },
    /// The market already was in the target state, nothing was sent.
    AlreadyDone(OnChainState),
}

/// Decides whether a contract write is needed and performs it behind the
/// RPC circuit breaker.
pub struct MarketService {
    contract: Contract,
    breaker: CircuitBreaker,
}
impl MarketService {
    pub fn new(contract: Contract) -> Self {
        Self {
            contract,
            breaker: CircuitBreaker::new("rpc", CircuitBreakerConfig::rpc()),
        }
    }
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }
    async fn guarded<T, F, Fut>(&self, op: F) -> Result<T, BlockchainError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BlockchainError>>,
    {
        match self.breaker.call(op).await {
            Ok(value) => Ok(value),
            Err(CircuitError::Open { retry_in }) => Err(BlockchainError::CircuitOpen {
                retry_in_secs: retry_in.as_secs().max(1),
            }),
            Err(CircuitError::Inner(e)) => Err(e),
        }
    }
    async fn state(&self, market: &MarketId) -> Result<OnChainState, BlockchainError> {
        self.guarded(|| self.contract.market_state(market)).await
    }
    fn check_receipt(
        operation: &'static str,
        market: &str,
        receipt: &TxReceiptInfo,
    ) -> Result<(), BlockchainError> {
        if !receipt.success {
            return Err(TransactionRevertedError {
                operation,
                market_id: market.to_string(),
                tx_hash: receipt.tx_hash.clone(),
            }
            .into());
        }
        Ok(())
    }

    pub async fn create_market(
        &self,
        params: &CreateMarketParams,
    ) -> Result<CreatedMarket, BlockchainError> {
        let receipt = self
            .guarded(|| self.contract.create_market(params))
            .await?;
        Self::check_receipt("createMarket", "(new)", &receipt)?;
        let market_id = receipt
            .market_id
            .ok_or_else(|| BlockchainError::MissingMarketId {
                tx_hash: receipt.tx_hash.clone(),
            })?;
        info!(
            "Created market {} for prediction {} in {}",
            market_id, params.twitch_prediction_id, receipt.tx_hash
        );
        Ok(CreatedMarket {
            market_id,
            tx_hash: receipt.tx_hash,
        })
    }
    pub async fn lock_market(&self, market: &MarketId) -> Result<WriteOutcome, BlockchainError> {
        match self.state(market).await? {
            OnChainState::Open => {}
            state @ (OnChainState::Locked | OnChainState::Resolved | OnChainState::Voided) => {
                debug!("Market {} already {:?}, not locking", market, state);
                return Ok(WriteOutcome::AlreadyDone(state));
            }
            OnChainState::NotFound => return Err(not_found("lock", market)),
        }
        let receipt = self.guarded(|| self.contract.lock_market(market)).await?;
        Self::check_receipt("lockMarket", market, &receipt)?;
        info!("Locked market {} in {}", market, receipt.tx_hash);
        Ok(WriteOutcome::Submitted {
            tx_hash: receipt.tx_hash,
        })
    }
    pub async fn resolve_market(
        &self,
        market: &MarketId,
        outcome: u32,
    ) -> Result<WriteOutcome, BlockchainError> {
        match self.state(market).await? {
            OnChainState::Open | OnChainState::Locked => {}
            OnChainState::Resolved => return Ok(WriteOutcome::AlreadyDone(OnChainState::Resolved)),
            OnChainState::Voided => {
                warn!("Market {} was voided, it can't be resolved", market);
                return Err(BlockchainError::InvalidState {
                    operation: "resolve",
                    market_id: market.clone(),
                    state: "voided".to_string(),
                });
            }
            OnChainState::NotFound => return Err(not_found("resolve", market)),
        }
        let receipt = self
            .guarded(|| self.contract.resolve_market(market, outcome))
            .await?;
        Self::check_receipt("resolveMarket", market, &receipt)?;
        info!(
            "Resolved market {} to outcome {} in {}",
            market, outcome, receipt.tx_hash
        );
        Ok(WriteOutcome::Submitted {
            tx_hash: receipt.tx_hash,
        })
    }
    pub async fn void_market(&self, market: &MarketId) -> Result<WriteOutcome, BlockchainError> {
        match self.state(market).await? {
            OnChainState::Open | OnChainState::Locked => {}
            OnChainState::Voided => return Ok(WriteOutcome::AlreadyDone(OnChainState::Voided)),
            OnChainState::Resolved => {
                return Err(BlockchainError::InvalidState {
                    operation: "void",
                    market_id: market.clone(),
                    state: "resolved".to_string(),
                })
            }
            OnChainState::NotFound => return Err(not_found("void", market)),
        }
        let receipt = self.guarded(|| self.contract.void_market(market)).await?;
        Self::check_receipt("voidMarket", market, &receipt)?;
        info!("Voided market {} in {}", market, receipt.tx_hash);
        Ok(WriteOutcome::Submitted {
            tx_hash: receipt.tx_hash,
        })
    }
}

fn not_found(operation: &'static str, market: &MarketId) -> BlockchainError {
    BlockchainError::InvalidState {
        operation,
        market_id: market.clone(),
        state: "missing".to_string(),
    }
}
