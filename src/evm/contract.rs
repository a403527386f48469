use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use alloy_provider::network::EthereumWallet;
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{sol, SolEvent};
use async_trait::async_trait;
use log::{debug, info};

use crate::api::MarketId;
use crate::config::ChainSettings;
use crate::contract::{CreateMarketParams, MarketContract, OnChainState, TxReceiptInfo};
use crate::error::{BlockchainError, ConfigError};

// Market states as returned by getMarketState; 0 means the id was never created.
const STATE_NONE: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_LOCKED: u8 = 2;
const STATE_RESOLVED: u8 = 3;
const STATE_VOIDED: u8 = 4;

sol! {
    #[sol(rpc)]
    contract PredictionMarket {
        event MarketCreated(uint256 indexed marketId, address indexed streamer, string twitchPredictionId);

        function createMarket(
            string question,
            string[] outcomes,
            uint256 lockTime,
            address streamer,
            string twitchPredictionId
        ) external returns (uint256 marketId);
        function lockMarket(uint256 marketId) external;
        function resolveMarket(uint256 marketId, uint256 winningOutcome) external;
        function voidMarket(uint256 marketId) external;
        function getMarketState(uint256 marketId) external view returns (uint8);
    }
}

pub struct EvmMarketContract {
    contract: PredictionMarket::PredictionMarketInstance<DynProvider>,
    timeout: Duration,
}
impl EvmMarketContract {
    pub fn new(settings: &ChainSettings) -> Result<Self, BlockchainError> {
        let signer = PrivateKeySigner::from_str(settings.private_key()?).map_err(|e| {
            ConfigError::Invalid {
                field: "chain.private_key",
                reason: e.to_string(),
            }
        })?;
        let signer = match settings.chain_id {
            Some(chain_id) => signer.with_chain_id(Some(chain_id)),
            None => signer,
        };
        let operator = signer.address();
        let rpc_url: url::Url =
            settings
                .rpc_url()?
                .parse()
                .map_err(|e: url::ParseError| ConfigError::Invalid {
                    field: "chain.rpc_url",
                    reason: e.to_string(),
                })?;
        let address = Address::from_str(settings.contract_address()?).map_err(|e| {
            ConfigError::Invalid {
                field: "chain.contract_address",
                reason: e.to_string(),
            }
        })?;
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(rpc_url)
            .erased();
        info!(
            "Using prediction market contract {} as operator {}",
            address, operator
        );
        Ok(Self {
            contract: PredictionMarket::new(address, provider),
            timeout: Duration::from_secs(settings.rpc_timeout_secs),
        })
    }
    async fn timed<T, F>(&self, operation: &'static str, call: F) -> Result<T, BlockchainError>
    where
        F: Future<Output = Result<T, BlockchainError>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| BlockchainError::Timeout { operation })?
    }
}

fn parse_market_id(market: &MarketId) -> Result<U256, BlockchainError> {
    U256::from_str(market).map_err(|_| BlockchainError::InvalidMarketId(market.clone()))
}

fn on_chain_state(raw: u8) -> OnChainState {
    match raw {
        STATE_NONE => OnChainState::NotFound,
        STATE_OPEN => OnChainState::Open,
        STATE_LOCKED => OnChainState::Locked,
        STATE_RESOLVED => OnChainState::Resolved,
        STATE_VOIDED => OnChainState::Voided,
        _ => OnChainState::NotFound,
    }
}

// The four writes differ only in the call builder, so the send/receipt
// dance lives in a macro. Once the transaction is out, any failure to get
// its receipt is `Unconfirmed` rather than a plain rpc error.
macro_rules! send_and_wait {
    ($self:expr, $operation:expr, $call:expr) => {{
        let pending = $self
            .timed($operation, async {
                $call
                    .send()
                    .await
                    .map_err(|e| BlockchainError::rpc($operation, e))
            })
            .await?;
        let tx_hash = format!("{:?}", pending.tx_hash());
        debug!("Submitted {} transaction {}", $operation, tx_hash);
        match tokio::time::timeout($self.timeout, pending.get_receipt()).await {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) => {
                return Err(BlockchainError::Unconfirmed {
                    operation: $operation,
                    tx_hash,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(BlockchainError::Unconfirmed {
                    operation: $operation,
                    tx_hash,
                    reason: "receipt timed out".to_string(),
                })
            }
        }
    }};
}

#[async_trait]
impl MarketContract for EvmMarketContract {
    async fn market_state(&self, market: &MarketId) -> Result<OnChainState, BlockchainError> {
        let id = parse_market_id(market)?;
        self.timed("getMarketState", async {
            let raw = self
                .contract
                .getMarketState(id)
                .call()
                .await
                .map_err(|e| BlockchainError::rpc("getMarketState", e))?;
            Ok(on_chain_state(raw))
        })
        .await
    }
    async fn create_market(
        &self,
        params: &CreateMarketParams,
    ) -> Result<TxReceiptInfo, BlockchainError> {
        let streamer = Address::from_str(&params.streamer)
            .map_err(|_| BlockchainError::InvalidAddress(params.streamer.clone()))?;
        let receipt = send_and_wait!(
            self,
            "createMarket",
            self.contract.createMarket(
                params.question.clone(),
                params.outcomes.clone(),
                U256::from(params.lock_time.max(0) as u64),
                streamer,
                params.twitch_prediction_id.clone(),
            )
        );
        let tx_hash = format!("{:?}", receipt.transaction_hash);
        let success = receipt.status();
        let market_id = receipt
            .inner
            .logs()
            .iter()
            .filter(|log| log.inner.address == *self.contract.address())
            .find_map(|log| PredictionMarket::MarketCreated::decode_log_data(&log.inner.data).ok())
            .map(|event| event.marketId.to_string());
        if success && market_id.is_none() {
            return Err(BlockchainError::MissingMarketId { tx_hash });
        }
        Ok(TxReceiptInfo {
            tx_hash,
            success,
            market_id,
        })
    }
    async fn lock_market(&self, market: &MarketId) -> Result<TxReceiptInfo, BlockchainError> {
        let id = parse_market_id(market)?;
        let receipt = send_and_wait!(self, "lockMarket", self.contract.lockMarket(id));
        Ok(TxReceiptInfo {
            tx_hash: format!("{:?}", receipt.transaction_hash),
            success: receipt.status(),
            market_id: None,
        })
    }
    async fn resolve_market(
        &self,
        market: &MarketId,
        outcome: u32,
    ) -> Result<TxReceiptInfo, BlockchainError> {
        let id = parse_market_id(market)?;
        let receipt = send_and_wait!(
            self,
            "resolveMarket",
            self.contract.resolveMarket(id, U256::from(outcome))
        );
        Ok(TxReceiptInfo {
            tx_hash: format!("{:?}", receipt.transaction_hash),
            success: receipt.status(),
            market_id: None,
        })
    }
    async fn void_market(&self, market: &MarketId) -> Result<TxReceiptInfo, BlockchainError> {
        let id = parse_market_id(market)?;
        let receipt = send_and_wait!(self, "voidMarket", self.contract.voidMarket(id));
        Ok(TxReceiptInfo {
            tx_hash: format!("{:?}", receipt.transaction_hash),
            success: receipt.status(),
            market_id: None,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn market_ids_parse_as_decimal() {
        assert_eq!(parse_market_id(&"42".to_string()).unwrap(), U256::from(42u64));
        assert!(matches!(
            parse_market_id(&"forty-two".to_string()),
            Err(BlockchainError::InvalidMarketId(_))
        ));
    }

    #[test]
    fn unknown_state_codes_read_as_not_found() {
        assert_eq!(on_chain_state(2), OnChainState::Locked);
        assert_eq!(on_chain_state(9), OnChainState::NotFound);
    }

    #[test]
    fn missing_chain_settings_are_config_errors() {
        let result = EvmMarketContract::new(&ChainSettings::default());
        assert!(matches!(
            result,
            Err(BlockchainError::MissingConfig(ConfigError::Missing("chain.private_key")))
        ));
    }

    #[tokio::test]
    async fn builds_a_chain_bound_operator() {
        let settings = ChainSettings {
            rpc_url: Some("http://127.0.0.1:8545".to_string()),
            contract_address: Some("0x5FbDB2315678afecb367f032d93F642f64180aa3".to_string()),
            private_key: Some(
                "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".to_string(),
            ),
            chain_id: Some(31337),
            ..ChainSettings::default()
        };
        let contract = EvmMarketContract::new(&settings).unwrap();
        assert_eq!(
            *contract.contract.address(),
            Address::from_str("0x5FbDB2315678afecb367f032d93F642f64180aa3").unwrap()
        );
        let bad_url = ChainSettings {
            rpc_url: Some("not a url".to_string()),
            ..settings
        };
        assert!(matches!(
            EvmMarketContract::new(&bad_url),
            Err(BlockchainError::MissingConfig(ConfigError::Invalid { .. }))
        ));
    }

    #[test]
    fn decodes_market_created_log() {
        let event = PredictionMarket::MarketCreated {
            marketId: U256::from(7u64),
            streamer: Address::ZERO,
            twitchPredictionId: "p1".to_string(),
        };
        let data = event.encode_log_data();
        let decoded = PredictionMarket::MarketCreated::decode_log_data(&data).unwrap();
        assert_eq!(decoded.marketId, U256::from(7u64));
    }
}
