use log::{debug, error};
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration value `{0}`")]
    Missing(&'static str),
    #[error("invalid configuration value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
#[error("transaction {tx_hash} for {operation} on market {market_id} reverted")]
pub struct TransactionRevertedError {
    pub operation: &'static str,
    pub market_id: String,
    pub tx_hash: String,
}

#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("rpc circuit is open, next attempt allowed in {retry_in_secs}s")]
    CircuitOpen { retry_in_secs: u64 },
    #[error("rpc call `{operation}` failed: {reason}")]
    Rpc {
        operation: &'static str,
        reason: String,
    },
    #[error("rpc call `{operation}` timed out")]
    Timeout { operation: &'static str },
    /// The transaction was broadcast but its receipt never arrived, so it
    /// may still be mined.
    #[error("`{operation}` transaction {tx_hash} was sent but is unconfirmed: {reason}")]
    Unconfirmed {
        operation: &'static str,
        tx_hash: String,
        reason: String,
    },
    #[error(transparent)]
    Reverted(#[from] TransactionRevertedError),
    #[error("market {market_id} cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        market_id: String,
        state: String,
    },
    #[error("`{0}` is not a valid market id")]
    InvalidMarketId(String),
    #[error("`{0}` is not a valid wallet address")]
    InvalidAddress(String),
    #[error("transaction {tx_hash} succeeded but emitted no MarketCreated event")]
    MissingMarketId { tx_hash: String },
    #[error(transparent)]
    MissingConfig(#[from] ConfigError),
}
impl BlockchainError {
    pub fn rpc(operation: &'static str, reason: impl ToString) -> Self {
        Self::Rpc {
            operation,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("too many requests")]
    RateLimited,
    #[error(transparent)]
    MissingConfig(#[from] ConfigError),
    #[error("{0}")]
    Unavailable(String),
    #[error(transparent)]
    Internal(anyhow::Error),
}
impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::MissingConfig(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}
impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast_ref::<BlockchainError>() {
            Some(BlockchainError::CircuitOpen { .. }) => Self::Unavailable(format!("{:#}", e)),
            _ => match e.downcast::<ConfigError>() {
                Ok(config) => Self::MissingConfig(config),
                Err(e) => Self::Internal(e),
            },
        }
    }
}

pub fn map_api_err(e: ApiError) -> (StatusCode, String) {
    let status = e.status();
    if status.is_server_error() {
        error!("{}: {:#}", status, e);
    } else {
        debug!("{}: {:#}", status, e);
    }
    (status, format!("{:#}", e))
}
