use ethers::types::{H256, U256};
use thiserror::Error;

use crate::config::ConfigError;
use crate::invoice::InvoiceState;
use crate::listener::FulfillmentCode;

#[derive(Debug, Error)]
pub enum OracleError {
    // configuration: caller must fix the input
    #[error("invalid request config: {0}")]
    InvalidRequestConfig(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("secrets reference expired at {expired_at}, refresh before dispatch")]
    SecretsExpired { expired_at: u64 },

    // authorization / funding: retryable after external remediation
    #[error("subscription {subscription_id} has {available} available, request needs {required}")]
    SubscriptionBalanceInvariant {
        subscription_id: u64,
        available: U256,
        required: U256,
    },
    #[error("consumer not authorized for subscription {subscription_id}")]
    Unauthorized { subscription_id: u64 },
    #[error("invoice {0} already has an outstanding request")]
    DuplicateOutstandingRequest(U256),
    #[error("router rejected request with {0:?}")]
    RouterRejected(FulfillmentCode),
    #[error("router returned already used request id {0:?}")]
    RequestIdReused(H256),

    // invoice
    #[error("invoice {0} not found")]
    UnknownInvoice(U256),
    #[error("invoice {0} already exists")]
    InvoiceExists(U256),
    #[error("invoice {token_id} already finalized as {state:?}")]
    AlreadyFinalized { token_id: U256, state: InvoiceState },
    #[error("invoice {0} is held for manual review")]
    UnderReview(U256),
    #[error("invoice {0} is not under review")]
    NotUnderReview(U256),
    #[error("invoice {token_id} is {state:?}, only verified invoices are appraised")]
    NotVerified { token_id: U256, state: InvoiceState },

    // valuation
    #[error("price feed sample is {age}s old, bound is {bound}s")]
    StalePriceFeed { age: u64, bound: u64 },
    #[error("price feed reported non-positive answer")]
    InvalidPrice,
    #[error("valuation overflows 256 bits")]
    ValuationOverflow,

    // transport / storage
    #[error(transparent)]
    Chain(#[from] anyhow::Error),
}

impl OracleError {
    /// Whether the same call may succeed later without the caller changing its input
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OracleError::SubscriptionBalanceInvariant { .. }
                | OracleError::Unauthorized { .. }
                | OracleError::DuplicateOutstandingRequest(_)
                | OracleError::RouterRejected(_)
                | OracleError::StalePriceFeed { .. }
                | OracleError::Chain(_)
        )
    }
}

impl From<sled::Error> for OracleError {
    fn from(err: sled::Error) -> Self {
        OracleError::Chain(err.into())
    }
}

impl From<serde_json::Error> for OracleError {
    fn from(err: serde_json::Error) -> Self {
        OracleError::Chain(err.into())
    }
}
