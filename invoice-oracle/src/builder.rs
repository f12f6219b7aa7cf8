use ethers::{
    abi::{encode, Token},
    types::{Address, Bytes, H256, U256},
};
use invoice_common::SubscriptionInfo;
use serde::{Deserialize, Serialize};

use crate::codec::ReturnType;
use crate::config::OracleConfig;
use crate::error::OracleError;
use crate::invoice::Invoice;
use crate::secrets::{SecretsReference, StagedSecrets};
use crate::validation::{check_no_plaintext_secrets, validate_args, ScriptValidator};

/// DON script answering "has this invoice been paid?"
pub const INVOICE_PAYMENT_SOURCE: &str = include_str!("../scripts/verify_payment.js");

/// Immutable description of one off-chain computation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeRequest {
    token_id: U256,
    source: String,
    args: Vec<String>,
    secrets: Option<SecretsReference>,
    subscription_id: u64,
    gas_limit: u32,
    don_id: H256,
    return_type: ReturnType,
}

impl ComputeRequest {
    pub fn token_id(&self) -> U256 {
        self.token_id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn secrets(&self) -> Option<SecretsReference> {
        self.secrets
    }

    pub fn subscription_id(&self) -> u64 {
        self.subscription_id
    }

    pub fn gas_limit(&self) -> u32 {
        self.gas_limit
    }

    pub fn don_id(&self) -> H256 {
        self.don_id
    }

    pub fn return_type(&self) -> ReturnType {
        self.return_type
    }

    /// Payload handed to the consumer's `sendRequest`:
    /// abi.encode(string source, string[] args, bytes secretsReference)
    pub fn encode(&self) -> Bytes {
        let secrets = self.secrets.map(|s| s.encode().to_vec()).unwrap_or_default();

        encode(&[
            Token::String(self.source.clone()),
            Token::Array(self.args.iter().cloned().map(Token::String).collect()),
            Token::Bytes(secrets),
        ]).into()
    }
}

pub struct RequestBuilder {
    token_id: U256,
    source: String,
    args: Vec<String>,
    secrets: Option<StagedSecrets>,
    subscription_id: u64,
    gas_limit: i64,
    don_id: H256,
    return_type: ReturnType,
}

impl RequestBuilder {
    pub fn new(token_id: U256, source: impl Into<String>) -> Self {
        Self {
            token_id,
            source: source.into(),
            args: Vec::new(),
            secrets: None,
            subscription_id: 0,
            gas_limit: 0,
            don_id: H256::zero(),
            return_type: ReturnType::Bool,
        }
    }

    /// Payment check for `invoice` with args `[tokenId, amount, payer]`
    pub fn invoice_payment(invoice: &Invoice) -> Self {
        Self::new(invoice.token_id, INVOICE_PAYMENT_SOURCE)
            .args(vec![
                invoice.token_id.to_string(),
                invoice.amount.to_string(),
                format!("{:?}", invoice.payer),
            ])
            .return_type(ReturnType::Bool)
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn secrets(mut self, staged: StagedSecrets) -> Self {
        self.secrets = Some(staged);
        self
    }

    pub fn subscription(mut self, subscription_id: u64) -> Self {
        self.subscription_id = subscription_id;
        self
    }

    pub fn gas_limit(mut self, gas_limit: i64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    pub fn don_id(mut self, don_id: H256) -> Self {
        self.don_id = don_id;
        self
    }

    pub fn return_type(mut self, return_type: ReturnType) -> Self {
        self.return_type = return_type;
        self
    }

    /// Validate against a subscription snapshot and freeze the request
    pub fn build(
        self,
        subscription: &SubscriptionInfo,
        consumer: Address,
        config: &OracleConfig,
    ) -> Result<ComputeRequest, OracleError> {
        if self.gas_limit <= 0 {
            return Err(OracleError::InvalidRequestConfig(format!(
                "compute budget must be positive, got {}",
                self.gas_limit
            )));
        }
        let gas_limit = u32::try_from(self.gas_limit)
            .ok()
            .filter(|g| *g <= config.max_callback_gas)
            .ok_or_else(|| OracleError::InvalidRequestConfig(format!(
                "compute budget {} exceeds callback gas ceiling {}",
                self.gas_limit, config.max_callback_gas
            )))?;

        ScriptValidator::validate_source(&self.source, config.max_source_bytes)?;
        validate_args(&self.args)?;

        if self.don_id.is_zero() {
            return Err(OracleError::InvalidRequestConfig("missing DON id".to_string()));
        }

        if subscription.subscription_id != self.subscription_id {
            return Err(OracleError::InvalidRequestConfig(format!(
                "subscription snapshot is for {}, request names {}",
                subscription.subscription_id, self.subscription_id
            )));
        }
        if !subscription.authorizes(consumer) {
            return Err(OracleError::InvalidRequestConfig(format!(
                "consumer {:?} not authorized on subscription {}",
                consumer, self.subscription_id
            )));
        }

        if let Some(staged) = &self.secrets {
            check_no_plaintext_secrets(&self.source, &self.args, staged)?;
        }

        Ok(ComputeRequest {
            token_id: self.token_id,
            source: self.source,
            args: self.args,
            secrets: self.secrets.map(|s| s.reference()),
            subscription_id: self.subscription_id,
            gas_limit,
            don_id: self.don_id,
            return_type: self.return_type,
        })
    }
}
