//! Ethers-backed collaborators: the consumer contract submits, the router
//! reports subscriptions and fulfillments, and an aggregator prices invoices.

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use invoice_common::contracts::{ConsumerClient, PriceFeedClient, RouterClient};
use invoice_common::{PriceSample, ProcessedEvent, SubscriptionInfo};
use tracing::warn;

use crate::builder::ComputeRequest;
use crate::dispatcher::{RequestRouter, SubmitError, SubscriptionLedger};
use crate::invoice::PriceFeed;
use crate::listener::{FulfillmentCode, FulfillmentSource};

/// Router custom errors that map onto fulfillment codes
const REVERT_CODES: &[(&str, FulfillmentCode)] = &[
    ("InsufficientBalance()", FulfillmentCode::SubscriptionBalanceInvariant),
    ("InvalidConsumer()", FulfillmentCode::Unauthorized),
    ("InvalidSubscription()", FulfillmentCode::Unauthorized),
    ("GasLimitTooBig(uint32)", FulfillmentCode::CostExceedsCommitment),
    ("TooManyRequests()", FulfillmentCode::CapacityExceeded),
    ("DuplicateRequestId(bytes32)", FulfillmentCode::InvalidRequestId),
];

/// Recognize a router revert by error name or 4-byte selector
pub fn classify_revert(message: &str) -> Option<FulfillmentCode> {
    REVERT_CODES.iter().find_map(|&(signature, code)| {
        let name = signature.split('(').next().unwrap_or(signature);
        let selector = hex::encode(&ethers::utils::id(signature)[..4]);
        (message.contains(name) || message.contains(&selector)).then_some(code)
    })
}

#[async_trait]
impl RequestRouter for ConsumerClient {
    fn consumer(&self) -> Address {
        self.address()
    }

    async fn submit(&self, request: &ComputeRequest) -> Result<H256, SubmitError> {
        let sent = self
            .send_request(request.encode(), request.subscription_id(), request.gas_limit(), request.don_id())
            .await;

        sent.map_err(|e| match classify_revert(&format!("{:?}", e)) {
            Some(code) => {
                warn!("Router refused request for invoice {}: {:?}", request.token_id(), code);
                SubmitError::Rejected(code)
            }
            None => SubmitError::Transport(e),
        })
    }
}

#[async_trait]
impl SubscriptionLedger for RouterClient {
    async fn subscription(&self, subscription_id: u64) -> anyhow::Result<SubscriptionInfo> {
        self.get_subscription(subscription_id).await
    }

    async fn estimate_cost(&self, request: &ComputeRequest) -> anyhow::Result<U256> {
        RouterClient::estimate_cost(
            self,
            request.subscription_id(),
            request.encode(),
            request.gas_limit(),
            request.don_id(),
        )
        .await
    }
}

#[async_trait]
impl FulfillmentSource for RouterClient {
    async fn fetch(&self, from_block: u64) -> anyhow::Result<(Vec<ProcessedEvent>, u64)> {
        self.processed_since(from_block).await
    }
}

#[async_trait]
impl PriceFeed for PriceFeedClient {
    async fn latest(&self) -> anyhow::Result<PriceSample> {
        PriceFeedClient::latest(self).await
    }
}
