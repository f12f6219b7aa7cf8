use ethers::types::{Address, H256, I256, U256};
use serde::{Deserialize, Serialize};

/// Subscription snapshot as reported by the Functions router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub subscription_id: u64,
    pub owner: Address,
    pub balance: U256,
    pub blocked_balance: U256,
    pub consumers: Vec<Address>,
}

impl SubscriptionInfo {
    /// Balance not already committed to in-flight requests
    pub fn available(&self) -> U256 {
        self.balance.saturating_sub(self.blocked_balance)
    }

    pub fn authorizes(&self, consumer: Address) -> bool {
        self.consumers.contains(&consumer)
    }
}

/// Latest round of a price feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceSample {
    pub round_id: u128,
    pub answer: I256,
    pub decimals: u8,
    pub updated_at: u64,
}

/// `RequestProcessed` event emitted by the router when the DON reports back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEvent {
    pub request_id: H256,
    pub subscription_id: u64,
    pub result_code: u8,
    pub response: Vec<u8>,
    pub err: Vec<u8>,
    pub block_number: u64,
}
