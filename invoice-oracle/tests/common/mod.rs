#![allow(dead_code)]

use async_trait::async_trait;
use ethers::types::{Address, H256, I256, U256};
use invoice_common::{PriceSample, ProcessedEvent, SubscriptionInfo};
use invoice_oracle::{
    ComputeRequest, FulfillmentCode, FulfillmentSource, Invoice, InvoiceOracle, OracleConfig, OracleStore, PriceFeed,
    RequestBuilder, RequestRouter, SubmitError, SubscriptionLedger,
};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

pub const NOW: u64 = 1_700_000_000;
pub const DAY: u64 = 86_400;
pub const SUBSCRIPTION: u64 = 42;

pub fn consumer() -> Address {
    Address::repeat_byte(0xC0)
}

pub fn payer() -> Address {
    Address::repeat_byte(0x0B)
}

pub fn owner() -> Address {
    Address::repeat_byte(0x0A)
}

pub fn oracle() -> InvoiceOracle {
    InvoiceOracle::new(OracleStore::temporary().unwrap(), OracleConfig::default())
}

/// amount = 1000 at 18 decimals, due one day out
pub fn mint(oracle: &InvoiceOracle, token: u64) -> Invoice {
    oracle
        .mint(U256::from(token), U256::from(1000) * U256::exp10(18), 18, NOW + DAY, payer(), owner(), NOW)
        .unwrap()
}

pub fn subscription() -> SubscriptionInfo {
    SubscriptionInfo {
        subscription_id: SUBSCRIPTION,
        owner: owner(),
        balance: U256::exp10(18),
        blocked_balance: U256::zero(),
        consumers: vec![consumer()],
    }
}

pub fn request_for(oracle: &InvoiceOracle, invoice: &Invoice) -> ComputeRequest {
    RequestBuilder::invoice_payment(invoice)
        .subscription(SUBSCRIPTION)
        .gas_limit(300_000)
        .don_id(H256::repeat_byte(0x66))
        .build(&subscription(), consumer(), oracle.config())
        .unwrap()
}

/// Subscription reads fail with a connection error while `outages` > 0
pub struct MockLedger {
    pub info: Mutex<SubscriptionInfo>,
    pub cost: U256,
    pub outages: AtomicU32,
}

impl MockLedger {
    pub fn funded() -> Self {
        Self::with_balance(U256::exp10(18))
    }

    pub fn with_balance(balance: U256) -> Self {
        let mut info = subscription();
        info.balance = balance;
        Self { info: Mutex::new(info), cost: U256::exp10(15), outages: AtomicU32::new(0) }
    }
}

#[async_trait]
impl SubscriptionLedger for MockLedger {
    async fn subscription(&self, _subscription_id: u64) -> anyhow::Result<SubscriptionInfo> {
        if self.outages.load(Ordering::SeqCst) > 0 {
            self.outages.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("connection refused");
        }
        Ok(self.info.lock().unwrap().clone())
    }

    async fn estimate_cost(&self, _request: &ComputeRequest) -> anyhow::Result<U256> {
        Ok(self.cost)
    }
}

/// Hands out sequential request ids; yields before answering so concurrent
/// dispatches interleave
pub struct MockRouter {
    pub consumer: Address,
    next_id: AtomicU64,
    pub reject: Mutex<Option<FulfillmentCode>>,
    pub repeat_id: Mutex<Option<H256>>,
    pub submitted: Mutex<Vec<ComputeRequest>>,
}

impl MockRouter {
    pub fn new() -> Self {
        Self {
            consumer: consumer(),
            next_id: AtomicU64::new(1),
            reject: Mutex::new(None),
            repeat_id: Mutex::new(None),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn submissions(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

#[async_trait]
impl RequestRouter for MockRouter {
    fn consumer(&self) -> Address {
        self.consumer
    }

    async fn submit(&self, request: &ComputeRequest) -> Result<H256, SubmitError> {
        tokio::task::yield_now().await;
        if let Some(code) = *self.reject.lock().unwrap() {
            return Err(SubmitError::Rejected(code));
        }
        self.submitted.lock().unwrap().push(request.clone());
        if let Some(id) = *self.repeat_id.lock().unwrap() {
            return Ok(id);
        }
        Ok(H256::from_low_u64_be(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }
}

/// Serves queued router events once, optionally failing the first fetches
pub struct MockSource {
    pub events: Mutex<Vec<ProcessedEvent>>,
    pub head: AtomicU64,
    pub failures: AtomicU32,
}

impl MockSource {
    pub fn new(events: Vec<ProcessedEvent>, head: u64) -> Self {
        Self { events: Mutex::new(events), head: AtomicU64::new(head), failures: AtomicU32::new(0) }
    }
}

#[async_trait]
impl FulfillmentSource for MockSource {
    async fn fetch(&self, from_block: u64) -> anyhow::Result<(Vec<ProcessedEvent>, u64)> {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("connection reset by peer");
        }
        let head = self.head.load(Ordering::SeqCst);
        let events = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= head)
            .cloned()
            .collect();
        Ok((events, head + 1))
    }
}

pub fn processed(request_id: H256, result_code: u8, response: Vec<u8>, err: &[u8], block: u64) -> ProcessedEvent {
    ProcessedEvent {
        request_id,
        subscription_id: SUBSCRIPTION,
        result_code,
        response,
        err: err.to_vec(),
        block_number: block,
    }
}

pub struct MockFeed(pub PriceSample);

#[async_trait]
impl PriceFeed for MockFeed {
    async fn latest(&self) -> anyhow::Result<PriceSample> {
        Ok(self.0)
    }
}

/// 1 unit = 1.00 reference at 8 decimals
pub fn par_feed(updated_at: u64) -> MockFeed {
    MockFeed(PriceSample { round_id: 1, answer: I256::from(100_000_000), decimals: 8, updated_at })
}
