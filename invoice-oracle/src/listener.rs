use anyhow::anyhow;
use async_trait::async_trait;
use ethers::types::{H256, U256};
use invoice_common::ProcessedEvent;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::codec::{decode, DecodedValue, ReturnType};
use crate::config::OracleConfig;
use crate::dispatcher::RequestReceipt;
use crate::error::OracleError;
use crate::invoice::{transition, InvoiceEvent, Signal};
use crate::reliability::{is_transient, Backoff};
use crate::store::{LinkState, OracleStore, SettleOutcome};

/// Attempts at settling against an invoice that keeps changing underneath
const SETTLE_ATTEMPTS: usize = 8;

/// Outcome tag reported by the router alongside a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FulfillmentCode {
    Success,
    UserError,
    InvalidRequestId,
    CostExceedsCommitment,
    CapacityExceeded,
    SubscriptionBalanceInvariant,
    Unauthorized,
}

impl FulfillmentCode {
    /// Map a router `resultCode`. A "fulfilled" code carrying error bytes is
    /// the user script failing. Unknown codes map to `None`.
    pub fn from_router(code: u8, err: &[u8]) -> Option<Self> {
        match code {
            0 if !err.is_empty() => Some(FulfillmentCode::UserError),
            0 => Some(FulfillmentCode::Success),
            1 => Some(FulfillmentCode::UserError),
            2 => Some(FulfillmentCode::InvalidRequestId),
            3 => Some(FulfillmentCode::CostExceedsCommitment),
            4 => Some(FulfillmentCode::CapacityExceeded),
            5 => Some(FulfillmentCode::SubscriptionBalanceInvariant),
            6 => Some(FulfillmentCode::Unauthorized),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentResult {
    pub request_id: H256,
    pub code: FulfillmentCode,
    pub raw_result: Vec<u8>,
    pub raw_error: Vec<u8>,
}

impl FulfillmentResult {
    pub fn success(request_id: H256, raw_result: Vec<u8>) -> Self {
        Self { request_id, code: FulfillmentCode::Success, raw_result, raw_error: Vec::new() }
    }

    pub fn failure(request_id: H256, code: FulfillmentCode, raw_error: impl Into<Vec<u8>>) -> Self {
        Self { request_id, code, raw_result: Vec::new(), raw_error: raw_error.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenerState {
    Awaiting { deadline: u64 },
    Fulfilled { code: FulfillmentCode, at: u64 },
    TimedOut { at: u64 },
}

/// Listener-side record of one dispatched request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: H256,
    pub token_id: U256,
    pub subscription_id: u64,
    pub return_type: ReturnType,
    pub receipt: RequestReceipt,
    pub state: ListenerState,
}

/// What a callback says, read under the request's declared return type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Answer(DecodedValue),
    OracleFailure { code: FulfillmentCode, message: String },
    Malformed(String),
}

pub fn interpret(result: &FulfillmentResult, ty: ReturnType, max_len: usize) -> Outcome {
    match result.code {
        FulfillmentCode::Success => match decode(&result.raw_result, ty, max_len) {
            Ok(value) => Outcome::Answer(value),
            Err(e) => Outcome::Malformed(e.to_string()),
        },
        code => Outcome::OracleFailure {
            code,
            message: String::from_utf8_lossy(&result.raw_error).into_owned(),
        },
    }
}

/// Emitted when a request times out; the subscription has been charged
/// with nothing to show for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundsConsumedWithoutResult {
    pub request_id: H256,
    pub token_id: U256,
    pub subscription_id: u64,
    pub submitted_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutNotice {
    TimedOut { warning: FundsConsumedWithoutResult, event: InvoiceEvent },
    /// A reservation that was never bound to a request id
    ReservationReleased { token_id: U256, since: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Applied {
        token_id: U256,
        request_id: H256,
        outcome: Outcome,
        event: InvoiceEvent,
    },
    Duplicate(H256),
    Unknown(H256),
    LateAfterTimeout(H256),
}

/// Source of router callbacks, read from a block cursor
#[async_trait]
pub trait FulfillmentSource: Send + Sync {
    /// Events at or after `from_block`, and the block to resume from
    async fn fetch(&self, from_block: u64) -> anyhow::Result<(Vec<ProcessedEvent>, u64)>;
}

pub struct FulfillmentListener<'a> {
    store: &'a OracleStore,
    config: &'a OracleConfig,
}

impl<'a> FulfillmentListener<'a> {
    pub fn new(store: &'a OracleStore, config: &'a OracleConfig) -> Self {
        Self { store, config }
    }

    pub fn state(&self, request_id: H256) -> Result<Option<ListenerState>, OracleError> {
        Ok(self.store.request(request_id)?.map(|r| r.state))
    }

    /// Convert a raw router event; unknown result codes settle as malformed
    pub fn handle_event(&self, event: &ProcessedEvent, now: u64) -> Result<Settlement, OracleError> {
        match FulfillmentCode::from_router(event.result_code, &event.err) {
            Some(code) => {
                let result = FulfillmentResult {
                    request_id: event.request_id,
                    code,
                    raw_result: event.response.clone(),
                    raw_error: event.err.clone(),
                };
                self.handle(&result, now)
            }
            None => self.settle(
                event.request_id,
                FulfillmentCode::Success,
                |_| Outcome::Malformed(format!("unknown router result code {}", event.result_code)),
                now,
            ),
        }
    }

    pub fn handle(&self, result: &FulfillmentResult, now: u64) -> Result<Settlement, OracleError> {
        let max_len = self.config.max_response_bytes;
        self.settle(result.request_id, result.code, |ty| interpret(result, ty, max_len), now)
    }

    fn settle<F>(&self, request_id: H256, code: FulfillmentCode, read: F, now: u64) -> Result<Settlement, OracleError>
    where
        F: Fn(ReturnType) -> Outcome,
    {
        let Some(awaiting) = self.store.request(request_id)? else {
            debug!("Ignoring callback for unknown request {:?}", request_id);
            return Ok(Settlement::Unknown(request_id));
        };
        if let Some(seen) = already_settled(&awaiting) {
            return Ok(seen);
        }

        let outcome = read(awaiting.return_type);
        let signal = match &outcome {
            Outcome::Answer(value) => Signal::VerificationSucceeded(request_id, value.clone()),
            Outcome::OracleFailure { code, message } => Signal::VerificationFailed {
                request_id,
                code: *code,
                message: message.clone(),
            },
            Outcome::Malformed(detail) => Signal::ResultMalformed { request_id, detail: detail.clone() },
        };
        let record = RequestRecord { state: ListenerState::Fulfilled { code, at: now }, ..awaiting.clone() };

        for _ in 0..SETTLE_ATTEMPTS {
            let invoice = self
                .store
                .get_invoice(record.token_id)?
                .ok_or(OracleError::UnknownInvoice(record.token_id))?;
            let (next, event) = transition(&invoice, signal.clone(), now);
            let update = event.changed_state().then_some((&invoice, &next));

            match self.store.settle(&awaiting, &record, update)? {
                SettleOutcome::Settled => {}
                SettleOutcome::InvoiceChanged => continue,
                SettleOutcome::RecordChanged => return self.settled_elsewhere(request_id),
            }

            match &outcome {
                Outcome::Malformed(detail) => error!(
                    "Malformed result for request {:?} on invoice {}: {}; held for review",
                    request_id, record.token_id, detail
                ),
                Outcome::OracleFailure { code, message } => warn!(
                    "Oracle reported {:?} for invoice {}: {}", code, record.token_id, message
                ),
                Outcome::Answer(_) => {}
            }
            info!("Invoice {} settled by request {:?}: {:?}", record.token_id, request_id, event);

            return Ok(Settlement::Applied {
                token_id: record.token_id,
                request_id,
                outcome,
                event,
            });
        }

        Err(OracleError::Chain(anyhow!(
            "invoice {} kept changing while settling request {:?}",
            record.token_id, request_id
        )))
    }

    /// Another writer finished the record between our read and our write
    fn settled_elsewhere(&self, request_id: H256) -> Result<Settlement, OracleError> {
        self.store
            .request(request_id)?
            .as_ref()
            .and_then(already_settled)
            .ok_or_else(|| OracleError::Chain(anyhow!("request {:?} changed while settling", request_id)))
    }

    /// Time out every overdue request and release abandoned reservations.
    ///
    /// Safe to run repeatedly, and alongside callbacks; each request is
    /// settled at most once.
    pub fn sweep_timeouts(&self, now: u64) -> Result<Vec<TimeoutNotice>, OracleError> {
        let mut notices = Vec::new();

        for awaiting in self.store.requests()? {
            let ListenerState::Awaiting { deadline } = awaiting.state else { continue };
            if now < deadline {
                continue;
            }

            let record = RequestRecord { state: ListenerState::TimedOut { at: now }, ..awaiting.clone() };
            let Some(event) = self.settle_timeout(&awaiting, &record, now)? else {
                debug!("Request {:?} was answered before it timed out", record.request_id);
                continue;
            };

            let warning = FundsConsumedWithoutResult {
                request_id: record.request_id,
                token_id: record.token_id,
                subscription_id: record.subscription_id,
                submitted_at: record.receipt.submitted_at,
            };
            warn!(
                "Request {:?} for invoice {} timed out; subscription {} was charged without a result",
                record.request_id, record.token_id, record.subscription_id
            );
            notices.push(TimeoutNotice::TimedOut { warning, event });
        }

        let timeout = self.config.fulfillment_timeout_secs;
        for (token_id, link) in self.store.reservations()? {
            let LinkState::Reserved { since } = link else { continue };
            if now < since.saturating_add(timeout) {
                continue;
            }
            if self.store.release_reservation(token_id, since)? {
                warn!("Released reservation on invoice {} held since {}", token_id, since);
                notices.push(TimeoutNotice::ReservationReleased { token_id, since });
            }
        }

        Ok(notices)
    }

    /// `None` if the request left `Awaiting` before the timeout landed
    fn settle_timeout(
        &self,
        awaiting: &RequestRecord,
        record: &RequestRecord,
        now: u64,
    ) -> Result<Option<InvoiceEvent>, OracleError> {
        for _ in 0..SETTLE_ATTEMPTS {
            let invoice = self
                .store
                .get_invoice(record.token_id)?
                .ok_or(OracleError::UnknownInvoice(record.token_id))?;
            let (next, event) = transition(&invoice, Signal::RequestTimedOut(record.request_id), now);
            let update = event.changed_state().then_some((&invoice, &next));

            match self.store.settle(awaiting, record, update)? {
                SettleOutcome::Settled => return Ok(Some(event)),
                SettleOutcome::RecordChanged => return Ok(None),
                SettleOutcome::InvoiceChanged => continue,
            }
        }

        Err(OracleError::Chain(anyhow!(
            "invoice {} kept changing while timing out request {:?}",
            record.token_id, record.request_id
        )))
    }

    /// Read new callbacks from `source` and settle them, then advance the cursor
    pub async fn poll(&self, source: &dyn FulfillmentSource, now: u64) -> Result<Vec<Settlement>, OracleError> {
        let from = self.store.cursor()?.unwrap_or(0);
        let (events, next) = self.fetch(source, from).await?;

        let mut settled = Vec::with_capacity(events.len());
        for event in &events {
            settled.push(self.handle_event(event, now)?);
        }

        if next > from {
            self.store.set_cursor(next)?;
        }
        Ok(settled)
    }

    async fn fetch(&self, source: &dyn FulfillmentSource, from: u64) -> Result<(Vec<ProcessedEvent>, u64), OracleError> {
        let mut backoff = Backoff::new(self.config.fetch_attempts, self.config.fetch_backoff());

        loop {
            let err = match source.fetch(from).await {
                Ok(fetched) => return Ok(fetched),
                Err(e) => e,
            };
            match backoff.next() {
                Some(delay) if is_transient(&err) => {
                    debug!("Fetching fulfillments from block {} failed, retrying in {:?}: {}", from, delay, err);
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(OracleError::Chain(err.context(format!("fetching fulfillments from block {}", from)))),
            }
        }
    }

    /// Block the next poll starts from, seeding the cursor with `start` on first run
    pub fn resume_from(&self, start: u64) -> Result<u64, OracleError> {
        match self.store.cursor()? {
            Some(block) => Ok(block),
            None => {
                self.store.set_cursor(start)?;
                Ok(start)
            }
        }
    }
}

fn already_settled(record: &RequestRecord) -> Option<Settlement> {
    match record.state {
        ListenerState::Awaiting { .. } => None,
        ListenerState::Fulfilled { .. } => {
            debug!("Duplicate callback for request {:?}", record.request_id);
            Some(Settlement::Duplicate(record.request_id))
        }
        ListenerState::TimedOut { at } => {
            warn!("Request {:?} answered after timing out at {}, ignoring", record.request_id, at);
            Some(Settlement::LateAfterTimeout(record.request_id))
        }
    }
}
