use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use invoice_common::PriceSample;
use serde::{Deserialize, Serialize};

use crate::codec::DecodedValue;
use crate::error::OracleError;
use crate::listener::FulfillmentCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceState {
    Pending,
    Verified,
    Rejected,
    Expired,
}

impl InvoiceState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InvoiceState::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    /// The DON answered and the payer has not paid
    NotPaid,
    /// The DON reported a failure code instead of an answer
    OracleFailure { code: FulfillmentCode, message: String },
}

/// Reference-currency value of an invoice, in the invoice's amount unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Valuation {
    pub value: U256,
    pub price_round: u128,
    pub priced_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub token_id: U256,
    pub amount: U256,
    pub amount_decimals: u8,
    pub due_date: u64,
    pub payer: Address,
    pub owner: Address,
    pub state: InvoiceState,
    pub pending_request: Option<H256>,
    pub rejection: Option<RejectionReason>,
    pub needs_review: bool,
    pub valuation: Option<Valuation>,
    pub updated_at: u64,
}

impl Invoice {
    /// A freshly minted invoice starts out Pending
    pub fn minted(
        token_id: U256,
        amount: U256,
        amount_decimals: u8,
        due_date: u64,
        payer: Address,
        owner: Address,
        now: u64,
    ) -> Self {
        Self {
            token_id,
            amount,
            amount_decimals,
            due_date,
            payer,
            owner,
            state: InvoiceState::Pending,
            pending_request: None,
            rejection: None,
            needs_review: false,
            valuation: None,
            updated_at: now,
        }
    }

    pub fn is_overdue(&self, now: u64) -> bool {
        self.state == InvoiceState::Pending && now >= self.due_date
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    RequestAccepted(H256),
    VerificationSucceeded(H256, DecodedValue),
    VerificationFailed { request_id: H256, code: FulfillmentCode, message: String },
    ResultMalformed { request_id: H256, detail: String },
    RequestTimedOut(H256),
    DueDateElapsed,
    ReviewResolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvoiceEvent {
    RequestLinked(H256),
    Verified,
    Rejected(RejectionReason),
    Expired,
    RequestReleased(H256),
    Quarantined { request_id: H256, detail: String },
    ReviewCleared,
    /// The invoice was already terminal; nothing changed
    AlreadyFinalized(InvoiceState),
    /// The signal names a request that is not the invoice's current one
    StaleSignal(H256),
    /// A second request was linked while one is outstanding
    RequestConflict { outstanding: H256 },
}

impl InvoiceEvent {
    pub fn changed_state(&self) -> bool {
        !matches!(
            self,
            InvoiceEvent::AlreadyFinalized(_)
                | InvoiceEvent::StaleSignal(_)
                | InvoiceEvent::RequestConflict { .. }
        )
    }
}

/// Apply `signal` to `invoice`, returning the next record and what happened.
///
/// Terminal invoices never change; every signal they receive is answered with
/// `AlreadyFinalized`.
pub fn transition(invoice: &Invoice, signal: Signal, now: u64) -> (Invoice, InvoiceEvent) {
    if invoice.state.is_terminal() {
        return (invoice.clone(), InvoiceEvent::AlreadyFinalized(invoice.state));
    }

    let mut next = invoice.clone();
    next.updated_at = now;

    let event = match signal {
        Signal::RequestAccepted(request_id) => match invoice.pending_request {
            Some(outstanding) if outstanding != request_id => {
                return (invoice.clone(), InvoiceEvent::RequestConflict { outstanding });
            }
            _ => {
                next.pending_request = Some(request_id);
                InvoiceEvent::RequestLinked(request_id)
            }
        },
        Signal::VerificationSucceeded(request_id, value) => {
            if invoice.pending_request != Some(request_id) {
                return (invoice.clone(), InvoiceEvent::StaleSignal(request_id));
            }
            next.pending_request = None;
            match value {
                DecodedValue::Bool(true) => {
                    next.state = InvoiceState::Verified;
                    InvoiceEvent::Verified
                }
                DecodedValue::Bool(false) => {
                    next.state = InvoiceState::Rejected;
                    next.rejection = Some(RejectionReason::NotPaid);
                    InvoiceEvent::Rejected(RejectionReason::NotPaid)
                }
                other => {
                    let detail = format!("expected boolean verdict, got {:?}", other.return_type());
                    next.needs_review = true;
                    InvoiceEvent::Quarantined { request_id, detail }
                }
            }
        }
        Signal::VerificationFailed { request_id, code, message } => {
            if invoice.pending_request != Some(request_id) {
                return (invoice.clone(), InvoiceEvent::StaleSignal(request_id));
            }
            let reason = RejectionReason::OracleFailure { code, message };
            next.pending_request = None;
            next.state = InvoiceState::Rejected;
            next.rejection = Some(reason.clone());
            InvoiceEvent::Rejected(reason)
        }
        Signal::ResultMalformed { request_id, detail } => {
            if invoice.pending_request != Some(request_id) {
                return (invoice.clone(), InvoiceEvent::StaleSignal(request_id));
            }
            next.pending_request = None;
            next.needs_review = true;
            InvoiceEvent::Quarantined { request_id, detail }
        }
        Signal::RequestTimedOut(request_id) => {
            if invoice.pending_request != Some(request_id) {
                return (invoice.clone(), InvoiceEvent::StaleSignal(request_id));
            }
            next.pending_request = None;
            InvoiceEvent::RequestReleased(request_id)
        }
        Signal::DueDateElapsed => {
            next.state = InvoiceState::Expired;
            InvoiceEvent::Expired
        }
        Signal::ReviewResolved => {
            next.needs_review = false;
            InvoiceEvent::ReviewCleared
        }
    };

    (next, event)
}

/// Latest reference-currency price
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn latest(&self) -> anyhow::Result<PriceSample>;
}

/// Value `invoice` in the feed's quote currency.
///
/// Rejects samples older than `max_staleness` seconds rather than pricing
/// with outdated data.
pub fn appraise(
    invoice: &Invoice,
    sample: &PriceSample,
    now: u64,
    max_staleness: u64,
) -> Result<Valuation, OracleError> {
    let age = now.saturating_sub(sample.updated_at);
    if age > max_staleness {
        return Err(OracleError::StalePriceFeed { age, bound: max_staleness });
    }
    if sample.answer <= ethers::types::I256::zero() {
        return Err(OracleError::InvalidPrice);
    }

    let price = sample.answer.into_raw();
    let scale = U256::exp10(sample.decimals as usize);
    let value = invoice
        .amount
        .checked_mul(price)
        .map(|v| v / scale)
        .ok_or(OracleError::ValuationOverflow)?;

    Ok(Valuation {
        value,
        price_round: sample.round_id,
        priced_at: now,
    })
}
