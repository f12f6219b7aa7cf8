use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use invoice_common::SubscriptionInfo;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::builder::ComputeRequest;
use crate::config::OracleConfig;
use crate::error::OracleError;
use crate::invoice::{transition, InvoiceEvent, InvoiceState, Signal};
use crate::listener::{FulfillmentCode, ListenerState, RequestRecord};
use crate::store::{BindOutcome, OracleStore};

const BIND_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestReceipt {
    pub request_id: H256,
    pub submitted_at: u64,
}

/// Read side of the subscription account that pays for requests
#[async_trait]
pub trait SubscriptionLedger: Send + Sync {
    async fn subscription(&self, subscription_id: u64) -> anyhow::Result<SubscriptionInfo>;
    async fn estimate_cost(&self, request: &ComputeRequest) -> anyhow::Result<U256>;
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("router rejected request: {0:?}")]
    Rejected(FulfillmentCode),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Submission path to the DON
#[async_trait]
pub trait RequestRouter: Send + Sync {
    /// Consumer contract that requests are sent from
    fn consumer(&self) -> Address;
    async fn submit(&self, request: &ComputeRequest) -> Result<H256, SubmitError>;
}

pub struct RequestDispatcher<'a> {
    store: &'a OracleStore,
    config: &'a OracleConfig,
}

impl<'a> RequestDispatcher<'a> {
    pub fn new(store: &'a OracleStore, config: &'a OracleConfig) -> Self {
        Self { store, config }
    }

    /// Submit `request` for its invoice, holding the invoice's request slot
    /// from pre-flight until the request id is bound. The slot is given back
    /// only when the router never accepted the request.
    pub async fn dispatch(
        &self,
        request: &ComputeRequest,
        ledger: &dyn SubscriptionLedger,
        router: &dyn RequestRouter,
        now: u64,
    ) -> Result<RequestReceipt, OracleError> {
        let token_id = request.token_id();
        self.check_invoice(token_id)?;

        if let Some(secrets) = request.secrets() {
            secrets.ensure_fresh(now)?;
        }

        let subscription = ledger.subscription(request.subscription_id()).await?;
        if !subscription.authorizes(router.consumer()) {
            return Err(OracleError::Unauthorized { subscription_id: request.subscription_id() });
        }
        let required = ledger.estimate_cost(request).await?;
        let available = subscription.available();
        if available < required {
            return Err(OracleError::SubscriptionBalanceInvariant {
                subscription_id: request.subscription_id(),
                available,
                required,
            });
        }

        if let Some(occupant) = self.store.reserve(token_id, now)? {
            warn!("Invoice {} already has a request in flight: {:?}", token_id, occupant);
            return Err(OracleError::DuplicateOutstandingRequest(token_id));
        }

        let request_id = match self.submit(request, router, &subscription, available, required).await {
            Ok(id) => id,
            Err(e) => {
                self.store.release_reservation(token_id, now)?;
                return Err(e);
            }
        };

        // The request is live and funded from here on; a failed bind keeps the
        // slot reserved until the timeout sweep reclaims it.
        self.bind(request, request_id, subscription.subscription_id, now).map_err(|e| {
            error!("Request {:?} for invoice {} submitted but not recorded: {}", request_id, token_id, e);
            e
        })
    }

    fn check_invoice(&self, token_id: U256) -> Result<(), OracleError> {
        let invoice = self
            .store
            .get_invoice(token_id)?
            .ok_or(OracleError::UnknownInvoice(token_id))?;

        if invoice.state != InvoiceState::Pending {
            return Err(OracleError::AlreadyFinalized { token_id, state: invoice.state });
        }
        if invoice.needs_review {
            return Err(OracleError::UnderReview(token_id));
        }
        if invoice.pending_request.is_some() {
            return Err(OracleError::DuplicateOutstandingRequest(token_id));
        }
        Ok(())
    }

    async fn submit(
        &self,
        request: &ComputeRequest,
        router: &dyn RequestRouter,
        subscription: &SubscriptionInfo,
        available: U256,
        required: U256,
    ) -> Result<H256, OracleError> {
        match router.submit(request).await {
            Ok(id) => Ok(id),
            Err(SubmitError::Rejected(FulfillmentCode::SubscriptionBalanceInvariant)) => {
                Err(OracleError::SubscriptionBalanceInvariant {
                    subscription_id: subscription.subscription_id,
                    available,
                    required,
                })
            }
            Err(SubmitError::Rejected(FulfillmentCode::Unauthorized)) => {
                Err(OracleError::Unauthorized { subscription_id: subscription.subscription_id })
            }
            Err(SubmitError::Rejected(code)) => Err(OracleError::RouterRejected(code)),
            Err(SubmitError::Transport(e)) => Err(OracleError::Chain(e)),
        }
    }

    fn bind(
        &self,
        request: &ComputeRequest,
        request_id: H256,
        subscription_id: u64,
        now: u64,
    ) -> Result<RequestReceipt, OracleError> {
        let token_id = request.token_id();
        let receipt = RequestReceipt { request_id, submitted_at: now };
        let record = RequestRecord {
            request_id,
            token_id,
            subscription_id,
            return_type: request.return_type(),
            receipt,
            state: ListenerState::Awaiting {
                deadline: now.saturating_add(self.config.fulfillment_timeout_secs),
            },
        };

        for _ in 0..BIND_ATTEMPTS {
            let invoice = self
                .store
                .get_invoice(token_id)?
                .ok_or(OracleError::UnknownInvoice(token_id))?;
            let (next, event) = transition(&invoice, Signal::RequestAccepted(request_id), now);
            if !matches!(event, InvoiceEvent::RequestLinked(_)) {
                // invoice moved on; the record still correlates the eventual callback
                warn!("Invoice {} changed during submission of {:?}: {:?}", token_id, request_id, event);
            }

            match self.store.bind(&record, &invoice, &next)? {
                BindOutcome::Bound => {
                    info!(
                        "Dispatched request {:?} for invoice {} on subscription {}",
                        request_id, token_id, subscription_id
                    );
                    return Ok(receipt);
                }
                BindOutcome::RequestSeen => return Err(OracleError::RequestIdReused(request_id)),
                BindOutcome::InvoiceChanged => continue,
            }
        }

        Err(OracleError::Chain(anyhow::anyhow!(
            "invoice {} kept changing while binding request {:?}",
            token_id, request_id
        )))
    }
}
