use anyhow::anyhow;
use ethers::types::{Address, U256};
use tracing::{error, info, warn};

pub mod builder;
pub mod chain;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod invoice;
pub mod listener;
pub mod outbox;
pub mod reliability;
pub mod secrets;
pub mod simulate;
pub mod store;
pub mod validation;

pub use builder::{ComputeRequest, RequestBuilder, INVOICE_PAYMENT_SOURCE};
pub use codec::{DecodedValue, ReturnType};
pub use config::OracleConfig;
pub use dispatcher::{RequestDispatcher, RequestReceipt, RequestRouter, SubmitError, SubscriptionLedger};
pub use error::OracleError;
pub use invoice::{Invoice, InvoiceEvent, InvoiceState, PriceFeed, RejectionReason, Valuation};
pub use listener::{
    FulfillmentCode, FulfillmentListener, FulfillmentResult, FulfillmentSource, Outcome, Settlement, TimeoutNotice,
};
pub use outbox::{Job, JobOutcome, Outbox, QueuedJob};
pub use secrets::{SecretsGateway, SecretsReference, SecretsVault, StagedSecrets};
pub use store::OracleStore;

use invoice::{transition, Signal};

const UPDATE_ATTEMPTS: usize = 8;

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Invoice registry plus the request and fulfillment machinery around it
#[derive(Clone)]
pub struct InvoiceOracle {
    store: OracleStore,
    config: OracleConfig,
}

impl InvoiceOracle {
    pub fn open(path: &str, config: OracleConfig) -> Result<Self, OracleError> {
        config.validate()?;
        Ok(Self::new(OracleStore::open(path)?, config))
    }

    pub fn new(store: OracleStore, config: OracleConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &OracleStore {
        &self.store
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> RequestDispatcher<'_> {
        RequestDispatcher::new(&self.store, &self.config)
    }

    pub fn listener(&self) -> FulfillmentListener<'_> {
        FulfillmentListener::new(&self.store, &self.config)
    }

    /// Record a newly minted invoice NFT
    #[allow(clippy::too_many_arguments)]
    pub fn mint(
        &self,
        token_id: U256,
        amount: U256,
        amount_decimals: u8,
        due_date: u64,
        payer: Address,
        owner: Address,
        now: u64,
    ) -> Result<Invoice, OracleError> {
        if amount.is_zero() {
            return Err(OracleError::InvalidRequestConfig("invoice amount must be positive".to_string()));
        }
        if due_date <= now {
            return Err(OracleError::InvalidRequestConfig(format!(
                "due date {} is not in the future",
                due_date
            )));
        }
        if payer.is_zero() {
            return Err(OracleError::InvalidRequestConfig("payer must be set".to_string()));
        }

        let invoice = Invoice::minted(token_id, amount, amount_decimals, due_date, payer, owner, now);
        if !self.store.insert_invoice(&invoice)? {
            return Err(OracleError::InvoiceExists(token_id));
        }

        info!("Minted invoice {} for {} due {}", token_id, amount, due_date);
        Ok(invoice)
    }

    pub fn invoice(&self, token_id: U256) -> Result<Invoice, OracleError> {
        self.store
            .get_invoice(token_id)?
            .ok_or(OracleError::UnknownInvoice(token_id))
    }

    pub async fn request_verification(
        &self,
        request: &ComputeRequest,
        ledger: &dyn SubscriptionLedger,
        router: &dyn RequestRouter,
        now: u64,
    ) -> Result<RequestReceipt, OracleError> {
        self.dispatcher().dispatch(request, ledger, router, now).await
    }

    pub fn handle_fulfillment(&self, result: &FulfillmentResult, now: u64) -> Result<Settlement, OracleError> {
        self.listener().handle(result, now)
    }

    pub async fn poll(&self, source: &dyn FulfillmentSource, now: u64) -> Result<Vec<Settlement>, OracleError> {
        self.listener().poll(source, now).await
    }

    pub fn sweep_timeouts(&self, now: u64) -> Result<Vec<TimeoutNotice>, OracleError> {
        self.listener().sweep_timeouts(now)
    }

    pub fn resume_from(&self, start_block: u64) -> Result<u64, OracleError> {
        self.listener().resume_from(start_block)
    }

    /// Carry out one job handed over through the outbox
    pub async fn run_job(
        &self,
        job: &Job,
        ledger: &dyn SubscriptionLedger,
        router: &dyn RequestRouter,
        now: u64,
    ) -> Result<JobOutcome, OracleError> {
        match job {
            Job::Register { token_id, amount, amount_decimals, due_date, payer, owner, minted_at } => {
                match self.mint(*token_id, *amount, *amount_decimals, *due_date, *payer, *owner, *minted_at) {
                    Ok(invoice) => Ok(JobOutcome::Registered(invoice)),
                    Err(OracleError::InvoiceExists(_)) => Ok(JobOutcome::Registered(self.invoice(*token_id)?)),
                    Err(e) => Err(e),
                }
            }
            Job::Verify { token_id, subscription_id, don_id, gas_limit, secrets } => {
                let invoice = self.invoice(*token_id)?;
                let subscription = ledger.subscription(*subscription_id).await?;

                let mut builder = RequestBuilder::invoice_payment(&invoice)
                    .subscription(*subscription_id)
                    .gas_limit(*gas_limit)
                    .don_id(*don_id);
                if let Some(staged) = secrets {
                    builder = builder.secrets(staged.clone());
                }
                let request = builder.build(&subscription, router.consumer(), &self.config)?;

                let receipt = self.request_verification(&request, ledger, router, now).await?;
                Ok(JobOutcome::Dispatched(receipt))
            }
        }
    }

    /// Run queued jobs in order. A transport failure leaves that job and the
    /// ones behind it queued for the next drain; any other failure retires it.
    pub async fn drain_outbox(
        &self,
        outbox: &Outbox,
        ledger: &dyn SubscriptionLedger,
        router: &dyn RequestRouter,
        now: u64,
    ) -> Result<Vec<JobOutcome>, OracleError> {
        let mut outcomes = Vec::new();

        for queued in outbox.pending()? {
            match self.run_job(&queued.job, ledger, router, now).await {
                Ok(outcome) => {
                    outbox.complete(&queued)?;
                    outcomes.push(outcome);
                }
                Err(OracleError::Chain(e)) => {
                    warn!("Job {} deferred: {:#}", queued.id, e);
                    break;
                }
                Err(e) => {
                    error!("Job {} failed: {}", queued.id, e);
                    outbox.fail(&queued, &e.to_string())?;
                }
            }
        }

        Ok(outcomes)
    }

    /// Expire every Pending invoice whose due date has passed
    pub fn expire_overdue(&self, now: u64) -> Result<Vec<U256>, OracleError> {
        let mut expired = Vec::new();

        for invoice in self.store.invoices()? {
            if !invoice.is_overdue(now) {
                continue;
            }
            let updated = self.update_invoice(invoice.token_id, |current| {
                let (next, event) = transition(current, Signal::DueDateElapsed, now);
                Ok(event.changed_state().then_some(next))
            })?;
            if updated.state == InvoiceState::Expired {
                info!("Invoice {} expired unpaid (due {})", updated.token_id, updated.due_date);
                expired.push(updated.token_id);
            }
        }

        Ok(expired)
    }

    /// Clear the review hold left by a malformed result
    pub fn resolve_review(&self, token_id: U256, now: u64) -> Result<Invoice, OracleError> {
        let invoice = self.update_invoice(token_id, |current| {
            if !current.needs_review {
                return Err(OracleError::NotUnderReview(token_id));
            }
            let (next, event) = transition(current, Signal::ReviewResolved, now);
            match event {
                InvoiceEvent::AlreadyFinalized(state) => Err(OracleError::AlreadyFinalized { token_id, state }),
                _ => Ok(Some(next)),
            }
        })?;

        info!("Review on invoice {} resolved", token_id);
        Ok(invoice)
    }

    /// Price a verified invoice from `feed` and record the valuation
    pub async fn appraise(&self, token_id: U256, feed: &dyn PriceFeed, now: u64) -> Result<Valuation, OracleError> {
        let invoice = self.invoice(token_id)?;
        if invoice.state != InvoiceState::Verified {
            return Err(OracleError::NotVerified { token_id, state: invoice.state });
        }

        let sample = feed.latest().await?;
        let valuation = crate::invoice::appraise(&invoice, &sample, now, self.config.max_price_staleness_secs)?;

        self.update_invoice(token_id, |current| {
            let mut next = current.clone();
            next.valuation = Some(valuation.clone());
            Ok(Some(next))
        })?;

        info!("Invoice {} valued at {} (round {})", token_id, valuation.value, valuation.price_round);
        Ok(valuation)
    }

    /// Compare-and-swap loop; `f` returns `None` to leave the invoice as is
    fn update_invoice<F>(&self, token_id: U256, f: F) -> Result<Invoice, OracleError>
    where
        F: Fn(&Invoice) -> Result<Option<Invoice>, OracleError>,
    {
        for _ in 0..UPDATE_ATTEMPTS {
            let current = self.invoice(token_id)?;
            let Some(next) = f(&current)? else {
                return Ok(current);
            };
            if self.store.swap_invoice(&current, &next)? {
                return Ok(next);
            }
        }

        Err(OracleError::Chain(anyhow!("invoice {} kept changing during update", token_id)))
    }
}
