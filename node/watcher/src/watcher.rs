use anyhow::Result;
use ethers::{
    providers::{Http, Provider},
    types::{Address, U256},
};
use invoice_common::contracts::{connect, ConsumerClient, PriceFeedClient, RouterClient};
use invoice_oracle::{unix_now, InvoiceEvent, InvoiceOracle, JobOutcome, OracleConfig, Outbox, Settlement};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Watcher node. The one process that owns the invoice store: it dispatches
/// queued jobs, settles callbacks and runs the sweeps.
pub struct WatcherNode {
    oracle: InvoiceOracle,
    outbox: Outbox,
    router: RouterClient,
    consumer: ConsumerClient,
    price_feed: Option<PriceFeedClient>,
}

impl WatcherNode {
    pub async fn new(
        rpc_url: &str,
        private_key: &str,
        router_addr: Address,
        consumer_addr: Address,
        price_feed: Option<Address>,
        db_path: &str,
        outbox_dir: &str,
    ) -> Result<Self> {
        let client = connect(rpc_url, private_key).await?;
        let oracle = InvoiceOracle::open(db_path, OracleConfig::from_env()?)?;

        let price_feed = match price_feed {
            Some(addr) => {
                let provider = Arc::new(Provider::<Http>::try_from(rpc_url)?);
                Some(PriceFeedClient::new(addr, provider))
            }
            None => None,
        };

        Ok(Self {
            oracle,
            outbox: Outbox::open(outbox_dir)?,
            router: RouterClient::new(router_addr, client.clone()),
            consumer: ConsumerClient::new(consumer_addr, client),
            price_feed,
        })
    }

    /// Main settlement loop
    pub async fn run(&self, from_block: Option<u64>) -> Result<()> {
        let start = match from_block {
            Some(block) => block,
            None => self.router.block_number().await?,
        };
        let cursor = self.oracle.resume_from(start)?;
        info!("Watcher resuming from block {}", cursor);

        // Spawn due-date sweeper
        let oracle = self.oracle.clone();
        let sweep_interval = self.oracle.config().expiry_sweep_interval();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(sweep_interval).await;

                match oracle.expire_overdue(unix_now()) {
                    Ok(expired) if !expired.is_empty() => info!("Expired {} overdue invoices", expired.len()),
                    Ok(_) => {}
                    Err(e) => error!("Expiry sweep failed: {}", e),
                }
            }
        });

        loop {
            tokio::time::sleep(self.oracle.config().poll_interval()).await;
            let now = unix_now();

            match self.oracle.drain_outbox(&self.outbox, &self.router, &self.consumer, now).await {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        if let JobOutcome::Dispatched(receipt) = outcome {
                            info!("Awaiting fulfillment of {:?}", receipt.request_id);
                        }
                    }
                }
                Err(e) => error!("Draining outbox failed: {}", e),
            }

            match self.oracle.poll(&self.router, now).await {
                Ok(settled) => {
                    for settlement in settled {
                        if let Settlement::Applied { token_id, event: InvoiceEvent::Verified, .. } = settlement {
                            self.appraise(token_id, now).await;
                        }
                    }
                }
                Err(e) if e.is_retryable() => warn!("Polling fulfillments failed: {}", e),
                Err(e) => return Err(e.into()),
            }

            if let Err(e) = self.oracle.sweep_timeouts(now) {
                error!("Timeout sweep failed: {}", e);
            }
        }
    }

    async fn appraise(&self, token_id: U256, now: u64) {
        let Some(feed) = &self.price_feed else { return };

        if let Err(e) = self.oracle.appraise(token_id, feed, now).await {
            warn!("Could not value invoice {}: {}", token_id, e);
        }
    }
}
