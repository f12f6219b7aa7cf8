use anyhow::{Context, Result};
use ethers::{
    signers::LocalWallet,
    types::{Address, U256},
};
use invoice_common::contracts::{connect, don_id_from_str, ConsumerClient};
use invoice_oracle::{secrets::HttpGateway, unix_now, Job, OracleConfig, Outbox, SecretsVault};
use k256::PublicKey;
use std::collections::BTreeMap;
use tracing::info;

const DAY: u64 = 86_400;
const SECRETS_SLOT: u8 = 0;

pub struct SecretsConfig {
    pub don_public_key: String,
    pub api_key: String,
    pub gateways: Vec<String>,
}

/// Requester node. Talks to the chain and the secrets gateways, and leaves
/// everything that touches the invoice store to the watcher.
pub struct RequesterNode {
    outbox: Outbox,
    config: OracleConfig,
    consumer: ConsumerClient,
    wallet: LocalWallet,
    address: Address,
}

impl RequesterNode {
    pub async fn new(rpc_url: &str, private_key: &str, consumer_addr: Address, outbox_dir: &str) -> Result<Self> {
        let client = connect(rpc_url, private_key).await?;
        let wallet = client.signer().clone();
        let address = client.address();

        Ok(Self {
            outbox: Outbox::open(outbox_dir)?,
            config: OracleConfig::from_env()?,
            consumer: ConsumerClient::new(consumer_addr, client),
            wallet,
            address,
        })
    }

    /// Mint on-chain, then queue the invoice for the watcher's registry
    pub async fn mint(&self, amount: U256, decimals: u8, due_in_days: u64, payer: Address) -> Result<U256> {
        if amount.is_zero() {
            anyhow::bail!("invoice amount must be positive");
        }
        let now = unix_now();
        let due_date = now + due_in_days * DAY;

        let token_id = self.consumer.mint_invoice(amount, due_date, payer).await?;
        info!("Minted token {} to {}", token_id, self.address);

        let job = Job::Register {
            token_id,
            amount,
            amount_decimals: decimals,
            due_date,
            payer,
            owner: self.address,
            minted_at: now,
        };
        let id = self.outbox.submit(job, now)?;
        info!("Registration of invoice {} queued as {}", token_id, id);

        Ok(token_id)
    }

    /// Stage secrets if given and queue a payment verification
    pub async fn verify(
        &self,
        token_id: U256,
        subscription_id: u64,
        don_id: &str,
        gas_limit: i64,
        secrets: Option<SecretsConfig>,
    ) -> Result<String> {
        let now = unix_now();
        let don_id = don_id_from_str(don_id)?;

        let staged = match secrets {
            Some(secrets) => {
                let key_bytes = hex::decode(secrets.don_public_key.trim_start_matches("0x"))
                    .context("DON public key is not hex")?;
                let don_key = PublicKey::from_sec1_bytes(&key_bytes).context("invalid DON public key")?;

                let vault = SecretsVault::new(
                    HttpGateway::new(secrets.gateways, self.wallet.clone()),
                    don_key,
                    self.config.secrets_ttl_secs,
                    SECRETS_SLOT,
                );
                let bundle = BTreeMap::from([("apiKey".to_string(), secrets.api_key)]);
                Some(vault.stage(&bundle, now).await?)
            }
            None => None,
        };

        let job = Job::Verify { token_id, subscription_id, don_id, gas_limit, secrets: staged };
        let id = self.outbox.submit(job, now)?;
        info!("Verification of invoice {} queued as {}", token_id, id);

        Ok(id)
    }
}
