mod requester;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ethers::types::U256;
use invoice_common::contracts::parse_address;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(name = "requester")]
#[clap(about = "Mints invoice NFTs and asks the DON whether they were paid")]
struct Args {
    #[clap(short, long, env = "RPC_URL")]
    rpc: String,

    #[clap(short = 'k', long, env = "PRIVATE_KEY")]
    private_key: String,

    #[clap(short, long, env = "CONSUMER_ADDRESS")]
    consumer: String,

    /// Spool directory drained by the watcher
    #[clap(long, env = "ORACLE_OUTBOX", default_value = "./oracle-outbox")]
    outbox: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mint an invoice and queue it for registration
    Mint {
        /// Amount in base units
        #[clap(long)]
        amount: String,

        #[clap(long, default_value = "18")]
        decimals: u8,

        #[clap(long)]
        due_in_days: u64,

        #[clap(long)]
        payer: String,
    },
    /// Queue a payment verification request for an invoice
    Verify {
        #[clap(long)]
        token_id: String,

        #[clap(long, env = "SUBSCRIPTION_ID")]
        subscription: u64,

        #[clap(long, env = "DON_ID")]
        don_id: String,

        #[clap(long, default_value = "300000")]
        gas_limit: i64,

        /// SEC1 hex of the DON's secrets key
        #[clap(long, env = "DON_PUBLIC_KEY")]
        don_public_key: Option<String>,

        #[clap(long, env = "PAYMENTS_API_KEY")]
        api_key: Option<String>,

        #[clap(long, env = "SECRETS_GATEWAYS", value_delimiter = ',')]
        gateways: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting invoice requester");
    info!("Consumer: {}", args.consumer);
    info!("Outbox: {}", args.outbox);

    let node = requester::RequesterNode::new(
        &args.rpc,
        &args.private_key,
        parse_address(&args.consumer)?,
        &args.outbox,
    ).await?;

    match args.command {
        Command::Mint { amount, decimals, due_in_days, payer } => {
            let amount = U256::from_dec_str(&amount)?;
            let payer = parse_address(&payer)?;
            let token_id = node.mint(amount, decimals, due_in_days, payer).await?;
            println!("{}", token_id);
        }
        Command::Verify { token_id, subscription, don_id, gas_limit, don_public_key, api_key, gateways } => {
            let secrets = match (don_public_key, api_key) {
                (Some(key), Some(api_key)) => Some(requester::SecretsConfig { don_public_key: key, api_key, gateways }),
                (None, None) => None,
                _ => anyhow::bail!("--don-public-key and --api-key must be given together"),
            };
            let job_id = node
                .verify(U256::from_dec_str(&token_id)?, subscription, &don_id, gas_limit, secrets)
                .await?;
            println!("{}", job_id);
        }
    }

    Ok(())
}
