mod watcher;

use anyhow::Result;
use clap::Parser;
use invoice_common::contracts::parse_address;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(name = "watcher")]
#[clap(about = "Settles invoice verification callbacks from the Functions router")]
struct Args {
    #[clap(short, long, env = "RPC_URL")]
    rpc: String,

    #[clap(short = 'k', long, env = "PRIVATE_KEY")]
    private_key: String,

    #[clap(long, env = "ROUTER_ADDRESS")]
    router: String,

    /// Invoice contract that sends requests to the router
    #[clap(short, long, env = "CONSUMER_ADDRESS")]
    consumer: String,

    /// Chainlink aggregator used to value verified invoices
    #[clap(long, env = "PRICE_FEED_ADDRESS")]
    price_feed: Option<String>,

    /// First block to scan when no cursor is stored yet; defaults to the current head
    #[clap(long)]
    from_block: Option<u64>,

    #[clap(long, default_value = "./oracle.db")]
    db_path: String,

    /// Spool directory the requester queues jobs into
    #[clap(long, env = "ORACLE_OUTBOX", default_value = "./oracle-outbox")]
    outbox: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting invoice watcher");
    info!("Router: {}", args.router);

    let price_feed = args.price_feed.as_deref().map(parse_address).transpose()?;

    let watcher = watcher::WatcherNode::new(
        &args.rpc,
        &args.private_key,
        parse_address(&args.router)?,
        parse_address(&args.consumer)?,
        price_feed,
        &args.db_path,
        &args.outbox,
    ).await?;

    watcher.run(args.from_block).await?;

    Ok(())
}
