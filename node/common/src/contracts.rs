use ethers::{
    abi::{decode, encode, ParamType, Token},
    contract::{abigen, parse_log},
    middleware::SignerMiddleware,
    providers::{Http, Middleware, Provider},
    signers::{LocalWallet, Signer},
    types::{Address, Bytes, TransactionRequest, H256, U256},
};
use std::sync::Arc;
use anyhow::{anyhow, Context, Result};

use crate::types::{PriceSample, ProcessedEvent, SubscriptionInfo};

// Generate contract bindings
abigen!(
    InvoiceConsumer,
    r#"[
        function sendRequest(bytes request, uint64 subscriptionId, uint32 gasLimit, bytes32 donId) external returns (bytes32)
        function mintInvoice(uint256 amount, uint256 dueDate, address payer) external returns (uint256)
        event RequestSent(bytes32 indexed id)
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId)
    ]"#
);

abigen!(
    FunctionsRouter,
    r#"[
        function getContractById(bytes32 id) external view returns (address)
        event RequestProcessed(bytes32 indexed requestId, uint64 indexed subscriptionId, uint96 totalCostJuels, address transmitter, uint8 resultCode, bytes response, bytes err, bytes callbackReturnData)
    ]"#
);

abigen!(
    FunctionsCoordinator,
    r#"[
        function estimateCost(uint64 subscriptionId, bytes data, uint32 callbackGasLimit, uint256 gasPriceWei) external view returns (uint96)
    ]"#
);

abigen!(
    AggregatorV3,
    r#"[
        function latestRoundData() external view returns (uint80 roundId, int256 answer, uint256 startedAt, uint256 updatedAt, uint80 answeredInRound)
        function decimals() external view returns (uint8)
    ]"#
);

pub type Client = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Connect a signing client, taking the chain id from the node
pub async fn connect(rpc_url: &str, private_key: &str) -> Result<Arc<Client>> {
    let provider = Provider::<Http>::try_from(rpc_url).context("invalid RPC URL")?;
    let wallet: LocalWallet = private_key.parse().context("invalid private key")?;
    let chain_id = provider.get_chainid().await?.as_u64();

    Ok(Arc::new(SignerMiddleware::new(provider, wallet.with_chain_id(chain_id))))
}

/// Widest block span requested from `eth_getLogs` in one call
pub const MAX_LOG_RANGE: u64 = 2_000;

/// Parse a `0x`-prefixed 20-byte address
pub fn parse_address(raw: &str) -> Result<Address> {
    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| anyhow!("address {} must start with 0x", raw))?;
    if digits.len() != 40 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow!("address {} is not 20 hex-encoded bytes", raw));
    }
    digits.parse().map_err(|e| anyhow!("address {}: {:?}", raw, e))
}

/// Inclusive block span to scan starting at `from_block`, capped at
/// `MAX_LOG_RANGE`; `None` once `from_block` is past `head`
pub fn log_window(from_block: u64, head: u64) -> Option<(u64, u64)> {
    (from_block <= head).then(|| (from_block, head.min(from_block.saturating_add(MAX_LOG_RANGE - 1))))
}

/// Encode a DON identifier such as `fun-ethereum-sepolia-1` as bytes32
pub fn don_id_from_str(don: &str) -> Result<H256> {
    let raw = don.as_bytes();
    if raw.is_empty() || raw.len() > 32 {
        return Err(anyhow!("DON id must be 1..=32 bytes, got {}", raw.len()));
    }
    let mut out = [0u8; 32];
    out[..raw.len()].copy_from_slice(raw);
    Ok(H256(out))
}

/// Invoice NFT contract acting as the Functions consumer
#[derive(Clone)]
pub struct ConsumerClient {
    contract: InvoiceConsumer<Client>,
}

impl ConsumerClient {
    pub fn new(contract_addr: Address, client: Arc<Client>) -> Self {
        let contract = InvoiceConsumer::new(contract_addr, client);
        Self { contract }
    }

    pub fn address(&self) -> Address {
        self.contract.address()
    }

    /// Submit an encoded request, returning the router-assigned request id
    pub async fn send_request(
        &self,
        request: Bytes,
        subscription_id: u64,
        gas_limit: u32,
        don_id: H256,
    ) -> Result<H256> {
        let receipt = self.contract
            .send_request(request, subscription_id, gas_limit, don_id.0)
            .send()
            .await?
            .await?
            .ok_or_else(|| anyhow!("sendRequest transaction dropped"))?;

        for log in receipt.logs {
            if log.address != self.contract.address() {
                continue;
            }
            if let Ok(event) = parse_log::<RequestSentFilter>(log) {
                return Ok(H256(event.id));
            }
        }

        Err(anyhow!("no RequestSent event in {:?}", receipt.transaction_hash))
    }

    /// Mint an invoice NFT, returning the new token id
    pub async fn mint_invoice(
        &self,
        amount: U256,
        due_date: u64,
        payer: Address,
    ) -> Result<U256> {
        let receipt = self.contract
            .mint_invoice(amount, U256::from(due_date), payer)
            .send()
            .await?
            .await?
            .ok_or_else(|| anyhow!("mintInvoice transaction dropped"))?;

        for log in receipt.logs {
            if let Ok(event) = parse_log::<TransferFilter>(log) {
                if event.from == Address::zero() {
                    return Ok(event.token_id);
                }
            }
        }

        Err(anyhow!("no mint Transfer event in {:?}", receipt.transaction_hash))
    }
}

/// Functions router: subscriptions, cost estimation and fulfillment events
#[derive(Clone)]
pub struct RouterClient {
    contract: FunctionsRouter<Client>,
    client: Arc<Client>,
    address: Address,
}

impl RouterClient {
    pub fn new(router_addr: Address, client: Arc<Client>) -> Self {
        let contract = FunctionsRouter::new(router_addr, client.clone());
        Self { contract, client, address: router_addr }
    }

    /// Read subscription balance and consumer list
    pub async fn get_subscription(&self, subscription_id: u64) -> Result<SubscriptionInfo> {
        let calldata = [
            &ethers::utils::id("getSubscription(uint64)")[0..4],
            &encode(&[Token::Uint(U256::from(subscription_id))])[..],
        ].concat();

        let result = self.client
            .call(&TransactionRequest::new().to(self.address).data(calldata).into(), None)
            .await?;

        // Subscription struct: uint96 balance, address owner, uint96 blockedBalance,
        // address proposedOwner, address[] consumers, bytes32 flags
        let decoded = decode(&[ParamType::Tuple(vec![
            ParamType::Uint(96),
            ParamType::Address,
            ParamType::Uint(96),
            ParamType::Address,
            ParamType::Array(Box::new(ParamType::Address)),
            ParamType::FixedBytes(32),
        ])], &result)?;

        let fields = decoded
            .into_iter()
            .next()
            .and_then(Token::into_tuple)
            .ok_or_else(|| anyhow!("malformed getSubscription response"))?;
        let field = |i: usize| {
            fields.get(i).cloned().ok_or_else(|| anyhow!("missing subscription field {}", i))
        };

        let balance = field(0)?.into_uint().ok_or_else(|| anyhow!("balance not uint"))?;
        let owner = field(1)?.into_address().ok_or_else(|| anyhow!("owner not address"))?;
        let blocked_balance = field(2)?.into_uint().ok_or_else(|| anyhow!("blockedBalance not uint"))?;
        let consumers = field(4)?
            .into_array()
            .ok_or_else(|| anyhow!("consumers not array"))?
            .into_iter()
            .filter_map(Token::into_address)
            .collect();

        Ok(SubscriptionInfo {
            subscription_id,
            owner,
            balance,
            blocked_balance,
            consumers,
        })
    }

    /// Ask the DON's coordinator for the juels a request would commit
    pub async fn estimate_cost(
        &self,
        subscription_id: u64,
        request: Bytes,
        gas_limit: u32,
        don_id: H256,
    ) -> Result<U256> {
        let coordinator_addr = self.contract.get_contract_by_id(don_id.0).call().await?;
        let coordinator = FunctionsCoordinator::new(coordinator_addr, self.client.clone());
        let gas_price = self.client.get_gas_price().await?;

        let cost = coordinator
            .estimate_cost(subscription_id, request, gas_limit, gas_price)
            .call()
            .await?;

        Ok(U256::from(cost))
    }

    pub async fn block_number(&self) -> Result<u64> {
        Ok(self.client.get_block_number().await?.as_u64())
    }

    /// Fulfillment events from `from_block`, at most `MAX_LOG_RANGE` blocks
    /// and never past the current head.
    ///
    /// Returns the events and the next block to query.
    pub async fn processed_since(&self, from_block: u64) -> Result<(Vec<ProcessedEvent>, u64)> {
        let head = self.block_number().await?;
        let Some((from, to)) = log_window(from_block, head) else {
            return Ok((vec![], from_block));
        };

        let logs = self.contract
            .event::<RequestProcessedFilter>()
            .from_block(from)
            .to_block(to)
            .query_with_meta()
            .await?;

        let events = logs
            .into_iter()
            .map(|(event, meta)| ProcessedEvent {
                request_id: H256(event.request_id),
                subscription_id: event.subscription_id,
                result_code: event.result_code,
                response: event.response.to_vec(),
                err: event.err.to_vec(),
                block_number: meta.block_number.as_u64(),
            })
            .collect();

        Ok((events, to + 1))
    }
}

/// Chainlink AggregatorV3 price feed
#[derive(Clone)]
pub struct PriceFeedClient {
    contract: AggregatorV3<Provider<Http>>,
}

impl PriceFeedClient {
    pub fn new(feed_addr: Address, provider: Arc<Provider<Http>>) -> Self {
        Self { contract: AggregatorV3::new(feed_addr, provider) }
    }

    pub async fn latest(&self) -> Result<PriceSample> {
        let (round_id, answer, _started_at, updated_at, _answered_in_round) =
            self.contract.latest_round_data().call().await?;
        let decimals = self.contract.decimals().call().await?;

        Ok(PriceSample {
            round_id,
            answer,
            decimals,
            updated_at: updated_at.low_u64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_window_is_capped() {
        assert_eq!(log_window(100, 50), None);
        assert_eq!(log_window(100, 100), Some((100, 100)));
        assert_eq!(log_window(100, 150), Some((100, 150)));
        assert_eq!(log_window(0, 19_000_000), Some((0, MAX_LOG_RANGE - 1)));
        assert_eq!(log_window(u64::MAX, u64::MAX), Some((u64::MAX, u64::MAX)));
    }

    #[test]
    fn test_parse_address() {
        let addr = parse_address("0x5FbDB2315678afecb367f032d93F642f64180aa3").unwrap();
        assert_eq!(format!("{:?}", addr), "0x5fbdb2315678afecb367f032d93f642f64180aa3");
        assert!(parse_address("5FbDB2315678afecb367f032d93F642f64180aa3").is_err());
        assert!(parse_address("0x5FbDB2315678afecb367f032d93F642f64180aa").is_err());
        assert!(parse_address("0xZZbDB2315678afecb367f032d93F642f64180aa3").is_err());
    }

    #[test]
    fn test_don_id_padding() {
        let id = don_id_from_str("fun-ethereum-sepolia-1").unwrap();
        assert_eq!(&id.0[..22], b"fun-ethereum-sepolia-1");
        assert!(id.0[22..].iter().all(|b| *b == 0));
        assert!(don_id_from_str("").is_err());
    }
}
