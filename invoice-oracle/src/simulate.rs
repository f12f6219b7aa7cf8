use async_trait::async_trait;
use ethers::types::H256;
use tracing::debug;

use crate::builder::ComputeRequest;
use crate::config::OracleConfig;
use crate::listener::{interpret, FulfillmentCode, FulfillmentResult, Outcome};

/// Local stand-in for the DON's script engine
#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    /// Run `source`, returning the raw result bytes or the script's error message
    async fn run(&self, source: &str, args: &[String]) -> Result<Vec<u8>, String>;
}

#[async_trait]
impl<F> ScriptRuntime for F
where
    F: Fn(&str, &[String]) -> Result<Vec<u8>, String> + Send + Sync,
{
    async fn run(&self, source: &str, args: &[String]) -> Result<Vec<u8>, String> {
        self(source, args)
    }
}

/// Dry-run `request` and read its output exactly as a real callback would be read
pub async fn simulate(request: &ComputeRequest, runtime: &dyn ScriptRuntime, config: &OracleConfig) -> Outcome {
    let result = match runtime.run(request.source(), request.args()).await {
        Ok(raw) => FulfillmentResult::success(H256::zero(), raw),
        Err(message) => FulfillmentResult::failure(H256::zero(), FulfillmentCode::UserError, message),
    };

    let outcome = interpret(&result, request.return_type(), config.max_response_bytes);
    debug!("Simulated request for invoice {}: {:?}", request.token_id(), outcome);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{RequestBuilder, INVOICE_PAYMENT_SOURCE};
    use crate::codec::{encode, DecodedValue};
    use ethers::types::{Address, U256};
    use invoice_common::SubscriptionInfo;

    fn request() -> ComputeRequest {
        let consumer = Address::repeat_byte(0x01);
        let subscription = SubscriptionInfo {
            subscription_id: 1,
            owner: Address::repeat_byte(0xAA),
            balance: U256::exp10(18),
            blocked_balance: U256::zero(),
            consumers: vec![consumer],
        };
        RequestBuilder::new(U256::from(5), INVOICE_PAYMENT_SOURCE)
            .args(vec!["5".into(), "1000".into(), "0xabc".into()])
            .subscription(1)
            .gas_limit(100_000)
            .don_id(H256::repeat_byte(0x66))
            .build(&subscription, consumer, &OracleConfig::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_simulated_verdict() {
        let paid = |_: &str, args: &[String]| -> Result<Vec<u8>, String> {
            assert_eq!(args[0], "5");
            Ok(encode(&DecodedValue::Bool(true)))
        };

        let outcome = simulate(&request(), &paid, &OracleConfig::default()).await;
        assert_eq!(outcome, Outcome::Answer(DecodedValue::Bool(true)));
    }

    #[tokio::test]
    async fn test_script_error_is_user_error() {
        let failing = |_: &str, _: &[String]| -> Result<Vec<u8>, String> { Err("HTTP 503".to_string()) };

        let outcome = simulate(&request(), &failing, &OracleConfig::default()).await;
        assert_eq!(
            outcome,
            Outcome::OracleFailure { code: FulfillmentCode::UserError, message: "HTTP 503".to_string() }
        );
    }

    #[tokio::test]
    async fn test_bad_output_is_malformed() {
        let chatty = |_: &str, _: &[String]| -> Result<Vec<u8>, String> { Ok(b"yes".to_vec()) };

        let outcome = simulate(&request(), &chatty, &OracleConfig::default()).await;
        assert!(matches!(outcome, Outcome::Malformed(_)));
    }
}
