mod common;

use common::*;
use ethers::types::U256;
use invoice_oracle::codec::encode;
use invoice_oracle::{
    DecodedValue, FulfillmentCode, FulfillmentResult, InvoiceEvent, InvoiceState, OracleError, Outcome,
    RejectionReason, Settlement,
};

async fn dispatched(oracle: &invoice_oracle::InvoiceOracle, token: u64) -> ethers::types::H256 {
    let invoice = mint(oracle, token);
    let request = request_for(oracle, &invoice);
    oracle
        .request_verification(&request, &MockLedger::funded(), &MockRouter::new(), NOW)
        .await
        .unwrap()
        .request_id
}

#[tokio::test]
async fn test_paid_invoice_verifies() {
    let oracle = oracle();
    let id = dispatched(&oracle, 1).await;

    let invoice = oracle.invoice(U256::from(1)).unwrap();
    assert_eq!(invoice.state, InvoiceState::Pending);
    assert_eq!(invoice.payer, payer());
    assert_eq!(invoice.amount, U256::from(1000) * U256::exp10(18));
    assert_eq!(oracle.invoice(U256::from(1)).unwrap().pending_request, Some(id));

    let settled = oracle
        .handle_fulfillment(&FulfillmentResult::success(id, encode(&DecodedValue::Bool(true))), NOW + 60)
        .unwrap();

    assert!(matches!(settled, Settlement::Applied { event: InvoiceEvent::Verified, .. }));
    let invoice = oracle.invoice(U256::from(1)).unwrap();
    assert_eq!(invoice.state, InvoiceState::Verified);
    assert_eq!(invoice.pending_request, None);
}

#[tokio::test]
async fn test_unpaid_invoice_rejected() {
    let oracle = oracle();
    let id = dispatched(&oracle, 1).await;

    oracle
        .handle_fulfillment(&FulfillmentResult::success(id, encode(&DecodedValue::Bool(false))), NOW + 60)
        .unwrap();

    let invoice = oracle.invoice(U256::from(1)).unwrap();
    assert_eq!(invoice.state, InvoiceState::Rejected);
    assert_eq!(invoice.rejection, Some(RejectionReason::NotPaid));
}

#[tokio::test]
async fn test_overdue_invoice_expires_and_late_answer_is_ignored() {
    let oracle = oracle();
    let id = dispatched(&oracle, 1).await;

    assert!(oracle.expire_overdue(NOW + DAY - 1).unwrap().is_empty());
    assert_eq!(oracle.expire_overdue(NOW + DAY).unwrap(), vec![U256::from(1)]);
    assert_eq!(oracle.invoice(U256::from(1)).unwrap().state, InvoiceState::Expired);

    let settled = oracle
        .handle_fulfillment(&FulfillmentResult::success(id, encode(&DecodedValue::Bool(true))), NOW + DAY + 5)
        .unwrap();
    assert!(matches!(
        settled,
        Settlement::Applied { event: InvoiceEvent::AlreadyFinalized(InvoiceState::Expired), .. }
    ));
    assert_eq!(oracle.invoice(U256::from(1)).unwrap().state, InvoiceState::Expired);

    // second sweep finds nothing left to expire
    assert!(oracle.expire_overdue(NOW + DAY + 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_user_error_rejects_with_oracle_failure() {
    let oracle = oracle();
    let id = dispatched(&oracle, 1).await;

    let settled = oracle
        .handle_fulfillment(&FulfillmentResult::failure(id, FulfillmentCode::UserError, "payments API 500"), NOW + 60)
        .unwrap();

    let Settlement::Applied { outcome, .. } = settled else { panic!("expected settlement") };
    assert!(matches!(outcome, Outcome::OracleFailure { code: FulfillmentCode::UserError, .. }));

    let invoice = oracle.invoice(U256::from(1)).unwrap();
    assert_eq!(invoice.state, InvoiceState::Rejected);
    assert_eq!(
        invoice.rejection,
        Some(RejectionReason::OracleFailure {
            code: FulfillmentCode::UserError,
            message: "payments API 500".to_string()
        })
    );
}

#[tokio::test]
async fn test_malformed_result_holds_invoice_for_review() {
    let oracle = oracle();
    let router = MockRouter::new();
    let request = request_for(&oracle, &mint(&oracle, 1));
    let id = oracle
        .request_verification(&request, &MockLedger::funded(), &router, NOW)
        .await
        .unwrap()
        .request_id;

    let settled = oracle
        .handle_fulfillment(&FulfillmentResult::success(id, vec![1]), NOW + 60)
        .unwrap();
    let Settlement::Applied { outcome, event, .. } = settled else { panic!("expected settlement") };
    assert!(matches!(outcome, Outcome::Malformed(_)));
    assert!(matches!(event, InvoiceEvent::Quarantined { .. }));

    let invoice = oracle.invoice(U256::from(1)).unwrap();
    assert_eq!(invoice.state, InvoiceState::Pending);
    assert!(invoice.needs_review);
    assert_eq!(invoice.pending_request, None);

    // no new requests until an operator clears the hold
    let err = oracle
        .request_verification(&request, &MockLedger::funded(), &router, NOW + 120)
        .await
        .unwrap_err();
    assert!(matches!(err, OracleError::UnderReview(_)));

    let cleared = oracle.resolve_review(U256::from(1), NOW + 180).unwrap();
    assert!(!cleared.needs_review);
    assert!(matches!(oracle.resolve_review(U256::from(1), NOW + 181), Err(OracleError::NotUnderReview(_))));

    let retry = oracle
        .request_verification(&request, &MockLedger::funded(), &router, NOW + 240)
        .await
        .unwrap();
    assert_ne!(retry.request_id, id);
}

#[tokio::test]
async fn test_verified_invoice_appraised() {
    let oracle = oracle();
    let id = dispatched(&oracle, 1).await;

    let feed = par_feed(NOW);
    assert!(matches!(
        oracle.appraise(U256::from(1), &feed, NOW + 10).await,
        Err(OracleError::NotVerified { state: InvoiceState::Pending, .. })
    ));

    oracle
        .handle_fulfillment(&FulfillmentResult::success(id, encode(&DecodedValue::Bool(true))), NOW + 60)
        .unwrap();

    let valuation = oracle.appraise(U256::from(1), &feed, NOW + 120).await.unwrap();
    assert_eq!(valuation.value, U256::from(1000) * U256::exp10(18));
    assert_eq!(oracle.invoice(U256::from(1)).unwrap().valuation, Some(valuation));

    let stale = par_feed(NOW - 7200);
    assert!(matches!(
        oracle.appraise(U256::from(1), &stale, NOW + 120).await,
        Err(OracleError::StalePriceFeed { .. })
    ));
}

#[test]
fn test_mint_validation() {
    let oracle = oracle();
    mint(&oracle, 1);

    assert!(matches!(
        oracle.mint(U256::from(1), U256::from(5), 18, NOW + DAY, payer(), owner(), NOW),
        Err(OracleError::InvoiceExists(_))
    ));
    assert!(matches!(
        oracle.mint(U256::from(2), U256::zero(), 18, NOW + DAY, payer(), owner(), NOW),
        Err(OracleError::InvalidRequestConfig(_))
    ));
    assert!(matches!(
        oracle.mint(U256::from(3), U256::from(5), 18, NOW, payer(), owner(), NOW),
        Err(OracleError::InvalidRequestConfig(_))
    ));
    assert!(matches!(oracle.invoice(U256::from(9)), Err(OracleError::UnknownInvoice(_))));
}
