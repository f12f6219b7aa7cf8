mod common;

use common::*;
use ethers::types::{H256, U256};
use invoice_oracle::{
    InvoiceOracle, InvoiceState, Job, JobOutcome, OracleConfig, OracleStore, Outbox,
};
use std::sync::atomic::Ordering;

fn register(token: u64) -> Job {
    Job::Register {
        token_id: U256::from(token),
        amount: U256::from(1000) * U256::exp10(18),
        amount_decimals: 18,
        due_date: NOW + DAY,
        payer: payer(),
        owner: owner(),
        minted_at: NOW,
    }
}

fn verify(token: u64) -> Job {
    Job::Verify {
        token_id: U256::from(token),
        subscription_id: SUBSCRIPTION,
        don_id: H256::repeat_byte(0x66),
        gas_limit: 300_000,
        secrets: None,
    }
}

#[tokio::test]
async fn test_jobs_reach_the_process_holding_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("oracle-db");
    let db = db.to_str().unwrap();

    let watcher = InvoiceOracle::open(db, OracleConfig::default()).unwrap();
    assert!(OracleStore::open(db).is_err(), "store is exclusive to one opener");

    // a separate command only touches the spool
    let requester = Outbox::open(dir.path().join("outbox")).unwrap();
    requester.submit(register(1), NOW).unwrap();
    requester.submit(verify(1), NOW).unwrap();

    let outbox = Outbox::open(dir.path().join("outbox")).unwrap();
    let router = MockRouter::new();
    let outcomes = watcher.drain_outbox(&outbox, &MockLedger::funded(), &router, NOW + 5).await.unwrap();

    assert_eq!(outcomes.len(), 2);
    assert!(matches!(&outcomes[0], JobOutcome::Registered(invoice) if invoice.token_id == U256::from(1)));
    let JobOutcome::Dispatched(receipt) = &outcomes[1] else { panic!("expected dispatch") };

    assert_eq!(router.submissions(), 1);
    assert_eq!(watcher.invoice(U256::from(1)).unwrap().pending_request, Some(receipt.request_id));
    assert!(outbox.pending().unwrap().is_empty());
}

#[tokio::test]
async fn test_transport_failure_keeps_jobs_queued_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let oracle = oracle();
    let outbox = Outbox::open(dir.path()).unwrap();
    outbox.submit(register(1), NOW).unwrap();
    outbox.submit(verify(1), NOW).unwrap();
    outbox.submit(register(2), NOW).unwrap();

    let ledger = MockLedger::funded();
    ledger.outages.store(1, Ordering::SeqCst);
    let router = MockRouter::new();

    let first = oracle.drain_outbox(&outbox, &ledger, &router, NOW).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(outbox.pending().unwrap().len(), 2);
    assert!(oracle.invoice(U256::from(2)).is_err());
    assert_eq!(router.submissions(), 0);

    let second = oracle.drain_outbox(&outbox, &ledger, &router, NOW + 1).await.unwrap();
    assert_eq!(second.len(), 2);
    assert!(outbox.pending().unwrap().is_empty());
    assert_eq!(router.submissions(), 1);
    assert_eq!(oracle.invoice(U256::from(2)).unwrap().state, InvoiceState::Pending);
}

#[tokio::test]
async fn test_hopeless_jobs_retired() {
    let dir = tempfile::tempdir().unwrap();
    let oracle = oracle();
    let outbox = Outbox::open(dir.path()).unwrap();
    let router = MockRouter::new();

    outbox.submit(verify(9), NOW).unwrap();
    outbox.submit(register(1), NOW).unwrap();
    outbox.submit(register(1), NOW).unwrap();
    outbox.submit(verify(1), NOW).unwrap();
    outbox.submit(verify(1), NOW).unwrap();

    let outcomes = oracle.drain_outbox(&outbox, &MockLedger::funded(), &router, NOW).await.unwrap();

    // unknown invoice and the second verification are retired; a repeated
    // registration is harmless
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outbox.failed().unwrap().len(), 2);
    assert!(outbox.pending().unwrap().is_empty());
    assert_eq!(router.submissions(), 1);
}
