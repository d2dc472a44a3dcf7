//! Scenario: Timeout → Reconcile → Exactly One Fill
//!
//! The full safety path end to end: a submission whose outcome was never
//! observed is quarantined, resolved through the venue lookup, and the
//! resulting execution is recorded exactly once even when `record` is
//! invoked redundantly for the same trade id.

use keel_execution::{Outbox, OutboxStatus};
use keel_fills::FillsLedger;
use keel_reconcile::{ReconcileAction, Reconciler};
use keel_schemas::Side;
use keel_testkit::{fill_event, limit_intent, session_id, MockVenue, TestJournals};

#[test]
fn timeout_then_reconcile_records_fill_exactly_once() {
    let journals = TestJournals::new().unwrap();
    let mut outbox = Outbox::open(journals.outbox_path()).unwrap();
    let mut fills = FillsLedger::open(journals.fills_path()).unwrap();

    // Intent is durable before any send is attempted.
    let session = session_id();
    let intent = limit_intent("BTCUSDT", Side::Buy, 0.05, 50_000.0, &session);
    let id = intent.client_order_id.clone();
    outbox.prepare(intent).unwrap();
    outbox.commit(&id).unwrap();

    // The send times out: no response was received at all.
    outbox.unknown(&id, "timeout after 5000ms").unwrap();
    assert_eq!(outbox.get(&id).unwrap().status, OutboxStatus::Unknown);

    // The venue actually executed the order.
    let venue = MockVenue::new().script_filled(&id, 0.05, 50_000.0, "784321");
    let reconciler = Reconciler::new(&venue);
    let outcome = reconciler
        .reconcile_one(&mut outbox, &id, "BTCUSDT")
        .unwrap();

    assert_eq!(outcome.action, ReconcileAction::Filled);
    assert!(!outcome.can_retry);
    assert_eq!(outbox.get(&id).unwrap().status, OutboxStatus::Filled);
    // Exactly one venue lookup for the attempt.
    assert_eq!(venue.query_count(&id), 1);

    // The caller turns the reconciled ack into a fill record. Recording it
    // twice (sync-ack path + reconcile path racing) must keep one fill.
    let ack = outcome.ack.unwrap();
    let trade_id = ack.raw["tradeId"].as_str().unwrap();
    let fill = fill_event(
        trade_id,
        &id,
        "BTCUSDT",
        Side::Buy,
        ack.filled_qty,
        ack.avg_price.unwrap(),
    );

    assert!(fills.record(fill.clone()).unwrap().is_some());
    assert!(fills.record(fill).unwrap().is_none());
    assert_eq!(fills.fill_count(), 1);
    assert!((fills.total_filled_qty(&id) - 0.05).abs() < 1e-12);
}

#[test]
fn venue_silence_is_the_only_green_light_for_retry() {
    let journals = TestJournals::new().unwrap();
    let mut outbox = Outbox::open(journals.outbox_path()).unwrap();

    let session = session_id();
    let intent = limit_intent("ETHUSDT", Side::Sell, 1.0, 3_000.0, &session);
    let id = intent.client_order_id.clone();
    outbox.prepare(intent).unwrap();
    outbox.commit(&id).unwrap();
    outbox.unknown(&id, "connection reset").unwrap();

    let venue = MockVenue::new().script_not_found(&id);
    let outcome = Reconciler::new(&venue)
        .reconcile_one(&mut outbox, &id, "ETHUSDT")
        .unwrap();

    assert_eq!(outcome.action, ReconcileAction::NotFound);
    assert!(outcome.can_retry);
    // The entry itself is untouched; failing it out and re-preparing is the
    // caller's explicit decision, not the reconciler's.
    assert_eq!(outbox.get(&id).unwrap().status, OutboxStatus::Unknown);
}
