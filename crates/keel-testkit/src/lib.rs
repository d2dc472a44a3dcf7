//! Shared test wiring for the keel crates.
//!
//! Temp journal directories, intent/fill factories, and a scriptable
//! [`MockVenue`] for reconciliation tests. Everything here is test support;
//! nothing is meant for production wiring.

use anyhow::Result;
use chrono::Utc;
use keel_execution::OrderIntent;
use keel_reconcile::{VenueOrder, VenueQuery};
use keel_schemas::{AckStatus, FillEvent, OrderType, Side, TimeInForce};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use tempfile::TempDir;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Temp journals
// ---------------------------------------------------------------------------

/// A temp directory with conventional journal paths, deleted on drop.
pub struct TestJournals {
    dir: TempDir,
}

impl TestJournals {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn outbox_path(&self) -> PathBuf {
        self.dir.path().join("outbox.jsonl")
    }

    pub fn fills_path(&self) -> PathBuf {
        self.dir.path().join("fills.jsonl")
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

// ---------------------------------------------------------------------------
// Factories
// ---------------------------------------------------------------------------

/// Fresh session id per call so tests never collide on derived keys.
pub fn session_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn limit_intent(symbol: &str, side: Side, qty: f64, price: f64, session: &str) -> OrderIntent {
    OrderIntent::new(
        symbol,
        side,
        OrderType::Limit,
        qty,
        Some(price),
        TimeInForce::Gtc,
        session,
        None,
        Value::Null,
    )
    .expect("test intent must be valid")
}

pub fn market_intent(symbol: &str, side: Side, qty: f64, session: &str) -> OrderIntent {
    OrderIntent::new(
        symbol,
        side,
        OrderType::Market,
        qty,
        None,
        TimeInForce::Ioc,
        session,
        None,
        Value::Null,
    )
    .expect("test intent must be valid")
}

pub fn fill_event(
    fill_id: &str,
    client_order_id: &str,
    symbol: &str,
    side: Side,
    qty: f64,
    price: f64,
) -> FillEvent {
    FillEvent {
        fill_id: fill_id.to_string(),
        client_order_id: client_order_id.to_string(),
        exchange_order_id: format!("x-{fill_id}"),
        symbol: symbol.to_string(),
        side,
        price,
        qty,
        commission: 0.0,
        commission_asset: "USDT".to_string(),
        trade_time: Utc::now(),
        is_maker: false,
    }
}

// ---------------------------------------------------------------------------
// MockVenue
// ---------------------------------------------------------------------------

enum Script {
    Found(VenueOrder),
    NotFound,
    Error(String),
}

/// Scriptable [`VenueQuery`] double.
///
/// Responses are keyed by `client_order_id`; unknown ids answer "not found".
/// Query counts are tracked so tests can assert the query-at-most-once
/// contract of the reconciler.
#[derive(Default)]
pub struct MockVenue {
    scripts: HashMap<String, Script>,
    queries: RefCell<HashMap<String, usize>>,
}

impl MockVenue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Venue will report a fully filled order carrying a trade id in `raw`.
    pub fn script_filled(mut self, id: &str, qty: f64, price: f64, trade_id: &str) -> Self {
        self.scripts.insert(
            id.to_string(),
            Script::Found(VenueOrder {
                status: AckStatus::Filled,
                executed_qty: qty,
                avg_price: Some(price),
                raw: json!({
                    "status": "FILLED",
                    "executedQty": format!("{qty:.8}"),
                    "tradeId": trade_id,
                }),
            }),
        );
        self
    }

    /// Venue will report the order with an arbitrary status.
    pub fn script_status(mut self, id: &str, status: AckStatus, executed_qty: f64) -> Self {
        self.scripts.insert(
            id.to_string(),
            Script::Found(VenueOrder {
                status,
                executed_qty,
                avg_price: None,
                raw: json!({"status": status.to_string()}),
            }),
        );
        self
    }

    /// Venue has never seen this key.
    pub fn script_not_found(mut self, id: &str) -> Self {
        self.scripts.insert(id.to_string(), Script::NotFound);
        self
    }

    /// The lookup itself will fail.
    pub fn script_error(mut self, id: &str, message: &str) -> Self {
        self.scripts
            .insert(id.to_string(), Script::Error(message.to_string()));
        self
    }

    /// How many times `query_order` was invoked for `id`.
    pub fn query_count(&self, id: &str) -> usize {
        self.queries.borrow().get(id).copied().unwrap_or(0)
    }
}

impl VenueQuery for MockVenue {
    fn query_order(
        &self,
        _symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<VenueOrder>, Box<dyn std::error::Error>> {
        *self
            .queries
            .borrow_mut()
            .entry(client_order_id.to_string())
            .or_insert(0) += 1;

        match self.scripts.get(client_order_id) {
            Some(Script::Found(order)) => Ok(Some(order.clone())),
            Some(Script::NotFound) | None => Ok(None),
            Some(Script::Error(msg)) => Err(msg.clone().into()),
        }
    }
}
