//! Shared domain vocabulary for the keel execution safety layer.
//!
//! Types here cross the journal boundary, so everything derives
//! `Serialize`/`Deserialize` and uses the venue's SCREAMING_CASE status
//! strings on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Order side.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type. `Limit` requires a price at intent construction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

/// Time-in-force.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeInForce {
    #[serde(rename = "GTC")]
    Gtc,
    #[serde(rename = "IOC")]
    Ioc,
    #[serde(rename = "FOK")]
    Fok,
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeInForce::Gtc => write!(f, "GTC"),
            TimeInForce::Ioc => write!(f, "IOC"),
            TimeInForce::Fok => write!(f, "FOK"),
        }
    }
}

/// Venue order status vocabulary as reported in acknowledgements and
/// order-lookup responses.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckStatus {
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "PARTIALLY_FILLED")]
    PartiallyFilled,
    #[serde(rename = "FILLED")]
    Filled,
    #[serde(rename = "CANCELED")]
    Canceled,
    #[serde(rename = "REJECTED")]
    Rejected,
    #[serde(rename = "EXPIRED")]
    Expired,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl AckStatus {
    /// Statuses that mean the venue will never execute this order (beyond
    /// whatever already filled).
    pub fn is_dead(&self) -> bool {
        matches!(
            self,
            AckStatus::Canceled | AckStatus::Rejected | AckStatus::Expired
        )
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AckStatus::New => "NEW",
            AckStatus::PartiallyFilled => "PARTIALLY_FILLED",
            AckStatus::Filled => "FILLED",
            AckStatus::Canceled => "CANCELED",
            AckStatus::Rejected => "REJECTED",
            AckStatus::Expired => "EXPIRED",
            AckStatus::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// The venue's response to a submission attempt.
///
/// An ack is a *hint* about what happened — it is never authoritative for
/// execution fact. Only [`FillEvent`] records are.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub status: AckStatus,
    pub filled_qty: f64,
    pub avg_price: Option<f64>,
    /// Raw venue response, kept verbatim for audit.
    pub raw: Value,
}

impl OrderAck {
    pub fn new(status: AckStatus, filled_qty: f64, avg_price: Option<f64>, raw: Value) -> Self {
        Self {
            status,
            filled_qty,
            avg_price,
            raw,
        }
    }
}

/// One actual execution, keyed by the venue's globally unique trade id.
///
/// The only authoritative record of execution. Immutable, append-only,
/// deduplicated by `fill_id` in the fills ledger. Venue-side trade
/// amendments are out of scope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    /// Venue trade id — globally unique, the dedup key.
    pub fill_id: String,
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub commission: f64,
    pub commission_asset: String,
    pub trade_time: DateTime<Utc>,
    pub is_maker: bool,
}

impl FillEvent {
    /// Notional value of this fill (`price * qty`).
    pub fn notional(&self) -> f64 {
        self.price * self.qty
    }
}
