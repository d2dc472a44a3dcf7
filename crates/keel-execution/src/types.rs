//! Validated order intent.

use crate::idempotency::{derive_client_order_id, KeyParams, MAX_CLIENT_ORDER_ID_LEN};
use chrono::{DateTime, Utc};
use keel_schemas::{OrderType, Side, TimeInForce};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// IntentError
// ---------------------------------------------------------------------------

/// A malformed intent, rejected at construction.
#[derive(Debug, Clone, PartialEq)]
pub enum IntentError {
    EmptySymbol,
    /// Quantity must be strictly positive and finite.
    BadQuantity { quantity: f64 },
    /// LIMIT orders require a price.
    MissingPrice,
    /// Price must be strictly positive and finite when present.
    BadPrice { price: f64 },
    /// MARKET orders must not carry a price: the venue prices them, and a
    /// stray price would still alter the derived client_order_id.
    UnexpectedPrice,
    /// Derived id exceeds the venue's client-order-id ceiling.
    IdTooLong { len: usize },
}

impl std::fmt::Display for IntentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptySymbol => write!(f, "intent invalid: symbol must not be empty"),
            Self::BadQuantity { quantity } => write!(
                f,
                "intent invalid: quantity must be positive and finite, got {quantity}"
            ),
            Self::MissingPrice => write!(f, "intent invalid: LIMIT order requires a price"),
            Self::BadPrice { price } => write!(
                f,
                "intent invalid: price must be positive and finite, got {price}"
            ),
            Self::UnexpectedPrice => {
                write!(f, "intent invalid: MARKET order must not carry a price")
            }
            Self::IdTooLong { len } => write!(
                f,
                "intent invalid: derived client_order_id length {len} exceeds {MAX_CLIENT_ORDER_ID_LEN}"
            ),
        }
    }
}

impl std::error::Error for IntentError {}

// ---------------------------------------------------------------------------
// OrderIntent
// ---------------------------------------------------------------------------

/// A fully-specified order the caller intends to submit.
///
/// Constructed once via [`OrderIntent::new`] and never mutated: the
/// `client_order_id` is derived from the other fields at construction, so
/// mutating any of them afterwards would silently desynchronize the key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    /// Opaque caller payload, journaled verbatim.
    pub metadata: Value,
    pub nonce: Option<String>,
    /// Deterministic idempotency key; see [`crate::derive_client_order_id`].
    pub client_order_id: String,
}

impl OrderIntent {
    /// Validate parameters and derive the idempotency key.
    ///
    /// # Errors
    /// [`IntentError`] on any malformed parameter; nothing is journaled for
    /// a rejected intent.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
        time_in_force: TimeInForce,
        session_id: impl Into<String>,
        nonce: Option<String>,
        metadata: Value,
    ) -> Result<Self, IntentError> {
        let symbol = symbol.into();
        let session_id = session_id.into();

        if symbol.trim().is_empty() {
            return Err(IntentError::EmptySymbol);
        }
        if !(quantity.is_finite() && quantity > 0.0) {
            return Err(IntentError::BadQuantity { quantity });
        }
        match (order_type, price) {
            (OrderType::Limit, None) => return Err(IntentError::MissingPrice),
            (OrderType::Market, Some(_)) => return Err(IntentError::UnexpectedPrice),
            (_, Some(p)) if !(p.is_finite() && p > 0.0) => {
                return Err(IntentError::BadPrice { price: p })
            }
            _ => {}
        }

        let client_order_id = derive_client_order_id(&KeyParams {
            symbol: &symbol,
            side,
            order_type,
            quantity,
            price,
            time_in_force,
            session_id: &session_id,
            nonce: nonce.as_deref(),
        });
        if client_order_id.len() > MAX_CLIENT_ORDER_ID_LEN {
            return Err(IntentError::IdTooLong {
                len: client_order_id.len(),
            });
        }

        Ok(Self {
            symbol,
            side,
            order_type,
            quantity,
            price,
            time_in_force,
            session_id,
            created_at: Utc::now(),
            metadata,
            nonce,
            client_order_id,
        })
    }

    /// The derivation parameters of this intent, for key re-verification.
    pub fn key_params(&self) -> KeyParams<'_> {
        KeyParams {
            symbol: &self.symbol,
            side: self.side,
            order_type: self.order_type,
            quantity: self.quantity,
            price: self.price,
            time_in_force: self.time_in_force,
            session_id: &self.session_id,
            nonce: self.nonce.as_deref(),
        }
    }
}
