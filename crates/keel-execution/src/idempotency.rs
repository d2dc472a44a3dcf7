//! Deterministic idempotency-key derivation.
//!
//! # Canonical derivation point
//!
//! Every call-site — first submit or any subsequent retry — must derive the
//! `client_order_id` through [`derive_client_order_id`]. Because the mapping
//! is deterministic (same parameters ⟹ same output), retries automatically
//! reuse the same key, and the venue's duplicate detection does the rest.
//!
//! # Canonicalization
//!
//! Parameters are rendered into a map with fixed short keys; quantity and
//! price are formatted as fixed 8-decimal strings so floating-point
//! formatting differences cannot change the hash; absent optionals are
//! omitted entirely (never serialized as null); the map is serialized with
//! sorted keys and no whitespace; SHA-256 over the UTF-8 bytes; first 35
//! lowercase hex chars; a constant marker character in front brings the
//! total to 36 — the venue's client-order-id ceiling.
//!
//! Known limit: two orders differing only beyond the 8th decimal of
//! quantity or price derive the same key. The target venue quantizes to 8
//! decimals, so such orders cannot both exist.

use keel_schemas::{OrderType, Side, TimeInForce};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Marker character prepended to every derived key.
pub const ID_MARKER: char = 'K';

/// Venue ceiling on client-order-id length. Marker + 35 hex chars == 36.
pub const MAX_CLIENT_ORDER_ID_LEN: usize = 36;

const ID_HEX_LEN: usize = MAX_CLIENT_ORDER_ID_LEN - 1;

/// The order parameters that participate in key derivation.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyParams<'a> {
    pub symbol: &'a str,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub session_id: &'a str,
    /// Caller-supplied disambiguator for otherwise-identical orders.
    pub nonce: Option<&'a str>,
}

/// Derive the deterministic `client_order_id` for the given parameters.
///
/// Pure: identical inputs always yield identical output, and any single
/// differing field yields a different id.
pub fn derive_client_order_id(params: &KeyParams<'_>) -> String {
    let mut fields: BTreeMap<&'static str, String> = BTreeMap::new();
    fields.insert("s", params.symbol.to_string());
    fields.insert("sd", params.side.to_string());
    fields.insert("t", params.order_type.to_string());
    fields.insert("q", format_fixed8(params.quantity));
    if let Some(price) = params.price {
        fields.insert("p", format_fixed8(price));
    }
    fields.insert("tif", params.time_in_force.to_string());
    fields.insert("sid", params.session_id.to_string());
    if let Some(nonce) = params.nonce {
        fields.insert("n", nonce.to_string());
    }

    // BTreeMap serializes in key order; serde_json default is compact.
    let canonical = serde_json::to_string(&fields)
        .unwrap_or_else(|_| unreachable!("string map always serializes"));

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());

    format!("{ID_MARKER}{}", &digest[..ID_HEX_LEN])
}

/// Recompute the key for `params` and compare with `id`.
///
/// For corruption/tamper detection only — never a control-flow primitive.
pub fn verify_client_order_id(id: &str, params: &KeyParams<'_>) -> bool {
    derive_client_order_id(params) == id
}

// Fixed 8-decimal rendering: "0.05" and "0.050000" hash identically.
fn format_fixed8(value: f64) -> String {
    format!("{value:.8}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_params() -> KeyParams<'static> {
        KeyParams {
            symbol: "BTCUSDT",
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity: 0.05,
            price: Some(50_000.0),
            time_in_force: TimeInForce::Gtc,
            session_id: "sess-1",
            nonce: None,
        }
    }

    #[test]
    fn identical_inputs_yield_identical_ids() {
        let a = derive_client_order_id(&base_params());
        let b = derive_client_order_id(&base_params());
        assert_eq!(a, b);
    }

    #[test]
    fn id_shape_matches_venue_ceiling() {
        let id = derive_client_order_id(&base_params());
        assert_eq!(id.len(), MAX_CLIENT_ORDER_ID_LEN);
        assert!(id.starts_with(ID_MARKER));
        assert!(id[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn every_field_participates_in_the_hash() {
        let base = derive_client_order_id(&base_params());

        let mut p = base_params();
        p.symbol = "ETHUSDT";
        assert_ne!(derive_client_order_id(&p), base);

        let mut p = base_params();
        p.side = Side::Sell;
        assert_ne!(derive_client_order_id(&p), base);

        let mut p = base_params();
        p.order_type = OrderType::Market;
        p.price = None;
        assert_ne!(derive_client_order_id(&p), base);

        let mut p = base_params();
        p.quantity = 0.06;
        assert_ne!(derive_client_order_id(&p), base);

        let mut p = base_params();
        p.price = Some(50_001.0);
        assert_ne!(derive_client_order_id(&p), base);

        let mut p = base_params();
        p.time_in_force = TimeInForce::Ioc;
        assert_ne!(derive_client_order_id(&p), base);

        let mut p = base_params();
        p.session_id = "sess-2";
        assert_ne!(derive_client_order_id(&p), base);

        let mut p = base_params();
        p.nonce = Some("1");
        assert_ne!(derive_client_order_id(&p), base);
    }

    #[test]
    fn float_formatting_noise_does_not_change_the_id() {
        let a = derive_client_order_id(&KeyParams {
            quantity: 0.1,
            ..base_params()
        });
        // 0.1 arrived at through arithmetic that would print differently
        // with shortest-round-trip formatting.
        let b = derive_client_order_id(&KeyParams {
            quantity: 0.3 - 0.2,
            ..base_params()
        });
        assert_eq!(a, b);
    }

    #[test]
    fn absent_price_is_omitted_not_null() {
        // A market order with no price and a limit order must differ, but
        // the market key must not embed a "null" rendering of price.
        let market = KeyParams {
            order_type: OrderType::Market,
            price: None,
            ..base_params()
        };
        let id = derive_client_order_id(&market);
        assert_eq!(id.len(), MAX_CLIENT_ORDER_ID_LEN);
        assert!(verify_client_order_id(&id, &market));
    }

    #[test]
    fn verify_matches_only_exact_params() {
        let id = derive_client_order_id(&base_params());
        assert!(verify_client_order_id(&id, &base_params()));

        let mut p = base_params();
        p.quantity = 0.051;
        assert!(!verify_client_order_id(&id, &p));

        assert!(!verify_client_order_id("K0000", &base_params()));
    }
}
