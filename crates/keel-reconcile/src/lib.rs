//! Read-your-writes reconciliation for quarantined (UNKNOWN) submissions.
//!
//! # Protocol
//!
//! When a submission's outcome is indeterminate — timeout, 5xx, connection
//! reset — the order sits quarantined in the outbox as UNKNOWN. Blindly
//! retrying the submission could double-execute; silently dropping it could
//! lose an order. The only safe move is to ask the venue what it saw for
//! our idempotency key:
//!
//! - the venue knows the order → record the real outcome via
//!   [`Outbox::reconciled`]; the original submission must never be retried;
//! - the venue has never seen the key → the request never arrived, and
//!   resubmission is declared safe (`can_retry`). This is the ONLY path
//!   that permits a retry;
//! - the lookup itself fails → the entry stays quarantined untouched;
//!   reconciliation (not the order) may be retried later.
//!
//! The venue lookup is a caller-supplied capability ([`VenueQuery`]); this
//! crate issues no network calls of its own and queries at most once per
//! reconciliation attempt.

use keel_execution::{Outbox, OutboxError, OutboxStatus};
use keel_schemas::{AckStatus, OrderAck};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// VenueQuery capability
// ---------------------------------------------------------------------------

/// An order record as returned by the venue's order-lookup endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VenueOrder {
    pub status: AckStatus,
    pub executed_qty: f64,
    pub avg_price: Option<f64>,
    /// Raw venue response, kept verbatim for audit.
    pub raw: Value,
}

impl VenueOrder {
    /// Reinterpret the venue record as an acknowledgement.
    pub fn to_ack(&self) -> OrderAck {
        OrderAck::new(
            self.status,
            self.executed_qty,
            self.avg_price,
            self.raw.clone(),
        )
    }
}

/// Venue-side idempotent order lookup, supplied by the caller.
///
/// `Ok(None)` means the venue has no order for this `client_order_id`.
/// Implementations own all transport concerns (HTTP, signing, deadlines).
pub trait VenueQuery {
    fn query_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<VenueOrder>, Box<dyn std::error::Error>>;
}

impl<Q: VenueQuery + ?Sized> VenueQuery for &Q {
    fn query_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<VenueOrder>, Box<dyn std::error::Error>> {
        (**self).query_order(symbol, client_order_id)
    }
}

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// How a reconciliation attempt classified one entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileAction {
    /// No outbox entry for the id, or the venue has never seen the key.
    NotFound,
    /// The entry was not UNKNOWN; nothing to reconcile. Idempotent no-op.
    AlreadyResolved,
    /// Venue reported a live order; outbox moved to RECONCILED.
    Confirmed,
    /// Venue reported a complete execution; outbox moved to FILLED.
    Filled,
    /// Venue reported the order dead; outbox moved to FAILED.
    Canceled,
    /// The venue lookup failed; the entry remains quarantined.
    StillUnknown,
}

/// Result of reconciling a single entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub client_order_id: String,
    pub action: ReconcileAction,
    /// `true` only when the venue confirmed it never saw the key — the one
    /// condition under which resubmission is safe.
    pub can_retry: bool,
    /// The ack derived from the venue record, when one was obtained.
    pub ack: Option<OrderAck>,
    /// Operator-facing context (lookup error text, venue status).
    pub detail: Option<String>,
}

impl ReconcileOutcome {
    fn new(client_order_id: &str, action: ReconcileAction) -> Self {
        Self {
            client_order_id: client_order_id.to_string(),
            action,
            can_retry: false,
            ack: None,
            detail: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Resolves UNKNOWN outbox entries through a venue lookup capability.
pub struct Reconciler<Q: VenueQuery> {
    venue: Q,
}

impl<Q: VenueQuery> Reconciler<Q> {
    pub fn new(venue: Q) -> Self {
        Self { venue }
    }

    /// Reconcile one entry. Queries the venue at most once.
    ///
    /// # Errors
    /// Only journal/state failures from [`Outbox::reconciled`] propagate;
    /// a failed venue lookup is contained as a `StillUnknown` outcome with
    /// the outbox untouched.
    pub fn reconcile_one(
        &self,
        outbox: &mut Outbox,
        client_order_id: &str,
        symbol: &str,
    ) -> Result<ReconcileOutcome, OutboxError> {
        let status = match outbox.get(client_order_id) {
            None => {
                return Ok(ReconcileOutcome::new(
                    client_order_id,
                    ReconcileAction::NotFound,
                ))
            }
            Some(entry) => entry.status,
        };

        if status != OutboxStatus::Unknown {
            let mut outcome =
                ReconcileOutcome::new(client_order_id, ReconcileAction::AlreadyResolved);
            outcome.detail = Some(format!("entry is {status}, not UNKNOWN"));
            return Ok(outcome);
        }

        let venue_order = match self.venue.query_order(symbol, client_order_id) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    client_order_id,
                    error = %e,
                    "venue lookup failed; entry stays quarantined"
                );
                let mut outcome =
                    ReconcileOutcome::new(client_order_id, ReconcileAction::StillUnknown);
                outcome.detail = Some(e.to_string());
                return Ok(outcome);
            }
        };

        match venue_order {
            None => {
                // The venue never saw our key: the request never arrived.
                // Resubmission is safe; the outbox entry is left untouched
                // so the caller can re-prepare after failing it out.
                tracing::info!(client_order_id, "venue has no order for key; retry is safe");
                let mut outcome = ReconcileOutcome::new(client_order_id, ReconcileAction::NotFound);
                outcome.can_retry = true;
                Ok(outcome)
            }
            Some(order) => {
                let ack = order.to_ack();
                let entry = outbox.reconciled(client_order_id, ack.clone())?;

                let action = match entry.status {
                    OutboxStatus::Filled => ReconcileAction::Filled,
                    OutboxStatus::Failed => ReconcileAction::Canceled,
                    _ => ReconcileAction::Confirmed,
                };
                tracing::info!(
                    client_order_id,
                    venue_status = %ack.status,
                    outbox_status = %entry.status,
                    "quarantined entry resolved"
                );

                let mut outcome = ReconcileOutcome::new(client_order_id, action);
                outcome.ack = Some(ack);
                outcome.detail = Some(format!("venue reported {}", entry.status));
                Ok(outcome)
            }
        }
    }

    /// Reconcile every currently-UNKNOWN entry.
    ///
    /// A failed venue lookup on one entry is contained as its own
    /// `StillUnknown` outcome and never blocks the rest. Journal failures
    /// abort the sweep: durability errors cannot be papered over.
    pub fn reconcile_all(&self, outbox: &mut Outbox) -> Result<Vec<ReconcileOutcome>, OutboxError> {
        let targets: Vec<(String, String)> = outbox
            .get_unknown()
            .into_iter()
            .map(|e| (e.client_order_id.clone(), e.intent.symbol.clone()))
            .collect();

        let mut outcomes = Vec::with_capacity(targets.len());
        for (id, symbol) in targets {
            outcomes.push(self.reconcile_one(outbox, &id, &symbol)?);
        }
        Ok(outcomes)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
