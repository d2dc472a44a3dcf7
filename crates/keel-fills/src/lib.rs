//! Fills ledger — the sole authoritative record of executions.
//!
//! # Design
//!
//! Acks are hints; fills are facts. Every confirmed execution is appended to
//! the journal exactly once, keyed by the venue's globally unique trade id.
//! Ingestion is idempotent: the same fill may arrive from a synchronous ack
//! and again from a later reconciliation, and only the first append wins.
//! No update or delete operation exists; venue-side trade corrections are a
//! documented limitation, not modeled.
//!
//! Indices (by order, by symbol) are rebuilt from the journal at
//! construction — in-memory state is never trusted across restarts.

use keel_journal::{Journal, JournalError};
use keel_schemas::{FillEvent, Side};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Journal entry type under which fills are persisted.
pub const FILL_ENTRY_TYPE: &str = "fill";

// ---------------------------------------------------------------------------
// FillsError
// ---------------------------------------------------------------------------

/// Invariant violations and durability failures on fill ingestion.
#[derive(Debug)]
pub enum FillsError {
    /// `fill_id`, `client_order_id`, or `symbol` was empty.
    EmptyIdentifier { field: &'static str },
    NonPositiveQty { qty: f64 },
    NonPositivePrice { price: f64 },
    NegativeCommission { commission: f64 },
    /// Durability failure from the underlying journal. Fatal; propagate.
    Journal(JournalError),
}

impl std::fmt::Display for FillsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyIdentifier { field } => {
                write!(f, "fill invariant: {field} must not be empty")
            }
            Self::NonPositiveQty { qty } => {
                write!(f, "fill invariant: qty must be positive and finite, got {qty}")
            }
            Self::NonPositivePrice { price } => write!(
                f,
                "fill invariant: price must be positive and finite, got {price}"
            ),
            Self::NegativeCommission { commission } => write!(
                f,
                "fill invariant: commission must be >= 0, got {commission}"
            ),
            Self::Journal(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for FillsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Journal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<JournalError> for FillsError {
    fn from(e: JournalError) -> Self {
        Self::Journal(e)
    }
}

// ---------------------------------------------------------------------------
// FillsLedger
// ---------------------------------------------------------------------------

/// Journal-backed, deduplicated, append-only record of executions.
pub struct FillsLedger {
    journal: Journal,
    fills: Vec<FillEvent>,
    seen: HashSet<String>,
    /// client_order_id → indices into `fills`. BTreeMap for deterministic
    /// iteration in reports.
    by_order: BTreeMap<String, Vec<usize>>,
    by_symbol: BTreeMap<String, Vec<usize>>,
}

impl FillsLedger {
    /// Open the fills journal at `path` and rebuild all indices by replay.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FillsError> {
        let journal = Journal::open(path)?;
        let mut ledger = Self {
            journal,
            fills: Vec::new(),
            seen: HashSet::new(),
            by_order: BTreeMap::new(),
            by_symbol: BTreeMap::new(),
        };

        let entries: Vec<_> = ledger.journal.iter_entries()?.collect();
        for entry in entries {
            if entry.entry_type != FILL_ENTRY_TYPE {
                continue;
            }
            match serde_json::from_value::<FillEvent>(entry.data) {
                Ok(fill) => {
                    if !ledger.seen.contains(&fill.fill_id) {
                        ledger.index(fill);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        sequence = entry.sequence,
                        error = %e,
                        "undecodable fill entry skipped during replay"
                    );
                }
            }
        }

        tracing::debug!(fills = ledger.fills.len(), "fills ledger rebuilt");
        Ok(ledger)
    }

    // -----------------------------------------------------------------------
    // Write surface
    // -----------------------------------------------------------------------

    /// Record one execution.
    ///
    /// Returns `Ok(None)` when `fill_id` was already seen — safe to call
    /// redundantly from both a synchronous ack and a later reconciliation.
    ///
    /// # Errors
    /// [`FillsError`] on an invariant violation or journal failure; the
    /// ledger is not mutated on error.
    pub fn record(&mut self, fill: FillEvent) -> Result<Option<FillEvent>, FillsError> {
        Self::validate(&fill)?;

        if self.seen.contains(&fill.fill_id) {
            tracing::debug!(fill_id = fill.fill_id.as_str(), "duplicate fill ignored");
            return Ok(None);
        }

        let data = serde_json::to_value(&fill).map_err(|e| {
            FillsError::Journal(JournalError::Serialize {
                detail: e.to_string(),
            })
        })?;
        self.journal.append(FILL_ENTRY_TYPE, data)?;

        tracing::debug!(
            fill_id = fill.fill_id.as_str(),
            client_order_id = fill.client_order_id.as_str(),
            symbol = fill.symbol.as_str(),
            qty = fill.qty,
            price = fill.price,
            "fill recorded"
        );
        self.index(fill.clone());
        Ok(Some(fill))
    }

    // -----------------------------------------------------------------------
    // Read surface
    // -----------------------------------------------------------------------

    /// Fills for one order, in recorded order.
    pub fn get_fills_for_order(&self, client_order_id: &str) -> Vec<&FillEvent> {
        self.by_order
            .get(client_order_id)
            .map(|idxs| idxs.iter().map(|&i| &self.fills[i]).collect())
            .unwrap_or_default()
    }

    /// Fills for one symbol, in recorded order.
    pub fn get_fills_for_symbol(&self, symbol: &str) -> Vec<&FillEvent> {
        self.by_symbol
            .get(symbol)
            .map(|idxs| idxs.iter().map(|&i| &self.fills[i]).collect())
            .unwrap_or_default()
    }

    /// Total executed quantity for an order (0.0 when no fills).
    pub fn total_filled_qty(&self, client_order_id: &str) -> f64 {
        self.get_fills_for_order(client_order_id)
            .iter()
            .map(|f| f.qty)
            .sum()
    }

    /// Volume-weighted average fill price: Σ(price·qty) / Σqty.
    /// `None` when the order has no fills.
    pub fn avg_fill_price(&self, client_order_id: &str) -> Option<f64> {
        let fills = self.get_fills_for_order(client_order_id);
        if fills.is_empty() {
            return None;
        }
        let qty: f64 = fills.iter().map(|f| f.qty).sum();
        let notional: f64 = fills.iter().map(|f| f.notional()).sum();
        Some(notional / qty)
    }

    /// Total commission across all fills, optionally restricted to one
    /// commission asset.
    pub fn total_commission(&self, asset: Option<&str>) -> f64 {
        self.fills
            .iter()
            .filter(|f| asset.map_or(true, |a| f.commission_asset == a))
            .map(|f| f.commission)
            .sum()
    }

    /// Realized PnL of a round trip: exit notional − entry notional when the
    /// entry side is BUY, inverted otherwise. `None` if either leg has no
    /// fills.
    pub fn compute_pnl(&self, entry_order_id: &str, exit_order_id: &str) -> Option<f64> {
        let entry = self.get_fills_for_order(entry_order_id);
        let exit = self.get_fills_for_order(exit_order_id);
        if entry.is_empty() || exit.is_empty() {
            return None;
        }

        let entry_notional: f64 = entry.iter().map(|f| f.notional()).sum();
        let exit_notional: f64 = exit.iter().map(|f| f.notional()).sum();

        Some(match entry[0].side {
            Side::Buy => exit_notional - entry_notional,
            Side::Sell => entry_notional - exit_notional,
        })
    }

    /// Number of distinct fills recorded.
    pub fn fill_count(&self) -> usize {
        self.fills.len()
    }

    /// Recompute every journal entry id against its content.
    pub fn verify_integrity(&self) -> bool {
        self.journal.verify_integrity()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn index(&mut self, fill: FillEvent) {
        let idx = self.fills.len();
        self.seen.insert(fill.fill_id.clone());
        self.by_order
            .entry(fill.client_order_id.clone())
            .or_default()
            .push(idx);
        self.by_symbol
            .entry(fill.symbol.clone())
            .or_default()
            .push(idx);
        self.fills.push(fill);
    }

    fn validate(fill: &FillEvent) -> Result<(), FillsError> {
        for (field, value) in [
            ("fill_id", &fill.fill_id),
            ("client_order_id", &fill.client_order_id),
            ("symbol", &fill.symbol),
        ] {
            if value.trim().is_empty() {
                return Err(FillsError::EmptyIdentifier { field });
            }
        }
        if !(fill.qty.is_finite() && fill.qty > 0.0) {
            return Err(FillsError::NonPositiveQty { qty: fill.qty });
        }
        if !(fill.price.is_finite() && fill.price > 0.0) {
            return Err(FillsError::NonPositivePrice { price: fill.price });
        }
        if !(fill.commission.is_finite() && fill.commission >= 0.0) {
            return Err(FillsError::NegativeCommission {
                commission: fill.commission,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
