//! Outbox — the order-intent state machine.
//!
//! # Design
//!
//! Durable intent first, network action second. Every lifecycle transition
//! appends a fresh immutable entry to the journal; nothing is ever mutated
//! in place. The current state of an id is the most recently appended entry
//! for that id, reconstructed at startup by one forward replay (O(n) replay,
//! O(1) lookup afterwards).
//!
//! # State diagram
//!
//! ```text
//!  prepare      commit        ack(FILLED)            Filled (terminal)
//!  ───► Prepared ───► Committed ──► ack(REJECTED)  ──► Failed (terminal)
//!                        │          ack(other)     ──► Acked
//!                        │ unknown(reason) / ack(UNKNOWN)
//!                        ▼
//!                     Unknown ── reconciled(ack) ──► Filled | Failed | Reconciled
//! ```
//!
//! **Unknown is quarantine.** An order in `Unknown` MUST NOT be resubmitted;
//! `prepare` refuses every id whose latest entry is not `Failed`, so the
//! only path out of quarantine is reconciliation. Illegal transitions are
//! errors the caller must treat as a halt/alert signal.

use crate::types::OrderIntent;
use chrono::{DateTime, Utc};
use keel_journal::{Journal, JournalError};
use keel_schemas::{AckStatus, OrderAck};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Journal entry type under which outbox transitions are persisted.
pub const OUTBOX_ENTRY_TYPE: &str = "outbox";

// ---------------------------------------------------------------------------
// OutboxStatus
// ---------------------------------------------------------------------------

/// Lifecycle states of a submitted order intent.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboxStatus {
    #[serde(rename = "PREPARED")]
    Prepared,
    #[serde(rename = "COMMITTED")]
    Committed,
    #[serde(rename = "ACKED")]
    Acked,
    /// The submission outcome could not be determined (timeout, 5xx, reset).
    /// Quarantined until reconciliation.
    #[serde(rename = "UNKNOWN")]
    Unknown,
    /// Resolved by the reconciler to a live (non-terminal) venue state.
    #[serde(rename = "RECONCILED")]
    Reconciled,
    /// Fully executed. **Terminal.**
    #[serde(rename = "FILLED")]
    Filled,
    /// Rejected, canceled, expired, or otherwise dead at the venue.
    /// **Terminal**; the only state from which re-preparation is allowed.
    #[serde(rename = "FAILED")]
    Failed,
}

impl OutboxStatus {
    /// No further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Failed)
    }

    /// Submission still in flight from the caller's perspective.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Prepared | Self::Committed | Self::Unknown)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Prepared => "PREPARED",
            Self::Committed => "COMMITTED",
            Self::Acked => "ACKED",
            Self::Unknown => "UNKNOWN",
            Self::Reconciled => "RECONCILED",
            Self::Filled => "FILLED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// OutboxEntry
// ---------------------------------------------------------------------------

/// One immutable snapshot of an order intent's lifecycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub client_order_id: String,
    pub intent: OrderIntent,
    pub status: OutboxStatus,
    pub ack: Option<OrderAck>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// OutboxError
// ---------------------------------------------------------------------------

/// Failures the outbox can surface.
///
/// `IllegalTransition` indicates a serious protocol violation (e.g. commit
/// before prepare, or any mutation of a terminal entry) and callers MUST
/// treat it as a halt/alert condition.
#[derive(Debug)]
pub enum OutboxError {
    /// `prepare` on an id whose latest entry is not FAILED.
    DuplicateIntent {
        client_order_id: String,
        status: OutboxStatus,
    },
    /// Transition requested for an id the outbox has never seen.
    MissingEntry { client_order_id: String },
    IllegalTransition {
        client_order_id: String,
        from: OutboxStatus,
        event: &'static str,
    },
    /// Durability failure from the underlying journal. Fatal; propagate.
    Journal(JournalError),
}

impl std::fmt::Display for OutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateIntent {
                client_order_id,
                status,
            } => write!(
                f,
                "duplicate intent {client_order_id}: latest entry is {status}, only FAILED may be re-prepared"
            ),
            Self::MissingEntry { client_order_id } => {
                write!(f, "no outbox entry for {client_order_id}")
            }
            Self::IllegalTransition {
                client_order_id,
                from,
                event,
            } => write!(
                f,
                "illegal outbox transition for {client_order_id}: {from} + {event}"
            ),
            Self::Journal(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for OutboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Journal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<JournalError> for OutboxError {
    fn from(e: JournalError) -> Self {
        Self::Journal(e)
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Journal-backed state machine tracking every submitted order intent.
///
/// Not internally synchronized per key: the caller must own a given
/// `client_order_id` end-to-end through prepare → commit → ack/unknown.
pub struct Outbox {
    journal: Journal,
    /// Latest entry per id. BTreeMap so query results are deterministic.
    latest: BTreeMap<String, OutboxEntry>,
}

impl Outbox {
    /// Open the outbox journal at `path` and rebuild current state by
    /// replaying it forward, keeping only the latest entry per id.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OutboxError> {
        let journal = Journal::open(path)?;
        let mut latest = BTreeMap::new();

        for entry in journal.iter_entries()? {
            if entry.entry_type != OUTBOX_ENTRY_TYPE {
                continue;
            }
            match serde_json::from_value::<OutboxEntry>(entry.data) {
                Ok(parsed) => {
                    latest.insert(parsed.client_order_id.clone(), parsed);
                }
                Err(e) => {
                    tracing::warn!(
                        sequence = entry.sequence,
                        error = %e,
                        "undecodable outbox entry skipped during replay"
                    );
                }
            }
        }

        tracing::debug!(entries = latest.len(), "outbox state rebuilt");
        Ok(Self { journal, latest })
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Durably record the intent to submit, before any network call.
    ///
    /// # Errors
    /// [`OutboxError::DuplicateIntent`] if an entry already exists for this
    /// id in any state other than FAILED. Re-preparation after a genuine
    /// failure is permitted; everything else is a duplicate.
    pub fn prepare(&mut self, intent: OrderIntent) -> Result<OutboxEntry, OutboxError> {
        let id = intent.client_order_id.clone();
        if let Some(existing) = self.latest.get(&id) {
            if existing.status != OutboxStatus::Failed {
                return Err(OutboxError::DuplicateIntent {
                    client_order_id: id,
                    status: existing.status,
                });
            }
        }

        let now = Utc::now();
        let entry = OutboxEntry {
            client_order_id: id,
            intent,
            status: OutboxStatus::Prepared,
            ack: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.persist(entry)
    }

    /// Mark the intent as committed. Call immediately before the network
    /// send: the durable record must exist before the action is attempted.
    pub fn commit(&mut self, client_order_id: &str) -> Result<OutboxEntry, OutboxError> {
        let current = self.require(client_order_id)?;
        if current.status != OutboxStatus::Prepared {
            return Err(self.illegal(current, "commit"));
        }
        let next = Self::advance(current, OutboxStatus::Committed, None, None);
        self.persist(next)
    }

    /// Record the venue's synchronous acknowledgement.
    ///
    /// UNKNOWN ack quarantines; REJECTED fails terminally; FILLED completes
    /// terminally; anything else is ACKED.
    pub fn ack(&mut self, client_order_id: &str, ack: OrderAck) -> Result<OutboxEntry, OutboxError> {
        let current = self.require(client_order_id)?;
        if current.status != OutboxStatus::Committed {
            return Err(self.illegal(current, "ack"));
        }

        let (status, error) = match ack.status {
            AckStatus::Unknown => (OutboxStatus::Unknown, None),
            AckStatus::Rejected => (
                OutboxStatus::Failed,
                Some("venue rejected submission".to_string()),
            ),
            AckStatus::Filled => (OutboxStatus::Filled, None),
            _ => (OutboxStatus::Acked, None),
        };
        let next = Self::advance(current, status, Some(ack), error);
        self.persist(next)
    }

    /// Quarantine the intent: the network call itself failed indeterminately
    /// (timeout, 5xx, connection reset) and no response was received at all.
    pub fn unknown(
        &mut self,
        client_order_id: &str,
        reason: &str,
    ) -> Result<OutboxEntry, OutboxError> {
        let current = self.require(client_order_id)?;
        if current.status != OutboxStatus::Committed {
            return Err(self.illegal(current, "unknown"));
        }
        tracing::warn!(client_order_id, reason, "submission outcome unknown; quarantined");
        let next = Self::advance(
            current,
            OutboxStatus::Unknown,
            None,
            Some(reason.to_string()),
        );
        self.persist(next)
    }

    /// Resolve a quarantined entry from a venue lookup. Reconciler only.
    pub fn reconciled(
        &mut self,
        client_order_id: &str,
        ack: OrderAck,
    ) -> Result<OutboxEntry, OutboxError> {
        let current = self.require(client_order_id)?;
        if current.status != OutboxStatus::Unknown {
            return Err(self.illegal(current, "reconciled"));
        }

        let (status, error) = if ack.status == AckStatus::Filled {
            (OutboxStatus::Filled, None)
        } else if ack.status.is_dead() {
            (
                OutboxStatus::Failed,
                Some(format!("venue reported {} during reconciliation", ack.status)),
            )
        } else {
            (OutboxStatus::Reconciled, None)
        };
        let next = Self::advance(current, status, Some(ack), error);
        self.persist(next)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Latest entry for an id, if any.
    pub fn get(&self, client_order_id: &str) -> Option<&OutboxEntry> {
        self.latest.get(client_order_id)
    }

    /// All entries currently in `status`, ordered by id.
    pub fn get_by_status(&self, status: OutboxStatus) -> Vec<&OutboxEntry> {
        self.latest
            .values()
            .filter(|e| e.status == status)
            .collect()
    }

    /// All quarantined entries, ordered by id.
    pub fn get_unknown(&self) -> Vec<&OutboxEntry> {
        self.get_by_status(OutboxStatus::Unknown)
    }

    /// Entries still in flight: PREPARED, COMMITTED, or UNKNOWN.
    pub fn get_pending(&self) -> Vec<&OutboxEntry> {
        self.latest
            .values()
            .filter(|e| e.status.is_pending())
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        self.latest.values().any(|e| e.status.is_pending())
    }

    /// Number of distinct ids ever prepared.
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn require(&self, client_order_id: &str) -> Result<&OutboxEntry, OutboxError> {
        self.latest
            .get(client_order_id)
            .ok_or_else(|| OutboxError::MissingEntry {
                client_order_id: client_order_id.to_string(),
            })
    }

    fn illegal(&self, current: &OutboxEntry, event: &'static str) -> OutboxError {
        OutboxError::IllegalTransition {
            client_order_id: current.client_order_id.clone(),
            from: current.status,
            event,
        }
    }

    fn advance(
        current: &OutboxEntry,
        status: OutboxStatus,
        ack: Option<OrderAck>,
        error: Option<String>,
    ) -> OutboxEntry {
        OutboxEntry {
            client_order_id: current.client_order_id.clone(),
            intent: current.intent.clone(),
            status,
            ack: ack.or_else(|| current.ack.clone()),
            error,
            created_at: current.created_at,
            updated_at: Utc::now(),
        }
    }

    /// Journal first, then the in-memory index. If the append fails the
    /// in-memory state is untouched, so memory never claims more than disk.
    fn persist(&mut self, entry: OutboxEntry) -> Result<OutboxEntry, OutboxError> {
        let data = serde_json::to_value(&entry).map_err(|e| {
            OutboxError::Journal(JournalError::Serialize {
                detail: e.to_string(),
            })
        })?;
        self.journal.append(OUTBOX_ENTRY_TYPE, data)?;

        tracing::debug!(
            client_order_id = entry.client_order_id.as_str(),
            status = %entry.status,
            "outbox transition"
        );
        self.latest
            .insert(entry.client_order_id.clone(), entry.clone());
        Ok(entry)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use keel_schemas::{OrderType, Side, TimeInForce};
    use serde_json::{json, Value};
    use tempfile::tempdir;

    fn intent(symbol: &str, qty: f64) -> OrderIntent {
        OrderIntent::new(
            symbol,
            Side::Buy,
            OrderType::Limit,
            qty,
            Some(50_000.0),
            TimeInForce::Gtc,
            "sess-t",
            None,
            Value::Null,
        )
        .unwrap()
    }

    fn ack_with(status: AckStatus) -> OrderAck {
        OrderAck::new(status, 0.0, None, json!({"status": status.to_string()}))
    }

    fn open_outbox(dir: &tempfile::TempDir) -> Outbox {
        Outbox::open(dir.path().join("outbox.jsonl")).unwrap()
    }

    #[test]
    fn prepare_fresh_id_succeeds() {
        let dir = tempdir().unwrap();
        let mut ob = open_outbox(&dir);
        let entry = ob.prepare(intent("BTCUSDT", 0.05)).unwrap();
        assert_eq!(entry.status, OutboxStatus::Prepared);
        assert!(ob.has_pending());
    }

    #[test]
    fn duplicate_prepare_rejected_unless_failed() {
        let dir = tempdir().unwrap();
        let mut ob = open_outbox(&dir);
        let i = intent("BTCUSDT", 0.05);
        let id = i.client_order_id.clone();
        ob.prepare(i.clone()).unwrap();

        let err = ob.prepare(i.clone()).unwrap_err();
        assert!(matches!(err, OutboxError::DuplicateIntent { .. }));

        // Drive to FAILED, then re-preparation is permitted.
        ob.commit(&id).unwrap();
        ob.ack(&id, ack_with(AckStatus::Rejected)).unwrap();
        let entry = ob.prepare(i).unwrap();
        assert_eq!(entry.status, OutboxStatus::Prepared);
    }

    #[test]
    fn commit_before_prepare_is_missing_entry() {
        let dir = tempdir().unwrap();
        let mut ob = open_outbox(&dir);
        assert!(matches!(
            ob.commit("K-nothing").unwrap_err(),
            OutboxError::MissingEntry { .. }
        ));
    }

    #[test]
    fn commit_twice_is_illegal() {
        let dir = tempdir().unwrap();
        let mut ob = open_outbox(&dir);
        let id = ob.prepare(intent("BTCUSDT", 0.05)).unwrap().client_order_id;
        ob.commit(&id).unwrap();
        let err = ob.commit(&id).unwrap_err();
        assert!(matches!(
            err,
            OutboxError::IllegalTransition {
                from: OutboxStatus::Committed,
                event: "commit",
                ..
            }
        ));
    }

    #[test]
    fn ack_rejected_fails_terminally() {
        let dir = tempdir().unwrap();
        let mut ob = open_outbox(&dir);
        let id = ob.prepare(intent("BTCUSDT", 0.05)).unwrap().client_order_id;
        ob.commit(&id).unwrap();
        let entry = ob.ack(&id, ack_with(AckStatus::Rejected)).unwrap();
        assert_eq!(entry.status, OutboxStatus::Failed);
        assert!(entry.status.is_terminal());
        assert!(entry.error.is_some());
    }

    #[test]
    fn ack_filled_completes_terminally() {
        let dir = tempdir().unwrap();
        let mut ob = open_outbox(&dir);
        let id = ob.prepare(intent("BTCUSDT", 0.05)).unwrap().client_order_id;
        ob.commit(&id).unwrap();
        let entry = ob
            .ack(
                &id,
                OrderAck::new(AckStatus::Filled, 0.05, Some(50_000.0), Value::Null),
            )
            .unwrap();
        assert_eq!(entry.status, OutboxStatus::Filled);
        assert!(entry.status.is_terminal());
    }

    #[test]
    fn ack_new_is_acked_and_unknown_ack_quarantines() {
        let dir = tempdir().unwrap();
        let mut ob = open_outbox(&dir);

        let a = ob.prepare(intent("BTCUSDT", 0.05)).unwrap().client_order_id;
        ob.commit(&a).unwrap();
        assert_eq!(
            ob.ack(&a, ack_with(AckStatus::New)).unwrap().status,
            OutboxStatus::Acked
        );

        let b = ob.prepare(intent("ETHUSDT", 1.0)).unwrap().client_order_id;
        ob.commit(&b).unwrap();
        assert_eq!(
            ob.ack(&b, ack_with(AckStatus::Unknown)).unwrap().status,
            OutboxStatus::Unknown
        );
        assert_eq!(ob.get_unknown().len(), 1);
    }

    #[test]
    fn unknown_requires_committed() {
        let dir = tempdir().unwrap();
        let mut ob = open_outbox(&dir);
        let id = ob.prepare(intent("BTCUSDT", 0.05)).unwrap().client_order_id;
        // Not yet committed: the caller never attempted the network send.
        let err = ob.unknown(&id, "timeout").unwrap_err();
        assert!(matches!(
            err,
            OutboxError::IllegalTransition {
                from: OutboxStatus::Prepared,
                ..
            }
        ));
    }

    #[test]
    fn unknown_is_quarantine_not_failure() {
        let dir = tempdir().unwrap();
        let mut ob = open_outbox(&dir);
        let i = intent("BTCUSDT", 0.05);
        let id = i.client_order_id.clone();
        ob.prepare(i.clone()).unwrap();
        ob.commit(&id).unwrap();
        ob.unknown(&id, "timeout after 5s").unwrap();

        // Quarantined: resubmission must be refused.
        let err = ob.prepare(i).unwrap_err();
        assert!(matches!(
            err,
            OutboxError::DuplicateIntent {
                status: OutboxStatus::Unknown,
                ..
            }
        ));
        assert!(ob.has_pending());
    }

    #[test]
    fn reconciled_maps_statuses() {
        let dir = tempdir().unwrap();
        let mut ob = open_outbox(&dir);

        let quarantine = |ob: &mut Outbox, sym: &str, qty: f64| {
            let id = ob.prepare(intent(sym, qty)).unwrap().client_order_id;
            ob.commit(&id).unwrap();
            ob.unknown(&id, "timeout").unwrap();
            id
        };

        let filled = quarantine(&mut ob, "BTCUSDT", 0.05);
        let dead = quarantine(&mut ob, "ETHUSDT", 1.0);
        let live = quarantine(&mut ob, "SOLUSDT", 10.0);

        assert_eq!(
            ob.reconciled(&filled, ack_with(AckStatus::Filled))
                .unwrap()
                .status,
            OutboxStatus::Filled
        );
        assert_eq!(
            ob.reconciled(&dead, ack_with(AckStatus::Canceled))
                .unwrap()
                .status,
            OutboxStatus::Failed
        );
        assert_eq!(
            ob.reconciled(&live, ack_with(AckStatus::New))
                .unwrap()
                .status,
            OutboxStatus::Reconciled
        );
    }

    #[test]
    fn terminal_entries_are_immutable() {
        let dir = tempdir().unwrap();
        let mut ob = open_outbox(&dir);
        let id = ob.prepare(intent("BTCUSDT", 0.05)).unwrap().client_order_id;
        ob.commit(&id).unwrap();
        ob.ack(&id, ack_with(AckStatus::Filled)).unwrap();

        for err in [
            ob.commit(&id).unwrap_err(),
            ob.ack(&id, ack_with(AckStatus::New)).unwrap_err(),
            ob.unknown(&id, "late timeout").unwrap_err(),
            ob.reconciled(&id, ack_with(AckStatus::New)).unwrap_err(),
        ] {
            assert!(matches!(
                err,
                OutboxError::IllegalTransition {
                    from: OutboxStatus::Filled,
                    ..
                }
            ));
        }
    }

    #[test]
    fn replay_keeps_latest_entry_per_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");

        let (id_done, id_pending) = {
            let mut ob = Outbox::open(&path).unwrap();
            let a = ob.prepare(intent("BTCUSDT", 0.05)).unwrap().client_order_id;
            ob.commit(&a).unwrap();
            ob.ack(&a, ack_with(AckStatus::Filled)).unwrap();

            let b = ob.prepare(intent("ETHUSDT", 1.0)).unwrap().client_order_id;
            ob.commit(&b).unwrap();
            (a, b)
        };

        // Reopen: in-memory state is never trusted across restarts.
        let ob = Outbox::open(&path).unwrap();
        assert_eq!(ob.len(), 2);
        assert_eq!(ob.get(&id_done).unwrap().status, OutboxStatus::Filled);
        assert_eq!(ob.get(&id_pending).unwrap().status, OutboxStatus::Committed);
        assert_eq!(ob.get_pending().len(), 1);
    }

    #[test]
    fn queries_are_ordered_and_consistent() {
        let dir = tempdir().unwrap();
        let mut ob = open_outbox(&dir);
        for (sym, qty) in [("BTCUSDT", 0.05), ("ETHUSDT", 1.0), ("SOLUSDT", 10.0)] {
            let id = ob.prepare(intent(sym, qty)).unwrap().client_order_id;
            ob.commit(&id).unwrap();
        }
        let committed = ob.get_by_status(OutboxStatus::Committed);
        assert_eq!(committed.len(), 3);
        let ids: Vec<_> = committed.iter().map(|e| &e.client_order_id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
