//! keel-execution
//!
//! Order intents and the outbox state machine.
//!
//! - Strategies (or any caller) construct a validated, immutable
//!   [`OrderIntent`] whose `client_order_id` is derived deterministically
//!   from the order parameters — retries automatically reuse the same key,
//!   so the venue can detect duplicate submissions.
//! - The [`Outbox`] durably records intent **before** the network call is
//!   attempted, then tracks the submission lifecycle as a sequence of
//!   immutable journal appends.
//!
//! The network call itself never happens here; the caller owns transport,
//! deadlines, and retry policy, all hard-constrained by the UNKNOWN
//! quarantine rule enforced by the outbox.

mod idempotency;
mod outbox;
mod types;

pub use idempotency::{
    derive_client_order_id, verify_client_order_id, KeyParams, ID_MARKER, MAX_CLIENT_ORDER_ID_LEN,
};

pub use types::{IntentError, OrderIntent};

pub use outbox::{Outbox, OutboxEntry, OutboxError, OutboxStatus, OUTBOX_ENTRY_TYPE};
