//! HustleXP storage contract and adapters.
//!
//! This crate owns the constitutional layer of the system:
//! - the trait surface every engine programs against,
//! - the invariant enforcement that makes upper-layer bugs unable to corrupt
//!   money or XP (database triggers in the PostgreSQL adapter, the identical
//!   checks in code in the in-memory reference adapter),
//! - serializable transactions with bounded jittered retry,
//! - lease-based advisory locks,
//! - the append-only ledgers and the transactional outbox table.
//!
//! Design stance:
//! - PostgreSQL is the transactional source of truth; in-process caches are
//!   never authoritative.
//! - Every trait method is one atomic unit of work; engines never compose
//!   partial writes across calls.

#![deny(unsafe_code)]

mod error;
pub mod memory;
mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
mod retry;
mod traits;

pub use error::{StoreError, StoreResult};
pub use model::{
    AdminAuditAppend, AdminAuditRecord, BadgeLedgerRecord, CausalOutcomeRecord, CompletionStats,
    CorrectionRecord, EscrowRecord, Lease, MetricSet, MoneyEventRecord, NewMoneyEvent,
    NewOutboxEvent, NewTrustDelta, NewXpAward, OutboxCounts, OutboxRecord, OutboxStatus,
    ProofRecord, QueryWindow, SystemFlagRecord, TaskRecord, TaskStateLogRecord,
    TaskTransitionRequest, TrustLedgerRecord, UserRecord, WriteOutcome, XpLedgerRecord,
};
pub use retry::RetryPolicy;
pub use traits::{
    CorrectionStore, EscrowStore, FlagStore, HustleStore, LedgerStore, LockStore, OutboxStore,
    TaskStore, UserStore,
};

/// Flag names in `system_flags`.
pub const FLAG_SAFE_MODE: &str = "safe_mode";
pub const FLAG_KILL_SWITCH: &str = "kill_switch";
