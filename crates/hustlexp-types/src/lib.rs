//! HustleXP domain vocabulary.
//!
//! Identifiers, lifecycle states, versioned event payloads, the correction
//! vocabulary, and the error taxonomy shared by every crate in the workspace.
//! This crate has no storage or I/O concerns.

#![deny(unsafe_code)]

mod correction;
mod error;
mod event;
mod id;
mod money;
mod proof;
mod task;
mod user;

pub use correction::{
    is_forbidden_target, CorrectionStatus, CorrectionType, Scope, Verdict, FORBIDDEN_TARGETS,
};
pub use error::{ErrorKind, ErrorSurface, InvariantCode};
pub use event::{EventPayload, Queue, EVENT_VERSION};
pub use id::{CorrectionId, EventId, ProofId, TaskId, UserId};
pub use money::{IdempotencyKey, MoneyEventPhase, MoneyOp, MoneyState};
pub use proof::ProofState;
pub use task::{TaskState, TaskTransition};
pub use user::{level_for_xp, Badge, Role, TrustTier};
