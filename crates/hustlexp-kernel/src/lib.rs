//! HustleXP kernel container.
//!
//! Wires the storage contract, the payment provider, the state machines,
//! the ledgers, the worker fleet, recovery, and the advisory correction
//! engine into one injected dependency container, and exposes the typed
//! command surface the transport layer forwards to.

#![deny(unsafe_code)]

mod artifacts;
mod config;
mod core;
mod error;

pub use artifacts::{
    ArtifactError, MockArtifactStore, PresignedUpload, ProofArtifactStore, MAX_PRESIGN_TTL,
};
pub use config::{ConfigError, KernelConfig};
pub use core::{init_tracing, HustleCore};
pub use error::KernelError;
