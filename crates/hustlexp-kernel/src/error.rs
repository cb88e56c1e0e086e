//! Kernel-level error folding: every engine error converges on the shared
//! taxonomy before it reaches a caller.

use hustlexp_correction::CorrectionError;
use hustlexp_ledger::LedgerError;
use hustlexp_money::MoneyError;
use hustlexp_storage::StoreError;
use hustlexp_task::TaskError;
use hustlexp_types::{ErrorKind, ErrorSurface};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Money(#[from] MoneyError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Correction(#[from] CorrectionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl KernelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KernelError::Task(err) => err.kind(),
            KernelError::Money(err) => err.kind(),
            KernelError::Ledger(err) => err.kind(),
            KernelError::Correction(err) => match err {
                CorrectionError::NotFound(_) => ErrorKind::NotFound,
                CorrectionError::Validation(_) => ErrorKind::Validation,
                CorrectionError::Store(inner) => inner.kind(),
            },
            KernelError::Store(err) => err.kind(),
        }
    }

    /// The small user-visible surface: friendly message, machine code, and
    /// an optional wait hint for retryable conditions.
    pub fn surface(&self) -> ErrorSurface {
        let kind = self.kind();
        let message = match kind {
            ErrorKind::Validation => "That request doesn't look right.".to_string(),
            ErrorKind::Authentication => "Please sign in again.".to_string(),
            ErrorKind::Authorization => "You don't have permission to do that.".to_string(),
            ErrorKind::NotFound => "We couldn't find that.".to_string(),
            ErrorKind::ConflictInvariant(_) | ErrorKind::ConflictState => {
                "That action isn't possible in the current state.".to_string()
            }
            ErrorKind::RateLimited => "Slow down a moment and try again.".to_string(),
            ErrorKind::Retryable => "We're retrying on our side; check back shortly.".to_string(),
            ErrorKind::FatalProvider => {
                "The payment couldn't be completed; our team is on it.".to_string()
            }
            ErrorKind::Internal => "Something went wrong on our side.".to_string(),
        };
        let mut surface = ErrorSurface::from_kind(kind, message);
        if kind == ErrorKind::Retryable {
            surface.estimated_wait_secs = Some(120);
        }
        if kind == ErrorKind::FatalProvider {
            surface.action_required = Some("update your payment method".to_string());
        }
        surface
    }
}
