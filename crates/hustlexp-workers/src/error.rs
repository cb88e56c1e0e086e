use hustlexp_ledger::LedgerError;
use hustlexp_money::MoneyError;
use hustlexp_outbox::OutboxError;
use hustlexp_storage::StoreError;
use hustlexp_types::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("malformed event payload: {0}")]
    MalformedPayload(String),

    #[error("push gateway: {0}")]
    Gateway(#[from] crate::gateway::GatewayError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Money(#[from] MoneyError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::MalformedPayload(_) => false,
            WorkerError::Gateway(err) => err.is_retryable(),
            WorkerError::Ledger(err) => err.kind() == ErrorKind::Retryable,
            WorkerError::Money(err) => err.kind() == ErrorKind::Retryable,
            WorkerError::Outbox(OutboxError::Store(err)) => err.is_retryable(),
            WorkerError::Store(err) => err.is_retryable(),
        }
    }
}
