//! PostgreSQL adapter.
//!
//! The transactional source-of-truth backend. Every multi-write trait method
//! runs in a SERIALIZABLE transaction retried on serialization failures and
//! deadlocks; the constitutional invariants live in triggers (see `schema`)
//! that raise stable `HXnnn` errors, so no caller above the database can
//! corrupt money or XP even when the Rust-side checks are bypassed.

mod corrections;
mod ledgers;
mod money;
mod outbox;
mod rows;
mod schema;
mod tasks;

use crate::error::{StoreError, StoreResult};
use crate::retry::RetryPolicy;
use hustlexp_types::InvariantCode;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

/// PostgreSQL-backed HustleXP storage adapter.
#[derive(Clone)]
pub struct PostgresHustleStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresHustleStore {
    /// Connect and initialize schema + invariant triggers.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with_options(database_url, 10, 5, RetryPolicy::default()).await
    }

    /// Connect with explicit pool and retry parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
        retry: RetryPolicy,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool, retry };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create the adapter from an existing pool.
    pub async fn from_pool(pool: PgPool, retry: RetryPolicy) -> StoreResult<Self> {
        let store = Self { pool, retry };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StoreResult<()> {
        // raw_sql: trigger blocks are DROP + CREATE pairs in one statement
        // batch, which the prepared-statement path rejects.
        for stmt in schema::DDL {
            sqlx::raw_sql(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }

    /// Open a SERIALIZABLE transaction.
    pub(crate) async fn begin_serializable(&self) -> StoreResult<Transaction<'_, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        Ok(tx)
    }

    /// Run a serializable unit of work with the configured retry policy.
    /// `operation` must be re-runnable from scratch: it re-opens its own
    /// transaction on every attempt.
    pub(crate) async fn with_retry<T, F, Fut>(&self, op_name: &str, operation: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = StoreResult<T>>,
    {
        self.retry
            .run(op_name, StoreError::is_retryable, operation)
            .await
    }
}

/// Map sqlx errors onto the storage taxonomy.
///
/// - trigger-raised `HXnnn` messages become `InvariantViolation`,
/// - serialization failures (40001) and deadlocks (40P01) become `Retryable`,
/// - unique violations (23505) become `Conflict`,
/// - everything else is `Backend`.
pub(crate) fn map_sqlx_err(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        let message = db_err.message().to_string();
        if let Some(code) = InvariantCode::from_message(&message) {
            return StoreError::InvariantViolation { code, message };
        }
        match db_err.code().as_deref() {
            Some("40001") | Some("40P01") => return StoreError::Retryable(message),
            Some("23505") => return StoreError::Conflict(message),
            _ => {}
        }
    }
    if matches!(err, sqlx::Error::RowNotFound) {
        return StoreError::NotFound(err.to_string());
    }
    StoreError::Backend(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_messages_map_to_codes() {
        let err = sqlx::Error::Protocol("HX201: not a db error".into());
        // Non-database errors never map to invariants.
        assert!(matches!(map_sqlx_err(err), StoreError::Backend(_)));
    }
}
