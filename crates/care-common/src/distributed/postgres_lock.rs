//! Transaction-scoped PostgreSQL advisory locks.
//!
//! Locks taken here are released by PostgreSQL on commit or rollback, so a
//! crashed billing run never leaves a funding bucket locked.

use crate::distributed::BucketLockKey;
use sqlx::PgConnection;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Block until the current transaction owns the lock for `key`.
pub async fn lock_in_transaction(
    conn: &mut PgConnection,
    key: BucketLockKey,
) -> Result<(), LockError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(key.value())
        .execute(&mut *conn)
        .await?;

    debug!("Acquired transaction advisory lock {}", key);
    Ok(())
}
