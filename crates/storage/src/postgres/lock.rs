//! Distributed lock on a PostgreSQL transaction-scoped advisory lock.
//!
//! Lock ids are the FNV-1a hashes of the namespace and name. Two different
//! names can hash to the same pair; such names share one lock. The lock is
//! tied to an open transaction, so it disappears with the transaction no
//! matter how the holder goes away.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{LockName, PostgresConfig};
use crate::error::StorageError;
use crate::traits::{check_lock_duration, logger_span, DistributedLockProvider};

/// SQLSTATE `lock_not_available`, raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

const fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        i += 1;
    }
    hash
}

/// The two `int4` keys passed to `pg_advisory_xact_lock` for `name`.
pub fn lock_ids(name: &LockName) -> (i32, i32) {
    (
        fnv1a_32(name.namespace.as_bytes()) as i32,
        fnv1a_32(name.name.as_bytes()) as i32,
    )
}

/// A held advisory lock: the open transaction that took it.
///
/// Dropping the handle rolls the transaction back, which releases the lock.
pub struct AdvisoryLock {
    tx: Transaction<'static, Postgres>,
}

impl AdvisoryLock {
    /// Wait up to `timeout` for the advisory lock `ids` on a fresh transaction.
    pub async fn acquire(
        pool: &PgPool,
        ids: (i32, i32),
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| StorageError::transaction("begin advisory lock transaction", e))?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::transaction("set lock_timeout", e))?;

        let locked = sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(ids.0)
            .bind(ids.1)
            .execute(&mut *tx)
            .await;
        match locked {
            Ok(_) => Ok(Self { tx }),
            Err(e) if is_lock_timeout(&e) => Err(StorageError::LockTimeout { waited: timeout }),
            Err(e) => Err(StorageError::transaction("pg_advisory_xact_lock", e)),
        }
    }

    /// Release the lock. Rolls back; the lock transaction never commits.
    pub async fn release(self) -> Result<(), StorageError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| StorageError::transaction("release advisory lock", e))
    }
}

fn is_lock_timeout(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == LOCK_NOT_AVAILABLE)
}

struct Held {
    lock: AdvisoryLock,
    duration: Duration,
}

#[derive(Default)]
struct State {
    pool: Option<PgPool>,
    span: Option<tracing::Span>,
    held: Option<Held>,
}

/// [`DistributedLockProvider`] on a PostgreSQL advisory lock.
///
/// The lock has no lease: `max_lock_time` bounds only the wait. It is held
/// until `unlock`, `close`, or the session ending.
pub struct PostgresLockProvider {
    config: PostgresConfig,
    name: LockName,
    state: Mutex<State>,
}

impl PostgresLockProvider {
    pub fn new(config: PostgresConfig, name: LockName) -> Self {
        Self {
            config,
            name,
            state: Mutex::new(State::default()),
        }
    }
}

#[async_trait]
impl DistributedLockProvider for PostgresLockProvider {
    async fn init(&self, logger: Option<tracing::Span>) -> Result<(), StorageError> {
        let span = logger_span(logger, "postgres");
        let pool = super::connect(&self.config, &span).await?;
        let mut state = self.state.lock().await;
        if let Some(held) = state.held.take() {
            warn!(parent: &span, lock = %self.name, "re-initialized while holding lock, releasing");
            held.lock.release().await?;
        }
        if let Some(previous) = state.pool.replace(pool) {
            previous.close().await;
        }
        state.span = Some(span);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let pool = self
            .state
            .lock()
            .await
            .pool
            .clone()
            .ok_or(StorageError::NotInitialized)?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| StorageError::transaction("ping postgres", e))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let pool = state.pool.take().ok_or(StorageError::NotInitialized)?;
        let span = state.span.take().unwrap_or_else(tracing::Span::none);
        let released = match state.held.take() {
            Some(held) => held.lock.release().await,
            None => Ok(()),
        };
        pool.close().await;
        debug!(parent: &span, lock = %self.name, "closed lock provider");
        released
    }

    async fn distributed_timed_lock(&self, max_lock_time: Duration) -> Result<(), StorageError> {
        check_lock_duration(max_lock_time)?;
        let mut state = self.state.lock().await;
        let pool = state.pool.clone().ok_or(StorageError::NotInitialized)?;
        if state.held.is_some() {
            return Err(StorageError::AlreadyHeld);
        }

        let lock = AdvisoryLock::acquire(&pool, lock_ids(&self.name), max_lock_time).await?;
        state.held = Some(Held {
            lock,
            duration: max_lock_time,
        });
        if let Some(span) = &state.span {
            debug!(parent: span, lock = %self.name, ?max_lock_time, "acquired advisory lock");
        }
        Ok(())
    }

    async fn unlock(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if state.pool.is_none() {
            return Err(StorageError::NotInitialized);
        }
        let held = state.held.take().ok_or(StorageError::NotHeld)?;
        held.lock.release().await?;
        if let Some(span) = &state.span {
            debug!(parent: span, lock = %self.name, "released advisory lock");
        }
        Ok(())
    }

    async fn get_duration(&self) -> Duration {
        let state = self.state.lock().await;
        state.held.as_ref().map_or(Duration::ZERO, |h| h.duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn lock_ids_are_stable_per_name() {
        let default = lock_ids(&LockName::default());
        assert_eq!(default, lock_ids(&LockName::new("pcs", "distlock")));
        assert_ne!(default, lock_ids(&LockName::new("pcs", "other")));
        assert_eq!(default.0, fnv1a_32(b"pcs") as i32);
    }

    #[test]
    fn namespace_and_name_are_hashed_separately() {
        let (a_ns, a_name) = lock_ids(&LockName::new("ab", "c"));
        let (b_ns, b_name) = lock_ids(&LockName::new("a", "bc"));
        assert_ne!(a_ns, b_ns);
        assert_ne!(a_name, b_name);
    }
}
