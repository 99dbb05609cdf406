use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, LockOptions};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::keys::Keys;
use crate::config::{EtcdConfig, LockName};
use crate::error::StorageError;
use crate::traits::{check_lock_duration, logger_span, DistributedLockProvider};

struct Held {
    /// Ownership key returned by the lock service.
    key: Vec<u8>,
    lease: i64,
    duration: Duration,
}

#[derive(Default)]
struct State {
    client: Option<Client>,
    span: Option<tracing::Span>,
    held: Option<Held>,
}

/// [`DistributedLockProvider`] on the etcd lock service.
///
/// Each acquisition is attached to its own lease with a TTL of the requested
/// duration, so a holder that dies releases the lock when the lease expires.
pub struct EtcdLockProvider {
    config: EtcdConfig,
    name: LockName,
    state: Mutex<State>,
}

impl EtcdLockProvider {
    pub fn new(config: EtcdConfig, name: LockName) -> Self {
        Self {
            config,
            name,
            state: Mutex::new(State::default()),
        }
    }
}

/// Lease TTL for `d`, in whole seconds rounded up.
fn lease_ttl(d: Duration) -> i64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// Revoke a lease nobody will use again. A failure only leaves the lease to
/// expire on its TTL, so it is logged rather than returned.
async fn abandon_lease(client: &mut Client, lease: i64, span: &tracing::Span, cause: &str) {
    if let Err(e) = client.lease_revoke(lease).await {
        warn!(parent: span, lease, cause, error = %e, "failed to revoke lock lease");
    }
}

async fn release(client: &mut Client, held: Held, span: &tracing::Span) -> Result<(), StorageError> {
    let unlocked = client
        .unlock(held.key)
        .await
        .map_err(|e| StorageError::transaction("unlock etcd lock", e));
    // Revoke even if unlock failed; dropping the lease also drops the lock key.
    abandon_lease(client, held.lease, span, "released").await;
    unlocked.map(|_| ())
}

#[async_trait]
impl DistributedLockProvider for EtcdLockProvider {
    async fn init(&self, logger: Option<tracing::Span>) -> Result<(), StorageError> {
        let span = logger_span(logger, "etcd");
        let client = super::connect(&self.config, &span).await?;
        let mut state = self.state.lock().await;
        if let (Some(mut previous), Some(held)) = (state.client.take(), state.held.take()) {
            warn!(parent: &span, lock = %self.name, "re-initialized while holding lock, releasing");
            release(&mut previous, held, &span).await?;
        }
        state.client = Some(client);
        state.span = Some(span);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut client = self
            .state
            .lock()
            .await
            .client
            .clone()
            .ok_or(StorageError::NotInitialized)?;
        client
            .status()
            .await
            .map_err(|e| StorageError::transaction("ping etcd", e))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let mut client = state.client.take().ok_or(StorageError::NotInitialized)?;
        let span = state.span.take().unwrap_or_else(tracing::Span::none);
        let released = match state.held.take() {
            Some(held) => release(&mut client, held, &span).await,
            None => Ok(()),
        };
        debug!(parent: &span, lock = %self.name, "closed lock provider");
        released
    }

    async fn distributed_timed_lock(&self, max_lock_time: Duration) -> Result<(), StorageError> {
        check_lock_duration(max_lock_time)?;
        let mut state = self.state.lock().await;
        let mut client = state.client.clone().ok_or(StorageError::NotInitialized)?;
        let span = state.span.clone().unwrap_or_else(tracing::Span::none);
        if state.held.is_some() {
            return Err(StorageError::AlreadyHeld);
        }

        let lease = client
            .lease_grant(lease_ttl(max_lock_time), None)
            .await
            .map_err(|e| StorageError::transaction("grant lock lease", e))?
            .id();
        let name = Keys::new(&self.config.key_prefix).lock(&self.name);
        let options = LockOptions::new().with_lease(lease);

        let outcome =
            tokio::time::timeout(max_lock_time, client.lock(name.as_str(), Some(options))).await;
        let key = match outcome {
            Ok(Ok(resp)) => resp.key().to_vec(),
            Ok(Err(e)) => {
                abandon_lease(&mut client, lease, &span, "lock request failed").await;
                return Err(StorageError::transaction(format!("lock {name}"), e));
            }
            Err(_) => {
                // The abandoned request is tied to the lease; revoking it withdraws the claim.
                abandon_lease(&mut client, lease, &span, "lock wait timed out").await;
                return Err(StorageError::LockTimeout {
                    waited: max_lock_time,
                });
            }
        };

        state.held = Some(Held {
            key,
            lease,
            duration: max_lock_time,
        });
        debug!(parent: &span, lock = %self.name, lease, ?max_lock_time, "acquired etcd lock");
        Ok(())
    }

    async fn unlock(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let mut client = state.client.clone().ok_or(StorageError::NotInitialized)?;
        let span = state.span.clone().unwrap_or_else(tracing::Span::none);
        let held = state.held.take().ok_or(StorageError::NotHeld)?;
        release(&mut client, held, &span).await?;
        debug!(parent: &span, lock = %self.name, "released etcd lock");
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
    fn lease_ttl_rounds_up() {
        assert_eq!(lease_ttl(Duration::from_secs(1)), 1);
        assert_eq!(lease_ttl(Duration::from_millis(1500)), 2);
        assert_eq!(lease_ttl(Duration::from_secs(30)), 30);
    }
}
