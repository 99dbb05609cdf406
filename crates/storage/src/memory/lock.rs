use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::config::LockName;
use crate::error::StorageError;
use crate::traits::{check_lock_duration, logger_span, DistributedLockProvider};

/// One mutex per lock name in use, shared by every provider in the process.
/// An entry lives only while some provider holds or awaits its mutex.
static REGISTRY: LazyLock<parking_lot::Mutex<HashMap<LockName, Arc<Mutex<()>>>>> =
    LazyLock::new(Default::default);

fn named_mutex(name: &LockName) -> Arc<Mutex<()>> {
    REGISTRY.lock().entry(name.clone()).or_default().clone()
}

/// Drop the entry for `name` once the registry's own reference is the last.
///
/// Every other reference is cloned out under the registry lock, so the count
/// cannot grow while it is being checked here.
fn prune(name: &LockName) {
    let mut registry = REGISTRY.lock();
    if registry.get(name).is_some_and(|m| Arc::strong_count(m) == 1) {
        registry.remove(name);
    }
}

struct Held {
    _guard: OwnedMutexGuard<()>,
    duration: Duration,
}

#[derive(Default)]
struct State {
    span: Option<tracing::Span>,
    held: Option<Held>,
}

/// Lock provider whose "cluster" is the current process.
///
/// Instances created with the same [`LockName`] exclude each other. The lock
/// has no lease: it stays held until `unlock` or `close`.
pub struct MemoryLockProvider {
    name: LockName,
    state: Mutex<State>,
}

impl MemoryLockProvider {
    pub fn new(name: LockName) -> Self {
        Self {
            name,
            state: Mutex::new(State::default()),
        }
    }
}

impl Default for MemoryLockProvider {
    fn default() -> Self {
        Self::new(LockName::default())
    }
}

#[async_trait]
impl DistributedLockProvider for MemoryLockProvider {
    async fn init(&self, logger: Option<tracing::Span>) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.span = Some(logger_span(logger, "memory"));
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let state = self.state.lock().await;
        state.span.as_ref().map(|_| ()).ok_or(StorageError::NotInitialized)
    }

    async fn close(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let span = state.span.take().ok_or(StorageError::NotInitialized)?;
        if state.held.take().is_some() {
            prune(&self.name);
            debug!(parent: &span, lock = %self.name, "released lock on close");
        }
        Ok(())
    }

    async fn distributed_timed_lock(&self, max_lock_time: Duration) -> Result<(), StorageError> {
        check_lock_duration(max_lock_time)?;
        let mut state = self.state.lock().await;
        let span = state.span.clone().ok_or(StorageError::NotInitialized)?;
        if state.held.is_some() {
            return Err(StorageError::AlreadyHeld);
        }

        let acquired =
            tokio::time::timeout(max_lock_time, named_mutex(&self.name).lock_owned()).await;
        let Ok(guard) = acquired else {
            prune(&self.name);
            return Err(StorageError::LockTimeout {
                waited: max_lock_time,
            });
        };
        state.held = Some(Held {
            _guard: guard,
            duration: max_lock_time,
        });
        debug!(parent: &span, lock = %self.name, ?max_lock_time, "acquired lock");
        Ok(())
    }

    async fn unlock(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let span = state.span.clone().ok_or(StorageError::NotInitialized)?;
        state.held.take().ok_or(StorageError::NotHeld)?;
        prune(&self.name);
        debug!(parent: &span, lock = %self.name, "released lock");
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

    fn unique_name(test: &str) -> LockName {
        LockName::new("memory-lock-test", format!("{test}-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn second_instance_waits_for_release() {
        let name = unique_name("wait");
        let a = MemoryLockProvider::new(name.clone());
        let b = MemoryLockProvider::new(name);
        a.init(None).await.unwrap();
        b.init(None).await.unwrap();

        a.distributed_timed_lock(Duration::from_secs(5)).await.unwrap();
        let err = b
            .distributed_timed_lock(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { .. }));

        a.unlock().await.unwrap();
        b.distributed_timed_lock(Duration::from_secs(1)).await.unwrap();
        assert_eq!(b.get_duration().await, Duration::from_secs(1));
        b.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn different_names_do_not_contend() {
        let a = MemoryLockProvider::new(unique_name("a"));
        let b = MemoryLockProvider::new(unique_name("b"));
        a.init(None).await.unwrap();
        b.init(None).await.unwrap();
        a.distributed_timed_lock(Duration::from_secs(1)).await.unwrap();
        b.distributed_timed_lock(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn close_releases_held_lock() {
        let name = unique_name("close");
        let a = MemoryLockProvider::new(name.clone());
        let b = MemoryLockProvider::new(name);
        a.init(None).await.unwrap();
        b.init(None).await.unwrap();

        a.distributed_timed_lock(Duration::from_secs(5)).await.unwrap();
        a.close().await.unwrap();
        b.distributed_timed_lock(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(a.close().await, Err(StorageError::NotInitialized)));
    }

    fn registered(name: &LockName) -> bool {
        REGISTRY.lock().contains_key(name)
    }

    #[tokio::test]
    async fn registry_forgets_names_once_released() {
        let name = unique_name("evict");
        let a = MemoryLockProvider::new(name.clone());
        let b = MemoryLockProvider::new(name.clone());
        a.init(None).await.unwrap();
        b.init(None).await.unwrap();

        a.distributed_timed_lock(Duration::from_secs(5)).await.unwrap();
        assert!(registered(&name));
        // A timed-out waiter must not evict the holder's mutex.
        b.distributed_timed_lock(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(registered(&name));

        a.unlock().await.unwrap();
        assert!(!registered(&name));

        b.distributed_timed_lock(Duration::from_secs(1)).await.unwrap();
        assert!(registered(&name));
        b.close().await.unwrap();
        assert!(!registered(&name));
    }

    #[tokio::test]
    async fn rejects_sub_second_durations() {
        let a = MemoryLockProvider::new(unique_name("short"));
        a.init(None).await.unwrap();
        let err = a
            .distributed_timed_lock(Duration::from_millis(999))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidLockDuration { .. }));
        assert_eq!(a.get_duration().await, Duration::ZERO);
    }
}
