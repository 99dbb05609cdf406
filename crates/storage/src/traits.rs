use std::time::Duration;

use async_trait::async_trait;
use pcs_model::{
    PowerCapOperation, PowerCapTask, PowerStatus, PowerStatusComponent, Transition,
    TransitionTask,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::StorageError;

/// Persistence for transitions, power-cap tasks and power status.
///
/// Implemented once per backend: [`crate::MemoryStorage`],
/// [`crate::EtcdStorage`] and [`crate::PostgresStorage`]. Consumers hold an
/// `Arc<dyn StorageProvider>` and never talk to a backend directly.
///
/// ## Lifecycle
///
/// `init` must succeed before any other call. After `close`, every call
/// (including a second `close`) fails with [`StorageError::NotInitialized`].
///
/// ## Upserts
///
/// `store_*` is an upsert keyed by the record's id. Once a record exists,
/// a store only updates its mutable fields (see each record's
/// `apply_update`); immutable fields such as a transition's locations or a
/// power-cap task's type keep their creation-time values. Stores are
/// last-writer-wins. Use [`StorageProvider::tas_transition`] or
/// [`StorageProvider::tas_power_status_master`] for conditional updates.
///
/// ## Deletes
///
/// Deleting a transition deletes its tasks; deleting a power-cap task deletes
/// its operations. Deleting a missing record succeeds.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static`; calls on different
/// records may run concurrently from many tasks.
#[async_trait]
pub trait StorageProvider: Send + Sync + 'static {
    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Connect to the backend. Events are logged under `logger`, or under a
    /// default span when `None`.
    async fn init(&self, logger: Option<tracing::Span>) -> Result<(), StorageError>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Release all backend resources.
    async fn close(&self) -> Result<(), StorageError>;

    // ── Power status ─────────────────────────────────────────────────────────

    /// Returns [`StorageError::NotFound`] until the master record is first stored.
    async fn get_power_status_master(&self) -> Result<OffsetDateTime, StorageError>;

    async fn store_power_status_master(&self, last_updated: OffsetDateTime)
        -> Result<(), StorageError>;

    /// Replace the master timestamp with `new` only if it currently equals
    /// `expected`. `Ok(false)` on mismatch; [`StorageError::NotFound`] when no
    /// master record exists.
    async fn tas_power_status_master(
        &self,
        new: OffsetDateTime,
        expected: OffsetDateTime,
    ) -> Result<bool, StorageError>;

    async fn store_power_status(&self, component: PowerStatusComponent)
        -> Result<(), StorageError>;

    async fn get_power_status(&self, xname: &str) -> Result<PowerStatusComponent, StorageError>;

    async fn delete_power_status(&self, xname: &str) -> Result<(), StorageError>;

    async fn get_all_power_status(&self) -> Result<PowerStatus, StorageError>;

    /// Every component whose xname starts with `xname` as a plain string
    /// prefix. `x1c0s1b1` therefore also matches `x1c0s1b10n0`.
    async fn get_power_status_hierarchy(&self, xname: &str) -> Result<PowerStatus, StorageError>;

    // ── Power capping ────────────────────────────────────────────────────────

    async fn store_power_cap_task(&self, task: PowerCapTask) -> Result<(), StorageError>;

    async fn store_power_cap_operation(&self, op: PowerCapOperation) -> Result<(), StorageError>;

    async fn get_power_cap_task(&self, task_id: Uuid) -> Result<PowerCapTask, StorageError>;

    async fn get_power_cap_operation(
        &self,
        task_id: Uuid,
        operation_id: Uuid,
    ) -> Result<PowerCapOperation, StorageError>;

    async fn get_all_power_cap_operations_for_task(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<PowerCapOperation>, StorageError>;

    async fn get_all_power_cap_tasks(&self) -> Result<Vec<PowerCapTask>, StorageError>;

    /// Delete a task and all of its operations.
    async fn delete_power_cap_task(&self, task_id: Uuid) -> Result<(), StorageError>;

    async fn delete_power_cap_operation(
        &self,
        task_id: Uuid,
        operation_id: Uuid,
    ) -> Result<(), StorageError>;

    // ── Transitions ──────────────────────────────────────────────────────────

    async fn store_transition(&self, transition: Transition) -> Result<(), StorageError>;

    async fn store_transition_task(&self, task: TransitionTask) -> Result<(), StorageError>;

    /// Returns `(full, first_page)`.
    ///
    /// `full` is the complete record. `first_page` is the representation to
    /// pass as `expected` to [`StorageProvider::tas_transition`]; on backends
    /// that paginate large location lists it carries only the first chunk,
    /// elsewhere it equals `full`.
    async fn get_transition(
        &self,
        transition_id: Uuid,
    ) -> Result<(Transition, Transition), StorageError>;

    async fn get_transition_task(
        &self,
        transition_id: Uuid,
        task_id: Uuid,
    ) -> Result<TransitionTask, StorageError>;

    async fn get_all_tasks_for_transition(
        &self,
        transition_id: Uuid,
    ) -> Result<Vec<TransitionTask>, StorageError>;

    async fn get_all_transitions(&self) -> Result<Vec<Transition>, StorageError>;

    /// Delete a transition and all of its tasks.
    async fn delete_transition(&self, transition_id: Uuid) -> Result<(), StorageError>;

    async fn delete_transition_task(
        &self,
        transition_id: Uuid,
        task_id: Uuid,
    ) -> Result<(), StorageError>;

    /// Atomically compare the stored transition with `expected` (ignoring
    /// locations) and, if equal, apply `new`.
    ///
    /// `Ok(false)` means the stored value differed and nothing was written.
    /// A missing transition is [`StorageError::NotFound`].
    async fn tas_transition(
        &self,
        new: Transition,
        expected: Transition,
    ) -> Result<bool, StorageError>;
}

/// A cluster-wide, timed, exclusive lock.
///
/// Independent of the storage provider's record-level concurrency control.
/// At most one provider instance across all processes holds the lock for a
/// given [`crate::LockName`] at any time.
///
/// Acquire, release and duration readout on one instance are serialized.
#[async_trait]
pub trait DistributedLockProvider: Send + Sync + 'static {
    async fn init(&self, logger: Option<tracing::Span>) -> Result<(), StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;

    /// Release any held lock, then release backend resources.
    async fn close(&self) -> Result<(), StorageError>;

    /// Block until the lock is acquired or `max_lock_time` elapses.
    ///
    /// `max_lock_time` is both the maximum wait and, on backends with lease
    /// expiry, how long the lock stays held without an `unlock`. Durations
    /// below one second are rejected, as is a second acquire on an instance
    /// that already holds the lock.
    async fn distributed_timed_lock(&self, max_lock_time: Duration) -> Result<(), StorageError>;

    async fn unlock(&self) -> Result<(), StorageError>;

    /// The duration requested by the current holder, or zero when not held.
    async fn get_duration(&self) -> Duration;
}

/// Smallest lock duration accepted by [`DistributedLockProvider::distributed_timed_lock`].
pub const MIN_LOCK_DURATION: Duration = Duration::from_secs(1);

pub(crate) fn check_lock_duration(requested: Duration) -> Result<(), StorageError> {
    if requested < MIN_LOCK_DURATION {
        return Err(StorageError::InvalidLockDuration { requested });
    }
    Ok(())
}

/// The span backend events are logged under.
pub(crate) fn logger_span(logger: Option<tracing::Span>, backend: &'static str) -> tracing::Span {
    logger.unwrap_or_else(|| tracing::info_span!("pcs_storage", backend))
}
