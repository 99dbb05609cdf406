//! Process-local backend for single-instance deployments and tests.

mod lock;

pub use lock::MemoryLockProvider;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use pcs_model::{
    truncate_to_micros, PowerCapOperation, PowerCapTask, PowerStatus, PowerStatusComponent,
    Transition, TransitionTask,
};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::error::{validate_xname, StorageError};
use crate::traits::{logger_span, StorageProvider};

#[derive(Default)]
struct Tables {
    power_status_master: Option<OffsetDateTime>,
    power_status: BTreeMap<String, PowerStatusComponent>,
    transitions: HashMap<Uuid, Transition>,
    /// Keyed by (transition id, task id) so a transition's tasks are one range.
    transition_tasks: BTreeMap<(Uuid, Uuid), TransitionTask>,
    power_cap_tasks: HashMap<Uuid, PowerCapTask>,
    /// Keyed by (task id, operation id).
    power_cap_operations: BTreeMap<(Uuid, Uuid), PowerCapOperation>,
}

struct Connected {
    tables: Tables,
    span: tracing::Span,
}

/// In-memory [`StorageProvider`]. Data lives until `close`.
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<Option<Connected>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> Result<T, StorageError>) -> Result<T, StorageError> {
        let guard = self.inner.read();
        let connected = guard.as_ref().ok_or(StorageError::NotInitialized)?;
        f(&connected.tables)
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut guard = self.inner.write();
        let connected = guard.as_mut().ok_or(StorageError::NotInitialized)?;
        f(&mut connected.tables)
    }
}

fn id_range(parent: Uuid) -> std::ops::RangeInclusive<(Uuid, Uuid)> {
    (parent, Uuid::nil())..=(parent, Uuid::max())
}

#[async_trait]
impl StorageProvider for MemoryStorage {
    async fn init(&self, logger: Option<tracing::Span>) -> Result<(), StorageError> {
        let span = logger_span(logger, "memory");
        let mut guard = self.inner.write();
        match guard.as_mut() {
            Some(connected) => connected.span = span,
            None => {
                debug!(parent: &span, "initialized in-memory storage");
                *guard = Some(Connected {
                    tables: Tables::default(),
                    span,
                });
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.read(|_| Ok(()))
    }

    async fn close(&self) -> Result<(), StorageError> {
        let connected = self.inner.write().take().ok_or(StorageError::NotInitialized)?;
        debug!(parent: &connected.span, "closed in-memory storage");
        Ok(())
    }

    // ── Power status ─────────────────────────────────────────────────────────

    async fn get_power_status_master(&self) -> Result<OffsetDateTime, StorageError> {
        self.read(|t| {
            t.power_status_master
                .ok_or_else(|| StorageError::not_found("power status master", "singleton"))
        })
    }

    async fn store_power_status_master(
        &self,
        last_updated: OffsetDateTime,
    ) -> Result<(), StorageError> {
        self.write(|t| {
            t.power_status_master = Some(truncate_to_micros(last_updated));
            Ok(())
        })
    }

    async fn tas_power_status_master(
        &self,
        new: OffsetDateTime,
        expected: OffsetDateTime,
    ) -> Result<bool, StorageError> {
        self.write(|t| {
            let current = t
                .power_status_master
                .as_mut()
                .ok_or_else(|| StorageError::not_found("power status master", "singleton"))?;
            if *current != truncate_to_micros(expected) {
                return Ok(false);
            }
            *current = truncate_to_micros(new);
            Ok(true)
        })
    }

    async fn store_power_status(
        &self,
        component: PowerStatusComponent,
    ) -> Result<(), StorageError> {
        validate_xname(&component.xname)?;
        let component = component.at_storage_precision();
        self.write(|t| {
            t.power_status.insert(component.xname.clone(), component);
            Ok(())
        })
    }

    async fn get_power_status(&self, xname: &str) -> Result<PowerStatusComponent, StorageError> {
        validate_xname(xname)?;
        self.read(|t| {
            t.power_status
                .get(xname)
                .cloned()
                .ok_or_else(|| StorageError::not_found("power status component", xname))
        })
    }

    async fn delete_power_status(&self, xname: &str) -> Result<(), StorageError> {
        validate_xname(xname)?;
        self.write(|t| {
            t.power_status.remove(xname);
            Ok(())
        })
    }

    async fn get_all_power_status(&self) -> Result<PowerStatus, StorageError> {
        self.read(|t| {
            Ok(PowerStatus {
                status: t.power_status.values().cloned().collect(),
            })
        })
    }

    async fn get_power_status_hierarchy(&self, xname: &str) -> Result<PowerStatus, StorageError> {
        validate_xname(xname)?;
        self.read(|t| {
            let status = t
                .power_status
                .range(xname.to_string()..)
                .take_while(|(key, _)| key.starts_with(xname))
                .map(|(_, c)| c.clone())
                .collect();
            Ok(PowerStatus { status })
        })
    }

    // ── Power capping ────────────────────────────────────────────────────────

    async fn store_power_cap_task(&self, task: PowerCapTask) -> Result<(), StorageError> {
        let task = task.at_storage_precision();
        self.write(|t| {
            match t.power_cap_tasks.get_mut(&task.task_id) {
                Some(existing) => existing.apply_update(&task),
                None => {
                    t.power_cap_tasks.insert(task.task_id, task);
                }
            }
            Ok(())
        })
    }

    async fn store_power_cap_operation(&self, op: PowerCapOperation) -> Result<(), StorageError> {
        self.write(|t| {
            if !t.power_cap_tasks.contains_key(&op.task_id) {
                return Err(StorageError::not_found("power cap task", op.task_id));
            }
            match t.power_cap_operations.get_mut(&(op.task_id, op.operation_id)) {
                Some(existing) => existing.apply_update(&op),
                None => {
                    t.power_cap_operations
                        .insert((op.task_id, op.operation_id), op);
                }
            }
            Ok(())
        })
    }

    async fn get_power_cap_task(&self, task_id: Uuid) -> Result<PowerCapTask, StorageError> {
        self.read(|t| {
            t.power_cap_tasks
                .get(&task_id)
                .cloned()
                .ok_or_else(|| StorageError::not_found("power cap task", task_id))
        })
    }

    async fn get_power_cap_operation(
        &self,
        task_id: Uuid,
        operation_id: Uuid,
    ) -> Result<PowerCapOperation, StorageError> {
        self.read(|t| {
            t.power_cap_operations
                .get(&(task_id, operation_id))
                .cloned()
                .ok_or_else(|| StorageError::not_found("power cap operation", operation_id))
        })
    }

    async fn get_all_power_cap_operations_for_task(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<PowerCapOperation>, StorageError> {
        self.read(|t| {
            Ok(t.power_cap_operations
                .range(id_range(task_id))
                .map(|(_, op)| op.clone())
                .collect())
        })
    }

    async fn get_all_power_cap_tasks(&self) -> Result<Vec<PowerCapTask>, StorageError> {
        self.read(|t| Ok(t.power_cap_tasks.values().cloned().collect()))
    }

    async fn delete_power_cap_task(&self, task_id: Uuid) -> Result<(), StorageError> {
        self.write(|t| {
            t.power_cap_tasks.remove(&task_id);
            t.power_cap_operations.retain(|(task, _), _| *task != task_id);
            Ok(())
        })
    }

    async fn delete_power_cap_operation(
        &self,
        task_id: Uuid,
        operation_id: Uuid,
    ) -> Result<(), StorageError> {
        self.write(|t| {
            t.power_cap_operations.remove(&(task_id, operation_id));
            Ok(())
        })
    }

    // ── Transitions ──────────────────────────────────────────────────────────

    async fn store_transition(&self, transition: Transition) -> Result<(), StorageError> {
        let transition = transition.at_storage_precision();
        self.write(|t| {
            match t.transitions.get_mut(&transition.transition_id) {
                Some(existing) => existing.apply_update(&transition),
                None => {
                    t.transitions.insert(transition.transition_id, transition);
                }
            }
            Ok(())
        })
    }

    async fn store_transition_task(&self, task: TransitionTask) -> Result<(), StorageError> {
        self.write(|t| {
            match t.transition_tasks.get_mut(&(task.transition_id, task.task_id)) {
                Some(existing) => existing.apply_update(&task),
                None => {
                    t.transition_tasks
                        .insert((task.transition_id, task.task_id), task);
                }
            }
            Ok(())
        })
    }

    async fn get_transition(
        &self,
        transition_id: Uuid,
    ) -> Result<(Transition, Transition), StorageError> {
        self.read(|t| {
            let transition = t
                .transitions
                .get(&transition_id)
                .cloned()
                .ok_or_else(|| StorageError::not_found("transition", transition_id))?;
            Ok((transition.clone(), transition))
        })
    }

    async fn get_transition_task(
        &self,
        transition_id: Uuid,
        task_id: Uuid,
    ) -> Result<TransitionTask, StorageError> {
        self.read(|t| {
            t.transition_tasks
                .get(&(transition_id, task_id))
                .cloned()
                .ok_or_else(|| StorageError::not_found("transition task", task_id))
        })
    }

    async fn get_all_tasks_for_transition(
        &self,
        transition_id: Uuid,
    ) -> Result<Vec<TransitionTask>, StorageError> {
        self.read(|t| {
            Ok(t.transition_tasks
                .range(id_range(transition_id))
                .map(|(_, task)| task.clone())
                .collect())
        })
    }

    async fn get_all_transitions(&self) -> Result<Vec<Transition>, StorageError> {
        self.read(|t| Ok(t.transitions.values().cloned().collect()))
    }

    async fn delete_transition(&self, transition_id: Uuid) -> Result<(), StorageError> {
        self.write(|t| {
            t.transitions.remove(&transition_id);
            t.transition_tasks
                .retain(|(transition, _), _| *transition != transition_id);
            Ok(())
        })
    }

    async fn delete_transition_task(
        &self,
        transition_id: Uuid,
        task_id: Uuid,
    ) -> Result<(), StorageError> {
        self.write(|t| {
            t.transition_tasks.remove(&(transition_id, task_id));
            Ok(())
        })
    }

    async fn tas_transition(
        &self,
        new: Transition,
        expected: Transition,
    ) -> Result<bool, StorageError> {
        let (new, expected) = (new.at_storage_precision(), expected.at_storage_precision());
        self.write(|t| {
            let current = t
                .transitions
                .get_mut(&new.transition_id)
                .ok_or_else(|| StorageError::not_found("transition", new.transition_id))?;
            if !expected.matches_ignoring_location(current) {
                return Ok(false);
            }
            current.apply_update(&new);
            Ok(true)
        })
    }
}
