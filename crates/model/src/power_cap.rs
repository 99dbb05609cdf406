//! Power-capping tasks (snapshot or patch requests) and the per-component
//! operations they expand into.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

string_enum! {
    pub enum PowerCapTaskType {
        Snapshot => "snapshot",
        Patch => "patch",
    }
}

string_enum! {
    pub enum PowerCapTaskStatus {
        New => "new",
        InProgress => "in-progress",
        Completed => "completed",
    }
}

string_enum! {
    /// Operation status. The capitalized terminal values are the strings
    /// the API has always reported and are kept as-is.
    pub enum PowerCapOpStatus {
        New => "new",
        InProgress => "in-progress",
        Failed => "failed",
        Succeeded => "Succeeded",
        Unsupported => "Unsupported",
    }
}

// ── Request parameters ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerCapSnapshotParameter {
    pub xnames: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerCapPatchParameter {
    pub components: Vec<PowerCapComponentParameter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerCapComponentParameter {
    pub xname: String,
    pub controls: Vec<PowerCapControlParameter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerCapControlParameter {
    pub name: String,
    pub value: i64,
}

// ── Results ─────────────────────────────────────────────────────────

/// Per-component result of a power-cap operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerCapComponent {
    pub xname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<PowerCapabilities>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub power_cap_limits: Vec<PowerCapControls>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_limit_max: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_limit_min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub powerup_power: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerCapControls {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_value: Option<i64>,
}

/// Operation counts by status, saved on a task when it is compressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerCapTaskCounts {
    pub total: u32,
    pub new: u32,
    #[serde(rename = "in-progress")]
    pub in_progress: u32,
    pub failed: u32,
    pub succeeded: u32,
    #[serde(rename = "un-supported")]
    pub unsupported: u32,
}

impl PowerCapTaskCounts {
    /// Count the given operations by status.
    pub fn tally(operations: &[PowerCapOperation]) -> Self {
        let mut counts = Self::default();
        for op in operations {
            counts.total += 1;
            match op.status {
                PowerCapOpStatus::New => counts.new += 1,
                PowerCapOpStatus::InProgress => counts.in_progress += 1,
                PowerCapOpStatus::Failed => counts.failed += 1,
                PowerCapOpStatus::Succeeded => counts.succeeded += 1,
                PowerCapOpStatus::Unsupported => counts.unsupported += 1,
            }
        }
        counts
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

// ── Task & operation records ────────────────────────────────────────

/// A tracked power-capping request.
///
/// `task_type` and the creation parameters are fixed at creation. The
/// completion summary (`is_compressed`, `task_counts`, `components`) is
/// written once, when the task completes and its operations are folded in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerCapTask {
    pub task_id: Uuid,
    #[serde(rename = "type")]
    pub task_type: PowerCapTaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_parameters: Option<PowerCapSnapshotParameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_parameters: Option<PowerCapPatchParameter>,
    #[serde(with = "time::serde::rfc3339")]
    pub task_create_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub automatic_expiration_time: OffsetDateTime,
    pub task_status: PowerCapTaskStatus,
    #[serde(default)]
    pub operation_ids: Vec<Uuid>,
    #[serde(default)]
    pub is_compressed: bool,
    #[serde(default)]
    pub task_counts: PowerCapTaskCounts,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<PowerCapComponent>,
}

impl PowerCapTask {
    pub fn new_snapshot(parameters: PowerCapSnapshotParameter, expiration_minutes: i64) -> Self {
        let mut task = Self::new(PowerCapTaskType::Snapshot, expiration_minutes);
        task.snapshot_parameters = Some(parameters);
        task
    }

    pub fn new_patch(parameters: PowerCapPatchParameter, expiration_minutes: i64) -> Self {
        let mut task = Self::new(PowerCapTaskType::Patch, expiration_minutes);
        task.patch_parameters = Some(parameters);
        task
    }

    fn new(task_type: PowerCapTaskType, expiration_minutes: i64) -> Self {
        let now = crate::now();
        Self {
            task_id: Uuid::new_v4(),
            task_type,
            snapshot_parameters: None,
            patch_parameters: None,
            task_create_time: now,
            automatic_expiration_time: now + Duration::minutes(expiration_minutes),
            task_status: PowerCapTaskStatus::New,
            operation_ids: Vec::new(),
            is_compressed: false,
            task_counts: PowerCapTaskCounts::default(),
            components: Vec::new(),
        }
    }

    /// Fold the finished operations into the task's completion summary.
    pub fn compress(&mut self, operations: &[PowerCapOperation]) {
        self.task_counts = PowerCapTaskCounts::tally(operations);
        self.components = operations.iter().map(|op| op.component.clone()).collect();
        self.is_compressed = true;
        self.task_status = PowerCapTaskStatus::Completed;
    }

    pub fn at_storage_precision(mut self) -> Self {
        self.task_create_time = crate::truncate_to_micros(self.task_create_time);
        self.automatic_expiration_time = crate::truncate_to_micros(self.automatic_expiration_time);
        self
    }

    /// Copy the fields a re-store may change from `update` onto `self`.
    pub fn apply_update(&mut self, update: &PowerCapTask) {
        self.task_status = update.task_status;
        self.operation_ids.clone_from(&update.operation_ids);
        self.is_compressed = update.is_compressed;
        self.task_counts = update.task_counts;
        self.components.clone_from(&update.components);
    }
}

/// One component's share of a power-cap task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerCapOperation {
    pub operation_id: Uuid,
    pub task_id: Uuid,
    #[serde(rename = "type")]
    pub op_type: String,
    pub status: PowerCapOpStatus,
    #[serde(default)]
    pub component: PowerCapComponent,
}

impl PowerCapOperation {
    pub fn new(task_id: Uuid, op_type: impl Into<String>) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            task_id,
            op_type: op_type.into(),
            status: PowerCapOpStatus::New,
            component: PowerCapComponent::default(),
        }
    }

    /// Copy the fields a re-store may change from `update` onto `self`.
    pub fn apply_update(&mut self, update: &PowerCapOperation) {
        self.status = update.status;
        self.component = update.component.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_task() -> PowerCapTask {
        PowerCapTask::new_snapshot(
            PowerCapSnapshotParameter {
                xnames: vec!["x0c0s0b0n0".into(), "x0c0s1b0n0".into()],
            },
            20,
        )
    }

    #[test]
    fn snapshot_task_starts_uncompressed() {
        let task = snapshot_task();
        assert_eq!(task.task_type, PowerCapTaskType::Snapshot);
        assert_eq!(task.task_status, PowerCapTaskStatus::New);
        assert!(task.patch_parameters.is_none());
        assert!(!task.is_compressed);
        assert!(task.task_counts.is_empty());
        assert_eq!(
            task.automatic_expiration_time - task.task_create_time,
            Duration::minutes(20)
        );
    }

    #[test]
    fn compress_tallies_operation_statuses() {
        let mut task = snapshot_task();
        let mut ops: Vec<PowerCapOperation> = (0..4)
            .map(|_| PowerCapOperation::new(task.task_id, "snapshot"))
            .collect();
        ops[0].status = PowerCapOpStatus::Succeeded;
        ops[1].status = PowerCapOpStatus::Succeeded;
        ops[2].status = PowerCapOpStatus::Failed;
        ops[3].status = PowerCapOpStatus::Unsupported;

        task.compress(&ops);
        assert!(task.is_compressed);
        assert_eq!(task.task_status, PowerCapTaskStatus::Completed);
        assert_eq!(task.task_counts.total, 4);
        assert_eq!(task.task_counts.succeeded, 2);
        assert_eq!(task.task_counts.failed, 1);
        assert_eq!(task.task_counts.unsupported, 1);
        assert_eq!(task.components.len(), 4);
    }

    #[test]
    fn apply_update_keeps_type_and_parameters() {
        let mut stored = snapshot_task();
        let mut update = stored.clone();
        update.task_type = PowerCapTaskType::Patch;
        update.snapshot_parameters = None;
        update.is_compressed = true;
        update.task_counts.total = 3;

        stored.apply_update(&update);
        assert_eq!(stored.task_type, PowerCapTaskType::Snapshot);
        assert!(stored.snapshot_parameters.is_some());
        assert!(stored.is_compressed);
        assert_eq!(stored.task_counts.total, 3);
    }

    #[test]
    fn counts_use_api_field_names() {
        let counts = PowerCapTaskCounts {
            in_progress: 1,
            unsupported: 2,
            ..Default::default()
        };
        let json = serde_json::to_value(counts).unwrap();
        assert_eq!(json["in-progress"], 1);
        assert_eq!(json["un-supported"], 2);
    }
}
