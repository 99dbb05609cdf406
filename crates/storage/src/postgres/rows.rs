//! Row types for the PostgreSQL tables and their conversion into model records.
//!
//! Enum columns are TEXT holding the variant's string form, so a row that
//! carries an unknown value fails conversion with [`ModelError::UnknownVariant`].

use pcs_model::{
    Location, ModelError, PowerCapComponent, PowerCapOperation, PowerCapPatchParameter,
    PowerCapSnapshotParameter, PowerCapTask, PowerCapTaskCounts, PowerStatusComponent,
    Transition, TransitionTask,
};
use sqlx::types::Json;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
pub(super) struct PowerStatusRow {
    pub xname: String,
    pub power_state: String,
    pub management_state: String,
    pub supported_power_transitions: Vec<String>,
    pub error: String,
    pub last_updated: OffsetDateTime,
}

impl TryFrom<PowerStatusRow> for PowerStatusComponent {
    type Error = ModelError;

    fn try_from(row: PowerStatusRow) -> Result<Self, Self::Error> {
        Ok(PowerStatusComponent {
            xname: row.xname,
            power_state: row.power_state.parse()?,
            management_state: row.management_state.parse()?,
            supported_power_transitions: row.supported_power_transitions,
            error: row.error,
            last_updated: row.last_updated,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct TransitionRow {
    pub id: Uuid,
    pub operation: String,
    pub task_deadline: i32,
    pub create_time: OffsetDateTime,
    pub last_active_time: OffsetDateTime,
    pub automatic_expiration_time: OffsetDateTime,
    pub location: Json<Vec<Location>>,
    pub status: String,
    pub task_ids: Vec<Uuid>,
}

impl TryFrom<TransitionRow> for Transition {
    type Error = ModelError;

    fn try_from(row: TransitionRow) -> Result<Self, Self::Error> {
        Ok(Transition {
            transition_id: row.id,
            operation: row.operation.parse()?,
            task_deadline: row.task_deadline,
            create_time: row.create_time,
            last_active_time: row.last_active_time,
            automatic_expiration_time: row.automatic_expiration_time,
            location: row.location.0,
            status: row.status.parse()?,
            task_ids: row.task_ids,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct TransitionTaskRow {
    pub id: Uuid,
    pub transition_id: Uuid,
    pub operation: String,
    pub state: String,
    pub xname: String,
    pub reservation_key: String,
    pub deputy_key: String,
    pub status: String,
    pub status_desc: String,
    pub error: String,
}

impl TryFrom<TransitionTaskRow> for TransitionTask {
    type Error = ModelError;

    fn try_from(row: TransitionTaskRow) -> Result<Self, Self::Error> {
        Ok(TransitionTask {
            task_id: row.id,
            transition_id: row.transition_id,
            operation: row.operation.parse()?,
            state: row.state.parse()?,
            xname: row.xname,
            reservation_key: row.reservation_key,
            deputy_key: row.deputy_key,
            status: row.status.parse()?,
            status_desc: row.status_desc,
            error: row.error,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct PowerCapTaskRow {
    pub id: Uuid,
    #[sqlx(rename = "type")]
    pub task_type: String,
    pub snapshot_parameters: Option<Json<PowerCapSnapshotParameter>>,
    pub patch_parameters: Option<Json<PowerCapPatchParameter>>,
    pub task_create_time: OffsetDateTime,
    pub automatic_expiration_time: OffsetDateTime,
    pub task_status: String,
    pub operation_ids: Vec<Uuid>,
    pub is_compressed: bool,
    pub task_counts: Json<PowerCapTaskCounts>,
    pub components: Json<Vec<PowerCapComponent>>,
}

impl TryFrom<PowerCapTaskRow> for PowerCapTask {
    type Error = ModelError;

    fn try_from(row: PowerCapTaskRow) -> Result<Self, Self::Error> {
        Ok(PowerCapTask {
            task_id: row.id,
            task_type: row.task_type.parse()?,
            snapshot_parameters: row.snapshot_parameters.map(|p| p.0),
            patch_parameters: row.patch_parameters.map(|p| p.0),
            task_create_time: row.task_create_time,
            automatic_expiration_time: row.automatic_expiration_time,
            task_status: row.task_status.parse()?,
            operation_ids: row.operation_ids,
            is_compressed: row.is_compressed,
            task_counts: row.task_counts.0,
            components: row.components.0,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct PowerCapOperationRow {
    pub id: Uuid,
    pub power_cap_task_id: Uuid,
    #[sqlx(rename = "type")]
    pub op_type: String,
    pub status: String,
    pub component: Json<PowerCapComponent>,
}

impl TryFrom<PowerCapOperationRow> for PowerCapOperation {
    type Error = ModelError;

    fn try_from(row: PowerCapOperationRow) -> Result<Self, Self::Error> {
        Ok(PowerCapOperation {
            operation_id: row.id,
            task_id: row.power_cap_task_id,
            op_type: row.op_type,
            status: row.status.parse()?,
            component: row.component.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use pcs_model::{
        ManagementState, PowerCapTaskStatus, PowerCapTaskType, PowerOperation, PowerState,
        TaskState, TaskStatus, TransitionStatus,
    };

    use super::*;

    fn ts() -> OffsetDateTime {
        time::macros::datetime!(2024-05-01 12:00:00.123456 UTC)
    }

    #[test]
    fn power_status_row_converts() {
        let row = PowerStatusRow {
            xname: "x0c0s0b0n0".into(),
            power_state: "on".into(),
            management_state: "available".into(),
            supported_power_transitions: vec!["Off".into(), "Soft-Restart".into()],
            error: String::new(),
            last_updated: ts(),
        };
        let c = PowerStatusComponent::try_from(row).unwrap();
        assert_eq!(c.power_state, PowerState::On);
        assert_eq!(c.management_state, ManagementState::Available);
        assert_eq!(c.supported_power_transitions.len(), 2);
    }

    #[test]
    fn transition_row_converts() {
        let id = Uuid::new_v4();
        let row = TransitionRow {
            id,
            operation: "Soft-Restart".into(),
            task_deadline: 5,
            create_time: ts(),
            last_active_time: ts(),
            automatic_expiration_time: ts(),
            location: Json(vec![Location::new("x0c0s0b0n0")]),
            status: "in-progress".into(),
            task_ids: vec![Uuid::new_v4()],
        };
        let t = Transition::try_from(row).unwrap();
        assert_eq!(t.transition_id, id);
        assert_eq!(t.operation, PowerOperation::SoftRestart);
        assert_eq!(t.status, TransitionStatus::InProgress);
        assert_eq!(t.location.len(), 1);
    }

    #[test]
    fn unknown_enum_text_is_rejected() {
        let row = TransitionTaskRow {
            id: Uuid::new_v4(),
            transition_id: Uuid::new_v4(),
            operation: "On".into(),
            state: "Levitating".into(),
            xname: "x0c0s0b0n0".into(),
            reservation_key: String::new(),
            deputy_key: String::new(),
            status: "new".into(),
            status_desc: String::new(),
            error: String::new(),
        };
        let err = TransitionTask::try_from(row).unwrap_err();
        assert!(matches!(err, ModelError::UnknownVariant { kind: "TaskState", .. }));
    }

    #[test]
    fn task_row_converts() {
        let row = TransitionTaskRow {
            id: Uuid::new_v4(),
            transition_id: Uuid::new_v4(),
            operation: "Off".into(),
            state: "Confirming".into(),
            xname: "x0c0s0b0n0".into(),
            reservation_key: "rk".into(),
            deputy_key: "dk".into(),
            status: "succeeded".into(),
            status_desc: "done".into(),
            error: String::new(),
        };
        let task = TransitionTask::try_from(row).unwrap();
        assert_eq!(task.state, TaskState::Confirming);
        assert_eq!(task.status, TaskStatus::Succeeded);
    }

    #[test]
    fn power_cap_task_row_keeps_type_and_parameters() {
        let row = PowerCapTaskRow {
            id: Uuid::new_v4(),
            task_type: "snapshot".into(),
            snapshot_parameters: Some(Json(PowerCapSnapshotParameter {
                xnames: vec!["x0c0s0b0n0".into()],
            })),
            patch_parameters: None,
            task_create_time: ts(),
            automatic_expiration_time: ts(),
            task_status: "completed".into(),
            operation_ids: vec![],
            is_compressed: true,
            task_counts: Json(PowerCapTaskCounts::default()),
            components: Json(vec![]),
        };
        let task = PowerCapTask::try_from(row).unwrap();
        assert_eq!(task.task_type, PowerCapTaskType::Snapshot);
        assert_eq!(task.task_status, PowerCapTaskStatus::Completed);
        assert!(task.snapshot_parameters.is_some());
        assert!(task.is_compressed);
    }
}
