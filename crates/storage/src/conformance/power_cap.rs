use std::future::Future;

use pcs_model::{
    PowerCapComponent, PowerCapControlParameter, PowerCapComponentParameter, PowerCapControls,
    PowerCapOpStatus, PowerCapOperation, PowerCapPatchParameter, PowerCapSnapshotParameter,
    PowerCapTask, PowerCapTaskStatus, PowerCapTaskType,
};
use uuid::Uuid;

use super::{expect_not_found, CaseResult, Cases, Section};
use crate::StorageProvider;

pub(super) async fn run_power_cap_tests<S, F, Fut>(factory: &F) -> Vec<CaseResult>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut cases = Cases::new(Section::PowerCap);
    cases.record("task_store_then_get_round_trips", task_store_then_get_round_trips(factory).await);
    cases.record(
        "completed_task_keeps_type_and_parameters",
        completed_task_keeps_type_and_parameters(factory).await,
    );
    cases.record(
        "operation_requires_existing_task",
        operation_requires_existing_task(factory).await,
    );
    cases.record("operations_store_get_and_list", operations_store_get_and_list(factory).await);
    cases.record("operation_restore_keeps_type", operation_restore_keeps_type(factory).await);
    cases.record(
        "delete_task_cascades_to_operations",
        delete_task_cascades_to_operations(factory).await,
    );
    cases.record("missing_records_are_not_found", missing_records_are_not_found(factory).await);
    cases.finish()
}

fn snapshot_task() -> PowerCapTask {
    PowerCapTask::new_snapshot(
        PowerCapSnapshotParameter {
            xnames: vec!["x0c0s0b0n0".into(), "x0c0s0b0n1".into()],
        },
        60,
    )
}

fn patch_task() -> PowerCapTask {
    PowerCapTask::new_patch(
        PowerCapPatchParameter {
            components: vec![PowerCapComponentParameter {
                xname: "x0c0s0b0n0".into(),
                controls: vec![PowerCapControlParameter {
                    name: "Node Power Limit".into(),
                    value: 400,
                }],
            }],
        },
        60,
    )
}

fn finished_op(task: &PowerCapTask, xname: &str, status: PowerCapOpStatus) -> PowerCapOperation {
    let mut op = PowerCapOperation::new(task.task_id, task.task_type.as_str());
    op.status = status;
    op.component = PowerCapComponent {
        xname: xname.to_string(),
        power_cap_limits: vec![PowerCapControls {
            name: "Node Power Limit".into(),
            current_value: Some(350),
            maximum_value: Some(850),
            minimum_value: Some(350),
        }],
        ..PowerCapComponent::default()
    };
    op
}

async fn task_store_then_get_round_trips<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for task in [snapshot_task(), patch_task()] {
        s.store_power_cap_task(task.clone())
            .await
            .map_err(|e| format!("store {}: {e}", task.task_type))?;
        let got = s
            .get_power_cap_task(task.task_id)
            .await
            .map_err(|e| format!("get {}: {e}", task.task_type))?;
        if got != task {
            return Err(format!("round trip mismatch: stored {task:?}, got {got:?}"));
        }
    }
    let all = s
        .get_all_power_cap_tasks()
        .await
        .map_err(|e| format!("get all: {e}"))?;
    if all.len() != 2 {
        return Err(format!("expected 2 tasks, got {}", all.len()));
    }
    Ok(())
}

async fn completed_task_keeps_type_and_parameters<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let task = snapshot_task();
    s.store_power_cap_task(task.clone())
        .await
        .map_err(|e| format!("store: {e}"))?;

    let ops = vec![
        finished_op(&task, "x0c0s0b0n0", PowerCapOpStatus::Succeeded),
        finished_op(&task, "x0c0s0b0n1", PowerCapOpStatus::Failed),
    ];
    let mut completed = task.clone();
    completed.operation_ids = ops.iter().map(|op| op.operation_id).collect();
    completed.compress(&ops);
    // A completion write that lost its type and parameters must not erase them.
    completed.task_type = PowerCapTaskType::Patch;
    completed.snapshot_parameters = None;
    s.store_power_cap_task(completed.clone())
        .await
        .map_err(|e| format!("store completed: {e}"))?;

    let got = s
        .get_power_cap_task(task.task_id)
        .await
        .map_err(|e| format!("get: {e}"))?;
    if got.task_type != PowerCapTaskType::Snapshot {
        return Err(format!("task type changed to {}", got.task_type));
    }
    if got.snapshot_parameters != task.snapshot_parameters {
        return Err("snapshot parameters were not retained".into());
    }
    if got.task_status != PowerCapTaskStatus::Completed || !got.is_compressed {
        return Err(format!(
            "completion not persisted: status {}, compressed {}",
            got.task_status, got.is_compressed
        ));
    }
    if got.task_counts != completed.task_counts || got.components != completed.components {
        return Err(format!(
            "completion summary mismatch: counts {:?}, {} components",
            got.task_counts,
            got.components.len()
        ));
    }
    if got.operation_ids != completed.operation_ids {
        return Err("operation ids were not updated".into());
    }
    Ok(())
}

async fn operation_requires_existing_task<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let orphan = PowerCapOperation::new(Uuid::new_v4(), "snapshot");
    expect_not_found(
        s.store_power_cap_operation(orphan).await,
        "store operation without task",
    )
}

async fn operations_store_get_and_list<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let task = patch_task();
    let other = snapshot_task();
    for t in [&task, &other] {
        s.store_power_cap_task(t.clone())
            .await
            .map_err(|e| format!("store task: {e}"))?;
    }

    let ops: Vec<PowerCapOperation> = ["x0c0s0b0n0", "x0c0s0b0n1", "x0c0s1b0n0"]
        .iter()
        .map(|x| finished_op(&task, x, PowerCapOpStatus::InProgress))
        .collect();
    for op in &ops {
        s.store_power_cap_operation(op.clone())
            .await
            .map_err(|e| format!("store op: {e}"))?;
    }
    s.store_power_cap_operation(finished_op(&other, "x1c0s0b0n0", PowerCapOpStatus::New))
        .await
        .map_err(|e| format!("store foreign op: {e}"))?;

    let got = s
        .get_power_cap_operation(task.task_id, ops[1].operation_id)
        .await
        .map_err(|e| format!("get op: {e}"))?;
    if got != ops[1] {
        return Err(format!("op mismatch: stored {:?}, got {got:?}", ops[1]));
    }

    let listed = s
        .get_all_power_cap_operations_for_task(task.task_id)
        .await
        .map_err(|e| format!("list ops: {e}"))?;
    if listed.len() != ops.len() {
        return Err(format!("expected {} ops, got {}", ops.len(), listed.len()));
    }

    s.delete_power_cap_operation(task.task_id, ops[0].operation_id)
        .await
        .map_err(|e| format!("delete op: {e}"))?;
    expect_not_found(
        s.get_power_cap_operation(task.task_id, ops[0].operation_id)
            .await,
        "deleted op",
    )?;
    s.delete_power_cap_operation(task.task_id, ops[0].operation_id)
        .await
        .map_err(|e| format!("delete missing op: {e}"))
}

async fn operation_restore_keeps_type<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let task = snapshot_task();
    s.store_power_cap_task(task.clone())
        .await
        .map_err(|e| format!("store task: {e}"))?;
    let original = PowerCapOperation::new(task.task_id, "snapshot");
    s.store_power_cap_operation(original.clone())
        .await
        .map_err(|e| format!("store op: {e}"))?;

    let mut update = finished_op(&task, "x0c0s0b0n0", PowerCapOpStatus::Succeeded);
    update.operation_id = original.operation_id;
    update.op_type = "patch".into();
    s.store_power_cap_operation(update.clone())
        .await
        .map_err(|e| format!("re-store op: {e}"))?;

    let got = s
        .get_power_cap_operation(task.task_id, original.operation_id)
        .await
        .map_err(|e| format!("get op: {e}"))?;
    if got.op_type != "snapshot" {
        return Err(format!("operation type changed to {}", got.op_type));
    }
    if got.status != PowerCapOpStatus::Succeeded || got.component != update.component {
        return Err(format!("mutable fields not updated: {got:?}"));
    }
    Ok(())
}

async fn delete_task_cascades_to_operations<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let task = snapshot_task();
    let keep = patch_task();
    for t in [&task, &keep] {
        s.store_power_cap_task(t.clone())
            .await
            .map_err(|e| format!("store task: {e}"))?;
    }
    for x in ["x0c0s0b0n0", "x0c0s0b0n1"] {
        s.store_power_cap_operation(finished_op(&task, x, PowerCapOpStatus::New))
            .await
            .map_err(|e| format!("store op: {e}"))?;
    }
    let kept_op = finished_op(&keep, "x0c0s0b0n0", PowerCapOpStatus::New);
    s.store_power_cap_operation(kept_op.clone())
        .await
        .map_err(|e| format!("store other op: {e}"))?;

    s.delete_power_cap_task(task.task_id)
        .await
        .map_err(|e| format!("delete task: {e}"))?;

    expect_not_found(s.get_power_cap_task(task.task_id).await, "deleted task")?;
    let orphans = s
        .get_all_power_cap_operations_for_task(task.task_id)
        .await
        .map_err(|e| format!("list ops: {e}"))?;
    if !orphans.is_empty() {
        return Err(format!("{} operations survived their task", orphans.len()));
    }
    s.get_power_cap_operation(keep.task_id, kept_op.operation_id)
        .await
        .map_err(|e| format!("unrelated op: {e}"))?;
    s.delete_power_cap_task(task.task_id)
        .await
        .map_err(|e| format!("delete missing task: {e}"))
}

async fn missing_records_are_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = Uuid::new_v4();
    expect_not_found(s.get_power_cap_task(id).await, "get task")?;
    expect_not_found(
        s.get_power_cap_operation(id, Uuid::new_v4()).await,
        "get operation",
    )?;
    let ops = s
        .get_all_power_cap_operations_for_task(id)
        .await
        .map_err(|e| format!("list ops: {e}"))?;
    if !ops.is_empty() {
        return Err(format!("expected no operations, got {}", ops.len()));
    }
    Ok(())
}
