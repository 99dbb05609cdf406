use std::future::Future;
use std::sync::Arc;

use pcs_model::{PowerOperation, PowerState, PowerStatusComponent, TransitionStatus, TransitionTask};

use super::{make_transition, CaseResult, Cases, Section};
use crate::{StorageError, StorageProvider};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<CaseResult>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut cases = Cases::new(Section::Concurrency);
    cases.record(
        "racing_transition_tas_exactly_one_wins",
        racing_transition_tas_exactly_one_wins(factory).await,
    );
    cases.record(
        "racing_master_tas_exactly_one_wins",
        racing_master_tas_exactly_one_wins(factory).await,
    );
    cases.record(
        "parallel_power_status_writes_all_land",
        parallel_power_status_writes_all_land(factory).await,
    );
    cases.record("parallel_task_writes_all_land", parallel_task_writes_all_land(factory).await);
    cases.finish()
}

/// Collect `Ok(won)` outcomes and count the winners.
async fn count_winners(
    handles: Vec<tokio::task::JoinHandle<Result<bool, StorageError>>>,
) -> Result<usize, String> {
    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }
    Ok(winners)
}

// ── Racing TAS on one transition: exactly one wins ──────────────────────────

/// N tasks read the same transition and all try to move it forward from
/// that same snapshot. Exactly one swap may succeed.
async fn racing_transition_tas_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let t = make_transition(PowerOperation::On, &["x0c0s0b0n0", "x0c0s0b0n1"]);
    storage
        .store_transition(t.clone())
        .await
        .map_err(|e| format!("store: {e}"))?;
    let (full, first_page) = storage
        .get_transition(t.transition_id)
        .await
        .map_err(|e| format!("get: {e}"))?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        let expected = first_page.clone();
        let mut next = full.clone();
        next.status = TransitionStatus::InProgress;
        next.last_active_time = full.last_active_time + time::Duration::seconds(i as i64 + 1);
        handles.push(tokio::spawn(
            async move { s.tas_transition(next, expected).await },
        ));
    }

    let winners = count_winners(handles).await?;
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }

    let (after, _) = storage
        .get_transition(t.transition_id)
        .await
        .map_err(|e| format!("get after race: {e}"))?;
    if after.status != TransitionStatus::InProgress {
        return Err(format!("expected in-progress after race, got {}", after.status));
    }
    Ok(())
}

// ── Racing TAS on the master record: exactly one wins ───────────────────────

async fn racing_master_tas_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let start = pcs_model::now();
    storage
        .store_power_status_master(start)
        .await
        .map_err(|e| format!("store master: {e}"))?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        let next = start + time::Duration::seconds(i as i64 + 1);
        handles.push(tokio::spawn(async move {
            s.tas_power_status_master(next, start).await
        }));
    }

    let winners = count_winners(handles).await?;
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    let current = storage
        .get_power_status_master()
        .await
        .map_err(|e| format!("get master: {e}"))?;
    if current == start {
        return Err("master unchanged after a winning tas".into());
    }
    Ok(())
}

// ── Independent writes: no false conflicts ──────────────────────────────────

async fn parallel_power_status_writes_all_land<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            s.store_power_status(PowerStatusComponent::new(
                format!("x0c0s{i}b0n0"),
                PowerState::Off,
            ))
            .await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        handle
            .await
            .map_err(|e| format!("task {i} panic: {e}"))?
            .map_err(|e| format!("task {i} failed: {e}"))?;
    }

    let all = storage
        .get_all_power_status()
        .await
        .map_err(|e| format!("get all: {e}"))?;
    if all.len() != N {
        return Err(format!("expected {N} components, got {}", all.len()));
    }
    Ok(())
}

async fn parallel_task_writes_all_land<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let t = make_transition(PowerOperation::Off, &["x0c0s0b0n0"]);
    storage
        .store_transition(t.clone())
        .await
        .map_err(|e| format!("store transition: {e}"))?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        let mut task = TransitionTask::new(t.transition_id, t.operation);
        task.xname = format!("x0c0s{i}b0n0");
        handles.push(tokio::spawn(async move { s.store_transition_task(task).await }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        handle
            .await
            .map_err(|e| format!("task {i} panic: {e}"))?
            .map_err(|e| format!("task {i} failed: {e}"))?;
    }

    let tasks = storage
        .get_all_tasks_for_transition(t.transition_id)
        .await
        .map_err(|e| format!("list tasks: {e}"))?;
    if tasks.len() != N {
        return Err(format!("expected {N} tasks, got {}", tasks.len()));
    }
    Ok(())
}
