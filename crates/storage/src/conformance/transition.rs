use std::future::Future;

use pcs_model::{
    Location, PowerOperation, TaskState, TaskStatus, Transition, TransitionStatus,
    TransitionTask,
};
use uuid::Uuid;

use super::{expect_not_found, make_transition, CaseResult, Cases, Section};
use crate::StorageProvider;

/// Enough locations to span several pages on a paginating backend.
const LARGE_LOCATION_COUNT: usize = 250;

pub(super) async fn run_transition_tests<S, F, Fut>(factory: &F) -> Vec<CaseResult>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut cases = Cases::new(Section::Transition);
    cases.record("store_then_get_round_trips", store_then_get_round_trips(factory).await);
    cases.record("get_missing_is_not_found", get_missing_is_not_found(factory).await);
    cases.record(
        "restore_only_updates_mutable_fields",
        restore_only_updates_mutable_fields(factory).await,
    );
    cases.record("large_location_list_round_trips", large_location_list_round_trips(factory).await);
    cases.record("get_all_transitions", get_all_transitions(factory).await);
    cases.record("tasks_store_get_and_list", tasks_store_get_and_list(factory).await);
    cases.record(
        "task_restore_only_updates_mutable_fields",
        task_restore_only_updates_mutable_fields(factory).await,
    );
    cases.record("delete_task_leaves_siblings", delete_task_leaves_siblings(factory).await);
    cases.record(
        "delete_transition_cascades_to_tasks",
        delete_transition_cascades_to_tasks(factory).await,
    );
    cases.record(
        "test_and_set_succeeds_then_stale_fails",
        test_and_set_succeeds_then_stale_fails(factory).await,
    );
    cases.record(
        "test_and_set_with_first_page_of_large_transition",
        test_and_set_with_first_page_of_large_transition(factory).await,
    );
    cases.record(
        "test_and_set_missing_is_not_found",
        test_and_set_missing_is_not_found(factory).await,
    );
    cases.record(
        "nanosecond_timestamps_test_and_set",
        nanosecond_timestamps_test_and_set(factory).await,
    );
    cases.finish()
}

fn sample() -> Transition {
    make_transition(
        PowerOperation::SoftRestart,
        &["x0c0s0b0n0", "x0c0s0b0n1", "x0c0s1b0n0"],
    )
}

fn large() -> Transition {
    let locations = (0..LARGE_LOCATION_COUNT)
        .map(|i| {
            let mut loc = Location::new(format!("x{}c0s{}b0n0", 1000 + i / 8, i % 8));
            loc.deputy_key = Some(format!("deputy-{i}"));
            loc
        })
        .collect();
    Transition::new(PowerOperation::Off, locations, 10)
}

fn task_for(transition: &Transition, xname: &str) -> TransitionTask {
    let mut task = TransitionTask::new(transition.transition_id, transition.operation);
    task.xname = xname.to_string();
    task
}

async fn store_then_get_round_trips<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut t = sample();
    t.task_ids = vec![Uuid::new_v4(), Uuid::new_v4()];
    s.store_transition(t.clone())
        .await
        .map_err(|e| format!("store: {e}"))?;

    let (full, first_page) = s
        .get_transition(t.transition_id)
        .await
        .map_err(|e| format!("get: {e}"))?;
    if full != t {
        return Err(format!("round trip mismatch: stored {t:?}, got {full:?}"));
    }
    if !first_page.matches_ignoring_location(&t) {
        return Err(format!("first page differs outside locations: {first_page:?}"));
    }
    Ok(())
}

async fn get_missing_is_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = Uuid::new_v4();
    expect_not_found(s.get_transition(id).await, "get transition")?;
    expect_not_found(
        s.get_transition_task(id, Uuid::new_v4()).await,
        "get transition task",
    )?;
    let tasks = s
        .get_all_tasks_for_transition(id)
        .await
        .map_err(|e| format!("list tasks: {e}"))?;
    if !tasks.is_empty() {
        return Err(format!("expected no tasks, got {}", tasks.len()));
    }
    s.delete_transition(id)
        .await
        .map_err(|e| format!("delete missing: {e}"))
}

async fn restore_only_updates_mutable_fields<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let original = sample();
    s.store_transition(original.clone())
        .await
        .map_err(|e| format!("store: {e}"))?;

    let mut update = original.clone();
    update.status = TransitionStatus::InProgress;
    update.last_active_time = original.last_active_time + time::Duration::seconds(5);
    update.location = vec![Location::new("x9c0s0b0n0")];
    update.task_ids = vec![Uuid::new_v4()];
    update.task_deadline = 99;
    s.store_transition(update.clone())
        .await
        .map_err(|e| format!("re-store: {e}"))?;

    let (got, _) = s
        .get_transition(original.transition_id)
        .await
        .map_err(|e| format!("get: {e}"))?;
    let mut expected = original;
    expected.apply_update(&update);
    if got != expected {
        return Err(format!("expected {expected:?}, got {got:?}"));
    }
    Ok(())
}

async fn large_location_list_round_trips<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let t = large();
    s.store_transition(t.clone())
        .await
        .map_err(|e| format!("store: {e}"))?;
    let (full, first_page) = s
        .get_transition(t.transition_id)
        .await
        .map_err(|e| format!("get: {e}"))?;
    if full != t {
        return Err(format!(
            "large transition mismatch: stored {} locations, got {}",
            t.location.len(),
            full.location.len()
        ));
    }
    if first_page.location.is_empty() || first_page.location.len() > full.location.len() {
        return Err(format!(
            "first page holds {} of {} locations",
            first_page.location.len(),
            full.location.len()
        ));
    }
    if first_page.location[..] != full.location[..first_page.location.len()] {
        return Err("first page is not a prefix of the full location list".into());
    }
    Ok(())
}

async fn get_all_transitions<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let stored = [sample(), large(), sample()];
    for t in &stored {
        s.store_transition(t.clone())
            .await
            .map_err(|e| format!("store {}: {e}", t.transition_id))?;
    }
    let all = s
        .get_all_transitions()
        .await
        .map_err(|e| format!("get all: {e}"))?;
    if all.len() != stored.len() {
        return Err(format!("expected {} transitions, got {}", stored.len(), all.len()));
    }
    for t in &stored {
        match all.iter().find(|a| a.transition_id == t.transition_id) {
            Some(found) if found == t => {}
            Some(found) => {
                return Err(format!(
                    "transition {} came back with {} locations, stored {}",
                    t.transition_id,
                    found.location.len(),
                    t.location.len()
                ))
            }
            None => return Err(format!("transition {} missing", t.transition_id)),
        }
    }
    Ok(())
}

async fn tasks_store_get_and_list<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let t = sample();
    let other = sample();
    s.store_transition(t.clone())
        .await
        .map_err(|e| format!("store transition: {e}"))?;

    let tasks: Vec<TransitionTask> = t.location.iter().map(|l| task_for(&t, &l.xname)).collect();
    for task in &tasks {
        s.store_transition_task(task.clone())
            .await
            .map_err(|e| format!("store task {}: {e}", task.task_id))?;
    }
    // Tasks of another transition must not leak into the listing.
    s.store_transition_task(task_for(&other, "x5c0s0b0n0"))
        .await
        .map_err(|e| format!("store foreign task: {e}"))?;

    let got = s
        .get_transition_task(t.transition_id, tasks[0].task_id)
        .await
        .map_err(|e| format!("get task: {e}"))?;
    if got != tasks[0] {
        return Err(format!("task mismatch: stored {:?}, got {got:?}", tasks[0]));
    }

    let listed = s
        .get_all_tasks_for_transition(t.transition_id)
        .await
        .map_err(|e| format!("list tasks: {e}"))?;
    if listed.len() != tasks.len() {
        return Err(format!("expected {} tasks, got {}", tasks.len(), listed.len()));
    }
    if let Some(stray) = listed.iter().find(|l| l.transition_id != t.transition_id) {
        return Err(format!("listing contains task of {}", stray.transition_id));
    }
    Ok(())
}

async fn task_restore_only_updates_mutable_fields<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let t = sample();
    let original = task_for(&t, "x0c0s0b0n0");
    s.store_transition_task(original.clone())
        .await
        .map_err(|e| format!("store: {e}"))?;

    let mut update = original.clone();
    update.state = TaskState::Confirming;
    update.status = TaskStatus::Failed;
    update.status_desc = "confirming power state".into();
    update.error = "timed out".into();
    update.xname = "x9c9s9b0n9".into();
    update.reservation_key = "changed".into();
    s.store_transition_task(update.clone())
        .await
        .map_err(|e| format!("re-store: {e}"))?;

    let got = s
        .get_transition_task(t.transition_id, original.task_id)
        .await
        .map_err(|e| format!("get: {e}"))?;
    let mut expected = original;
    expected.apply_update(&update);
    if got != expected {
        return Err(format!("expected {expected:?}, got {got:?}"));
    }
    Ok(())
}

async fn delete_task_leaves_siblings<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let t = sample();
    let a = task_for(&t, "x0c0s0b0n0");
    let b = task_for(&t, "x0c0s0b0n1");
    for task in [&a, &b] {
        s.store_transition_task(task.clone())
            .await
            .map_err(|e| format!("store task: {e}"))?;
    }
    s.delete_transition_task(t.transition_id, a.task_id)
        .await
        .map_err(|e| format!("delete task: {e}"))?;
    expect_not_found(
        s.get_transition_task(t.transition_id, a.task_id).await,
        "deleted task",
    )?;
    s.get_transition_task(t.transition_id, b.task_id)
        .await
        .map_err(|e| format!("sibling task: {e}"))?;
    s.delete_transition_task(t.transition_id, a.task_id)
        .await
        .map_err(|e| format!("delete missing task: {e}"))
}

async fn delete_transition_cascades_to_tasks<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let t = large();
    let keep = sample();
    s.store_transition(t.clone())
        .await
        .map_err(|e| format!("store transition: {e}"))?;
    s.store_transition(keep.clone())
        .await
        .map_err(|e| format!("store other transition: {e}"))?;
    for l in t.location.iter().take(5) {
        s.store_transition_task(task_for(&t, &l.xname))
            .await
            .map_err(|e| format!("store task: {e}"))?;
    }
    let kept_task = task_for(&keep, "x0c0s0b0n0");
    s.store_transition_task(kept_task.clone())
        .await
        .map_err(|e| format!("store other task: {e}"))?;

    s.delete_transition(t.transition_id)
        .await
        .map_err(|e| format!("delete: {e}"))?;

    expect_not_found(s.get_transition(t.transition_id).await, "deleted transition")?;
    let orphans = s
        .get_all_tasks_for_transition(t.transition_id)
        .await
        .map_err(|e| format!("list tasks: {e}"))?;
    if !orphans.is_empty() {
        return Err(format!("{} tasks survived their transition", orphans.len()));
    }
    s.get_transition(keep.transition_id)
        .await
        .map_err(|e| format!("unrelated transition: {e}"))?;
    s.get_transition_task(keep.transition_id, kept_task.task_id)
        .await
        .map_err(|e| format!("unrelated task: {e}"))?;
    Ok(())
}

async fn test_and_set_succeeds_then_stale_fails<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let t = sample();
    s.store_transition(t.clone())
        .await
        .map_err(|e| format!("store: {e}"))?;
    let (full, first_page) = s
        .get_transition(t.transition_id)
        .await
        .map_err(|e| format!("get: {e}"))?;

    let mut next = full.clone();
    next.status = TransitionStatus::InProgress;
    next.last_active_time = pcs_model::now();
    let swapped = s
        .tas_transition(next.clone(), first_page.clone())
        .await
        .map_err(|e| format!("tas: {e}"))?;
    if !swapped {
        return Err("tas against the current value returned false".into());
    }

    let mut stale = full;
    stale.status = TransitionStatus::Aborted;
    let swapped = s
        .tas_transition(stale, first_page)
        .await
        .map_err(|e| format!("stale tas: {e}"))?;
    if swapped {
        return Err("tas against a stale value returned true".into());
    }

    let (got, _) = s
        .get_transition(t.transition_id)
        .await
        .map_err(|e| format!("get after tas: {e}"))?;
    if got.status != TransitionStatus::InProgress {
        return Err(format!("expected in-progress after tas, got {}", got.status));
    }
    if !got.same_locations(&t) {
        return Err("tas changed the location list".into());
    }
    Ok(())
}

async fn test_and_set_with_first_page_of_large_transition<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let t = large();
    s.store_transition(t.clone())
        .await
        .map_err(|e| format!("store: {e}"))?;
    let (full, first_page) = s
        .get_transition(t.transition_id)
        .await
        .map_err(|e| format!("get: {e}"))?;

    let mut next = full;
    next.status = TransitionStatus::Completed;
    let swapped = s
        .tas_transition(next, first_page)
        .await
        .map_err(|e| format!("tas: {e}"))?;
    if !swapped {
        return Err("tas with the first page as expected returned false".into());
    }

    let (got, _) = s
        .get_transition(t.transition_id)
        .await
        .map_err(|e| format!("get after tas: {e}"))?;
    if got.status != TransitionStatus::Completed || got.location != t.location {
        return Err(format!(
            "expected completed with {} locations, got {} with {}",
            t.location.len(),
            got.status,
            got.location.len()
        ));
    }
    Ok(())
}

async fn test_and_set_missing_is_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let t = sample();
    expect_not_found(s.tas_transition(t.clone(), t).await, "tas on missing transition")
}

/// Timestamps are kept to microseconds. The record as the caller built it,
/// nanoseconds included, still matches what was stored.
async fn nanosecond_timestamps_test_and_set<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut t = sample();
    t.last_active_time = time::macros::datetime!(2023-11-14 22:13:20.123_456_789 UTC);
    s.store_transition(t.clone())
        .await
        .map_err(|e| format!("store: {e}"))?;

    let (full, _) = s
        .get_transition(t.transition_id)
        .await
        .map_err(|e| format!("get: {e}"))?;
    if full.last_active_time.nanosecond() != 123_456_000 {
        return Err(format!(
            "expected last_active_time truncated to microseconds, got {}",
            full.last_active_time
        ));
    }

    let mut next = t.clone();
    next.status = TransitionStatus::InProgress;
    next.last_active_time = t.last_active_time + time::Duration::nanoseconds(1_500);
    let swapped = s
        .tas_transition(next.clone(), t)
        .await
        .map_err(|e| format!("tas: {e}"))?;
    if !swapped {
        return Err("tas against the record as written returned false".into());
    }
    let (got, _) = s
        .get_transition(next.transition_id)
        .await
        .map_err(|e| format!("get after tas: {e}"))?;
    if got.last_active_time != pcs_model::truncate_to_micros(next.last_active_time) {
        return Err(format!(
            "expected last_active_time {}, got {}",
            pcs_model::truncate_to_micros(next.last_active_time),
            got.last_active_time
        ));
    }
    Ok(())
}
