use std::future::Future;

use pcs_model::{PowerState, PowerStatusComponent};
use uuid::Uuid;

use super::{expect_not_initialized, CaseResult, Cases, Section};
use crate::StorageProvider;

pub(super) async fn run_lifecycle_tests<S, F, Fut>(factory: &F) -> Vec<CaseResult>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut cases = Cases::new(Section::Lifecycle);
    cases.record("ping_succeeds_after_init", ping_succeeds_after_init(factory).await);
    cases.record("second_close_is_not_initialized", second_close_is_not_initialized(factory).await);
    cases.record(
        "calls_after_close_are_not_initialized",
        calls_after_close_are_not_initialized(factory).await,
    );
    cases.finish()
}

async fn ping_succeeds_after_init<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.ping().await.map_err(|e| format!("ping: {e}"))?;
    s.close().await.map_err(|e| format!("close: {e}"))
}

async fn second_close_is_not_initialized<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.close().await.map_err(|e| format!("first close: {e}"))?;
    expect_not_initialized(s.close().await, "second close")
}

async fn calls_after_close_are_not_initialized<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.close().await.map_err(|e| format!("close: {e}"))?;

    expect_not_initialized(s.ping().await, "ping")?;
    expect_not_initialized(
        s.store_power_status(PowerStatusComponent::new("x0c0s0b0n0", PowerState::On))
            .await,
        "store_power_status",
    )?;
    expect_not_initialized(s.get_transition(Uuid::new_v4()).await, "get_transition")?;
    expect_not_initialized(s.get_all_power_cap_tasks().await, "get_all_power_cap_tasks")?;
    expect_not_initialized(s.get_power_status_master().await, "get_power_status_master")
}
