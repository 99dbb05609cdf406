use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{expect_not_initialized, CaseResult, Cases, Section};
use crate::{DistributedLockProvider, StorageError};

/// Providers racing for the lock in the mutual exclusion test.
const CONTENDERS: usize = 50;

/// Generous wait so every contender gets its turn.
const CONTENDED_WAIT: Duration = Duration::from_secs(60);

/// How long each contender keeps the lock before releasing it.
const HOLD: Duration = Duration::from_millis(150);

pub(super) async fn run_lock_tests<L, F, Fut>(factory: &F) -> Vec<CaseResult>
where
    L: DistributedLockProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let mut cases = Cases::new(Section::Lock);
    cases.record(
        "lock_then_unlock_reports_duration",
        lock_then_unlock_reports_duration(factory).await,
    );
    cases.record("sub_second_duration_rejected", sub_second_duration_rejected(factory).await);
    cases.record(
        "second_lock_on_same_instance_is_already_held",
        second_lock_on_same_instance_is_already_held(factory).await,
    );
    cases.record("unlock_without_lock_is_not_held", unlock_without_lock_is_not_held(factory).await);
    cases.record(
        "second_provider_times_out_while_held",
        second_provider_times_out_while_held(factory).await,
    );
    cases.record("close_releases_held_lock", close_releases_held_lock(factory).await);
    cases.record(
        "double_close_and_use_after_close",
        double_close_and_use_after_close(factory).await,
    );
    cases.record(
        "contenders_are_mutually_exclusive",
        contenders_are_mutually_exclusive(factory).await,
    );
    cases.finish()
}

/// Close every provider, keeping the test body's result.
async fn finish<L: DistributedLockProvider>(
    providers: &[&L],
    result: Result<(), String>,
) -> Result<(), String> {
    for p in providers {
        let _ = p.close().await;
    }
    result
}

async fn lock_then_unlock_reports_duration<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: DistributedLockProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let l = factory().await;
    let result = async {
        if l.get_duration().await != Duration::ZERO {
            return Err("duration non-zero before locking".to_string());
        }
        let wanted = Duration::from_secs(5);
        l.distributed_timed_lock(wanted)
            .await
            .map_err(|e| format!("lock: {e}"))?;
        let held = l.get_duration().await;
        if held != wanted {
            return Err(format!("expected duration {wanted:?} while held, got {held:?}"));
        }
        l.unlock().await.map_err(|e| format!("unlock: {e}"))?;
        if l.get_duration().await != Duration::ZERO {
            return Err("duration non-zero after unlock".to_string());
        }
        Ok(())
    }
    .await;
    finish(&[&l], result).await
}

async fn sub_second_duration_rejected<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: DistributedLockProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let l = factory().await;
    let result = match l.distributed_timed_lock(Duration::from_millis(500)).await {
        Err(StorageError::InvalidLockDuration { .. }) => Ok(()),
        other => Err(format!("expected InvalidLockDuration, got {other:?}")),
    };
    finish(&[&l], result).await
}

async fn second_lock_on_same_instance_is_already_held<L, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    L: DistributedLockProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let l = factory().await;
    let result = async {
        l.distributed_timed_lock(Duration::from_secs(5))
            .await
            .map_err(|e| format!("lock: {e}"))?;
        match l.distributed_timed_lock(Duration::from_secs(5)).await {
            Err(StorageError::AlreadyHeld) => {}
            other => return Err(format!("expected AlreadyHeld, got {other:?}")),
        }
        l.unlock().await.map_err(|e| format!("unlock: {e}"))
    }
    .await;
    finish(&[&l], result).await
}

async fn unlock_without_lock_is_not_held<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: DistributedLockProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let l = factory().await;
    let result = async {
        match l.unlock().await {
            Err(StorageError::NotHeld) => {}
            other => return Err(format!("unlock before lock: expected NotHeld, got {other:?}")),
        }
        l.distributed_timed_lock(Duration::from_secs(5))
            .await
            .map_err(|e| format!("lock: {e}"))?;
        l.unlock().await.map_err(|e| format!("unlock: {e}"))?;
        match l.unlock().await {
            Err(StorageError::NotHeld) => Ok(()),
            other => Err(format!("second unlock: expected NotHeld, got {other:?}")),
        }
    }
    .await;
    finish(&[&l], result).await
}

async fn second_provider_times_out_while_held<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: DistributedLockProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let a = factory().await;
    let b = factory().await;
    let result = async {
        a.distributed_timed_lock(Duration::from_secs(30))
            .await
            .map_err(|e| format!("first lock: {e}"))?;
        match b.distributed_timed_lock(Duration::from_secs(1)).await {
            Err(StorageError::LockTimeout { .. }) => {}
            other => return Err(format!("expected LockTimeout, got {other:?}")),
        }
        if b.get_duration().await != Duration::ZERO {
            return Err("timed-out provider reports a held duration".into());
        }
        a.unlock().await.map_err(|e| format!("unlock: {e}"))?;
        b.distributed_timed_lock(Duration::from_secs(5))
            .await
            .map_err(|e| format!("lock after release: {e}"))?;
        b.unlock().await.map_err(|e| format!("second unlock: {e}"))
    }
    .await;
    finish(&[&a, &b], result).await
}

async fn close_releases_held_lock<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: DistributedLockProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let a = factory().await;
    let b = factory().await;
    let result = async {
        a.distributed_timed_lock(Duration::from_secs(30))
            .await
            .map_err(|e| format!("lock: {e}"))?;
        a.close().await.map_err(|e| format!("close: {e}"))?;
        b.distributed_timed_lock(Duration::from_secs(5))
            .await
            .map_err(|e| format!("lock after holder closed: {e}"))?;
        b.unlock().await.map_err(|e| format!("unlock: {e}"))
    }
    .await;
    finish(&[&a, &b], result).await
}

async fn double_close_and_use_after_close<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: DistributedLockProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let l = factory().await;
    l.ping().await.map_err(|e| format!("ping: {e}"))?;
    l.close().await.map_err(|e| format!("close: {e}"))?;
    expect_not_initialized(l.close().await, "second close")?;
    expect_not_initialized(l.ping().await, "ping after close")?;
    expect_not_initialized(
        l.distributed_timed_lock(Duration::from_secs(1)).await,
        "lock after close",
    )?;
    expect_not_initialized(l.unlock().await, "unlock after close")
}

// ── Mutual exclusion under contention ───────────────────────────────────────

/// CONTENDERS providers race for the lock, each holding it briefly. Every
/// one must eventually succeed and no two may hold it at the same time.
async fn contenders_are_mutually_exclusive<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: DistributedLockProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let mut providers = Vec::with_capacity(CONTENDERS);
    for _ in 0..CONTENDERS {
        providers.push(Arc::new(factory().await));
    }

    let holders = Arc::new(AtomicUsize::new(0));
    let max_holders = Arc::new(AtomicUsize::new(0));
    let successes = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for p in &providers {
        let p = p.clone();
        let holders = holders.clone();
        let max_holders = max_holders.clone();
        let successes = successes.clone();
        handles.push(tokio::spawn(async move {
            p.distributed_timed_lock(CONTENDED_WAIT).await?;
            let now_holding = holders.fetch_add(1, Ordering::SeqCst) + 1;
            max_holders.fetch_max(now_holding, Ordering::SeqCst);
            tokio::time::sleep(HOLD).await;
            holders.fetch_sub(1, Ordering::SeqCst);
            successes.fetch_add(1, Ordering::SeqCst);
            p.unlock().await
        }));
    }

    let mut result = Ok(());
    for (i, handle) in handles.into_iter().enumerate() {
        let outcome = handle
            .await
            .map_err(|e| format!("contender {i} panic: {e}"))
            .and_then(|r| r.map_err(|e| format!("contender {i}: {e}")));
        if let Err(e) = outcome {
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    for p in &providers {
        let _ = p.close().await;
    }
    result?;

    let max = max_holders.load(Ordering::SeqCst);
    if max != 1 {
        return Err(format!("expected at most 1 concurrent holder, saw {max}"));
    }
    let done = successes.load(Ordering::SeqCst);
    if done != CONTENDERS {
        return Err(format!("expected {CONTENDERS} successful locks, got {done}"));
    }
    Ok(())
}
