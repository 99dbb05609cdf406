use std::future::Future;

use pcs_model::{truncate_to_micros, ManagementState, PowerState, PowerStatusComponent};
use time::macros::datetime;

use super::{expect_not_found, CaseResult, Cases, Section};
use crate::{StorageError, StorageProvider};

pub(super) async fn run_power_status_tests<S, F, Fut>(factory: &F) -> Vec<CaseResult>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut cases = Cases::new(Section::PowerStatus);
    cases.record("store_then_get_round_trips", store_then_get_round_trips(factory).await);
    cases.record("store_overwrites_every_field", store_overwrites_every_field(factory).await);
    cases.record("get_missing_is_not_found", get_missing_is_not_found(factory).await);
    cases.record(
        "delete_removes_and_tolerates_missing",
        delete_removes_and_tolerates_missing(factory).await,
    );
    cases.record("invalid_xname_rejected", invalid_xname_rejected(factory).await);
    cases.record("get_all_returns_every_component", get_all_returns_every_component(factory).await);
    cases.record(
        "hierarchy_is_plain_string_prefix",
        hierarchy_is_plain_string_prefix(factory).await,
    );
    cases.record("master_missing_then_stored", master_missing_then_stored(factory).await);
    cases.record("master_test_and_set", master_test_and_set(factory).await);
    cases.record(
        "master_test_and_set_missing_is_not_found",
        master_test_and_set_missing_is_not_found(factory).await,
    );
    cases.record(
        "master_timestamps_kept_to_microseconds",
        master_timestamps_kept_to_microseconds(factory).await,
    );
    cases.record(
        "component_timestamp_kept_to_microseconds",
        component_timestamp_kept_to_microseconds(factory).await,
    );
    cases.finish()
}

fn component(xname: &str) -> PowerStatusComponent {
    let mut c = PowerStatusComponent::new(xname, PowerState::On);
    c.supported_power_transitions = vec!["Off".into(), "Soft-Restart".into()];
    c
}

async fn store_then_get_round_trips<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let c = component("x0c0s0b0n0");
    s.store_power_status(c.clone())
        .await
        .map_err(|e| format!("store: {e}"))?;
    let got = s
        .get_power_status(&c.xname)
        .await
        .map_err(|e| format!("get: {e}"))?;
    if got != c {
        return Err(format!("round trip mismatch: stored {c:?}, got {got:?}"));
    }
    Ok(())
}

async fn store_overwrites_every_field<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut c = component("x0c0s0b0n0");
    s.store_power_status(c.clone())
        .await
        .map_err(|e| format!("store: {e}"))?;

    c.power_state = PowerState::Off;
    c.management_state = ManagementState::Unavailable;
    c.supported_power_transitions = vec!["On".into()];
    c.error = "BMC unreachable".into();
    c.last_updated = pcs_model::now();
    s.store_power_status(c.clone())
        .await
        .map_err(|e| format!("re-store: {e}"))?;

    let got = s
        .get_power_status(&c.xname)
        .await
        .map_err(|e| format!("get: {e}"))?;
    if got != c {
        return Err(format!("expected {c:?}, got {got:?}"));
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
    expect_not_found(s.get_power_status("x9c0s0b0n0").await, "get missing")
}

async fn delete_removes_and_tolerates_missing<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let c = component("x0c0s0b0n0");
    s.store_power_status(c.clone())
        .await
        .map_err(|e| format!("store: {e}"))?;
    s.delete_power_status(&c.xname)
        .await
        .map_err(|e| format!("delete: {e}"))?;
    expect_not_found(s.get_power_status(&c.xname).await, "get after delete")?;
    s.delete_power_status(&c.xname)
        .await
        .map_err(|e| format!("delete missing: {e}"))
}

async fn invalid_xname_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    fn expect_invalid<T: std::fmt::Debug>(
        result: Result<T, StorageError>,
        what: &str,
    ) -> Result<(), String> {
        match result {
            Err(StorageError::InvalidIdentifier { .. }) => Ok(()),
            other => Err(format!("{what}: expected InvalidIdentifier, got {other:?}")),
        }
    }

    expect_invalid(s.store_power_status(component("xyzzy")).await, "store")?;
    expect_invalid(s.get_power_status("xyzzy").await, "get")?;
    expect_invalid(s.delete_power_status("xyzzy").await, "delete")?;
    expect_invalid(s.get_power_status_hierarchy("xyzzy").await, "hierarchy")?;

    let all = s
        .get_all_power_status()
        .await
        .map_err(|e| format!("get all: {e}"))?;
    if !all.is_empty() {
        return Err(format!("rejected store left {} records behind", all.len()));
    }
    Ok(())
}

async fn get_all_returns_every_component<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let xnames = ["x0c0s0b0n0", "x0c0s0b0n1", "x1000c0r1b0"];
    for x in xnames {
        s.store_power_status(component(x))
            .await
            .map_err(|e| format!("store {x}: {e}"))?;
    }
    let all = s
        .get_all_power_status()
        .await
        .map_err(|e| format!("get all: {e}"))?;
    if all.len() != xnames.len() {
        return Err(format!("expected {} components, got {}", xnames.len(), all.len()));
    }
    for x in xnames {
        if all.find(x).is_none() {
            return Err(format!("{x} missing from get_all_power_status"));
        }
    }
    Ok(())
}

async fn hierarchy_is_plain_string_prefix<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let under = [
        "x4c1s1b1",
        "x4c1s1b1n0",
        "x4c1s1b1n1",
        "x4c1s1b10",
        "x4c1s1b10n0",
    ];
    let outside = ["x4c1s1b0n0", "x4c1s2b1n0", "x4c1s1", "x3c1s1b1n0"];
    for x in under.iter().chain(outside.iter()) {
        s.store_power_status(component(x))
            .await
            .map_err(|e| format!("store {x}: {e}"))?;
    }

    let found = s
        .get_power_status_hierarchy("x4c1s1b1")
        .await
        .map_err(|e| format!("hierarchy: {e}"))?;
    if found.len() != under.len() {
        let got: Vec<&str> = found.status.iter().map(|c| c.xname.as_str()).collect();
        return Err(format!("expected exactly {under:?}, got {got:?}"));
    }
    for x in under {
        if found.find(x).is_none() {
            return Err(format!("{x} missing from hierarchy"));
        }
    }
    Ok(())
}

async fn master_missing_then_stored<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    expect_not_found(s.get_power_status_master().await, "master before store")?;

    let ts = pcs_model::now();
    s.store_power_status_master(ts)
        .await
        .map_err(|e| format!("store master: {e}"))?;
    let got = s
        .get_power_status_master()
        .await
        .map_err(|e| format!("get master: {e}"))?;
    if got != ts {
        return Err(format!("expected master {ts}, got {got}"));
    }
    Ok(())
}

async fn master_test_and_set<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let first = pcs_model::now();
    let second = first + time::Duration::seconds(30);
    let third = second + time::Duration::seconds(30);
    s.store_power_status_master(first)
        .await
        .map_err(|e| format!("store master: {e}"))?;

    let swapped = s
        .tas_power_status_master(second, first)
        .await
        .map_err(|e| format!("tas: {e}"))?;
    if !swapped {
        return Err("tas with current value as expected returned false".into());
    }

    let stale = s
        .tas_power_status_master(third, first)
        .await
        .map_err(|e| format!("stale tas: {e}"))?;
    if stale {
        return Err("tas with stale expected value returned true".into());
    }

    let got = s
        .get_power_status_master()
        .await
        .map_err(|e| format!("get master: {e}"))?;
    if got != second {
        return Err(format!("expected master {second}, got {got}"));
    }
    Ok(())
}

async fn master_test_and_set_missing_is_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let ts = pcs_model::now();
    expect_not_found(s.tas_power_status_master(ts, ts).await, "tas on missing master")
}

/// A caller holding a nanosecond timestamp (e.g. `OffsetDateTime::now_utc()`)
/// reads back its microsecond truncation and can test-and-set against the
/// value it wrote.
async fn master_timestamps_kept_to_microseconds<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let written = datetime!(2023-11-14 22:13:20.123_456_789 UTC);
    s.store_power_status_master(written)
        .await
        .map_err(|e| format!("store master: {e}"))?;
    let got = s
        .get_power_status_master()
        .await
        .map_err(|e| format!("get master: {e}"))?;
    if got != truncate_to_micros(written) {
        return Err(format!("expected {}, got {got}", truncate_to_micros(written)));
    }

    let next = written + time::Duration::seconds(1);
    let swapped = s
        .tas_power_status_master(next, written)
        .await
        .map_err(|e| format!("tas: {e}"))?;
    if !swapped {
        return Err("tas with the written nanosecond value returned false".into());
    }
    let got = s
        .get_power_status_master()
        .await
        .map_err(|e| format!("get master after tas: {e}"))?;
    if got != truncate_to_micros(next) {
        return Err(format!("expected {} after tas, got {got}", truncate_to_micros(next)));
    }
    Ok(())
}

async fn component_timestamp_kept_to_microseconds<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut c = component("x0c0s0b0n0");
    c.last_updated = datetime!(2023-11-14 22:13:20.123_456_789 UTC);
    s.store_power_status(c.clone())
        .await
        .map_err(|e| format!("store: {e}"))?;
    let got = s
        .get_power_status(&c.xname)
        .await
        .map_err(|e| format!("get: {e}"))?;
    let expected = c.at_storage_precision();
    if got != expected {
        return Err(format!("expected {expected:?}, got {got:?}"));
    }
    Ok(())
}
