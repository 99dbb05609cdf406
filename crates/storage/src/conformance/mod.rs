//! Conformance test suite for `StorageProvider` and `DistributedLockProvider`
//! implementations.
//!
//! Every backend must behave identically from the caller's point of view.
//! The suite covers:
//!
//! - **Lifecycle**: ping, close, double close, use after close
//! - **Power status**: upserts, xname validation, hierarchy prefix queries,
//!   the master timestamp and its test-and-set
//! - **Transitions**: restricted upserts, paging, cascade delete, test-and-set
//! - **Power capping**: type retention, parent checks, cascade delete
//! - **Concurrency**: racing test-and-set writers, parallel independent writes
//! - **Locking**: mutual exclusion under contention, timeouts, misuse
//!
//! # Usage
//!
//! Backend tests call [`run_storage_suite`] with a factory that returns a
//! fresh, initialized, empty storage instance for each test, and
//! [`run_lock_suite`] with a factory whose instances all contend for the
//! same lock name:
//!
//! ```ignore
//! use pcs_storage::conformance::run_storage_suite;
//!
//! #[tokio::test]
//! async fn postgres_conformance() {
//!     let report = run_storage_suite(|| async { fresh_postgres_storage().await }).await;
//!     assert_eq!(report.failed(), 0, "{report}");
//! }
//! ```

mod concurrent;
mod lifecycle;
mod lock;
mod power_cap;
mod power_status;
mod transition;

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Debug;
use std::future::Future;

use pcs_model::{Location, PowerOperation, Transition};
use tracing::warn;

use crate::{DistributedLockProvider, StorageError, StorageProvider};

/// Area of provider behaviour a case exercises. Reports are grouped by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Section {
    Lifecycle,
    PowerStatus,
    Transition,
    PowerCap,
    Concurrency,
    Lock,
}

impl Section {
    pub fn as_str(self) -> &'static str {
        match self {
            Section::Lifecycle => "lifecycle",
            Section::PowerStatus => "power-status",
            Section::Transition => "transition",
            Section::PowerCap => "power-cap",
            Section::Concurrency => "concurrency",
            Section::Lock => "lock",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Outcome of one conformance case.
#[derive(Debug, Clone)]
pub struct CaseResult {
    pub section: Section,
    pub case: &'static str,
    /// Why the case failed; `None` when it passed.
    pub failure: Option<String>,
}

impl CaseResult {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Collects one section's outcomes in run order.
struct Cases {
    section: Section,
    results: Vec<CaseResult>,
}

impl Cases {
    fn new(section: Section) -> Self {
        Self {
            section,
            results: Vec::new(),
        }
    }

    fn record(&mut self, case: &'static str, outcome: Result<(), String>) {
        if let Err(reason) = &outcome {
            warn!(section = %self.section, case, %reason, "conformance case failed");
        }
        self.results.push(CaseResult {
            section: self.section,
            case,
            failure: outcome.err(),
        });
    }

    fn finish(self) -> Vec<CaseResult> {
        self.results
    }
}

/// Pass and fail counts for one section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub passed: usize,
    pub failed: usize,
}

/// Every case outcome from one suite run against one backend.
#[derive(Debug, Clone)]
pub struct SuiteReport {
    pub cases: Vec<CaseResult>,
}

impl SuiteReport {
    pub fn passed(&self) -> usize {
        self.cases.iter().filter(|c| c.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.cases.len() - self.passed()
    }

    pub fn failures(&self) -> impl Iterator<Item = &CaseResult> {
        self.cases.iter().filter(|c| !c.passed())
    }

    /// Counts per section, in section order.
    pub fn tallies(&self) -> BTreeMap<Section, Tally> {
        let mut tallies: BTreeMap<Section, Tally> = BTreeMap::new();
        for c in &self.cases {
            let tally = tallies.entry(c.section).or_default();
            if c.passed() {
                tally.passed += 1;
            } else {
                tally.failed += 1;
            }
        }
        tallies
    }
}

impl fmt::Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} of {} cases passed", self.passed(), self.cases.len())?;
        for (section, tally) in self.tallies() {
            writeln!(
                f,
                "  {section:<13} {}/{}",
                tally.passed,
                tally.passed + tally.failed
            )?;
        }
        for c in self.failures() {
            let reason = c.failure.as_deref().unwrap_or_default();
            writeln!(f, "  failed {}::{}: {reason}", c.section, c.case)?;
        }
        Ok(())
    }
}

/// Run the storage suite against a backend.
///
/// `factory` is called once per test and must return an initialized, empty
/// storage instance. Tests close the instances they are given.
pub async fn run_storage_suite<S, F, Fut>(factory: F) -> SuiteReport
where
    S: StorageProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut cases = lifecycle::run_lifecycle_tests(&factory).await;
    cases.extend(power_status::run_power_status_tests(&factory).await);
    cases.extend(transition::run_transition_tests(&factory).await);
    cases.extend(power_cap::run_power_cap_tests(&factory).await);
    cases.extend(concurrent::run_concurrent_tests(&factory).await);
    SuiteReport { cases }
}

/// Run the lock suite against a backend.
///
/// `factory` must return an initialized provider; all providers it returns
/// contend for the same lock. Tests run one after another and release
/// everything they acquire.
pub async fn run_lock_suite<L, F, Fut>(factory: F) -> SuiteReport
where
    L: DistributedLockProvider,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    SuiteReport {
        cases: lock::run_lock_tests(&factory).await,
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn expect_not_found<T: Debug>(result: Result<T, StorageError>, what: &str) -> Result<(), String> {
    match result {
        Err(StorageError::NotFound { .. }) => Ok(()),
        other => Err(format!("{what}: expected NotFound, got {other:?}")),
    }
}

fn expect_not_initialized<T: Debug>(
    result: Result<T, StorageError>,
    what: &str,
) -> Result<(), String> {
    match result {
        Err(StorageError::NotInitialized) => Ok(()),
        other => Err(format!("{what}: expected NotInitialized, got {other:?}")),
    }
}

fn make_transition(operation: PowerOperation, xnames: &[&str]) -> Transition {
    let locations = xnames.iter().map(|x| Location::new(*x)).collect();
    Transition::new(operation, locations, 5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_groups_cases_by_section() {
        let mut storage = Cases::new(Section::Transition);
        storage.record("round_trip", Ok(()));
        storage.record("cascade", Err("2 tasks survived".into()));
        let mut lock = Cases::new(Section::Lock);
        lock.record("timeout", Ok(()));

        let mut cases = lock.finish();
        cases.extend(storage.finish());
        let report = SuiteReport { cases };

        assert_eq!(report.passed(), 2);
        assert_eq!(report.failed(), 1);
        let tallies = report.tallies();
        assert_eq!(tallies[&Section::Transition], Tally { passed: 1, failed: 1 });
        assert_eq!(tallies[&Section::Lock], Tally { passed: 1, failed: 0 });
        assert_eq!(
            tallies.keys().copied().collect::<Vec<_>>(),
            [Section::Transition, Section::Lock]
        );

        let text = report.to_string();
        assert!(text.starts_with("2 of 3 cases passed"), "{text}");
        assert!(text.contains("transition    1/2"), "{text}");
        assert!(text.contains("failed transition::cascade: 2 tasks survived"), "{text}");
    }
}
