//! Transitions: tracked, cluster-wide power operations and their per-component
//! tasks.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

string_enum! {
    /// Power action requested by a transition.
    pub enum PowerOperation {
        On => "On",
        Off => "Off",
        SoftRestart => "Soft-Restart",
        HardRestart => "Hard-Restart",
        Init => "Init",
        ForceOff => "Force-Off",
        SoftOff => "Soft-Off",
    }
}

string_enum! {
    /// Lifecycle of a whole transition.
    pub enum TransitionStatus {
        New => "new",
        InProgress => "in-progress",
        Completed => "completed",
        Aborted => "aborted",
    }
}

impl TransitionStatus {
    /// Whether the orchestrator may move a transition from `self` to `next`.
    ///
    /// Status only moves forward; `Aborted` is reachable from any
    /// non-terminal status.
    pub fn can_advance_to(self, next: TransitionStatus) -> bool {
        use TransitionStatus::*;
        match (self, next) {
            (Completed | Aborted, _) => false,
            (_, Aborted) => true,
            (New, InProgress | Completed) => true,
            (InProgress, Completed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransitionStatus::Completed | TransitionStatus::Aborted)
    }
}

string_enum! {
    /// Progress of a single transition task.
    pub enum TaskState {
        GatherData => "GatherData",
        Sending => "Sending",
        Waiting => "Waiting",
        Confirming => "Confirming",
    }
}

impl TaskState {
    /// Task state only moves forward through the declared order.
    pub fn can_advance_to(self, next: TaskState) -> bool {
        (next as u8) > (self as u8)
    }
}

string_enum! {
    /// Outcome of a transition task.
    pub enum TaskStatus {
        New => "new",
        InProgress => "in-progress",
        Failed => "failed",
        Succeeded => "succeeded",
        Unsupported => "unsupported",
    }
}

/// A target component of a transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub xname: String,
    /// Hardware reservation deputy key supplied by the requester.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deputy_key: Option<String>,
}

impl Location {
    pub fn new(xname: impl Into<String>) -> Self {
        Self {
            xname: xname.into(),
            deputy_key: None,
        }
    }
}

/// A tracked power operation across one or more components.
///
/// `location` and `task_ids` are fixed when the transition is first stored.
/// Later stores only update `status` and `last_active_time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub transition_id: Uuid,
    pub operation: PowerOperation,
    /// Minutes each task may run before it is considered failed.
    pub task_deadline: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub create_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub automatic_expiration_time: OffsetDateTime,
    pub location: Vec<Location>,
    pub status: TransitionStatus,
    #[serde(default)]
    pub task_ids: Vec<Uuid>,
}

/// Hours a transition is retained after creation.
pub const TRANSITION_RETENTION_HOURS: i64 = 24;

impl Transition {
    /// Create a new transition in `New` status.
    ///
    /// Duplicate locations are dropped, keeping the first occurrence, since
    /// the target list has set semantics.
    pub fn new(operation: PowerOperation, locations: Vec<Location>, task_deadline: i32) -> Self {
        let now = crate::now();
        let mut unique: Vec<Location> = Vec::with_capacity(locations.len());
        for loc in locations {
            if !unique.iter().any(|l| l.xname == loc.xname) {
                unique.push(loc);
            }
        }
        Self {
            transition_id: Uuid::new_v4(),
            operation,
            task_deadline,
            create_time: now,
            last_active_time: now,
            automatic_expiration_time: now + Duration::hours(TRANSITION_RETENTION_HOURS),
            location: unique,
            status: TransitionStatus::New,
            task_ids: Vec::new(),
        }
    }

    /// Test-and-set comparison: every field except `location` must match.
    ///
    /// Location lists are not compared because paginating backends only
    /// hold the first chunk in the record being compared.
    pub fn matches_ignoring_location(&self, other: &Transition) -> bool {
        self.transition_id == other.transition_id
            && self.operation == other.operation
            && self.task_deadline == other.task_deadline
            && self.create_time == other.create_time
            && self.last_active_time == other.last_active_time
            && self.automatic_expiration_time == other.automatic_expiration_time
            && self.status == other.status
            && self.task_ids == other.task_ids
    }

    /// The record with every timestamp truncated to microseconds.
    pub fn at_storage_precision(mut self) -> Self {
        self.create_time = crate::truncate_to_micros(self.create_time);
        self.last_active_time = crate::truncate_to_micros(self.last_active_time);
        self.automatic_expiration_time = crate::truncate_to_micros(self.automatic_expiration_time);
        self
    }

    /// Copy the fields a re-store may change from `update` onto `self`.
    pub fn apply_update(&mut self, update: &Transition) {
        self.status = update.status;
        self.last_active_time = update.last_active_time;
    }

    /// Whether the location lists hold the same xnames, ignoring order.
    pub fn same_locations(&self, other: &Transition) -> bool {
        self.location.len() == other.location.len()
            && self
                .location
                .iter()
                .all(|l| other.location.iter().any(|o| o == l))
    }
}

/// The unit of work for one component of a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionTask {
    pub task_id: Uuid,
    pub transition_id: Uuid,
    pub operation: PowerOperation,
    pub state: TaskState,
    pub xname: String,
    #[serde(default)]
    pub reservation_key: String,
    #[serde(default)]
    pub deputy_key: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub status_desc: String,
    #[serde(default)]
    pub error: String,
}

impl TransitionTask {
    pub fn new(transition_id: Uuid, operation: PowerOperation) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            transition_id,
            operation,
            state: TaskState::GatherData,
            xname: String::new(),
            reservation_key: String::new(),
            deputy_key: String::new(),
            status: TaskStatus::New,
            status_desc: String::new(),
            error: String::new(),
        }
    }

    /// Copy the fields a re-store may change from `update` onto `self`.
    pub fn apply_update(&mut self, update: &TransitionTask) {
        self.state = update.state;
        self.status = update.status;
        self.status_desc.clone_from(&update.status_desc);
        self.error.clone_from(&update.error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Transition {
        Transition::new(
            PowerOperation::Init,
            vec![Location::new("x0c0s1b0n0"), Location::new("x0c0s2b0n0")],
            5,
        )
    }

    #[test]
    fn new_transition_drops_duplicate_locations() {
        let t = Transition::new(
            PowerOperation::Off,
            vec![
                Location::new("x0c0s1b0n0"),
                Location::new("x0c0s1b0n0"),
                Location::new("x0c0s2b0n0"),
            ],
            5,
        );
        assert_eq!(t.location.len(), 2);
        assert_eq!(t.status, TransitionStatus::New);
    }

    #[test]
    fn tas_comparison_ignores_location() {
        let a = sample();
        let mut b = a.clone();
        b.location.truncate(1);
        assert!(a.matches_ignoring_location(&b));

        b.status = TransitionStatus::Aborted;
        assert!(!a.matches_ignoring_location(&b));
    }

    #[test]
    fn apply_update_only_touches_mutable_fields() {
        let mut stored = sample();
        let mut update = stored.clone();
        update.status = TransitionStatus::InProgress;
        update.operation = PowerOperation::Off;
        update.location = vec![Location::new("x9c0s0b0n0")];
        update.last_active_time = stored.last_active_time + Duration::seconds(30);

        stored.apply_update(&update);
        assert_eq!(stored.status, TransitionStatus::InProgress);
        assert_eq!(stored.last_active_time, update.last_active_time);
        assert_eq!(stored.operation, PowerOperation::Init);
        assert_eq!(stored.location.len(), 2);
    }

    #[test]
    fn storage_precision_drops_nanoseconds_only() {
        let mut t = sample();
        t.last_active_time = time::macros::datetime!(2023-11-14 22:13:20.123_456_789 UTC);
        let stored = t.clone().at_storage_precision();
        assert_eq!(stored.last_active_time.nanosecond(), 123_456_000);
        assert_eq!(stored.create_time, t.create_time);
        assert!(stored.matches_ignoring_location(&t.clone().at_storage_precision()));
        assert!(!stored.matches_ignoring_location(&t));
    }

    #[test]
    fn status_moves_forward_or_aborts() {
        use TransitionStatus::*;
        assert!(New.can_advance_to(InProgress));
        assert!(InProgress.can_advance_to(Completed));
        assert!(InProgress.can_advance_to(Aborted));
        assert!(!InProgress.can_advance_to(New));
        assert!(!Completed.can_advance_to(Aborted));
        assert!(!Aborted.can_advance_to(InProgress));
    }

    #[test]
    fn task_state_is_forward_only() {
        assert!(TaskState::GatherData.can_advance_to(TaskState::Sending));
        assert!(!TaskState::Waiting.can_advance_to(TaskState::Sending));
    }

    #[test]
    fn enums_use_canonical_strings_on_the_wire() {
        let json = serde_json::to_string(&PowerOperation::HardRestart).unwrap();
        assert_eq!(json, "\"Hard-Restart\"");
        let status: TransitionStatus = serde_json::from_str("\"in-progress\"").unwrap();
        assert_eq!(status, TransitionStatus::InProgress);
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn transition_json_round_trip_preserves_times() {
        let t = sample();
        let json = serde_json::to_string(&t).unwrap();
        let back: Transition = serde_json::from_str(&json).unwrap();
        assert_eq!(t, back);
    }
}
