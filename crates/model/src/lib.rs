//! pcs-model: entity records shared by every power-control storage backend.
//!
//! The types here are plain serde records. They carry no backend concerns:
//! the memory backend stores them as-is, the etcd backend stores their JSON
//! encoding and the PostgreSQL backend maps them onto table rows.
//!
//! Timestamps are `time::OffsetDateTime`. Every backend persists them at
//! microsecond precision (the records' `at_storage_precision`), so a value
//! read back compares equal to [`truncate_to_micros`] of the value written.
//! [`now`] already returns such a value.

#[macro_use]
mod macros;

mod error;
pub mod power_cap;
pub mod power_status;
pub mod transition;
pub mod xname;

pub use error::ModelError;
pub use power_cap::{
    PowerCapComponent, PowerCapComponentParameter, PowerCapControlParameter, PowerCapControls,
    PowerCapOpStatus, PowerCapOperation, PowerCapPatchParameter, PowerCapSnapshotParameter,
    PowerCapTask, PowerCapTaskCounts, PowerCapTaskStatus, PowerCapTaskType, PowerCapabilities,
};
pub use power_status::{ManagementState, PowerState, PowerStatus, PowerStatusComponent};
pub use transition::{
    Location, PowerOperation, TaskState, TaskStatus, Transition, TransitionStatus, TransitionTask,
};
pub use xname::{is_valid_xname, Xname, XnameKind};

use time::OffsetDateTime;

/// Current UTC time truncated to microseconds.
pub fn now() -> OffsetDateTime {
    truncate_to_micros(OffsetDateTime::now_utc())
}

/// Drop sub-microsecond precision from a timestamp.
pub fn truncate_to_micros(ts: OffsetDateTime) -> OffsetDateTime {
    let micros = ts.nanosecond() / 1_000 * 1_000;
    ts.replace_nanosecond(micros).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_has_no_sub_microsecond_component() {
        let ts = now();
        assert_eq!(ts.nanosecond() % 1_000, 0);
    }

    #[test]
    fn truncate_keeps_microseconds() {
        let ts = time::macros::datetime!(2025-03-01 12:00:00.123_456_789 UTC);
        let truncated = truncate_to_micros(ts);
        assert_eq!(truncated.nanosecond(), 123_456_000);
        assert_eq!(truncated.unix_timestamp(), ts.unix_timestamp());
    }
}
