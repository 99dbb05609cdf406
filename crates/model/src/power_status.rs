//! Last known power state of each component, maintained by the status poller.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

string_enum! {
    pub enum PowerState {
        On => "on",
        Off => "off",
        Undefined => "undefined",
    }
}

string_enum! {
    pub enum ManagementState {
        Unavailable => "unavailable",
        Available => "available",
    }
}

/// Power status of one component, keyed by xname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerStatusComponent {
    pub xname: String,
    pub power_state: PowerState,
    pub management_state: ManagementState,
    #[serde(default)]
    pub supported_power_transitions: Vec<String>,
    #[serde(default)]
    pub error: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl PowerStatusComponent {
    pub fn new(xname: impl Into<String>, power_state: PowerState) -> Self {
        Self {
            xname: xname.into(),
            power_state,
            management_state: ManagementState::Available,
            supported_power_transitions: Vec::new(),
            error: String::new(),
            last_updated: crate::now(),
        }
    }

    /// The record with `last_updated` truncated to microseconds.
    pub fn at_storage_precision(mut self) -> Self {
        self.last_updated = crate::truncate_to_micros(self.last_updated);
        self
    }
}

/// A collection of component power statuses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerStatus {
    pub status: Vec<PowerStatusComponent>,
}

impl PowerStatus {
    pub fn len(&self) -> usize {
        self.status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }

    pub fn find(&self, xname: &str) -> Option<&PowerStatusComponent> {
        self.status.iter().find(|c| c.xname == xname)
    }
}
