//! Database entity and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Scheduling
//! decisions live in `crate::scheduler`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Cursor;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstanceState {
    /// Waiting for `due_at`, or being retried after a failed generation.
    Scheduled,
    /// The loop ended because the active switch was off.
    Completed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Scheduled => "SCHEDULED",
            InstanceState::Completed => "COMPLETED",
        }
    }

    pub fn parse_state(s: &str) -> Option<InstanceState> {
        match s {
            "SCHEDULED" => Some(InstanceState::Scheduled),
            "COMPLETED" => Some(InstanceState::Completed),
            _ => None,
        }
    }
}

/// One polling loop, as persisted between generations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub instance_id: String,
    pub cursor: Cursor,
    pub generation: i64,
    pub state: InstanceState,
    pub attempt: i32,
    pub due_at: DateTime<Utc>,
    pub last_error: Option<String>,
}
