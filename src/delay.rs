use chrono::{DateTime, FixedOffset, Local, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Spacing between generations of the polling loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayPolicy {
    pub base_seconds: u64,
    /// Used instead of `base_seconds` inside the quiet window.
    pub quiet_seconds: u64,
    /// Floor applied after subtracting the cycle's own run time.
    pub min_seconds: u64,
    /// First quiet hour, inclusive.
    pub quiet_start_hour: u32,
    /// Last quiet hour, inclusive. May be smaller than the start to wrap midnight.
    pub quiet_end_hour: u32,
    pub utc_offset_minutes: Option<i32>,
}

impl Default for DelayPolicy {
    fn default() -> Self {
        Self {
            base_seconds: 45,
            quiet_seconds: 180,
            min_seconds: 30,
            quiet_start_hour: 1,
            quiet_end_hour: 6,
            utc_offset_minutes: None,
        }
    }
}

impl DelayPolicy {
    pub fn local_hour(&self, at: DateTime<Utc>) -> u32 {
        match self
            .utc_offset_minutes
            .and_then(|m| FixedOffset::east_opt(m * 60))
        {
            Some(offset) => at.with_timezone(&offset).hour(),
            None => at.with_timezone(&Local).hour(),
        }
    }

    pub fn is_quiet_hour(&self, hour: u32) -> bool {
        if self.quiet_start_hour <= self.quiet_end_hour {
            (self.quiet_start_hour..=self.quiet_end_hour).contains(&hour)
        } else {
            hour >= self.quiet_start_hour || hour <= self.quiet_end_hour
        }
    }

    pub fn target_seconds(&self, hour: u32) -> u64 {
        if self.is_quiet_hour(hour) {
            self.quiet_seconds
        } else {
            self.base_seconds
        }
    }

    /// Seconds to wait before the next generation; zero ends the loop.
    pub fn next_delay_seconds(
        &self,
        active: bool,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> u64 {
        if !active {
            return 0;
        }
        let elapsed = (now - started_at).num_seconds().max(0) as u64;
        let target = self.target_seconds(self.local_hour(now));
        target.saturating_sub(elapsed).max(self.min_seconds)
    }
}
