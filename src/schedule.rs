use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

/// Wall-clock window during which an automation run is allowed to act.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutomationWindow {
    pub start: NaiveDateTime,
    pub finish: NaiveDateTime,
}

impl AutomationWindow {
    /// Starts at midnight of `today` (or the next day) and runs until 23:59
    /// of that day, or for a year when no end of day was requested.
    pub fn new(today: NaiveDate, start_tomorrow: bool, finish_tomorrow: bool) -> Self {
        let mut start = today.and_time(NaiveTime::MIN);
        if start_tomorrow {
            start += Duration::days(1);
        }
        let finish = if finish_tomorrow {
            start + Duration::hours(23) + Duration::minutes(59)
        } else {
            start + Duration::days(365)
        };
        Self { start, finish }
    }

    pub fn has_started(&self, now: NaiveDateTime) -> bool {
        now >= self.start
    }

    pub fn has_elapsed(&self, now: NaiveDateTime) -> bool {
        now >= self.finish
    }
}
