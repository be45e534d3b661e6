use chrono::{NaiveTime, Timelike};

use crate::db::models::ScheduledTask;

/// Tracks which wall-clock minute was last evaluated so each `HH:MM` fires
/// at most once, however many ticks land inside it.
#[derive(Debug, Default)]
pub struct MinuteGate {
    last_evaluated: Option<String>,
}

impl MinuteGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some("HH:MM")` when `now` falls in a minute not yet evaluated.
    /// The minute is only consumed by `mark_evaluated`.
    pub fn pending(&self, now: NaiveTime) -> Option<String> {
        let minute = minute_key(now);
        (self.last_evaluated.as_deref() != Some(minute.as_str())).then_some(minute)
    }

    pub fn mark_evaluated(&mut self, minute: String) {
        self.last_evaluated = Some(minute);
    }

    pub fn last_evaluated(&self) -> Option<&str> {
        self.last_evaluated.as_deref()
    }
}

pub fn minute_key(now: NaiveTime) -> String {
    format!("{:02}:{:02}", now.hour(), now.minute())
}

/// Enabled tasks scheduled for exactly `minute`.
pub fn due<'a>(tasks: &'a [ScheduledTask], minute: &'a str) -> impl Iterator<Item = &'a ScheduledTask> {
    tasks
        .iter()
        .filter(move |t| t.enabled && t.schedule_time == minute)
}
