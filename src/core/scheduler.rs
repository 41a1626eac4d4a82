// Copyright (c) 2026 ironloop contributors
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/ironloop/ironloop

//! Interval bookkeeping for the tick loop

use std::time::Duration;

use tracing::debug;

/// The activities the engine runs, in their fixed per-tick order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activity {
    /// Read due input channels
    Sample,
    /// Compare discrete inputs against their previous values
    DetectChanges,
    /// Step the control loops
    Control,
    /// Evaluate alert bounds
    Alert,
    /// Push state to the message bus
    Publish,
    /// Append state to the persistence store
    Persist,
}

/// Order in which due activities run within one tick. Never reordered.
pub const TICK_ORDER: [Activity; 6] = [
    Activity::Sample,
    Activity::DetectChanges,
    Activity::Control,
    Activity::Alert,
    Activity::Publish,
    Activity::Persist,
];

struct ScheduleEntry {
    activity: Activity,
    interval: Duration,
    last_fired: Option<u64>,
}

/// Owns one interval timer per activity and decides what runs each tick.
///
/// Time is monotonic milliseconds since engine start, supplied by the
/// caller, so tests can drive the schedule deterministically. Firing resets
/// `last_fired` to the tick time itself rather than advancing it by the
/// interval: a late or missed tick is skipped, never queued for catch-up.
pub struct Scheduler {
    entries: Vec<ScheduleEntry>,
}

impl Scheduler {
    /// Build a schedule from (activity, interval) pairs.
    pub fn new(intervals: Vec<(Activity, Duration)>) -> Self {
        let entries = intervals
            .into_iter()
            .map(|(activity, interval)| ScheduleEntry {
                activity,
                interval,
                last_fired: None,
            })
            .collect();
        Self { entries }
    }

    /// Evaluate the schedule at `now_ms` and return the due activities in
    /// [`TICK_ORDER`]. Each entry fires at most once per call; an entry
    /// that has never fired is due immediately.
    pub fn tick(&mut self, now_ms: u64) -> Vec<Activity> {
        let mut due = Vec::new();
        for entry in &mut self.entries {
            let interval_ms = entry.interval.as_millis() as u64;
            let fire = match entry.last_fired {
                None => true,
                Some(last) => now_ms.saturating_sub(last) >= interval_ms,
            };
            if fire {
                entry.last_fired = Some(now_ms);
                due.push(entry.activity);
            }
        }

        due.sort_by_key(|a| TICK_ORDER.iter().position(|o| o == a));
        if !due.is_empty() {
            debug!("tick {}ms: {:?} due", now_ms, due);
        }
        due
    }

    /// Smallest configured interval, used to validate the base resolution.
    pub fn min_interval(&self) -> Option<Duration> {
        self.entries.iter().map(|e| e.interval).min()
    }
}
