// Copyright (c) 2026 ironloop contributors
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/ironloop/ironloop

//! Core engine module - tick loop and schedule

mod engine;
mod scheduler;

pub use engine::Engine;
pub use scheduler::{Activity, Scheduler, TICK_ORDER};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Engine-wide counters exposed to status surfaces.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineState {
    /// Tick loop is executing
    pub running: bool,
    /// Ticks executed since start
    pub ticks: u64,
    /// Sampling passes completed
    pub sample_passes: u64,
    /// Change events emitted
    pub total_changes: u64,
    /// At least one alert rule is raised
    pub alerts_active: bool,
    /// Emergency stop currently engaged
    pub estop_active: bool,
    /// Seconds since the engine started running
    pub uptime_seconds: u64,
    /// When the last discrete transition was observed
    pub last_change: Option<DateTime<Utc>>,
}
