// Copyright (c) 2026 ironloop contributors
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/ironloop/ironloop

//! ironloop - Industrial Process-Control Engine
//!
//! A tick-driven control engine for small industrial installations:
//! - Typed I/O channels (digital, analog, PWM) behind a pluggable adapter
//! - PID and hysteresis control loops with anti-windup and safe limits
//! - Debounce-free discrete change detection with per-event telemetry
//! - Level-crossing alert evaluation
//! - Fan-out to actuators, MQTT and SQLite with per-sink fault isolation
//! - Guaranteed safe-state actuator write on shutdown and emergency stop
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ironloop Engine                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │   tick ─▶ Sampler ─▶ Change   ─▶ Controller ─▶ Alert         │
//! │              │       Detector        │         Evaluator     │
//! │              ▼           │           ▼             │         │
//! │       ┌──────────────────┴───────────────────────┐ │         │
//! │       │             Channel Registry             │◀┘         │
//! │       └──────────────────┬───────────────────────┘           │
//! │              ▲           ▼                                   │
//! │   Command ───┘      Dispatcher ─▶ Actuators / MQTT / SQLite  │
//! │   Ingestor                                                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod alerts;
pub mod channels;
pub mod config;
pub mod control;
pub mod core;
pub mod db;
pub mod dispatch;
pub mod ingest;
pub mod io;
pub mod sampling;
pub mod streaming;

// Re-exports for convenience
pub use alerts::{AlertEvaluator, AlertEvent};
pub use channels::{Channel, ChannelKind, ChannelRegistry};
pub use config::Config;
pub use control::{ControlLoop, Controller, LoopMode};
pub use crate::core::{Engine, EngineState};
pub use db::Database;
pub use dispatch::Dispatcher;
pub use ingest::{Command, CommandIngestor};
pub use io::{IoAdapter, SimulatedIo};
pub use sampling::{ChangeDetector, Sampler};
pub use streaming::MqttLink;

/// ironloop version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// ironloop name
pub const NAME: &str = "ironloop";
