// Copyright (c) 2026 ironloop contributors
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/ironloop/ironloop

//! Command ingestion - external setpoint changes and manual overrides
//!
//! Commands arrive on an mpsc queue fed by the MQTT link (or a local
//! handle), get validated against the registry and controller, and apply
//! under the same locks the tick loop uses - so a command is either fully
//! visible to the next tick or not applied at all.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::channels::{ChannelKind, ChannelRegistry};
use crate::control::Controller;
use crate::streaming::MqttLink;

/// An externally-sourced command. Transient: validated, applied, discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Loop name (setpoint change) or output channel name (override)
    pub target: String,
    /// Desired setpoint or output value
    pub value: f64,
    /// Who sent it, for logs and rejection notices
    #[serde(default = "unknown_source")]
    pub source: String,
    /// When it was created
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn unknown_source() -> String {
    "unknown".to_string()
}

/// Why a command was rejected. Rejected commands never mutate state.
#[derive(Debug, Error)]
pub enum CommandError {
    /// No loop or channel with that name
    #[error("unknown target '{0}'")]
    UnknownTarget(String),
    /// The target is an input channel
    #[error("target '{0}' is not writable")]
    NotWritable(String),
    /// The value is outside the target's accepted range
    #[error("value {value} out of range for '{target}' ({min}..={max})")]
    OutOfRange {
        /// Command target
        target: String,
        /// Offending value
        value: f64,
        /// Lower acceptance bound
        min: f64,
        /// Upper acceptance bound
        max: f64,
    },
    /// NaN or infinity
    #[error("non-finite value for '{0}'")]
    NotFinite(String),
}

/// What a valid command did.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// A loop setpoint changed
    Setpoint {
        /// Loop name
        name: String,
        /// New setpoint
        value: f64,
    },
    /// An output channel was commanded directly
    Output {
        /// Channel name
        channel: String,
        /// Commanded value
        value: f64,
    },
}

/// Validates and applies commands against shared engine state.
pub struct CommandIngestor {
    registry: Arc<RwLock<ChannelRegistry>>,
    controller: Arc<Mutex<Controller>>,
    mqtt: Option<Arc<MqttLink>>,
}

impl CommandIngestor {
    /// Build an ingestor over the engine's shared state.
    pub fn new(
        registry: Arc<RwLock<ChannelRegistry>>,
        controller: Arc<Mutex<Controller>>,
        mqtt: Option<Arc<MqttLink>>,
    ) -> Self {
        Self {
            registry,
            controller,
            mqtt,
        }
    }

    /// Validate and apply one command.
    ///
    /// Loop names take precedence over channel names when both exist; the
    /// config validator keeps the namespaces disjoint in practice.
    pub fn apply(&self, cmd: &Command) -> Result<Applied, CommandError> {
        if !cmd.value.is_finite() {
            return Err(CommandError::NotFinite(cmd.target.clone()));
        }

        {
            let mut controller = self.controller.lock();
            if controller.has_loop(&cmd.target) {
                controller.set_setpoint(&cmd.target, cmd.value);
                return Ok(Applied::Setpoint {
                    name: cmd.target.clone(),
                    value: cmd.value,
                });
            }
        }

        let mut registry = self.registry.write();
        let Some(ch) = registry.get(&cmd.target) else {
            return Err(CommandError::UnknownTarget(cmd.target.clone()));
        };

        let (min, max) = match ch.kind {
            ChannelKind::DigitalOut => (0.0, 1.0),
            ChannelKind::PwmOut => (0.0, 100.0),
            ChannelKind::DigitalIn | ChannelKind::AnalogIn => {
                return Err(CommandError::NotWritable(cmd.target.clone()));
            }
        };
        if cmd.value < min || cmd.value > max {
            return Err(CommandError::OutOfRange {
                target: cmd.target.clone(),
                value: cmd.value,
                min,
                max,
            });
        }
        if ch.kind == ChannelKind::DigitalOut && cmd.value != 0.0 && cmd.value != 1.0 {
            return Err(CommandError::OutOfRange {
                target: cmd.target.clone(),
                value: cmd.value,
                min,
                max,
            });
        }

        registry.apply_output(&cmd.target, cmd.value);
        Ok(Applied::Output {
            channel: cmd.target.clone(),
            value: cmd.value,
        })
    }

    /// Drain the command queue until shutdown.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<Command>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match self.apply(&cmd) {
                        Ok(applied) => {
                            info!("command from '{}' applied: {:?}", cmd.source, applied);
                        }
                        Err(e) => {
                            warn!("command from '{}' rejected: {}", cmd.source, e);
                            if let Some(mqtt) = &self.mqtt {
                                let notice = serde_json::json!({
                                    "target": cmd.target,
                                    "source": cmd.source,
                                    "reason": e.to_string(),
                                });
                                // Best effort, like every other publish
                                let _ = mqtt.publish("rejected", &notice).await;
                            }
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::ChannelDef;
    use crate::control::{ControlLoop, LoopMode, OutputDrive};

    fn setup() -> CommandIngestor {
        let registry = Arc::new(RwLock::new(ChannelRegistry::from_defs(&[
            ChannelDef::test_input("temp", ChannelKind::AnalogIn, 1),
            ChannelDef::test_output("heater", ChannelKind::DigitalOut, 2),
            ChannelDef::test_output("fan", ChannelKind::PwmOut, 3),
        ])));
        let controller = Arc::new(Mutex::new(Controller::new(vec![ControlLoop::new(
            "temp_loop".into(),
            "temp".into(),
            LoopMode::Pid {
                kp: 1.0,
                ki: 0.0,
                kd: 0.0,
            },
            25.0,
            -100.0,
            100.0,
            Duration::from_secs(1),
            OutputDrive::RelayPair {
                raise: "heater".into(),
                lower: "heater".into(),
                threshold: 10.0,
            },
        )])));
        CommandIngestor::new(registry, controller, None)
    }

    fn cmd(target: &str, value: f64) -> Command {
        Command {
            target: target.into(),
            value,
            source: "test".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn setpoint_command_targets_the_loop() {
        let ingestor = setup();
        let applied = ingestor.apply(&cmd("temp_loop", 30.0)).unwrap();
        assert_eq!(
            applied,
            Applied::Setpoint {
                name: "temp_loop".into(),
                value: 30.0
            }
        );
    }

    #[test]
    fn override_marks_output_pending() {
        let ingestor = setup();
        ingestor.apply(&cmd("heater", 1.0)).unwrap();
        let reg = ingestor.registry.read();
        let ch = reg.get("heater").unwrap();
        assert_eq!(ch.value, 1.0);
        assert!(ch.pending);
    }

    #[test]
    fn unknown_target_is_rejected_without_mutation() {
        let ingestor = setup();
        assert!(matches!(
            ingestor.apply(&cmd("nope", 1.0)),
            Err(CommandError::UnknownTarget(_))
        ));
        assert!(!ingestor.registry.read().has_pending());
    }

    #[test]
    fn input_channel_is_not_writable() {
        let ingestor = setup();
        assert!(matches!(
            ingestor.apply(&cmd("temp", 30.0)),
            Err(CommandError::NotWritable(_))
        ));
    }

    #[test]
    fn digital_override_must_be_binary() {
        let ingestor = setup();
        assert!(matches!(
            ingestor.apply(&cmd("heater", 0.5)),
            Err(CommandError::OutOfRange { .. })
        ));
        assert!(matches!(
            ingestor.apply(&cmd("heater", 2.0)),
            Err(CommandError::OutOfRange { .. })
        ));
    }

    #[test]
    fn pwm_range_is_percent() {
        let ingestor = setup();
        ingestor.apply(&cmd("fan", 55.0)).unwrap();
        assert!(matches!(
            ingestor.apply(&cmd("fan", 140.0)),
            Err(CommandError::OutOfRange { .. })
        ));
    }

    #[test]
    fn non_finite_values_never_apply() {
        let ingestor = setup();
        assert!(matches!(
            ingestor.apply(&cmd("temp_loop", f64::NAN)),
            Err(CommandError::NotFinite(_))
        ));
    }
}
