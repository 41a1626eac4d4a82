// Copyright (c) 2026 ironloop contributors
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/ironloop/ironloop

//! Control loops - PID and hysteresis strategies over registry channels
//!
//! Strategies only mutate in-memory loop state and return actuator
//! commands; all hardware writes go through the dispatcher.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Control strategy selected per loop at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "mode")]
pub enum LoopMode {
    /// Continuous feedback control
    Pid {
        /// Proportional gain
        kp: f64,
        /// Integral gain; zero disables the integral term
        ki: f64,
        /// Derivative gain
        kd: f64,
    },
    /// Discrete three-state relay logic with a dead band
    Hysteresis {
        /// Below this the raise-side actuator engages
        low: f64,
        /// Above this the lower-side actuator engages
        high: f64,
    },
}

/// How a loop's output reaches the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum OutputDrive {
    /// Write the clamped output value to one PWM/analog channel
    Analog {
        /// Target output channel
        channel: String,
    },
    /// Drive a complementary pair of discrete outputs
    RelayPair {
        /// Engaged when the output calls for raising the process value
        raise: String,
        /// Engaged when the output calls for lowering it
        lower: String,
        /// Dead band around zero where both sides stay off
        #[serde(default = "default_threshold")]
        threshold: f64,
    },
}

fn default_threshold() -> f64 {
    10.0
}

/// A commanded output value, consumed by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorCommand {
    /// Output channel to drive
    pub channel: String,
    /// Commanded value (0/1 for relays, raw output for analog)
    pub value: f64,
}

/// One configured control loop with its runtime state.
pub struct ControlLoop {
    /// Loop name, the target key for setpoint commands
    pub name: String,
    /// Input channel supplying the measured value
    pub input: String,
    /// Strategy and gains
    pub mode: LoopMode,
    /// Current setpoint
    pub setpoint: f64,
    /// Lower output limit
    pub min_output: f64,
    /// Upper output limit
    pub max_output: f64,
    /// Control interval; also the PID `dt`
    pub interval: Duration,
    /// How the output maps onto registry channels
    pub drive: OutputDrive,
    /// Last clamped output
    pub last_output: f64,

    integral: f64,
    prev_error: Option<f64>,
    last_run_ms: Option<u64>,
}

impl ControlLoop {
    /// Create a loop with cleared runtime state.
    pub fn new(
        name: String,
        input: String,
        mode: LoopMode,
        setpoint: f64,
        min_output: f64,
        max_output: f64,
        interval: Duration,
        drive: OutputDrive,
    ) -> Self {
        Self {
            name,
            input,
            mode,
            setpoint,
            min_output,
            max_output,
            interval,
            drive,
            last_output: 0.0,
            integral: 0.0,
            prev_error: None,
            last_run_ms: None,
        }
    }

    /// Step the loop once against a measured value and return the actuator
    /// commands for this interval.
    pub fn step(&mut self, measured: f64) -> Vec<ActuatorCommand> {
        match self.mode {
            LoopMode::Pid { kp, ki, kd } => {
                let output = self.pid_step(measured, kp, ki, kd);
                self.commands_for_output(output)
            }
            LoopMode::Hysteresis { low, high } => self.hysteresis_step(measured, low, high),
        }
    }

    fn pid_step(&mut self, measured: f64, kp: f64, ki: f64, kd: f64) -> f64 {
        let dt = self.interval.as_secs_f64();
        let error = self.setpoint - measured;

        // Anti-windup: the accumulator may never push Ki*integral past the
        // output limits, so releasing saturation cannot jump the output.
        let integral_term = if ki > 0.0 {
            self.integral =
                (self.integral + error * dt).clamp(self.min_output / ki, self.max_output / ki);
            ki * self.integral
        } else {
            0.0
        };

        let derivative = match self.prev_error {
            Some(prev) if dt > 0.0 => (error - prev) / dt,
            _ => 0.0,
        };

        let output = (kp * error + integral_term + kd * derivative)
            .clamp(self.min_output, self.max_output);

        // prev_error tracks the real trajectory even while clamped
        self.prev_error = Some(error);
        self.last_output = output;
        output
    }

    fn hysteresis_step(&mut self, measured: f64, low: f64, high: f64) -> Vec<ActuatorCommand> {
        let OutputDrive::RelayPair { raise, lower, .. } = &self.drive else {
            // Rejected by config validation; nothing sensible to drive.
            return Vec::new();
        };

        let (raise_on, lower_on) = if measured > high {
            (false, true)
        } else if measured < low {
            (true, false)
        } else {
            (false, false)
        };

        self.last_output = if raise_on {
            self.max_output
        } else if lower_on {
            self.min_output
        } else {
            0.0
        };

        vec![
            ActuatorCommand {
                channel: raise.clone(),
                value: raise_on as u8 as f64,
            },
            ActuatorCommand {
                channel: lower.clone(),
                value: lower_on as u8 as f64,
            },
        ]
    }

    fn commands_for_output(&self, output: f64) -> Vec<ActuatorCommand> {
        match &self.drive {
            OutputDrive::Analog { channel } => vec![ActuatorCommand {
                channel: channel.clone(),
                value: output,
            }],
            OutputDrive::RelayPair {
                raise,
                lower,
                threshold,
            } => {
                let (raise_on, lower_on) = if output > *threshold {
                    (true, false)
                } else if output < -threshold {
                    (false, true)
                } else {
                    (false, false)
                };
                vec![
                    ActuatorCommand {
                        channel: raise.clone(),
                        value: raise_on as u8 as f64,
                    },
                    ActuatorCommand {
                        channel: lower.clone(),
                        value: lower_on as u8 as f64,
                    },
                ]
            }
        }
    }
}

/// Measured value and staleness of a loop input, snapshotted from the
/// registry before stepping so no registry lock is held while loops run.
pub type InputSnapshot = HashMap<String, (f64, bool)>;

/// Owns every configured loop and steps the ones that are due.
pub struct Controller {
    loops: Vec<ControlLoop>,
}

impl Controller {
    /// Wrap the configured loops.
    pub fn new(loops: Vec<ControlLoop>) -> Self {
        Self { loops }
    }

    /// Step every loop whose interval has elapsed.
    ///
    /// A loop whose input is stale is skipped for this interval: its state
    /// and output stay frozen, and unrelated loops still run.
    pub fn step_due(&mut self, now_ms: u64, inputs: &InputSnapshot) -> Vec<ActuatorCommand> {
        let mut commands = Vec::new();
        for lp in &mut self.loops {
            let interval_ms = lp.interval.as_millis() as u64;
            let due = match lp.last_run_ms {
                None => true,
                Some(last) => now_ms.saturating_sub(last) >= interval_ms,
            };
            if !due {
                continue;
            }
            lp.last_run_ms = Some(now_ms);

            match inputs.get(&lp.input) {
                Some((_, true)) | None => {
                    debug!("loop '{}': input '{}' stale, holding", lp.name, lp.input);
                }
                Some((measured, false)) => {
                    commands.extend(lp.step(*measured));
                }
            }
        }
        commands
    }

    /// Change a loop's setpoint. Returns false for an unknown loop.
    pub fn set_setpoint(&mut self, name: &str, setpoint: f64) -> bool {
        match self.loops.iter_mut().find(|l| l.name == name) {
            Some(lp) => {
                lp.setpoint = setpoint;
                true
            }
            None => false,
        }
    }

    /// Whether a loop with this name exists.
    pub fn has_loop(&self, name: &str) -> bool {
        self.loops.iter().any(|l| l.name == name)
    }

    /// Read access to the loops, for status reporting.
    pub fn loops(&self) -> &[ControlLoop] {
        &self.loops
    }
}
