// Copyright (c) 2026 ironloop contributors
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/ironloop/ironloop

//! Configuration module
//!
//! One fully-validated structure built at startup; every component receives
//! only the section it needs. Load failures fall back to the built-in
//! defaults with a warning so a damaged config file never strands a plant
//! controller at boot.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::channels::{ChannelKind, Scaling};
use crate::control::{ControlLoop, LoopMode, OutputDrive};
use crate::streaming::MqttConfig;

/// A configuration that cannot be run. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The tick resolution is coarser than the fastest activity
    #[error("base resolution {base_ms}ms exceeds smallest interval {min_ms}ms")]
    BaseResolution {
        /// Configured base resolution
        base_ms: u64,
        /// Smallest schedule or loop interval
        min_ms: u64,
    },
    /// Two channels share a name
    #[error("duplicate channel name '{0}'")]
    DuplicateChannel(String),
    /// A loop or rule references a channel that does not exist
    #[error("{referrer} references unknown channel '{name}'")]
    UnknownChannel {
        /// The loop or rule doing the referencing
        referrer: String,
        /// The missing channel
        name: String,
    },
    /// A referenced channel has the wrong direction or kind
    #[error("{referrer}: channel '{name}' is not {expected}")]
    WrongKind {
        /// The loop or rule doing the referencing
        referrer: String,
        /// The offending channel
        name: String,
        /// What was needed ("an input", "a digital output", ...)
        expected: &'static str,
    },
    /// A loop definition is internally inconsistent
    #[error("loop '{name}': {reason}")]
    InvalidLoop {
        /// Loop name
        name: String,
        /// What is wrong
        reason: String,
    },
    /// An alert rule is internally inconsistent
    #[error("alert rule '{name}': {reason}")]
    InvalidRule {
        /// Rule name
        name: String,
        /// What is wrong
        reason: String,
    },
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tick loop parameters
    pub engine: EngineConfig,
    /// Per-activity intervals
    pub schedule: ScheduleConfig,
    /// Channel table
    pub channels: Vec<ChannelDef>,
    /// Control loop table
    pub loops: Vec<LoopDef>,
    /// Alert rules and emergency stop
    pub alerts: AlertsConfig,
    /// Message bus connection
    pub mqtt: MqttConfig,
    /// Persistence target
    pub database: DatabaseConfig,
}

/// Tick loop parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base tick resolution in milliseconds
    pub base_resolution_ms: u64,
    /// Deadline for any single adapter or sink operation
    pub io_timeout_ms: u64,
    /// Consecutive read failures before a channel counts as faulted
    pub fault_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_resolution_ms: 1000,
            io_timeout_ms: 250,
            fault_threshold: 5,
        }
    }
}

impl EngineConfig {
    /// Base resolution as a [`Duration`].
    pub fn base_resolution(&self) -> Duration {
        Duration::from_millis(self.base_resolution_ms)
    }

    /// I/O deadline as a [`Duration`].
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Per-activity intervals in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Input sampling
    pub sample_ms: u64,
    /// Discrete change detection
    pub detect_ms: u64,
    /// Control loop stepping (default for loops without their own interval)
    pub control_ms: u64,
    /// Alert evaluation
    pub alert_ms: u64,
    /// Message bus publishing
    pub publish_ms: u64,
    /// Persistence writes
    pub persist_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            sample_ms: 1000,
            detect_ms: 1000,
            control_ms: 1000,
            alert_ms: 1000,
            publish_ms: 10_000,
            persist_ms: 10_000,
        }
    }
}

/// One channel table entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDef {
    /// Unique channel name
    pub name: String,
    /// Channel kind
    pub kind: ChannelKind,
    /// Hardware line / pin / register number
    pub line: u32,
    /// Optional bank or bus qualifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank: Option<String>,
    /// Linear scale factor applied to raw reads
    #[serde(default = "one")]
    pub factor: f64,
    /// Linear offset applied after the factor
    #[serde(default)]
    pub offset: f64,
    /// Invert a pull-up wired digital input
    #[serde(default)]
    pub invert: bool,
    /// Engineering unit label
    #[serde(default)]
    pub unit: String,
    /// Output level enforced on shutdown or emergency stop
    #[serde(default)]
    pub safe_value: f64,
}

fn one() -> f64 {
    1.0
}

impl ChannelDef {
    /// The scaling policy this entry describes.
    pub fn scaling(&self) -> Scaling {
        if self.invert {
            Scaling::Inverted
        } else if self.factor != 1.0 || self.offset != 0.0 {
            Scaling::Linear {
                factor: self.factor,
                offset: self.offset,
            }
        } else {
            Scaling::Identity
        }
    }
}

#[cfg(test)]
impl ChannelDef {
    /// Bare input definition for unit tests.
    pub fn test_input(name: &str, kind: ChannelKind, line: u32) -> Self {
        Self {
            name: name.to_string(),
            kind,
            line,
            bank: None,
            factor: 1.0,
            offset: 0.0,
            invert: false,
            unit: String::new(),
            safe_value: 0.0,
        }
    }

    /// Bare output definition for unit tests.
    pub fn test_output(name: &str, kind: ChannelKind, line: u32) -> Self {
        Self::test_input(name, kind, line)
    }
}

/// One control loop table entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDef {
    /// Loop name, the target key for setpoint commands
    pub name: String,
    /// Input channel supplying the measured value
    pub input: String,
    /// Strategy and gains
    #[serde(flatten)]
    pub mode: LoopMode,
    /// Initial setpoint
    #[serde(default)]
    pub setpoint: f64,
    /// Lower output limit
    #[serde(default = "neg_hundred")]
    pub min_output: f64,
    /// Upper output limit
    #[serde(default = "hundred")]
    pub max_output: f64,
    /// Loop interval; defaults to the schedule's control interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    /// Output mapping
    pub drive: OutputDrive,
}

fn hundred() -> f64 {
    100.0
}

fn neg_hundred() -> f64 {
    -100.0
}

impl LoopDef {
    /// Instantiate the runtime loop, falling back to the schedule's control
    /// interval when none is set.
    pub fn to_loop(&self, default_interval: Duration) -> ControlLoop {
        ControlLoop::new(
            self.name.clone(),
            self.input.clone(),
            self.mode,
            self.setpoint,
            self.min_output,
            self.max_output,
            self.interval_ms
                .map(Duration::from_millis)
                .unwrap_or(default_interval),
            self.drive.clone(),
        )
    }
}

/// One alert rule: min/max bounds on a channel value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleDef {
    /// Rule name used in telemetry
    pub name: String,
    /// Channel to watch
    pub channel: String,
    /// Raise when the value drops below this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Raise when the value rises above this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

/// Alert rules plus the optional emergency-stop input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Bound rules evaluated at the alert interval
    pub rules: Vec<AlertRuleDef>,
    /// Digital input that forces all outputs safe while active
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estop_channel: Option<String>,
}

/// Persistence target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Enable the SQLite sink
    pub enabled: bool,
    /// Database path
    pub path: PathBuf,
    /// Rows older than this many days are purged at startup
    pub retention_days: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("./data/ironloop.db"),
            retention_days: 30,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            schedule: ScheduleConfig::default(),
            channels: vec![
                ChannelDef {
                    name: "temp".into(),
                    kind: ChannelKind::AnalogIn,
                    line: 0,
                    bank: Some("ain".into()),
                    factor: 100.0,
                    offset: -25.0,
                    invert: false,
                    unit: "°C".into(),
                    safe_value: 0.0,
                },
                ChannelDef {
                    name: "input_1".into(),
                    kind: ChannelKind::DigitalIn,
                    line: 22,
                    bank: None,
                    factor: 1.0,
                    offset: 0.0,
                    invert: true,
                    unit: String::new(),
                    safe_value: 0.0,
                },
                ChannelDef {
                    name: "input_2".into(),
                    kind: ChannelKind::DigitalIn,
                    line: 23,
                    bank: None,
                    factor: 1.0,
                    offset: 0.0,
                    invert: true,
                    unit: String::new(),
                    safe_value: 0.0,
                },
                ChannelDef {
                    name: "estop".into(),
                    kind: ChannelKind::DigitalIn,
                    line: 27,
                    bank: None,
                    factor: 1.0,
                    offset: 0.0,
                    invert: true,
                    unit: String::new(),
                    safe_value: 0.0,
                },
                ChannelDef {
                    name: "heater".into(),
                    kind: ChannelKind::DigitalOut,
                    line: 18,
                    bank: None,
                    factor: 1.0,
                    offset: 0.0,
                    invert: false,
                    unit: String::new(),
                    safe_value: 0.0,
                },
                ChannelDef {
                    name: "cooler".into(),
                    kind: ChannelKind::DigitalOut,
                    line: 19,
                    bank: None,
                    factor: 1.0,
                    offset: 0.0,
                    invert: false,
                    unit: String::new(),
                    safe_value: 0.0,
                },
            ],
            loops: vec![LoopDef {
                name: "temp_loop".into(),
                input: "temp".into(),
                mode: LoopMode::Pid {
                    kp: 2.0,
                    ki: 0.1,
                    kd: 0.05,
                },
                setpoint: 25.0,
                min_output: -100.0,
                max_output: 100.0,
                interval_ms: None,
                drive: OutputDrive::RelayPair {
                    raise: "heater".into(),
                    lower: "cooler".into(),
                    threshold: 10.0,
                },
            }],
            alerts: AlertsConfig {
                rules: vec![AlertRuleDef {
                    name: "temp_band".into(),
                    channel: "temp".into(),
                    min: Some(15.0),
                    max: Some(35.0),
                }],
                estop_channel: Some("estop".into()),
            },
            mqtt: MqttConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Load the file if it parses, otherwise fall back to the defaults.
    ///
    /// A missing file is written out with the defaults so the operator has
    /// something to edit; a broken file is left alone.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => config,
                Err(e) => {
                    warn!(
                        "failed to load {:?} ({}); continuing with built-in defaults",
                        path, e
                    );
                    Self::default()
                }
            }
        } else {
            let config = Self::default();
            if let Err(e) = config.save(path) {
                warn!("could not write default config to {:?}: {}", path, e);
            }
            config
        }
    }

    /// Get the per-user configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("ironloop"))
            .unwrap_or_else(|| PathBuf::from("./config"))
    }

    /// Default configuration path.
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    fn channel(&self, name: &str) -> Option<&ChannelDef> {
        self.channels.iter().find(|c| c.name == name)
    }

    fn check_channel(
        &self,
        referrer: &str,
        name: &str,
        expected: &'static str,
        pred: impl Fn(ChannelKind) -> bool,
    ) -> Result<(), ConfigError> {
        match self.channel(name) {
            None => Err(ConfigError::UnknownChannel {
                referrer: referrer.to_string(),
                name: name.to_string(),
            }),
            Some(def) if !pred(def.kind) => Err(ConfigError::WrongKind {
                referrer: referrer.to_string(),
                name: name.to_string(),
                expected,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Validate cross-references and timing before the engine starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Unique channel names
        for (i, def) in self.channels.iter().enumerate() {
            if self.channels[..i].iter().any(|d| d.name == def.name) {
                return Err(ConfigError::DuplicateChannel(def.name.clone()));
            }
        }

        // The base resolution must be at least as fine as everything it drives
        let sched = &self.schedule;
        let mut min_ms = [
            sched.sample_ms,
            sched.detect_ms,
            sched.control_ms,
            sched.alert_ms,
            sched.publish_ms,
            sched.persist_ms,
        ]
        .into_iter()
        .min()
        .unwrap_or(u64::MAX);
        for lp in &self.loops {
            if let Some(ms) = lp.interval_ms {
                min_ms = min_ms.min(ms);
            }
        }
        if self.engine.base_resolution_ms == 0 || self.engine.base_resolution_ms > min_ms {
            return Err(ConfigError::BaseResolution {
                base_ms: self.engine.base_resolution_ms,
                min_ms,
            });
        }

        for lp in &self.loops {
            let referrer = format!("loop '{}'", lp.name);
            self.check_channel(&referrer, &lp.input, "an input", ChannelKind::is_input)?;

            match &lp.drive {
                OutputDrive::Analog { channel } => {
                    self.check_channel(&referrer, channel, "a pwm output", |k| {
                        k == ChannelKind::PwmOut
                    })?;
                }
                OutputDrive::RelayPair {
                    raise,
                    lower,
                    threshold,
                } => {
                    for ch in [raise, lower] {
                        self.check_channel(&referrer, ch, "a digital output", |k| {
                            k == ChannelKind::DigitalOut
                        })?;
                    }
                    if *threshold < 0.0 {
                        return Err(ConfigError::InvalidLoop {
                            name: lp.name.clone(),
                            reason: format!("negative relay threshold {}", threshold),
                        });
                    }
                }
            }

            if lp.min_output >= lp.max_output {
                return Err(ConfigError::InvalidLoop {
                    name: lp.name.clone(),
                    reason: format!(
                        "output limits [{}, {}] are empty",
                        lp.min_output, lp.max_output
                    ),
                });
            }

            match lp.mode {
                LoopMode::Pid { kp, ki, kd } => {
                    if !(kp.is_finite() && ki.is_finite() && kd.is_finite())
                        || kp < 0.0
                        || ki < 0.0
                        || kd < 0.0
                    {
                        return Err(ConfigError::InvalidLoop {
                            name: lp.name.clone(),
                            reason: format!("bad gains kp={} ki={} kd={}", kp, ki, kd),
                        });
                    }
                }
                LoopMode::Hysteresis { low, high } => {
                    if low >= high {
                        return Err(ConfigError::InvalidLoop {
                            name: lp.name.clone(),
                            reason: format!("hysteresis band [{}, {}] is empty", low, high),
                        });
                    }
                    if !matches!(lp.drive, OutputDrive::RelayPair { .. }) {
                        return Err(ConfigError::InvalidLoop {
                            name: lp.name.clone(),
                            reason: "hysteresis mode needs a relay-pair drive".to_string(),
                        });
                    }
                }
            }
        }

        for rule in &self.alerts.rules {
            let referrer = format!("alert rule '{}'", rule.name);
            self.check_channel(&referrer, &rule.channel, "an input", ChannelKind::is_input)?;
            match (rule.min, rule.max) {
                (None, None) => {
                    return Err(ConfigError::InvalidRule {
                        name: rule.name.clone(),
                        reason: "neither min nor max is set".to_string(),
                    });
                }
                (Some(lo), Some(hi)) if lo >= hi => {
                    return Err(ConfigError::InvalidRule {
                        name: rule.name.clone(),
                        reason: format!("bounds [{}, {}] are empty", lo, hi),
                    });
                }
                _ => {}
            }
        }

        if let Some(estop) = &self.alerts.estop_channel {
            self.check_channel("estop", estop, "a digital input", |k| {
                k == ChannelKind::DigitalIn
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        back.validate().unwrap();
        assert_eq!(back.channels.len(), config.channels.len());
        assert_eq!(back.loops.len(), config.loops.len());
    }

    #[test]
    fn coarse_base_resolution_is_rejected() {
        let mut config = Config::default();
        config.engine.base_resolution_ms = 2000;
        config.schedule.sample_ms = 500;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BaseResolution { .. })
        ));
    }

    #[test]
    fn dangling_loop_input_is_rejected() {
        let mut config = Config::default();
        config.loops[0].input = "nope".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownChannel { .. })
        ));
    }

    #[test]
    fn loop_driving_an_input_is_rejected() {
        let mut config = Config::default();
        config.loops[0].drive = OutputDrive::RelayPair {
            raise: "input_1".into(),
            lower: "cooler".into(),
            threshold: 10.0,
        };
        assert!(matches!(config.validate(), Err(ConfigError::WrongKind { .. })));
    }

    #[test]
    fn hysteresis_requires_relay_pair() {
        let mut config = Config::default();
        config.channels.push(ChannelDef {
            name: "valve".into(),
            kind: ChannelKind::PwmOut,
            line: 12,
            bank: None,
            factor: 1.0,
            offset: 0.0,
            invert: false,
            unit: String::new(),
            safe_value: 0.0,
        });
        config.loops[0].mode = LoopMode::Hysteresis {
            low: 10.0,
            high: 20.0,
        };
        config.loops[0].drive = OutputDrive::Analog {
            channel: "valve".into(),
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidLoop { .. })));
    }

    #[test]
    fn rule_without_bounds_is_rejected() {
        let mut config = Config::default();
        config.alerts.rules[0].min = None;
        config.alerts.rules[0].max = None;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidRule { .. })));
    }

    #[test]
    fn pull_up_input_gets_inverted_scaling() {
        let config = Config::default();
        let input = config.channel("input_1").unwrap();
        assert_eq!(input.scaling(), Scaling::Inverted);
        let temp = config.channel("temp").unwrap();
        assert!(matches!(temp.scaling(), Scaling::Linear { .. }));
    }
}
