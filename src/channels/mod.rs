// Copyright (c) 2026 ironloop contributors
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/ironloop/ironloop

//! Channel types - the typed I/O point table shared by every component

mod registry;

pub use registry::ChannelRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ChannelDef;

/// Kind of a named I/O point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    /// Discrete input (switch, relay feedback, limit switch)
    DigitalIn,
    /// Discrete output (relay, contactor, indicator)
    DigitalOut,
    /// Analog input (temperature, pressure, 4-20mA loop)
    AnalogIn,
    /// Pulse-width output (motor speed, valve position)
    PwmOut,
}

impl ChannelKind {
    /// True for channels the sampler reads.
    pub fn is_input(self) -> bool {
        matches!(self, ChannelKind::DigitalIn | ChannelKind::AnalogIn)
    }

    /// True for channels the dispatcher writes.
    pub fn is_output(self) -> bool {
        !self.is_input()
    }

    /// Stable name used in telemetry and persistence rows.
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::DigitalIn => "digital_in",
            ChannelKind::DigitalOut => "digital_out",
            ChannelKind::AnalogIn => "analog_in",
            ChannelKind::PwmOut => "pwm_out",
        }
    }
}

/// Opaque hardware descriptor handed to the I/O adapter.
///
/// The engine never interprets it; the adapter maps it onto whatever the
/// platform offers (GPIO line, ADC channel, fieldbus register).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelAddress {
    /// Line / pin / register number
    pub line: u32,
    /// Optional bank or bus qualifier ("P8", "ain", "unit2")
    #[serde(default)]
    pub bank: Option<String>,
}

impl std::fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.bank {
            Some(bank) => write!(f, "{}:{}", bank, self.line),
            None => write!(f, "{}", self.line),
        }
    }
}

/// Raw-to-engineering conversion applied by the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scaling {
    /// Pass the raw value through unchanged
    Identity,
    /// `scaled = raw * factor + offset`
    Linear {
        /// Multiplier applied to the raw value
        factor: f64,
        /// Constant added after the multiply
        offset: f64,
    },
    /// Boolean inversion for pull-up wired digital inputs
    Inverted,
}

impl Scaling {
    /// Apply the conversion to a raw adapter value.
    pub fn apply(self, raw: f64) -> f64 {
        match self {
            Scaling::Identity => raw,
            Scaling::Linear { factor, offset } => raw * factor + offset,
            Scaling::Inverted => {
                if raw >= 0.5 {
                    0.0
                } else {
                    1.0
                }
            }
        }
    }
}

/// A single named I/O point with its current and previous state.
///
/// Channels are owned by the [`ChannelRegistry`]; inputs are mutated only by
/// the sampler, outputs only by the dispatcher and the command ingestor.
#[derive(Debug, Clone, Serialize)]
pub struct Channel {
    /// Unique name, the key used everywhere else
    pub name: String,
    /// What the point is
    pub kind: ChannelKind,
    /// Hardware descriptor for the adapter
    pub address: ChannelAddress,
    /// Raw-to-engineering conversion
    pub scaling: Scaling,
    /// Engineering unit label ("°C", "bar", "")
    pub unit: String,
    /// Last raw value read from the adapter
    pub raw: f64,
    /// Current engineering value (inputs) or commanded value (outputs)
    pub value: f64,
    /// When the value was last written by a successful sample or command
    pub updated_at: DateTime<Utc>,
    /// When the value last differed from the previous one
    pub changed_at: DateTime<Utc>,
    /// True when the most recent sample attempt failed
    pub stale: bool,
    /// Consecutive sample failures; reset on the next good read
    pub fail_count: u32,
    /// Value captured at the previous change-detection pass
    pub prev_sampled: f64,
    /// Output level enforced on shutdown or emergency stop
    pub safe_value: f64,
    /// Output has a commanded value not yet written to hardware
    #[serde(skip)]
    pub pending: bool,
}

impl Channel {
    /// Build a channel from its configuration entry.
    pub fn from_def(def: &ChannelDef) -> Self {
        let now = Utc::now();
        Self {
            name: def.name.clone(),
            kind: def.kind,
            address: ChannelAddress {
                line: def.line,
                bank: def.bank.clone(),
            },
            scaling: def.scaling(),
            unit: def.unit.clone(),
            raw: 0.0,
            value: def.safe_value,
            updated_at: now,
            changed_at: now,
            stale: false,
            fail_count: 0,
            prev_sampled: def.safe_value,
            safe_value: def.safe_value,
            pending: false,
        }
    }

    /// Record a successful sample: scale, update timestamps, clear stale.
    pub fn record_sample(&mut self, raw: f64, now: DateTime<Utc>) {
        let scaled = self.scaling.apply(raw);
        if scaled != self.value {
            self.changed_at = now;
        }
        self.raw = raw;
        self.value = scaled;
        self.updated_at = now;
        self.stale = false;
        self.fail_count = 0;
    }

    /// Record a failed sample: value and timestamps stay untouched.
    ///
    /// Returns the new consecutive failure count.
    pub fn record_failure(&mut self) -> u32 {
        self.stale = true;
        self.fail_count = self.fail_count.saturating_add(1);
        self.fail_count
    }

    /// Set a commanded output value and mark it for the next dispatch.
    pub fn command(&mut self, value: f64, now: DateTime<Utc>) {
        if value != self.value {
            self.changed_at = now;
        }
        self.value = value;
        self.updated_at = now;
        self.pending = true;
    }
}

/// A discrete input transition observed by the change detector.
///
/// Ephemeral: consumed by the dispatcher, never retained in the registry.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    /// Channel that moved
    pub channel: String,
    /// Value at the previous detection pass
    pub old_value: f64,
    /// Value now
    pub new_value: f64,
    /// When the transition was observed
    pub timestamp: DateTime<Utc>,
    /// Human-readable summary for logs and telemetry
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaling_linear() {
        let s = Scaling::Linear {
            factor: 0.1,
            offset: -5.0,
        };
        assert!((s.apply(250.0) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn scaling_inverted_pull_up() {
        assert_eq!(Scaling::Inverted.apply(1.0), 0.0);
        assert_eq!(Scaling::Inverted.apply(0.0), 1.0);
    }

    #[test]
    fn failed_sample_keeps_value_and_sets_stale() {
        let def = ChannelDef::test_input("temp", ChannelKind::AnalogIn, 4);
        let mut ch = Channel::from_def(&def);
        let t0 = Utc::now();
        ch.record_sample(21.5, t0);

        let n = ch.record_failure();
        assert_eq!(n, 1);
        assert!(ch.stale);
        assert_eq!(ch.value, 21.5);
        assert_eq!(ch.updated_at, t0);

        // A good read recovers the channel
        ch.record_sample(22.0, Utc::now());
        assert!(!ch.stale);
        assert_eq!(ch.fail_count, 0);
    }
}
