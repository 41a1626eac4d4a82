// Copyright (c) 2026 ironloop contributors
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/ironloop/ironloop

//! Alert evaluation - level-crossing bound checks over channel values
//!
//! Transitions fire only on crossing, never on steady state. There is no
//! hysteresis margin between raise and clear: a value oscillating exactly
//! at a bound can chatter. That matches the configured-bounds contract;
//! widen the bounds if chatter shows up in practice.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::channels::ChannelRegistry;
use crate::config::AlertRuleDef;

/// Direction of an alert transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    /// A bound was crossed
    Raised,
    /// The value returned strictly within bounds
    Cleared,
}

/// A single alert transition, surfaced to the dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    /// Rule that transitioned
    pub rule: String,
    /// Channel the rule watches
    pub channel: String,
    /// Raised or cleared
    pub kind: AlertKind,
    /// Channel value at the transition
    pub value: f64,
    /// The bound involved
    pub threshold: f64,
    /// When the transition happened
    pub timestamp: DateTime<Utc>,
}

struct RuleState {
    rule: AlertRuleDef,
    active: bool,
    threshold: f64,
    since: DateTime<Utc>,
}

/// Evaluates every configured rule against the registry at each due
/// interval and reports transitions.
pub struct AlertEvaluator {
    states: Vec<RuleState>,
}

impl AlertEvaluator {
    /// Build the evaluator from validated rule definitions.
    pub fn new(rules: Vec<AlertRuleDef>) -> Self {
        let now = Utc::now();
        Self {
            states: rules
                .into_iter()
                .map(|rule| RuleState {
                    rule,
                    active: false,
                    threshold: 0.0,
                    since: now,
                })
                .collect(),
        }
    }

    /// Check all rules; stale channels are skipped entirely.
    pub fn evaluate(&mut self, registry: &ChannelRegistry) -> Vec<AlertEvent> {
        let now = Utc::now();
        let mut events = Vec::new();

        for state in &mut self.states {
            let Some(ch) = registry.get(&state.rule.channel) else {
                continue;
            };
            if ch.stale {
                continue;
            }
            let value = ch.value;

            let below = state.rule.min.map(|m| value < m).unwrap_or(false);
            let above = state.rule.max.map(|m| value > m).unwrap_or(false);

            if (below || above) && !state.active {
                state.active = true;
                state.threshold = if below {
                    state.rule.min.unwrap_or(0.0)
                } else {
                    state.rule.max.unwrap_or(0.0)
                };
                state.since = now;
                warn!(
                    "alert '{}' raised: {} = {} (bound {})",
                    state.rule.name, state.rule.channel, value, state.threshold
                );
                events.push(AlertEvent {
                    rule: state.rule.name.clone(),
                    channel: state.rule.channel.clone(),
                    kind: AlertKind::Raised,
                    value,
                    threshold: state.threshold,
                    timestamp: now,
                });
            } else if state.active && Self::strictly_within(&state.rule, value) {
                state.active = false;
                state.since = now;
                info!(
                    "alert '{}' cleared: {} = {}",
                    state.rule.name, state.rule.channel, value
                );
                events.push(AlertEvent {
                    rule: state.rule.name.clone(),
                    channel: state.rule.channel.clone(),
                    kind: AlertKind::Cleared,
                    value,
                    threshold: state.threshold,
                    timestamp: now,
                });
            }
        }
        events
    }

    fn strictly_within(rule: &AlertRuleDef, value: f64) -> bool {
        rule.min.map(|m| value > m).unwrap_or(true) && rule.max.map(|m| value < m).unwrap_or(true)
    }

    /// True while any rule is in the raised state.
    pub fn any_active(&self) -> bool {
        self.states.iter().any(|s| s.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelKind;
    use crate::config::ChannelDef;

    fn setup(min: Option<f64>, max: Option<f64>) -> (AlertEvaluator, ChannelRegistry) {
        let eval = AlertEvaluator::new(vec![AlertRuleDef {
            name: "temp_band".into(),
            channel: "temp".into(),
            min,
            max,
        }]);
        let reg = ChannelRegistry::from_defs(&[ChannelDef::test_input(
            "temp",
            ChannelKind::AnalogIn,
            1,
        )]);
        (eval, reg)
    }

    fn set(reg: &mut ChannelRegistry, v: f64) {
        reg.get_mut("temp").unwrap().record_sample(v, Utc::now());
    }

    #[test]
    fn raises_once_and_clears_once() {
        let (mut eval, mut reg) = setup(Some(15.0), Some(35.0));

        set(&mut reg, 20.0);
        assert!(eval.evaluate(&reg).is_empty());

        set(&mut reg, 40.0);
        let events = eval.evaluate(&reg);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AlertKind::Raised);
        assert_eq!(events[0].threshold, 35.0);

        // Still out of bounds: no repeated event
        set(&mut reg, 41.0);
        assert!(eval.evaluate(&reg).is_empty());
        assert!(eval.any_active());

        set(&mut reg, 30.0);
        let events = eval.evaluate(&reg);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AlertKind::Cleared);
        assert!(!eval.any_active());
    }

    #[test]
    fn boundary_value_does_not_clear() {
        let (mut eval, mut reg) = setup(None, Some(35.0));

        set(&mut reg, 40.0);
        assert_eq!(eval.evaluate(&reg).len(), 1);

        // Exactly at the bound is not strictly within it
        set(&mut reg, 35.0);
        assert!(eval.evaluate(&reg).is_empty());
        assert!(eval.any_active());

        set(&mut reg, 34.9);
        assert_eq!(eval.evaluate(&reg).len(), 1);
    }

    #[test]
    fn stale_channel_is_skipped() {
        let (mut eval, mut reg) = setup(Some(15.0), None);

        set(&mut reg, 10.0);
        assert_eq!(eval.evaluate(&reg).len(), 1);

        reg.get_mut("temp").unwrap().record_failure();
        // Value is below min but stale channels take no part in alerting
        assert!(eval.evaluate(&reg).is_empty());
        assert!(eval.any_active());
    }
}
