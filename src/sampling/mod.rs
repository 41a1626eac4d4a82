// Copyright (c) 2026 ironloop contributors
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/ironloop/ironloop

//! Sampling - reads due inputs through the adapter and detects transitions

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::channels::{ChangeEvent, ChannelRegistry};
use crate::io::{IoAdapter, IoError};

/// Reads every input channel through the adapter and folds the results into
/// the registry.
///
/// Each read is independently deadline-bounded; a failure marks only that
/// channel stale and the remaining channels still sample in the same pass.
pub struct Sampler {
    adapter: Arc<dyn IoAdapter>,
    io_timeout: Duration,
    fault_threshold: u32,
}

impl Sampler {
    /// Build a sampler over an adapter.
    pub fn new(adapter: Arc<dyn IoAdapter>, io_timeout: Duration, fault_threshold: u32) -> Self {
        Self {
            adapter,
            io_timeout,
            fault_threshold,
        }
    }

    /// Sample all input channels once.
    ///
    /// The registry lock is never held across an adapter call: targets are
    /// collected first, reads run unlocked, results are applied in one
    /// write pass.
    pub async fn sample(&self, registry: &RwLock<ChannelRegistry>) {
        let targets = registry.read().input_targets();

        let mut results = Vec::with_capacity(targets.len());
        for (name, address) in targets {
            let result = match tokio::time::timeout(self.io_timeout, self.adapter.read(&address))
                .await
            {
                Ok(Ok(raw)) => Ok(raw),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(IoError::Timeout),
            };
            results.push((name, result));
        }

        let now = Utc::now();
        let mut reg = registry.write();
        for (name, result) in results {
            let Some(ch) = reg.get_mut(&name) else {
                continue;
            };
            match result {
                Ok(raw) => {
                    ch.record_sample(raw, now);
                    debug!("sampled {} = {} {}", ch.name, ch.value, ch.unit);
                }
                Err(e) => {
                    let failures = ch.record_failure();
                    error!("sample failed on '{}': {}", name, e);
                    if failures == self.fault_threshold {
                        warn!(
                            "channel '{}' faulted after {} consecutive failures; \
                             excluded from control and alerts until it recovers",
                            name, failures
                        );
                    }
                }
            }
        }
    }
}

/// Emits one [`ChangeEvent`] per digital input whose value differs from the
/// previous detection pass. No software debounce: equal values never emit,
/// and suppressing contact noise is the adapter's job.
pub struct ChangeDetector;

impl ChangeDetector {
    /// Compare and update the detection reference for every digital input.
    pub fn detect(&self, registry: &mut ChannelRegistry) -> Vec<ChangeEvent> {
        let now = Utc::now();
        let mut events = Vec::new();
        registry.for_each_digital_input(|ch| {
            if ch.stale {
                return;
            }
            if ch.value != ch.prev_sampled {
                events.push(ChangeEvent {
                    channel: ch.name.clone(),
                    old_value: ch.prev_sampled,
                    new_value: ch.value,
                    timestamp: now,
                    description: format!(
                        "{}: {} -> {}",
                        ch.name,
                        ch.prev_sampled != 0.0,
                        ch.value != 0.0
                    ),
                });
            }
            ch.prev_sampled = ch.value;
        });
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelAddress, ChannelKind};
    use crate::config::ChannelDef;
    use crate::io::SimulatedIo;

    fn addr(line: u32) -> ChannelAddress {
        ChannelAddress { line, bank: None }
    }

    fn registry() -> RwLock<ChannelRegistry> {
        RwLock::new(ChannelRegistry::from_defs(&[
            ChannelDef::test_input("a", ChannelKind::AnalogIn, 1),
            ChannelDef::test_input("b", ChannelKind::AnalogIn, 2),
            ChannelDef::test_input("c", ChannelKind::AnalogIn, 3),
        ]))
    }

    #[tokio::test]
    async fn one_failing_channel_does_not_stop_the_others() {
        let sim = Arc::new(SimulatedIo::with_seed(1));
        sim.set_value(&addr(1), 1.0);
        sim.set_value(&addr(2), 2.0);
        sim.set_value(&addr(3), 3.0);

        let reg = registry();
        let sampler = Sampler::new(sim.clone(), Duration::from_millis(100), 5);

        sampler.sample(&reg).await;
        assert_eq!(reg.read().get("a").unwrap().value, 1.0);

        // A starts failing; B and C keep updating, A keeps its last value
        sim.set_failing(&addr(1), true);
        sim.set_value(&addr(2), 2.5);
        sim.set_value(&addr(3), 3.5);
        sampler.sample(&reg).await;

        let guard = reg.read();
        let a = guard.get("a").unwrap();
        assert!(a.stale);
        assert_eq!(a.value, 1.0);
        assert_eq!(guard.get("b").unwrap().value, 2.5);
        assert_eq!(guard.get("c").unwrap().value, 3.5);
    }

    #[tokio::test]
    async fn fault_counter_resets_on_recovery() {
        let sim = Arc::new(SimulatedIo::with_seed(1));
        sim.set_value(&addr(1), 1.0);
        let reg = RwLock::new(ChannelRegistry::from_defs(&[ChannelDef::test_input(
            "a",
            ChannelKind::AnalogIn,
            1,
        )]));
        let sampler = Sampler::new(sim.clone(), Duration::from_millis(100), 3);

        sim.set_failing(&addr(1), true);
        for _ in 0..4 {
            sampler.sample(&reg).await;
        }
        assert_eq!(reg.read().get("a").unwrap().fail_count, 4);

        sim.set_failing(&addr(1), false);
        sampler.sample(&reg).await;
        let guard = reg.read();
        assert_eq!(guard.get("a").unwrap().fail_count, 0);
        assert!(!guard.get("a").unwrap().stale);
    }

    #[test]
    fn change_event_iff_value_differs() {
        let mut reg = ChannelRegistry::from_defs(&[ChannelDef::test_input(
            "door",
            ChannelKind::DigitalIn,
            1,
        )]);
        let detector = ChangeDetector;
        let now = Utc::now();

        // Initial value equals the detection reference: nothing to report
        assert!(detector.detect(&mut reg).is_empty());

        reg.get_mut("door").unwrap().record_sample(1.0, now);
        let events = detector.detect(&mut reg);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_value, 0.0);
        assert_eq!(events[0].new_value, 1.0);

        // Identical consecutive samples: zero events
        reg.get_mut("door").unwrap().record_sample(1.0, now);
        assert!(detector.detect(&mut reg).is_empty());
        reg.get_mut("door").unwrap().record_sample(1.0, now);
        assert!(detector.detect(&mut reg).is_empty());

        reg.get_mut("door").unwrap().record_sample(0.0, now);
        assert_eq!(detector.detect(&mut reg).len(), 1);
    }

    #[test]
    fn stale_digital_input_emits_nothing() {
        let mut reg = ChannelRegistry::from_defs(&[ChannelDef::test_input(
            "door",
            ChannelKind::DigitalIn,
            1,
        )]);
        let detector = ChangeDetector;

        reg.get_mut("door").unwrap().record_sample(1.0, Utc::now());
        reg.get_mut("door").unwrap().record_failure();
        assert!(detector.detect(&mut reg).is_empty());
    }
}
