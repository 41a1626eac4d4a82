// Copyright (c) 2026 ironloop contributors
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/ironloop/ironloop

//! Simulated I/O adapter for bench runs and tests

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::prelude::*;
use rand_distr::Normal;

use super::{IoAdapter, IoError};
use crate::channels::ChannelAddress;

/// In-memory adapter standing in for real hardware.
///
/// Unscripted reads return a slowly drifting noisy value so a bench setup
/// produces plausible telemetry; tests script exact values per address and
/// inject faults to exercise the engine's recovery paths.
pub struct SimulatedIo {
    state: Mutex<SimState>,
}

struct SimState {
    rng: StdRng,
    scripted: HashMap<String, f64>,
    failing: HashSet<String>,
    written: HashMap<String, f64>,
    drift: f64,
}

impl SimulatedIo {
    /// Adapter seeded from entropy.
    pub fn new() -> Self {
        Self::with_seed(rand::rngs::OsRng.gen())
    }

    /// Adapter with a fixed seed for reproducible runs.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Mutex::new(SimState {
                rng: StdRng::seed_from_u64(seed),
                scripted: HashMap::new(),
                failing: HashSet::new(),
                written: HashMap::new(),
                drift: 0.0,
            }),
        }
    }

    /// Pin an address to an exact value until changed.
    pub fn set_value(&self, address: &ChannelAddress, value: f64) {
        self.state.lock().scripted.insert(address.to_string(), value);
    }

    /// Make an address fail every read and write, or recover it.
    pub fn set_failing(&self, address: &ChannelAddress, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing.insert(address.to_string());
        } else {
            state.failing.remove(&address.to_string());
        }
    }

    /// Last value written to an address, if any.
    pub fn written(&self, address: &ChannelAddress) -> Option<f64> {
        self.state.lock().written.get(&address.to_string()).copied()
    }
}

impl Default for SimulatedIo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IoAdapter for SimulatedIo {
    async fn read(&self, address: &ChannelAddress) -> Result<f64, IoError> {
        let mut state = self.state.lock();
        let key = address.to_string();

        if state.failing.contains(&key) {
            return Err(IoError::Read {
                address: key,
                reason: "simulated fault".to_string(),
            });
        }

        if let Some(v) = state.scripted.get(&key) {
            return Ok(*v);
        }

        // Ambient signal: a drifting baseline with read noise
        state.drift += state.rng.gen_range(-0.002..0.002);
        let drift = state.drift;
        let noise = state.rng.sample::<f64, _>(Normal::new(0.0, 0.05).unwrap());
        Ok((0.5 + drift + noise).clamp(0.0, 1.0))
    }

    async fn write(&self, address: &ChannelAddress, value: f64) -> Result<(), IoError> {
        let mut state = self.state.lock();
        let key = address.to_string();

        if state.failing.contains(&key) {
            return Err(IoError::Write {
                address: key,
                reason: "simulated fault".to_string(),
            });
        }

        state.written.insert(key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(line: u32) -> ChannelAddress {
        ChannelAddress { line, bank: None }
    }

    #[tokio::test]
    async fn scripted_value_round_trip() {
        let sim = SimulatedIo::with_seed(7);
        sim.set_value(&addr(3), 42.5);
        assert_eq!(sim.read(&addr(3)).await.unwrap(), 42.5);
    }

    #[tokio::test]
    async fn fault_injection_and_recovery() {
        let sim = SimulatedIo::with_seed(7);
        sim.set_value(&addr(1), 1.0);
        sim.set_failing(&addr(1), true);
        assert!(sim.read(&addr(1)).await.is_err());
        assert!(sim.write(&addr(1), 0.0).await.is_err());

        // No re-initialization needed after a fault clears
        sim.set_failing(&addr(1), false);
        assert_eq!(sim.read(&addr(1)).await.unwrap(), 1.0);
        sim.write(&addr(1), 0.0).await.unwrap();
        assert_eq!(sim.written(&addr(1)), Some(0.0));
    }
}
