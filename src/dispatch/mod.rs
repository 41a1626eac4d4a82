// Copyright (c) 2026 ironloop contributors
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/ironloop/ironloop

//! Dispatch - fans state out to actuators, the message bus and the store
//!
//! Each sink has its own failure boundary: a dead broker drops the
//! snapshot, a failed actuator write logs and moves on, a persistence
//! error never touches sampling or control.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::alerts::AlertEvent;
use crate::channels::{ChangeEvent, ChannelRegistry};
use crate::db::{ChannelRow, Database};
use crate::io::{IoAdapter, IoError};
use crate::streaming::MqttLink;

/// Aggregate snapshot published once per publish interval.
#[derive(Debug, Serialize)]
struct Snapshot {
    timestamp: String,
    channels: BTreeMap<String, f64>,
}

/// Fans current state out to the three sinks.
pub struct Dispatcher {
    adapter: Arc<dyn IoAdapter>,
    mqtt: Option<Arc<MqttLink>>,
    db: Option<Database>,
    io_timeout: Duration,
}

impl Dispatcher {
    /// Build a dispatcher; bus and store sinks are optional.
    pub fn new(
        adapter: Arc<dyn IoAdapter>,
        mqtt: Option<Arc<MqttLink>>,
        db: Option<Database>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            adapter,
            mqtt,
            db,
            io_timeout,
        }
    }

    async fn write_one(&self, address: &crate::channels::ChannelAddress, value: f64) -> Result<(), IoError> {
        match tokio::time::timeout(self.io_timeout, self.adapter.write(address, value)).await {
            Ok(result) => result,
            Err(_) => Err(IoError::Timeout),
        }
    }

    /// Write every pending output to hardware.
    ///
    /// A failed write is logged and does not block the remaining writes;
    /// the commanded value stays in the registry and the next controller
    /// or override command re-marks the channel pending.
    pub async fn write_outputs(&self, registry: &RwLock<ChannelRegistry>) {
        let pending = registry.write().take_pending();
        for (name, address, value) in pending {
            match self.write_one(&address, value).await {
                Ok(()) => debug!("wrote {} = {}", name, value),
                Err(e) => error!("actuator write failed on '{}': {}", name, e),
            }
        }
    }

    /// Publish the registry snapshot plus pending events to the bus.
    ///
    /// At-most-once: failures are logged and the payloads dropped.
    pub async fn publish(
        &self,
        registry: &RwLock<ChannelRegistry>,
        changes: &[ChangeEvent],
        alerts: &[AlertEvent],
    ) {
        let Some(mqtt) = &self.mqtt else { return };

        let (values, snapshot) = {
            let reg = registry.read();
            let values: Vec<(String, f64)> =
                reg.iter().map(|c| (c.name.clone(), c.value)).collect();
            let snapshot = Snapshot {
                timestamp: Utc::now().to_rfc3339(),
                channels: values.iter().cloned().collect(),
            };
            (values, snapshot)
        };

        for (name, value) in &values {
            if let Err(e) = mqtt.publish_value(name, *value).await {
                warn!("publish dropped for '{}': {}", name, e);
            }
        }

        if let Err(e) = mqtt.publish("snapshot", &snapshot).await {
            warn!("snapshot publish dropped: {}", e);
        }

        for event in changes {
            let topic = format!("changes/{}", event.channel);
            if let Err(e) = mqtt.publish(&topic, event).await {
                warn!("change publish dropped for '{}': {}", event.channel, e);
            }
        }

        for event in alerts {
            let topic = format!("alerts/{}", event.rule);
            if let Err(e) = mqtt.publish(&topic, event).await {
                warn!("alert publish dropped for '{}': {}", event.rule, e);
            }
        }
    }

    /// Append the registry snapshot and change events to the store.
    pub fn persist(&self, registry: &RwLock<ChannelRegistry>, changes: &[ChangeEvent]) {
        let Some(db) = &self.db else { return };

        let rows: Vec<ChannelRow> = {
            let reg = registry.read();
            let now = Utc::now().to_rfc3339();
            reg.iter()
                .map(|c| ChannelRow {
                    timestamp: now.clone(),
                    channel_name: c.name.clone(),
                    channel_kind: c.kind.as_str().to_string(),
                    value: c.value,
                    unit: c.unit.clone(),
                })
                .collect()
        };

        if let Err(e) = db.store_snapshot(&rows) {
            error!("persist failed for snapshot: {}", e);
        }
        if !changes.is_empty() {
            if let Err(e) = db.store_changes(changes) {
                error!("persist failed for change events: {}", e);
            }
        }
    }

    /// Drive every output to its configured safe value.
    ///
    /// Runs unconditionally on shutdown and while the emergency stop is
    /// active. Every write is attempted even when earlier ones fail; the
    /// registry is marked safe afterwards so status reflects the intent.
    pub async fn safe_state(&self, registry: &RwLock<ChannelRegistry>) {
        let targets = registry.read().safe_targets();
        let mut failures = 0usize;
        for (name, address, safe_value) in targets {
            match self.write_one(&address, safe_value).await {
                Ok(()) => debug!("safe state: {} = {}", name, safe_value),
                Err(e) => {
                    failures += 1;
                    error!("safe-state write failed on '{}': {}", name, e);
                }
            }
        }
        registry.write().mark_safe();
        if failures > 0 {
            warn!("safe state applied with {} failed writes", failures);
        }
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
        let mut heater = ChannelDef::test_output("heater", ChannelKind::DigitalOut, 18);
        heater.safe_value = 0.0;
        let mut vent = ChannelDef::test_output("vent", ChannelKind::PwmOut, 12);
        vent.safe_value = 25.0;
        RwLock::new(ChannelRegistry::from_defs(&[heater, vent]))
    }

    #[tokio::test]
    async fn pending_outputs_reach_the_adapter() {
        let sim = Arc::new(SimulatedIo::with_seed(3));
        let reg = registry();
        let dispatcher =
            Dispatcher::new(sim.clone(), None, None, Duration::from_millis(100));

        reg.write().apply_output("heater", 1.0);
        dispatcher.write_outputs(&reg).await;

        assert_eq!(sim.written(&addr(18)), Some(1.0));
        assert!(!reg.read().has_pending());
    }

    #[tokio::test]
    async fn failed_write_does_not_block_the_rest() {
        let sim = Arc::new(SimulatedIo::with_seed(3));
        sim.set_failing(&addr(18), true);
        let reg = registry();
        let dispatcher =
            Dispatcher::new(sim.clone(), None, None, Duration::from_millis(100));

        reg.write().apply_output("heater", 1.0);
        reg.write().apply_output("vent", 80.0);
        dispatcher.write_outputs(&reg).await;

        assert_eq!(sim.written(&addr(18)), None);
        assert_eq!(sim.written(&addr(12)), Some(80.0));
    }

    #[tokio::test]
    async fn safe_state_forces_all_outputs() {
        let sim = Arc::new(SimulatedIo::with_seed(3));
        let reg = registry();
        let dispatcher =
            Dispatcher::new(sim.clone(), None, None, Duration::from_millis(100));

        reg.write().apply_output("heater", 1.0);
        reg.write().apply_output("vent", 90.0);
        dispatcher.write_outputs(&reg).await;

        dispatcher.safe_state(&reg).await;
        assert_eq!(sim.written(&addr(18)), Some(0.0));
        assert_eq!(sim.written(&addr(12)), Some(25.0));

        let guard = reg.read();
        assert_eq!(guard.get("heater").unwrap().value, 0.0);
        assert_eq!(guard.get("vent").unwrap().value, 25.0);
    }

    #[tokio::test]
    async fn safe_state_attempts_every_write_despite_failures() {
        let sim = Arc::new(SimulatedIo::with_seed(3));
        sim.set_failing(&addr(18), true);
        let reg = registry();
        let dispatcher =
            Dispatcher::new(sim.clone(), None, None, Duration::from_millis(100));

        dispatcher.safe_state(&reg).await;
        // The failing channel is skipped but the second write still lands
        assert_eq!(sim.written(&addr(12)), Some(25.0));
    }

    #[tokio::test]
    async fn persist_writes_snapshot_rows() {
        let sim = Arc::new(SimulatedIo::with_seed(3));
        let reg = registry();
        let db = Database::open_in_memory().unwrap();
        let dispatcher = Dispatcher::new(
            sim,
            None,
            Some(db.clone()),
            Duration::from_millis(100),
        );

        dispatcher.persist(&reg, &[]);
        assert_eq!(db.counts().unwrap(), (2, 0));
    }
}
