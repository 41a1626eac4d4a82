//! Engine - the authoritative tick loop tying every component together

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::scheduler::{Activity, Scheduler};
use super::EngineState;
use crate::alerts::{AlertEvaluator, AlertEvent};
use crate::channels::{ChangeEvent, ChannelRegistry};
use crate::config::Config;
use crate::control::{Controller, InputSnapshot};
use crate::db::Database;
use crate::dispatch::Dispatcher;
use crate::ingest::{Command, CommandIngestor};
use crate::io::IoAdapter;
use crate::sampling::{ChangeDetector, Sampler};
use crate::streaming::MqttLink;

/// Owns all engine state and runs the tick cycle.
///
/// Exactly one logical thread executes sample, change detection, control,
/// alerting and dispatch, in that order, once per base-resolution tick.
/// The command ingestor and the MQTT event loop are the only other tasks,
/// and they touch shared state solely through the registry and controller
/// locks.
pub struct Engine {
    config: Config,
    registry: Arc<RwLock<ChannelRegistry>>,
    controller: Arc<Mutex<Controller>>,
    scheduler: Scheduler,
    sampler: Sampler,
    detector: ChangeDetector,
    alerts: AlertEvaluator,
    dispatcher: Dispatcher,
    mqtt: Option<Arc<MqttLink>>,
    command_tx: mpsc::Sender<Command>,
    command_rx: Option<mpsc::Receiver<Command>>,
    started: Instant,
    state: EngineState,
    estop_active: bool,

    // Events accumulated between dispatch firings; publish and persist
    // drain independently because their intervals differ.
    publish_changes: Vec<ChangeEvent>,
    publish_alerts: Vec<AlertEvent>,
    persist_changes: Vec<ChangeEvent>,
}

impl Engine {
    /// Validate the configuration and assemble every component.
    ///
    /// Fails only on startup faults: invalid configuration or an unusable
    /// persistence target. A missing broker is not fatal; the bus sink
    /// just drops its payloads until the broker appears.
    pub async fn new(config: Config, adapter: Arc<dyn IoAdapter>) -> Result<Self> {
        config.validate().context("configuration rejected")?;

        let (command_tx, command_rx) = mpsc::channel(64);

        let mqtt = if config.mqtt.enabled {
            match MqttLink::connect(&config.mqtt, command_tx.clone()).await {
                Ok(link) => Some(Arc::new(link)),
                Err(e) => {
                    warn!("MQTT link unavailable, continuing without bus: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let db = if config.database.enabled {
            let db = Database::open(&config.database).context("persistence target unusable")?;
            if let Err(e) = db.cleanup(config.database.retention_days) {
                warn!("retention cleanup failed: {}", e);
            }
            Some(db)
        } else {
            None
        };

        let registry = Arc::new(RwLock::new(ChannelRegistry::from_defs(&config.channels)));

        let control_interval = std::time::Duration::from_millis(config.schedule.control_ms);
        let controller = Arc::new(Mutex::new(Controller::new(
            config
                .loops
                .iter()
                .map(|def| def.to_loop(control_interval))
                .collect(),
        )));

        let sched = &config.schedule;
        let scheduler = Scheduler::new(vec![
            (Activity::Sample, ms(sched.sample_ms)),
            (Activity::DetectChanges, ms(sched.detect_ms)),
            (Activity::Control, ms(sched.control_ms)),
            (Activity::Alert, ms(sched.alert_ms)),
            (Activity::Publish, ms(sched.publish_ms)),
            (Activity::Persist, ms(sched.persist_ms)),
        ]);

        let sampler = Sampler::new(
            adapter.clone(),
            config.engine.io_timeout(),
            config.engine.fault_threshold,
        );
        let dispatcher = Dispatcher::new(
            adapter,
            mqtt.clone(),
            db,
            config.engine.io_timeout(),
        );
        let alerts = AlertEvaluator::new(config.alerts.rules.clone());

        info!(
            "Engine assembled: {} channels, {} loops, {} alert rules",
            config.channels.len(),
            config.loops.len(),
            config.alerts.rules.len()
        );

        Ok(Self {
            config,
            registry,
            controller,
            scheduler,
            sampler,
            detector: ChangeDetector,
            alerts,
            dispatcher,
            mqtt,
            command_tx,
            command_rx: Some(command_rx),
            started: Instant::now(),
            state: EngineState::default(),
            estop_active: false,
            publish_changes: Vec::new(),
            publish_alerts: Vec::new(),
            persist_changes: Vec::new(),
        })
    }

    /// Handle for injecting commands locally (tests, embedding).
    pub fn command_handle(&self) -> mpsc::Sender<Command> {
        self.command_tx.clone()
    }

    /// Shared registry handle for status surfaces.
    pub fn registry(&self) -> Arc<RwLock<ChannelRegistry>> {
        self.registry.clone()
    }

    /// Run until the shutdown signal fires.
    ///
    /// The current tick always completes, then every output is driven to
    /// its safe value before adapter resources are released. The safe-state
    /// write runs even if the signal arrived during an I/O failure.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        self.started = Instant::now();
        self.state.running = true;

        if let Some(rx) = self.command_rx.take() {
            let ingestor = CommandIngestor::new(
                self.registry.clone(),
                self.controller.clone(),
                self.mqtt.clone(),
            );
            let ingest_shutdown = shutdown.resubscribe();
            tokio::spawn(ingestor.run(rx, ingest_shutdown));
        }

        let mut ticker = tokio::time::interval(self.config.engine.base_resolution());
        // Late ticks are skipped, never replayed in a burst
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Engine running at {}ms base resolution",
            self.config.engine.base_resolution_ms
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now_ms = self.started.elapsed().as_millis() as u64;
                    self.tick(now_ms).await;
                }
                _ = shutdown.recv() => {
                    info!("shutdown signal received, finishing current tick");
                    break;
                }
            }
        }

        self.state.running = false;
        self.dispatcher.safe_state(&self.registry).await;
        info!("all outputs at safe values");

        if let Some(mqtt) = &self.mqtt {
            if let Err(e) = mqtt.disconnect().await {
                warn!("MQTT disconnect failed: {}", e);
            }
        }

        info!("Engine stopped after {} ticks", self.state.ticks);
        Ok(())
    }

    /// Execute one tick at the given monotonic time.
    ///
    /// Separated from [`run`](Self::run) so tests can drive the cycle
    /// deterministically.
    pub async fn tick(&mut self, now_ms: u64) {
        self.state.ticks += 1;

        for activity in self.scheduler.tick(now_ms) {
            match activity {
                Activity::Sample => {
                    self.sampler.sample(&self.registry).await;
                    self.state.sample_passes += 1;
                    self.check_estop();
                }
                Activity::DetectChanges => {
                    let events = {
                        let mut reg = self.registry.write();
                        self.detector.detect(&mut reg)
                    };
                    if !events.is_empty() {
                        self.state.total_changes += events.len() as u64;
                        self.state.last_change = Some(Utc::now());
                        self.publish_changes.extend(events.iter().cloned());
                        self.persist_changes.extend(events);
                    }
                }
                Activity::Control => {
                    if self.estop_active {
                        continue;
                    }
                    let inputs: InputSnapshot = {
                        let reg = self.registry.read();
                        reg.iter()
                            .filter(|c| c.kind.is_input())
                            .map(|c| (c.name.clone(), (c.value, c.stale)))
                            .collect()
                    };
                    let commands = self.controller.lock().step_due(now_ms, &inputs);
                    if !commands.is_empty() {
                        let mut reg = self.registry.write();
                        for cmd in commands {
                            reg.apply_output(&cmd.channel, cmd.value);
                        }
                    }
                }
                Activity::Alert => {
                    let events = self.alerts.evaluate(&self.registry.read());
                    self.state.alerts_active = self.alerts.any_active();
                    self.publish_alerts.extend(events);
                }
                Activity::Publish => {
                    let changes = std::mem::take(&mut self.publish_changes);
                    let alerts = std::mem::take(&mut self.publish_alerts);
                    self.dispatcher
                        .publish(&self.registry, &changes, &alerts)
                        .await;
                }
                Activity::Persist => {
                    let changes = std::mem::take(&mut self.persist_changes);
                    self.dispatcher.persist(&self.registry, &changes);
                }
            }
        }

        if self.estop_active {
            // Outputs are held at their safe values for as long as the
            // emergency stop stays engaged
            self.dispatcher.safe_state(&self.registry).await;
        } else if self.registry.read().has_pending() {
            self.dispatcher.write_outputs(&self.registry).await;
        }
    }

    fn check_estop(&mut self) {
        let Some(name) = &self.config.alerts.estop_channel else {
            return;
        };
        let active = self
            .registry
            .read()
            .get(name)
            .map(|c| !c.stale && c.value >= 0.5)
            .unwrap_or(false);

        if active != self.estop_active {
            if active {
                warn!("emergency stop engaged; outputs forced safe, control suspended");
            } else {
                info!("emergency stop released; control resumes");
            }
            self.estop_active = active;
            self.state.estop_active = active;
        }
    }

    /// Current engine counters for status surfaces.
    pub fn status(&self) -> EngineState {
        let mut state = self.state.clone();
        state.uptime_seconds = self.started.elapsed().as_secs();
        state
    }
}

fn ms(v: u64) -> std::time::Duration {
    std::time::Duration::from_millis(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::channels::ChannelAddress;
    use crate::io::SimulatedIo;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.mqtt.enabled = false;
        config.database.enabled = false;
        config.engine.base_resolution_ms = 10;
        config.schedule.sample_ms = 10;
        config.schedule.detect_ms = 10;
        config.schedule.control_ms = 10;
        config.schedule.alert_ms = 10;
        config.schedule.publish_ms = 50;
        config.schedule.persist_ms = 50;
        config
    }

    fn temp_addr() -> ChannelAddress {
        ChannelAddress {
            line: 0,
            bank: Some("ain".into()),
        }
    }

    fn sim() -> Arc<SimulatedIo> {
        let sim = Arc::new(SimulatedIo::with_seed(11));
        // temp scales as raw * 100 - 25: raw 0.45 reads as 20 °C
        sim.set_value(&temp_addr(), 0.45);
        // Pull-up inputs idle high
        for line in [22, 23, 27] {
            sim.set_value(&ChannelAddress { line, bank: None }, 1.0);
        }
        sim
    }

    #[tokio::test]
    async fn pid_drives_heater_and_shutdown_restores_safe_state() {
        let sim = sim();
        let mut engine = Engine::new(test_config(), sim.clone()).await.unwrap();

        // Measured 20 vs setpoint 25: the heater engages within a few
        // control intervals
        for t in 0..5 {
            engine.tick(t * 10).await;
        }
        let heater = ChannelAddress {
            line: 18,
            bank: None,
        };
        assert_eq!(sim.written(&heater), Some(1.0));

        // The run loop always ends in a safe-state write
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move {
            engine.run(rx).await.unwrap();
            engine
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(()).unwrap();
        let engine = handle.await.unwrap();

        assert_eq!(sim.written(&heater), Some(0.0));
        assert_eq!(
            sim.written(&ChannelAddress {
                line: 19,
                bank: None
            }),
            Some(0.0)
        );
        let reg = engine.registry();
        let guard = reg.read();
        assert_eq!(guard.get("heater").unwrap().value, 0.0);
        assert_eq!(guard.get("cooler").unwrap().value, 0.0);
    }

    #[tokio::test]
    async fn engaged_estop_forces_outputs_safe_and_suspends_control() {
        let sim = sim();
        let mut engine = Engine::new(test_config(), sim.clone()).await.unwrap();

        for t in 0..5 {
            engine.tick(t * 10).await;
        }
        let heater = ChannelAddress {
            line: 18,
            bank: None,
        };
        assert_eq!(sim.written(&heater), Some(1.0));

        // Pull-up estop input goes low: engaged
        sim.set_value(
            &ChannelAddress {
                line: 27,
                bank: None,
            },
            0.0,
        );
        engine.tick(50).await;
        assert_eq!(sim.written(&heater), Some(0.0));
        assert!(engine.status().estop_active);

        // Released: control resumes and re-engages the heater
        sim.set_value(
            &ChannelAddress {
                line: 27,
                bank: None,
            },
            1.0,
        );
        engine.tick(60).await;
        engine.tick(70).await;
        assert_eq!(sim.written(&heater), Some(1.0));
        assert!(!engine.status().estop_active);
    }

    #[tokio::test]
    async fn local_command_is_visible_to_the_next_tick() {
        let sim = sim();
        let mut engine = Engine::new(test_config(), sim.clone()).await.unwrap();
        engine.tick(0).await;

        // Raise the setpoint far above the measured value through the
        // command path; the next control tick saturates the output high
        let ingestor = CommandIngestor::new(
            engine.registry.clone(),
            engine.controller.clone(),
            None,
        );
        ingestor
            .apply(&Command {
                target: "temp_loop".into(),
                value: 90.0,
                source: "test".into(),
                timestamp: Utc::now(),
            })
            .unwrap();

        engine.tick(10).await;
        let heater = ChannelAddress {
            line: 18,
            bank: None,
        };
        assert_eq!(sim.written(&heater), Some(1.0));
    }

    #[tokio::test]
    async fn invalid_config_is_a_startup_fault() {
        let mut config = test_config();
        config.engine.base_resolution_ms = 0;
        let result = Engine::new(config, Arc::new(SimulatedIo::with_seed(1))).await;
        assert!(result.is_err());
    }
}
