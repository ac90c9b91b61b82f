//! # Safety-Logic Loop
//!
//! Every period the loop loads the latest snapshot of every device from the
//! measurement bus cache, evaluates the rule set and enqueues corrective
//! commands.
//!
//! | Rule | Condition | Command | Priority |
//! |------|-----------|---------|----------|
//! | inverter power cap | inverter `power` > 10 kW | `set_power_limit_pct(90)` | high |
//! | fleet power cap | sum of inverter `power` > 50 kW | `set_power_limit_pct(80)` to every inverter | high |
//! | voltage window | `voltage` outside 200..=250 V | `turn_off` | emergency |
//! | stale snapshot | no good snapshot for 10 s | device marked offline | - |
//!
//! Offline devices are left out of every other rule. A rule that fired
//! against a device stays silent for that device for the hysteresis time
//! (5 s by default).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::constants::*;
use crate::control::{CommandKind, ControlCommand, ControlQueue, Priority};
use crate::device::DeviceKind;
use crate::error::GatewayError;
use crate::measurement_bus::MeasurementBus;
use crate::snapshot::Snapshot;
use crate::supervisor::StopFlag;

/// Safety section of the gateway configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub max_single_inverter_w: f64,
    pub max_total_power_w: f64,
    pub single_limit_pct: f64,
    pub fleet_limit_pct: f64,
    pub min_voltage_v: f64,
    pub max_voltage_v: f64,
    pub stale_after_ms: u64,
    pub hysteresis_ms: u64,
    pub period_ms: u64,
    /// Measurement holding active power in W
    pub power_measurement: String,
    /// Measurement holding voltage in V
    pub voltage_measurement: String,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_single_inverter_w: 10_000.0,
            max_total_power_w: 50_000.0,
            single_limit_pct: 90.0,
            fleet_limit_pct: 80.0,
            min_voltage_v: 200.0,
            max_voltage_v: 250.0,
            stale_after_ms: STALE_AFTER_MS,
            hysteresis_ms: SAFETY_HYSTERESIS_MS,
            period_ms: SAFETY_PERIOD_MS,
            power_measurement: "power".to_string(),
            voltage_measurement: "voltage".to_string(),
        }
    }
}

impl SafetyConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn rules(&self) -> Vec<SafetyRule> {
        vec![
            SafetyRule::StaleSnapshot {
                max_age: Duration::from_millis(self.stale_after_ms),
            },
            SafetyRule::InverterPowerCap {
                max_w: self.max_single_inverter_w,
                limit_pct: self.single_limit_pct,
            },
            SafetyRule::FleetPowerCap {
                max_total_w: self.max_total_power_w,
                limit_pct: self.fleet_limit_pct,
            },
            SafetyRule::VoltageWindow {
                min_v: self.min_voltage_v,
                max_v: self.max_voltage_v,
            },
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SafetyRule {
    InverterPowerCap { max_w: f64, limit_pct: f64 },
    FleetPowerCap { max_total_w: f64, limit_pct: f64 },
    VoltageWindow { min_v: f64, max_v: f64 },
    StaleSnapshot { max_age: Duration },
}

impl SafetyRule {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InverterPowerCap { .. } => "inverter_power_cap",
            Self::FleetPowerCap { .. } => "fleet_power_cap",
            Self::VoltageWindow { .. } => "voltage_window",
            Self::StaleSnapshot { .. } => "stale_snapshot",
        }
    }
}

/// Stateful rule evaluator: hysteresis and staleness tracking
pub struct SafetyEngine {
    rules: Vec<SafetyRule>,
    devices: Vec<(String, DeviceKind)>,
    power_measurement: String,
    voltage_measurement: String,
    hysteresis: Duration,
    started: Instant,
    last_good: HashMap<String, Instant>,
    offline: HashSet<String>,
    last_fired: HashMap<(String, &'static str), Instant>,
}

impl SafetyEngine {
    pub fn new<I, S>(config: &SafetyConfig, devices: I) -> Self
    where
        I: IntoIterator<Item = (S, DeviceKind)>,
        S: Into<String>,
    {
        Self::with_rules(config, config.rules(), devices)
    }

    pub fn with_rules<I, S>(config: &SafetyConfig, rules: Vec<SafetyRule>, devices: I) -> Self
    where
        I: IntoIterator<Item = (S, DeviceKind)>,
        S: Into<String>,
    {
        Self {
            rules,
            devices: devices.into_iter().map(|(n, k)| (n.into(), k)).collect(),
            power_measurement: config.power_measurement.clone(),
            voltage_measurement: config.voltage_measurement.clone(),
            hysteresis: Duration::from_millis(config.hysteresis_ms),
            started: Instant::now(),
            last_good: HashMap::new(),
            offline: HashSet::new(),
            last_fired: HashMap::new(),
        }
    }

    pub fn rules(&self) -> &[SafetyRule] {
        &self.rules
    }

    pub fn is_offline(&self, device: &str) -> bool {
        self.offline.contains(device)
    }

    pub fn offline_count(&self) -> usize {
        self.offline.len()
    }

    /// Evaluate every rule against the latest snapshots.
    pub fn evaluate(
        &mut self,
        snapshots: &HashMap<String, Arc<Snapshot>>,
        now: Instant,
    ) -> Vec<ControlCommand> {
        for snapshot in snapshots.values().filter(|s| !s.is_error()) {
            let last = self
                .last_good
                .entry(snapshot.device_name.clone())
                .or_insert(snapshot.captured_at);
            *last = (*last).max(snapshot.captured_at);
        }

        let rules = std::mem::take(&mut self.rules);
        if let Some(max_age) = rules.iter().find_map(|rule| match rule {
            SafetyRule::StaleSnapshot { max_age } => Some(*max_age),
            _ => None,
        }) {
            self.update_offline(max_age, now);
        }

        let mut commands = Vec::new();
        for rule in &rules {
            match rule {
                SafetyRule::InverterPowerCap { max_w, limit_pct } => {
                    for (device, power) in self.inverter_powers(snapshots) {
                        if power > *max_w {
                            self.fire(&mut commands, now, rule, &device, || {
                                ControlCommand::new(
                                    device.as_str(),
                                    CommandKind::SetPowerLimitPct,
                                    Some(*limit_pct),
                                    Priority::High,
                                )
                            });
                        }
                    }
                }
                SafetyRule::FleetPowerCap {
                    max_total_w,
                    limit_pct,
                } => {
                    let powers = self.inverter_powers(snapshots);
                    let total: f64 = powers.iter().map(|(_, p)| p).sum();
                    if total > *max_total_w {
                        debug!(total_w = total, limit_w = *max_total_w, "fleet power over limit");
                        for (device, _) in &powers {
                            self.fire(&mut commands, now, rule, device, || {
                                ControlCommand::new(
                                    device.as_str(),
                                    CommandKind::SetPowerLimitPct,
                                    Some(*limit_pct),
                                    Priority::High,
                                )
                            });
                        }
                    }
                }
                SafetyRule::VoltageWindow { min_v, max_v } => {
                    let readings: Vec<(String, f64)> = self
                        .live_snapshots(snapshots)
                        .filter_map(|(name, _, s)| {
                            s.values
                                .get(&self.voltage_measurement)
                                .map(|v| (name.to_string(), v))
                        })
                        .collect();
                    for (device, voltage) in readings {
                        if !(*min_v..=*max_v).contains(&voltage) {
                            self.fire(&mut commands, now, rule, &device, || {
                                ControlCommand::new(
                                    device.as_str(),
                                    CommandKind::TurnOff,
                                    None,
                                    Priority::Emergency,
                                )
                            });
                        }
                    }
                }
                SafetyRule::StaleSnapshot { .. } => {}
            }
        }
        self.rules = rules;
        commands
    }

    fn update_offline(&mut self, max_age: Duration, now: Instant) {
        for (device, _) in &self.devices {
            let last = self.last_good.get(device).copied().unwrap_or(self.started);
            let stale = now.saturating_duration_since(last) > max_age;
            if stale && self.offline.insert(device.clone()) {
                warn!(
                    device = %device,
                    age_ms = now.saturating_duration_since(last).as_millis() as u64,
                    "device offline, no fresh snapshot"
                );
            } else if !stale && self.offline.remove(device) {
                info!(device = %device, "device online");
            }
        }
    }

    /// Known, online devices with a good latest snapshot
    fn live_snapshots<'a>(
        &'a self,
        snapshots: &'a HashMap<String, Arc<Snapshot>>,
    ) -> impl Iterator<Item = (&'a str, DeviceKind, &'a Snapshot)> + 'a {
        self.devices.iter().filter_map(move |(name, kind)| {
            if self.offline.contains(name) {
                return None;
            }
            let snapshot = snapshots.get(name).filter(|s| !s.is_error())?;
            Some((name.as_str(), *kind, snapshot.as_ref()))
        })
    }

    fn inverter_powers(&self, snapshots: &HashMap<String, Arc<Snapshot>>) -> Vec<(String, f64)> {
        self.live_snapshots(snapshots)
            .filter(|(_, kind, _)| *kind == DeviceKind::Inverter)
            .filter_map(|(name, _, s)| {
                s.values
                    .get(&self.power_measurement)
                    .map(|p| (name.to_string(), p))
            })
            .collect()
    }

    fn fire(
        &mut self,
        commands: &mut Vec<ControlCommand>,
        now: Instant,
        rule: &SafetyRule,
        device: &str,
        command: impl FnOnce() -> ControlCommand,
    ) {
        let key = (device.to_string(), rule.name());
        if let Some(last) = self.last_fired.get(&key) {
            if now.saturating_duration_since(*last) < self.hysteresis {
                debug!(device, rule = rule.name(), "suppressed by hysteresis");
                return;
            }
        }
        self.last_fired.insert(key, now);
        let command = command();
        warn!(
            device,
            rule = rule.name(),
            command = %command.kind,
            priority = ?command.priority,
            "safety rule fired"
        );
        commands.push(command);
    }
}

/// Evaluate on a fixed cadence until the stop flag is set.
pub async fn run_safety_loop(
    mut engine: SafetyEngine,
    bus: Arc<MeasurementBus>,
    queue: Arc<ControlQueue>,
    stop: StopFlag,
    period: Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(period_ms = period.as_millis() as u64, rules = engine.rules().len(), "safety loop started");

    loop {
        tokio::select! {
            biased;
            _ = stop.wait() => break,
            _ = ticker.tick() => {}
        }
        let snapshots = bus.latest();
        for command in engine.evaluate(&snapshots, Instant::now()) {
            let device = command.target_device.clone();
            match queue.enqueue(command) {
                Ok(()) => {}
                Err(GatewayError::QueueFull { .. }) => {
                    warn!(device = %device, "control queue full, safety command dropped")
                }
                Err(err) => warn!(device = %device, error = %err, "safety command rejected"),
            }
        }
    }
    info!("safety loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{Measurements, SnapshotStatus};

    fn entry(device: &str, values: &[(&str, f64)]) -> (String, Arc<Snapshot>) {
        let values: Measurements = values.iter().copied().collect();
        (
            device.to_string(),
            Arc::new(Snapshot::new(device, 1, values, SnapshotStatus::Ok)),
        )
    }

    fn engine() -> SafetyEngine {
        SafetyEngine::new(
            &SafetyConfig::default(),
            [
                ("inv_1", DeviceKind::Inverter),
                ("inv_2", DeviceKind::Inverter),
                ("meter_1", DeviceKind::Meter),
            ],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_voltage_window_with_hysteresis() {
        let mut engine = engine();
        let latest = HashMap::from([entry("meter_1", &[("voltage", 260.0)])]);

        let commands = engine.evaluate(&latest, Instant::now());
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].target_device, "meter_1");
        assert_eq!(commands[0].kind, CommandKind::TurnOff);
        assert_eq!(commands[0].priority, Priority::Emergency);

        tokio::time::advance(Duration::from_millis(4900)).await;
        let latest = HashMap::from([entry("meter_1", &[("voltage", 260.0)])]);
        assert!(engine.evaluate(&latest, Instant::now()).is_empty());

        tokio::time::advance(Duration::from_millis(100)).await;
        let latest = HashMap::from([entry("meter_1", &[("voltage", 260.0)])]);
        assert_eq!(engine.evaluate(&latest, Instant::now()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_voltage_inside_window_is_quiet() {
        let mut engine = engine();
        let latest = HashMap::from([
            entry("meter_1", &[("voltage", 200.0)]),
            entry("inv_1", &[("voltage", 250.0)]),
        ]);
        assert!(engine.evaluate(&latest, Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_cap_applies_to_inverters_only() {
        let mut engine = engine();
        let latest = HashMap::from([
            entry("inv_1", &[("power", 12_000.0)]),
            entry("meter_1", &[("power", 40_000.0)]),
        ]);

        let commands = engine.evaluate(&latest, Instant::now());
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].target_device, "inv_1");
        assert_eq!(commands[0].kind, CommandKind::SetPowerLimitPct);
        assert_eq!(commands[0].payload, Some(90.0));
        assert_eq!(commands[0].priority, Priority::High);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fleet_cap_limits_every_inverter() {
        let config = SafetyConfig {
            max_single_inverter_w: 100_000.0,
            ..SafetyConfig::default()
        };
        let mut engine = SafetyEngine::new(
            &config,
            [("inv_1", DeviceKind::Inverter), ("inv_2", DeviceKind::Inverter)],
        );
        let latest = HashMap::from([
            entry("inv_1", &[("power", 30_000.0)]),
            entry("inv_2", &[("power", 25_000.0)]),
        ]);

        let mut targets: Vec<String> = engine
            .evaluate(&latest, Instant::now())
            .into_iter()
            .inspect(|c| assert_eq!(c.payload, Some(80.0)))
            .map(|c| c.target_device)
            .collect();
        targets.sort();
        assert_eq!(targets, ["inv_1", "inv_2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_device_is_offline_and_excluded() {
        let mut engine = engine();
        let latest = HashMap::from([entry("inv_1", &[("voltage", 230.0)])]);
        engine.evaluate(&latest, Instant::now());
        assert!(!engine.is_offline("inv_1"));

        tokio::time::advance(Duration::from_millis(STALE_AFTER_MS + 1)).await;
        // same old snapshot, now out of window but stale
        let mut stale = (*latest["inv_1"]).clone();
        stale.values = [("voltage", 300.0)].into_iter().collect();
        let latest = HashMap::from([("inv_1".to_string(), Arc::new(stale))]);

        assert!(engine.evaluate(&latest, Instant::now()).is_empty());
        assert!(engine.is_offline("inv_1"));
        // never reported at all
        assert!(engine.is_offline("meter_1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_snapshots_do_not_refresh_liveness() {
        let mut engine = engine();
        tokio::time::advance(Duration::from_millis(STALE_AFTER_MS + 1)).await;
        let latest = HashMap::from([(
            "inv_2".to_string(),
            Arc::new(Snapshot::error("inv_2", 4)),
        )]);
        engine.evaluate(&latest, Instant::now());
        assert!(engine.is_offline("inv_2"));
        assert_eq!(engine.offline_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_enqueues_commands() {
        let bus = Arc::new(MeasurementBus::default());
        let queue = Arc::new(ControlQueue::new(["meter_1"], 8));
        let stop = StopFlag::new();
        let values: Measurements = [("voltage", 180.0)].into_iter().collect();
        bus.publish_snapshot(Snapshot::new("meter_1", 1, values, SnapshotStatus::Ok))
            .unwrap();

        let handle = tokio::spawn(run_safety_loop(
            SafetyEngine::new(&SafetyConfig::default(), [("meter_1", DeviceKind::Meter)]),
            Arc::clone(&bus),
            Arc::clone(&queue),
            stop.clone(),
            Duration::from_millis(500),
        ));
        tokio::time::sleep(Duration::from_millis(1200)).await;
        stop.set();
        handle.await.unwrap();

        assert_eq!(queue.len("meter_1"), 1);
        assert_eq!(queue.pop("meter_1").unwrap().kind, CommandKind::TurnOff);
    }
}
