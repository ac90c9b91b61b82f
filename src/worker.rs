//! # Polling Worker
//!
//! One worker per device. Each tick:
//!
//! 1. skip while the session is quarantined, or send the single probe once
//!    the cooldown has elapsed;
//! 2. apply the device's pending control commands, highest priority first;
//! 3. read the whole register block, decode it and publish a snapshot
//!    (`ok`/`partial`), or publish an empty `error` snapshot on failure.
//!
//! Ticks follow `last_tick + poll_interval`; overrun ticks are skipped, not
//! burst. The stop flag is checked between transactions and while waiting
//! for the next tick. A transaction in flight always runs to completion.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::control::{resolve_write, ControlQueue};
use crate::error::ModbusError;
use crate::measurement_bus::MeasurementBus;
use crate::session::{DeviceSession, PollDecision};
use crate::snapshot::{Snapshot, SnapshotStatus};
use crate::supervisor::StopFlag;
use crate::transport::ModbusTransport;

/// Last instant a worker finished a tick or a bus transaction
#[derive(Debug)]
pub struct Heartbeat(Mutex<Instant>);

impl Heartbeat {
    pub fn new() -> Self {
        Self(Mutex::new(Instant::now()))
    }

    pub fn beat(&self) {
        *self.0.lock() = Instant::now();
    }

    pub fn last(&self) -> Instant {
        *self.0.lock()
    }

    pub fn age(&self) -> Duration {
        self.last().elapsed()
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// Unrecoverable bus failure reported to the supervisor
#[derive(Debug, Clone)]
pub struct FatalEvent {
    pub bus: String,
    pub device: String,
    pub error: ModbusError,
}

/// Result of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A snapshot with this status was published
    Published(SnapshotStatus),
    /// Quarantine cooldown still running; nothing sent
    Skipped,
    /// Stop flag seen between transactions
    Stopped,
    /// The bus is closed
    Fatal,
}

/// Totals returned when a worker exits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub device: String,
    pub ticks: u64,
    pub published: u64,
    pub commands_applied: u64,
}

pub struct PollingWorker<T> {
    session: DeviceSession<T>,
    bus: Arc<MeasurementBus>,
    control: Arc<ControlQueue>,
    stop: StopFlag,
    heartbeat: Arc<Heartbeat>,
    fatal: Option<mpsc::UnboundedSender<FatalEvent>>,
    sequence: u64,
    report: WorkerReport,
}

impl<T: ModbusTransport> PollingWorker<T> {
    pub fn new(
        session: DeviceSession<T>,
        bus: Arc<MeasurementBus>,
        control: Arc<ControlQueue>,
        stop: StopFlag,
    ) -> Self {
        let device = session.descriptor().name.clone();
        Self {
            session,
            bus,
            control,
            stop,
            heartbeat: Arc::new(Heartbeat::new()),
            fatal: None,
            sequence: 0,
            report: WorkerReport {
                device,
                ..WorkerReport::default()
            },
        }
    }

    /// Report `TransportClosed` on `tx`
    pub fn with_fatal_channel(mut self, tx: mpsc::UnboundedSender<FatalEvent>) -> Self {
        self.fatal = Some(tx);
        self
    }

    pub fn heartbeat(&self) -> Arc<Heartbeat> {
        Arc::clone(&self.heartbeat)
    }

    pub fn session(&self) -> &DeviceSession<T> {
        &self.session
    }

    /// Sequence number of the last published snapshot
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Tick until the stop flag is set or the bus closes.
    pub async fn run(mut self) -> WorkerReport {
        let period = self.session.descriptor().poll_interval;
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            device = %self.report.device,
            slave_id = self.session.descriptor().slave_id,
            poll_interval_ms = period.as_millis() as u64,
            "polling worker started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.stop.wait() => break,
                _ = ticker.tick() => {}
            }
            let outcome = self.tick().await;
            self.heartbeat.beat();
            match outcome {
                TickOutcome::Fatal | TickOutcome::Stopped => break,
                TickOutcome::Published(_) | TickOutcome::Skipped => {}
            }
        }

        info!(
            device = %self.report.device,
            ticks = self.report.ticks,
            published = self.report.published,
            "polling worker stopped"
        );
        self.report
    }

    /// One poll cycle
    pub async fn tick(&mut self) -> TickOutcome {
        self.report.ticks += 1;

        match self.session.should_poll(Instant::now()) {
            PollDecision::Poll => {}
            PollDecision::Skip(remaining) => {
                trace!(
                    device = %self.report.device,
                    remaining_ms = remaining.as_millis() as u64,
                    "quarantined, tick skipped"
                );
                return TickOutcome::Skipped;
            }
            PollDecision::Probe => {
                debug!(device = %self.report.device, "probing quarantined device");
                let probed = self.session.probe().await;
                self.heartbeat.beat();
                if let Err(err) = probed {
                    self.publish_error();
                    return self.failure_outcome(err);
                }
            }
        }

        if let Err(err) = self.apply_commands().await {
            self.publish_error();
            return self.failure_outcome(err);
        }
        if self.stop.is_set() {
            return TickOutcome::Stopped;
        }

        match self.session.read_block().await {
            Ok(raw) => {
                let decoded = self.session.descriptor().register_map.decode(&raw);
                let status = decoded.status;
                let sequence = self.next_sequence();
                let snapshot =
                    Snapshot::new(self.report.device.clone(), sequence, decoded.values, status);
                self.publish(snapshot);
                TickOutcome::Published(status)
            }
            Err(err) => {
                warn!(
                    device = %self.report.device,
                    failures = self.session.consecutive_errors(),
                    error = %err,
                    "poll failed"
                );
                self.publish_error();
                self.failure_outcome(err)
            }
        }
    }

    /// Write pending commands one at a time. Only `TransportClosed` is
    /// returned; other failures discard the command.
    ///
    /// The heartbeat is stamped after every write so a long queue does not
    /// look like a stalled worker.
    async fn apply_commands(&mut self) -> Result<(), ModbusError> {
        while !self.stop.is_set() && !self.session.is_quarantined() {
            let Some(command) = self.control.pop(&self.report.device) else {
                break;
            };
            let op = match resolve_write(&self.session.descriptor().register_map, &command) {
                Ok(op) => op,
                Err(err) => {
                    warn!(
                        device = %self.report.device,
                        command = %command.kind,
                        error = %err,
                        "command discarded"
                    );
                    continue;
                }
            };
            let written = self.session.transact(&op).await;
            self.heartbeat.beat();
            match written {
                Ok(_) => {
                    self.report.commands_applied += 1;
                    info!(
                        device = %self.report.device,
                        command = %command.kind,
                        priority = ?command.priority,
                        address = op.address(),
                        "command applied"
                    );
                }
                Err(ModbusError::TransportClosed) => return Err(ModbusError::TransportClosed),
                Err(err) => warn!(
                    device = %self.report.device,
                    command = %command.kind,
                    error = %err,
                    "command write failed"
                ),
            }
        }
        Ok(())
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn publish_error(&mut self) {
        let sequence = self.next_sequence();
        self.publish(Snapshot::error(self.report.device.clone(), sequence));
    }

    fn publish(&mut self, snapshot: Snapshot) {
        match self.bus.publish_snapshot(snapshot) {
            Ok(()) => self.report.published += 1,
            Err(err) => error!(device = %self.report.device, error = %err, "snapshot not published"),
        }
    }

    fn failure_outcome(&self, err: ModbusError) -> TickOutcome {
        if err != ModbusError::TransportClosed {
            return TickOutcome::Published(SnapshotStatus::Error);
        }
        let bus = self.session.arbiter().name().to_string();
        error!(device = %self.report.device, bus = %bus, "bus closed, worker exiting");
        if let Some(tx) = &self.fatal {
            let _ = tx.send(FatalEvent {
                bus,
                device: self.report.device.clone(),
                error: err,
            });
        }
        TickOutcome::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::BusArbiter;
    use crate::bytes::ByteOrder;
    use crate::codec::{BusOp, ReadFunction};
    use crate::control::{CommandKind, ControlCommand, Priority};
    use crate::device::{DeviceDescriptor, DeviceKind};
    use crate::mock::{MockHandle, MockTransport};
    use crate::register_map::{RegisterMap, RegisterMapping};
    use crate::transport::TransportTimeouts;
    use crate::value::DataType;

    struct Fixture {
        worker: PollingWorker<MockTransport>,
        mock: MockHandle,
        bus: Arc<MeasurementBus>,
        control: Arc<ControlQueue>,
        stop: StopFlag,
    }

    fn fixture() -> Fixture {
        let map = RegisterMap::new(
            "inverter",
            0,
            3,
            ReadFunction::Holding,
            ByteOrder::BigEndian,
            vec![
                RegisterMapping::new("run_state", 0, DataType::U16).writable(),
                RegisterMapping::new("power_limit_pct", 1, DataType::U16).writable(),
                RegisterMapping::new("voltage", 2, DataType::U16).scaled(0.1),
            ],
        )
        .unwrap();
        let descriptor = Arc::new(DeviceDescriptor {
            name: "inv_1".to_string(),
            model: "inverter".to_string(),
            slave_id: 7,
            kind: DeviceKind::Inverter,
            poll_interval: Duration::from_millis(500),
            bus: "rs485".to_string(),
            register_map: Arc::new(map),
        });
        let mock = MockTransport::new();
        let handle = mock.handle();
        let arbiter = Arc::new(BusArbiter::new("rs485", mock, TransportTimeouts::default()));
        let bus = Arc::new(MeasurementBus::default());
        let control = Arc::new(ControlQueue::new(["inv_1"], 16));
        let stop = StopFlag::new();
        let worker = PollingWorker::new(
            DeviceSession::new(descriptor, arbiter),
            Arc::clone(&bus),
            Arc::clone(&control),
            stop.clone(),
        );
        Fixture {
            worker,
            mock: handle,
            bus,
            control,
            stop,
        }
    }

    #[tokio::test]
    async fn test_tick_publishes_snapshot_with_sequence() {
        let mut f = fixture();
        f.mock.set_registers(7, 0, &[1, 100, 2301]);

        assert_eq!(
            f.worker.tick().await,
            TickOutcome::Published(SnapshotStatus::Ok)
        );
        assert_eq!(f.worker.tick().await, TickOutcome::Published(SnapshotStatus::Ok));

        let latest = f.bus.latest_for("inv_1").unwrap();
        assert_eq!(latest.sequence, 2);
        assert!((latest.values.get("voltage").unwrap() - 230.1).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_publishes_error_snapshot() {
        let mut f = fixture();
        let mut sub = f.bus.subscribe("measurements/inv_1").unwrap();
        f.mock.set_offline(7, ModbusError::timeout("mock", 1000));

        assert_eq!(
            f.worker.tick().await,
            TickOutcome::Published(SnapshotStatus::Error)
        );
        let json: serde_json::Value =
            serde_json::from_slice(&sub.recv().await.unwrap().payload).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["sequence"], 1);
    }

    #[tokio::test]
    async fn test_commands_written_before_read_by_priority() {
        let mut f = fixture();
        f.control
            .enqueue(ControlCommand::new("inv_1", CommandKind::TurnOn, None, Priority::Normal))
            .unwrap();
        f.control
            .enqueue(ControlCommand::new(
                "inv_1",
                CommandKind::SetPowerLimitPct,
                Some(80.0),
                Priority::High,
            ))
            .unwrap();

        f.worker.tick().await;

        let ops: Vec<BusOp> = f.mock.requests().into_iter().map(|r| r.op).collect();
        assert_eq!(
            ops,
            vec![
                BusOp::WriteSingle {
                    address: 1,
                    value: 80
                },
                BusOp::WriteSingle {
                    address: 0,
                    value: 1
                },
                BusOp::read(ReadFunction::Holding, 0, 3),
            ]
        );
        assert_eq!(f.mock.register(7, 1), 80);
        assert!(f.control.is_empty("inv_1"));
    }

    #[tokio::test]
    async fn test_invalid_command_is_discarded() {
        let mut f = fixture();
        f.control
            .enqueue(ControlCommand::new(
                "inv_1",
                CommandKind::ResetAlarm,
                None,
                Priority::Normal,
            ))
            .unwrap();

        f.worker.tick().await;
        assert_eq!(f.mock.request_count(), 1);
        assert!(f.control.is_empty("inv_1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quarantined_ticks_are_skipped() {
        let mut f = fixture();
        f.mock.set_offline(7, ModbusError::timeout("mock", 1000));
        for _ in 0..crate::constants::MAX_CONSECUTIVE_ERRORS {
            f.worker.tick().await;
        }
        f.mock.clear_requests();

        assert_eq!(f.worker.tick().await, TickOutcome::Skipped);
        assert_eq!(f.mock.request_count(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        f.mock.set_online(7);
        assert_eq!(f.worker.tick().await, TickOutcome::Published(SnapshotStatus::Ok));
        // probe, then the block read
        assert_eq!(f.mock.request_count(), 2);
    }

    #[tokio::test]
    async fn test_transport_closed_is_reported() {
        let f = fixture();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut worker = f.worker.with_fatal_channel(tx);
        f.mock.break_link();

        assert_eq!(worker.tick().await, TickOutcome::Fatal);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.device, "inv_1");
        assert_eq!(event.bus, "rs485");
        assert_eq!(event.error, ModbusError::TransportClosed);
    }

    #[tokio::test]
    async fn test_command_on_closed_link_publishes_error_snapshot() {
        let mut f = fixture();
        f.control
            .enqueue(ControlCommand::new("inv_1", CommandKind::TurnOn, None, Priority::Normal))
            .unwrap();
        f.mock.break_link();

        assert_eq!(f.worker.tick().await, TickOutcome::Fatal);
        let latest = f.bus.latest_for("inv_1").unwrap();
        assert_eq!(latest.status, SnapshotStatus::Error);
        assert_eq!(latest.sequence, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_stamped_between_command_writes() {
        let f = fixture();
        f.mock.set_delay(Duration::from_millis(1000));
        f.mock.set_offline(7, ModbusError::timeout("mock", 1000));
        for _ in 0..3 {
            f.control
                .enqueue(ControlCommand::new("inv_1", CommandKind::TurnOn, None, Priority::Normal))
                .unwrap();
        }
        let heartbeat = f.worker.heartbeat();
        let handle = tokio::spawn(f.worker.run());

        // each write burns four attempts of one second plus backoff
        let mut oldest = Duration::ZERO;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            oldest = oldest.max(heartbeat.age());
        }
        f.stop.set();
        handle.await.unwrap();

        assert!(f.mock.request_count() >= 12);
        assert!(oldest < Duration::from_millis(5000), "heartbeat aged {oldest:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_stopped() {
        let f = fixture();
        let heartbeat = f.worker.heartbeat();
        let handle = tokio::spawn(f.worker.run());

        tokio::time::sleep(Duration::from_millis(1200)).await;
        f.stop.set();
        let report = handle.await.unwrap();

        // ticks at 0, 500 and 1000 ms
        assert_eq!(report.ticks, 3);
        assert_eq!(report.published, 3);
        assert!(heartbeat.age() < Duration::from_millis(500));
    }
}
