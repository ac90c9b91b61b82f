//! # Supervisor
//!
//! Opens the buses, starts one polling worker per device plus the safety
//! loop, the transport bridge and the optional control intake, then watches
//! them until shutdown.
//!
//! ```text
//!                 +--------------------+
//!   shutdown ---> |     Supervisor     | <--- FatalEvent (TransportClosed)
//!                 +--------------------+
//!                   |  StopFlag   |  heartbeats / status report (5 s)
//!        +----------+------+------+------------+
//!        v                 v                   v
//!   PollingWorker x N   Safety loop      Transport bridge
//!        |                 |                   ^
//!        v                 v                   |
//!   BusArbiter        ControlQueue       MeasurementBus
//! ```
//!
//! Shutdown order: stop flag, workers (bounded wait, then abort), bus
//! arbiters, measurement bus, then the remaining loops. The exit code is 0
//! for a requested shutdown, 2 for an unrecoverable bus error and 3 when a
//! worker stopped making progress.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::arbiter::BusArbiter;
use crate::config::{BusConfig, BusTransportConfig, ValidatedConfig};
use crate::constants::STATUS_REPORT_INTERVAL_MS;
use crate::control::{parse_control_envelope, ControlQueue};
use crate::device::DeviceDescriptor;
use crate::error::{GatewayError, GatewayResult};
use crate::measurement_bus::{spawn_bridge, MeasurementBus, TracingSink, TransportSink};
use crate::safety::{run_safety_loop, SafetyEngine};
use crate::session::DeviceSession;
use crate::snapshot::SnapshotStatus;
use crate::transport::{AnyTransport, TcpTransport};
use crate::worker::{FatalEvent, Heartbeat, PollingWorker, WorkerReport};

// ============================================================================
// Stop flag
// ============================================================================

struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

/// Monotonic shutdown signal shared by every task. Once set it stays set.
#[derive(Clone)]
pub struct StopFlag(Arc<StopInner>);

impl StopFlag {
    pub fn new() -> Self {
        Self(Arc::new(StopInner {
            stopped: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    pub fn set(&self) {
        if !self.0.stopped.swap(true, Ordering::AcqRel) {
            self.0.notify.notify_waiters();
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.stopped.load(Ordering::Acquire)
    }

    /// Resolves once the flag is set
    pub async fn wait(&self) {
        let notified = self.0.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_set() {
            return;
        }
        notified.await;
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Bus opening
// ============================================================================

/// Opens the transport of a configured bus
pub trait BusConnector: Send + Sync + 'static {
    fn open(&self, bus: &BusConfig) -> impl Future<Output = GatewayResult<AnyTransport>> + Send;
}

/// TCP connections, and serial ports when built with the `rtu` feature
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

impl BusConnector for DefaultConnector {
    async fn open(&self, bus: &BusConfig) -> GatewayResult<AnyTransport> {
        match &bus.transport {
            BusTransportConfig::Tcp { host, port } => {
                TcpTransport::connect(host, *port, bus.timeouts())
                    .await
                    .map(AnyTransport::Tcp)
                    .map_err(|e| GatewayError::open_failed(&bus.name, e.to_string()))
            }
            #[cfg(feature = "rtu")]
            BusTransportConfig::Rtu(serial) => crate::transport::open_serial(serial, bus.timeouts())
                .map(AnyTransport::Rtu)
                .map_err(|e| GatewayError::open_failed(&bus.name, e.to_string())),
            #[cfg(not(feature = "rtu"))]
            BusTransportConfig::Rtu(serial) => Err(GatewayError::open_failed(
                &bus.name,
                format!("{}: built without the `rtu` feature", serial.path),
            )),
        }
    }
}

// ============================================================================
// Exit status
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayExit {
    pub code: i32,
    pub reason: String,
}

impl GatewayExit {
    pub fn graceful() -> Self {
        Self {
            code: 0,
            reason: "shutdown requested".to_string(),
        }
    }

    pub fn from_error(err: &GatewayError) -> Self {
        Self {
            code: err.exit_code(),
            reason: err.to_string(),
        }
    }

    #[inline]
    pub fn is_graceful(&self) -> bool {
        self.code == 0
    }
}

// ============================================================================
// Supervisor
// ============================================================================

pub struct Supervisor<C = DefaultConnector> {
    config: ValidatedConfig,
    connector: C,
    sink: Arc<dyn TransportSink>,
    intake: Option<mpsc::Receiver<Bytes>>,
}

impl Supervisor {
    pub fn new(config: ValidatedConfig) -> Self {
        Self {
            config,
            connector: DefaultConnector,
            sink: Arc::new(TracingSink),
            intake: None,
        }
    }
}

impl<C: BusConnector> Supervisor<C> {
    pub fn with_connector<D: BusConnector>(self, connector: D) -> Supervisor<D> {
        Supervisor {
            config: self.config,
            connector,
            sink: self.sink,
            intake: self.intake,
        }
    }

    /// Downstream sink the bridge forwards snapshots to
    pub fn with_sink(mut self, sink: Arc<dyn TransportSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Control intake: each payload is one JSON command envelope
    pub fn with_intake(mut self, intake: mpsc::Receiver<Bytes>) -> Self {
        self.intake = Some(intake);
        self
    }

    /// Start, then supervise until `shutdown` resolves or a fatal condition.
    pub async fn run<F>(self, shutdown: F) -> GatewayExit
    where
        F: Future<Output = ()>,
    {
        match self.start().await {
            Ok(running) => running.run_until(shutdown).await,
            Err(err) => {
                error!(error = %err, "gateway failed to start");
                GatewayExit::from_error(&err)
            }
        }
    }

    /// Open the buses and spawn every task.
    ///
    /// A bus that fails to open is skipped together with its devices; if no
    /// bus opens the error is returned.
    pub async fn start(self) -> GatewayResult<RunningGateway> {
        let Self {
            config,
            connector,
            sink,
            intake,
        } = self;

        let mut arbiters = Vec::new();
        let mut last_error = None;
        for bus in &config.buses {
            let device_count = config.devices_on(&bus.name).count();
            if device_count == 0 {
                info!(bus = %bus.name, "no devices on bus, not opened");
                continue;
            }
            match connector.open(bus).await {
                Ok(transport) => {
                    info!(bus = %bus.name, devices = device_count, "bus opened");
                    let arbiter = Arc::new(BusArbiter::new(bus.name.clone(), transport, bus.timeouts()));
                    arbiters.push((arbiter, device_count));
                }
                Err(err) => {
                    error!(bus = %bus.name, error = %err, "bus failed to open, its devices are not started");
                    last_error = Some(err);
                }
            }
        }
        if arbiters.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                GatewayError::open_failed("*", "no bus could be opened")
            }));
        }

        let devices: Vec<Arc<DeviceDescriptor>> = config
            .devices
            .iter()
            .filter(|d| arbiters.iter().any(|(a, _)| a.name() == d.bus))
            .cloned()
            .collect();

        let stop = StopFlag::new();
        let bus = Arc::new(MeasurementBus::new(config.subscriber_capacity));
        let control = Arc::new(ControlQueue::new(
            devices.iter().map(|d| d.name.clone()),
            config.queue_capacity,
        ));
        let bridge = spawn_bridge(&bus, sink)?;
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let mut workers = Vec::with_capacity(devices.len());
        let mut shutdown_bound = Duration::ZERO;
        for (arbiter, device_count) in &arbiters {
            let bus_bound = arbiter.retry_policy().worst_case(&arbiter.timeouts()) * *device_count as u32;
            shutdown_bound = shutdown_bound.max(bus_bound);

            for descriptor in devices.iter().filter(|d| d.bus == arbiter.name()) {
                let session = DeviceSession::new(Arc::clone(descriptor), Arc::clone(arbiter));
                let worker = PollingWorker::new(
                    session,
                    Arc::clone(&bus),
                    Arc::clone(&control),
                    stop.clone(),
                )
                .with_fatal_channel(fatal_tx.clone());
                let heartbeat = worker.heartbeat();
                workers.push(WorkerHandle {
                    device: Arc::clone(descriptor),
                    heartbeat,
                    stall_bound: (descriptor.poll_interval + bus_bound) * 2,
                    handle: tokio::spawn(worker.run()),
                });
            }
        }
        drop(fatal_tx);

        let engine = SafetyEngine::new(
            &config.safety,
            devices.iter().map(|d| (d.name.clone(), d.kind)),
        );
        let safety = tokio::spawn(run_safety_loop(
            engine,
            Arc::clone(&bus),
            Arc::clone(&control),
            stop.clone(),
            config.safety.period(),
        ));
        let intake = intake.map(|rx| {
            tokio::spawn(run_intake(rx, Arc::clone(&control), stop.clone()))
        });

        info!(
            buses = arbiters.len(),
            devices = devices.len(),
            "gateway started"
        );
        Ok(RunningGateway {
            config,
            stop,
            bus,
            control,
            arbiters: arbiters.into_iter().map(|(a, _)| a).collect(),
            workers,
            safety,
            bridge,
            intake,
            fatal_rx,
            shutdown_bound,
        })
    }
}

struct WorkerHandle {
    device: Arc<DeviceDescriptor>,
    heartbeat: Arc<Heartbeat>,
    /// Heartbeat age beyond which the worker is considered stuck
    stall_bound: Duration,
    handle: JoinHandle<WorkerReport>,
}

/// A started gateway
pub struct RunningGateway {
    config: ValidatedConfig,
    stop: StopFlag,
    bus: Arc<MeasurementBus>,
    control: Arc<ControlQueue>,
    arbiters: Vec<Arc<BusArbiter<AnyTransport>>>,
    workers: Vec<WorkerHandle>,
    safety: JoinHandle<()>,
    bridge: JoinHandle<()>,
    intake: Option<JoinHandle<()>>,
    fatal_rx: mpsc::UnboundedReceiver<FatalEvent>,
    shutdown_bound: Duration,
}

impl RunningGateway {
    pub fn measurement_bus(&self) -> &Arc<MeasurementBus> {
        &self.bus
    }

    pub fn control_queue(&self) -> &Arc<ControlQueue> {
        &self.control
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Names of the devices whose workers were started
    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().map(|w| w.device.name.as_str())
    }

    /// Supervise until `shutdown` resolves, a bus fails or a worker stalls,
    /// then shut down gracefully.
    pub async fn run_until<F>(mut self, shutdown: F) -> GatewayExit
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut status = interval(Duration::from_millis(STATUS_REPORT_INTERVAL_MS));
        status.set_missed_tick_behavior(MissedTickBehavior::Skip);
        status.tick().await;

        let exit = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break GatewayExit::graceful();
                }
                Some(event) = self.fatal_rx.recv() => {
                    let err = GatewayError::Bus(event.error);
                    error!(bus = %event.bus, device = %event.device, error = %err, "unrecoverable bus error");
                    break GatewayExit::from_error(&err);
                }
                _ = status.tick() => {
                    self.report_status();
                    if let Err(err) = self.check_heartbeats() {
                        error!(error = %err, "worker stalled");
                        break GatewayExit::from_error(&err);
                    }
                }
            }
        };

        self.shutdown().await;
        info!(code = exit.code, reason = %exit.reason, "gateway stopped");
        exit
    }

    fn check_heartbeats(&self) -> GatewayResult<()> {
        for worker in self.workers.iter().filter(|w| !w.handle.is_finished()) {
            let age = worker.heartbeat.age();
            if age > worker.stall_bound {
                return Err(GatewayError::Deadlock(format!(
                    "worker '{}' silent for {} ms (limit {} ms)",
                    worker.device.name,
                    age.as_millis(),
                    worker.stall_bound.as_millis()
                )));
            }
        }
        Ok(())
    }

    fn report_status(&self) {
        let latest = self.bus.latest();
        let stale_after = Duration::from_millis(self.config.safety.stale_after_ms);
        let power_name = &self.config.safety.power_measurement;
        let mut online = 0usize;
        let mut inverter_power = 0.0;

        for worker in &self.workers {
            let device = &worker.device;
            match latest.get(&device.name) {
                Some(snapshot) => {
                    let age = snapshot.captured_at.elapsed();
                    let fresh = age <= stale_after && snapshot.status != SnapshotStatus::Error;
                    if fresh {
                        online += 1;
                        if device.is_inverter() {
                            inverter_power += snapshot.values.get(power_name).unwrap_or(0.0);
                        }
                    }
                    debug!(
                        device = %device.name,
                        status = snapshot.status.as_str(),
                        sequence = snapshot.sequence,
                        age_ms = age.as_millis() as u64,
                        pending_commands = self.control.len(&device.name),
                        "device status"
                    );
                }
                None => debug!(device = %device.name, "device status: no snapshot yet"),
            }
        }

        for arbiter in &self.arbiters {
            let stats = arbiter.try_stats();
            debug!(
                bus = %arbiter.name(),
                transactions = stats.transactions,
                failures = stats.failures,
                retries = stats.retries,
                exceptions = stats.exceptions,
                closed = arbiter.is_closed(),
                "bus status"
            );
        }

        info!(
            online,
            devices = self.workers.len(),
            inverter_power_w = inverter_power,
            published = self.bus.published(),
            "system status"
        );
    }

    async fn shutdown(self) {
        self.stop.set();
        let deadline = Instant::now() + self.shutdown_bound;

        let mut reports: HashMap<String, WorkerReport> = HashMap::new();
        for mut worker in self.workers {
            match timeout_at(deadline, &mut worker.handle).await {
                Ok(Ok(report)) => {
                    reports.insert(report.device.clone(), report);
                }
                Ok(Err(err)) => error!(device = %worker.device.name, error = %err, "worker panicked"),
                Err(_) => {
                    warn!(device = %worker.device.name, "worker did not stop in time, aborting");
                    worker.handle.abort();
                    let _ = worker.handle.await;
                }
            }
        }
        debug!(stopped = reports.len(), "workers joined");

        for arbiter in &self.arbiters {
            if let Err(err) = arbiter.close().await {
                warn!(bus = %arbiter.name(), error = %err, "bus close failed");
            }
        }
        self.bus.close();

        if let Err(err) = self.safety.await {
            error!(error = %err, "safety loop panicked");
        }
        if let Err(err) = self.bridge.await {
            error!(error = %err, "transport bridge panicked");
        }
        if let Some(intake) = self.intake {
            if let Err(err) = intake.await {
                error!(error = %err, "control intake panicked");
            }
        }
    }
}

/// Parse intake payloads and enqueue them until stopped or the sender goes
/// away. Bad payloads are logged and dropped.
async fn run_intake(mut rx: mpsc::Receiver<Bytes>, queue: Arc<ControlQueue>, stop: StopFlag) {
    loop {
        let payload = tokio::select! {
            biased;
            _ = stop.wait() => break,
            payload = rx.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        match parse_control_envelope(&payload).and_then(|command| queue.enqueue(command)) {
            Ok(()) => {}
            Err(err) => warn!(error = %err, "control message dropped"),
        }
    }
    debug!("control intake stopped");
}
