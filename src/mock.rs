//! Scripted in-memory transport
//!
//! [`MockTransport`] simulates a bus full of devices: each slave has a
//! register bank that reads return and writes update. Failures are injected
//! either as one-shot scripted replies or as a persistent "offline" error per
//! slave. Every exchange is recorded with its start and end instant, which
//! lets tests check ordering and that frames never overlap.
//!
//! The transport is moved into an arbiter; tests keep a [`MockHandle`] to
//! script and inspect it. [`MockConnector`] hands out mock transports to the
//! supervisor in place of real buses.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::codec::{BusOp, BusReply};
use crate::config::BusConfig;
use crate::error::{GatewayError, GatewayResult, ModbusError, ModbusResult};
use crate::supervisor::BusConnector;
use crate::transport::{AnyTransport, ModbusTransport, TransportStats};

/// One recorded exchange
#[derive(Debug, Clone)]
pub struct WireRecord {
    pub slave_id: u8,
    pub op: BusOp,
    pub started: Instant,
    pub finished: Option<Instant>,
}

#[derive(Default)]
struct MockState {
    script: VecDeque<ModbusResult<BusReply>>,
    per_slave: HashMap<u8, VecDeque<ModbusResult<BusReply>>>,
    offline: HashMap<u8, ModbusError>,
    registers: HashMap<(u8, u16), u16>,
    log: Vec<WireRecord>,
    delay: Duration,
    link_closed: bool,
    in_flight: bool,
    overlapped: bool,
    stats: TransportStats,
}

impl MockState {
    fn respond(&mut self, slave_id: u8, op: &BusOp) -> ModbusResult<BusReply> {
        if self.link_closed {
            return Err(ModbusError::TransportClosed);
        }
        if let Some(step) = self.per_slave.get_mut(&slave_id).and_then(VecDeque::pop_front) {
            return step;
        }
        if let Some(step) = self.script.pop_front() {
            return step;
        }
        if let Some(err) = self.offline.get(&slave_id) {
            return Err(err.clone());
        }
        match op {
            BusOp::ReadRegisters {
                address, quantity, ..
            } => {
                let values = (0..*quantity)
                    .map(|i| {
                        let addr = address.wrapping_add(i);
                        self.registers.get(&(slave_id, addr)).copied().unwrap_or(0)
                    })
                    .collect();
                Ok(BusReply::Registers(values))
            }
            BusOp::WriteSingle { address, value } => {
                self.registers.insert((slave_id, *address), *value);
                Ok(BusReply::Written)
            }
            BusOp::WriteMultiple { address, values } => {
                for (i, value) in values.iter().enumerate() {
                    self.registers
                        .insert((slave_id, address.wrapping_add(i as u16)), *value);
                }
                Ok(BusReply::Written)
            }
        }
    }
}

/// In-memory transport for tests and simulation
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    slave_id: u8,
    silence: Duration,
    connected: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            slave_id: 1,
            silence: Duration::ZERO,
            connected: true,
        }
    }

    /// Require `silence` between frames, like a serial line would
    pub fn with_silence(mut self, silence: Duration) -> Self {
        self.silence = silence;
        self
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ModbusTransport for MockTransport {
    fn select_slave(&mut self, slave_id: u8) {
        self.slave_id = slave_id;
    }

    async fn exchange(&mut self, op: &BusOp) -> ModbusResult<BusReply> {
        if !self.connected {
            return Err(ModbusError::TransportClosed);
        }
        let (index, delay) = {
            let mut state = self.state.lock();
            if state.in_flight {
                state.overlapped = true;
            }
            state.in_flight = true;
            state.stats.requests_sent += 1;
            state.log.push(WireRecord {
                slave_id: self.slave_id,
                op: op.clone(),
                started: Instant::now(),
                finished: None,
            });
            (state.log.len() - 1, state.delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.in_flight = false;
        if let Some(record) = state.log.get_mut(index) {
            record.finished = Some(Instant::now());
        }
        let result = state.respond(self.slave_id, op);
        match &result {
            Ok(_) => state.stats.responses_received += 1,
            Err(err) => {
                state.stats.errors += 1;
                if matches!(err, ModbusError::Timeout { .. }) {
                    state.stats.timeouts += 1;
                }
            }
        }
        result
    }

    fn inter_frame_silence(&self) -> Duration {
        self.silence
    }

    fn is_connected(&self) -> bool {
        self.connected && !self.state.lock().link_closed
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.connected = false;
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.state.lock().stats
    }
}

/// Test-side view of a [`MockTransport`]
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Next exchange on any slave returns `reply`
    pub fn push_reply(&self, reply: ModbusResult<BusReply>) {
        self.state.lock().script.push_back(reply);
    }

    /// Next exchange addressed to `slave_id` returns `reply`
    pub fn push_reply_for(&self, slave_id: u8, reply: ModbusResult<BusReply>) {
        self.state
            .lock()
            .per_slave
            .entry(slave_id)
            .or_default()
            .push_back(reply);
    }

    /// Every unscripted exchange with `slave_id` fails with `err`
    pub fn set_offline(&self, slave_id: u8, err: ModbusError) {
        self.state.lock().offline.insert(slave_id, err);
    }

    pub fn set_online(&self, slave_id: u8) {
        self.state.lock().offline.remove(&slave_id);
    }

    /// Simulate the link going away; every exchange fails with `TransportClosed`
    pub fn break_link(&self) {
        self.state.lock().link_closed = true;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    pub fn set_registers(&self, slave_id: u8, start: u16, values: &[u16]) {
        let mut state = self.state.lock();
        for (i, value) in values.iter().enumerate() {
            state
                .registers
                .insert((slave_id, start.wrapping_add(i as u16)), *value);
        }
    }

    pub fn register(&self, slave_id: u8, address: u16) -> u16 {
        self.state
            .lock()
            .registers
            .get(&(slave_id, address))
            .copied()
            .unwrap_or(0)
    }

    pub fn requests(&self) -> Vec<WireRecord> {
        self.state.lock().log.clone()
    }

    pub fn requests_for(&self, slave_id: u8) -> Vec<WireRecord> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|r| r.slave_id == slave_id)
            .cloned()
            .collect()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().log.len()
    }

    pub fn clear_requests(&self) {
        self.state.lock().log.clear();
    }

    /// True if two exchanges were ever in flight at the same time
    pub fn overlapped(&self) -> bool {
        self.state.lock().overlapped
    }
}

/// [`BusConnector`] that opens a fresh [`MockTransport`] per bus
#[derive(Default)]
pub struct MockConnector {
    handles: MockBusHandles,
    failing: HashSet<String>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opening `bus` fails with `TransportOpenFailed`
    pub fn fail_bus(mut self, bus: impl Into<String>) -> Self {
        self.failing.insert(bus.into());
        self
    }

    /// Handles of the transports opened so far, keyed by bus name
    pub fn handles(&self) -> MockBusHandles {
        self.handles.clone()
    }
}

impl BusConnector for MockConnector {
    async fn open(&self, bus: &BusConfig) -> GatewayResult<AnyTransport> {
        if self.failing.contains(&bus.name) {
            return Err(GatewayError::open_failed(&bus.name, "mock bus unavailable"));
        }
        let transport = MockTransport::new();
        self.handles
            .0
            .lock()
            .insert(bus.name.clone(), transport.handle());
        Ok(AnyTransport::Mock(transport))
    }
}

/// Shared map of bus name to [`MockHandle`]
#[derive(Clone, Default)]
pub struct MockBusHandles(Arc<Mutex<HashMap<String, MockHandle>>>);

impl MockBusHandles {
    pub fn get(&self, bus: &str) -> Option<MockHandle> {
        self.0.lock().get(bus).cloned()
    }
}
