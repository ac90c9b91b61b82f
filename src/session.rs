//! # Device Session
//!
//! Per-device view of a shared bus: it targets the device's slave id on
//! every transaction and tracks consecutive failures.
//!
//! ```text
//!            5 consecutive failures
//!   Active ---------------------------> Quarantined { cooldown = 2 s }
//!     ^                                   |     |
//!     |        probe succeeds             |     | probe fails:
//!     +-----------------------------------+     | cooldown = min(2 x cooldown, 60 s)
//!                                               v
//! ```
//!
//! While quarantined no request for the device reaches the bus until the
//! cooldown elapses; the first transaction afterwards is a single-register
//! probe without retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::arbiter::BusArbiter;
use crate::codec::{BusOp, BusReply};
use crate::constants::*;
use crate::device::DeviceDescriptor;
use crate::error::ModbusResult;
use crate::transport::ModbusTransport;

/// Connection state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Quarantined { until: Instant, cooldown: Duration },
}

/// What the worker should do on this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    Poll,
    /// Cooldown elapsed: send one probe before polling again
    Probe,
    /// Still cooling down for the given time
    Skip(Duration),
}

pub struct DeviceSession<T> {
    descriptor: Arc<DeviceDescriptor>,
    arbiter: Arc<BusArbiter<T>>,
    consecutive_errors: u32,
    state: SessionState,
}

impl<T: ModbusTransport> DeviceSession<T> {
    pub fn new(descriptor: Arc<DeviceDescriptor>, arbiter: Arc<BusArbiter<T>>) -> Self {
        Self {
            descriptor,
            arbiter,
            consecutive_errors: 0,
            state: SessionState::Active,
        }
    }

    #[inline]
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    #[inline]
    pub fn arbiter(&self) -> &Arc<BusArbiter<T>> {
        &self.arbiter
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[inline]
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    #[inline]
    pub fn is_quarantined(&self) -> bool {
        matches!(self.state, SessionState::Quarantined { .. })
    }

    pub fn should_poll(&self, now: Instant) -> PollDecision {
        match self.state {
            SessionState::Active => PollDecision::Poll,
            SessionState::Quarantined { until, .. } if now < until => {
                PollDecision::Skip(until - now)
            }
            SessionState::Quarantined { .. } => PollDecision::Probe,
        }
    }

    /// Run `op` against this device with the bus retry policy.
    pub async fn transact(&mut self, op: &BusOp) -> ModbusResult<BusReply> {
        let result = self.arbiter.transact(self.descriptor.slave_id, op).await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }

    /// Read the whole register block of the device's map
    pub async fn read_block(&mut self) -> ModbusResult<Vec<u16>> {
        let op = self.descriptor.register_map.read_op();
        self.transact(&op).await?.into_registers()
    }

    /// One single-register read without retries.
    ///
    /// Success restores `Active`; failure doubles the cooldown.
    pub async fn probe(&mut self) -> ModbusResult<()> {
        let op = self.descriptor.register_map.probe_op();
        let result = self
            .arbiter
            .transact_with_retries(self.descriptor.slave_id, &op, 0)
            .await;
        match result {
            Ok(_) => {
                self.record_success();
                Ok(())
            }
            Err(err) => {
                self.consecutive_errors = self.consecutive_errors.saturating_add(1);
                let cooldown = match self.state {
                    SessionState::Quarantined { cooldown, .. } => (cooldown * 2)
                        .min(Duration::from_millis(QUARANTINE_MAX_COOLDOWN_MS)),
                    SessionState::Active => Duration::from_millis(QUARANTINE_INITIAL_COOLDOWN_MS),
                };
                warn!(
                    device = %self.descriptor.name,
                    error = %err,
                    cooldown_ms = cooldown.as_millis() as u64,
                    "probe failed, device stays quarantined"
                );
                self.state = SessionState::Quarantined {
                    until: Instant::now() + cooldown,
                    cooldown,
                };
                Err(err)
            }
        }
    }

    fn record_success(&mut self) {
        self.consecutive_errors = 0;
        if self.is_quarantined() {
            info!(device = %self.descriptor.name, "device back online");
        }
        self.state = SessionState::Active;
    }

    fn record_failure(&mut self) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        if self.state == SessionState::Active && self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS
        {
            let cooldown = Duration::from_millis(QUARANTINE_INITIAL_COOLDOWN_MS);
            warn!(
                device = %self.descriptor.name,
                slave_id = self.descriptor.slave_id,
                failures = self.consecutive_errors,
                cooldown_ms = cooldown.as_millis() as u64,
                "device quarantined"
            );
            self.state = SessionState::Quarantined {
                until: Instant::now() + cooldown,
                cooldown,
            };
        }
    }
}
