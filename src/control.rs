//! # Control Command Queue
//!
//! Pending writes, sharded by target device so one busy device never holds
//! back another. Each shard is a bounded priority queue:
//!
//! - served `emergency > high > normal`, FIFO within a level;
//! - on overflow an `emergency` command evicts the oldest `normal` one;
//!   anything else is rejected with `QueueFull`.
//!
//! Commands become register writes through [`resolve_write`], which looks up
//! the command's mapping in the device's register map:
//!
//! | Command | Mapping | Value |
//! |---------|---------|-------|
//! | `turn_on` | `run_state` | 1 |
//! | `turn_off` | `run_state` | 0 |
//! | `set_power_limit_pct` | `power_limit_pct` | payload, 0..=100 |
//! | `reset_alarm` | `alarm_reset` | 1 |
//! | `emergency_stop` | `emergency_stop` | 1 |

use std::collections::{HashMap, VecDeque};
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec::BusOp;
use crate::error::{GatewayError, GatewayResult};
use crate::register_map::RegisterMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    TurnOn,
    TurnOff,
    SetPowerLimitPct,
    ResetAlarm,
    EmergencyStop,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TurnOn => "turn_on",
            Self::TurnOff => "turn_off",
            Self::SetPowerLimitPct => "set_power_limit_pct",
            Self::ResetAlarm => "reset_alarm",
            Self::EmergencyStop => "emergency_stop",
        }
    }

    /// Register mapping the command writes to
    pub fn mapping_name(&self) -> &'static str {
        match self {
            Self::TurnOn | Self::TurnOff => "run_state",
            Self::SetPowerLimitPct => "power_limit_pct",
            Self::ResetAlarm => "alarm_reset",
            Self::EmergencyStop => "emergency_stop",
        }
    }

    pub fn default_priority(&self) -> Priority {
        match self {
            Self::EmergencyStop => Priority::Emergency,
            _ => Priority::Normal,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command priority; ordering follows service order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
    Emergency,
}

impl Priority {
    #[inline]
    fn level(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlCommand {
    pub target_device: String,
    pub kind: CommandKind,
    pub payload: Option<f64>,
    pub priority: Priority,
    pub enqueued_at: Instant,
}

impl ControlCommand {
    pub fn new(
        target_device: impl Into<String>,
        kind: CommandKind,
        payload: Option<f64>,
        priority: Priority,
    ) -> Self {
        Self {
            target_device: target_device.into(),
            kind,
            payload,
            priority,
            enqueued_at: Instant::now(),
        }
    }
}

/// Pending commands of one device, one FIFO per priority level
#[derive(Debug, Default)]
struct Shard {
    levels: [VecDeque<ControlCommand>; 3],
}

impl Shard {
    fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    fn pop(&mut self) -> Option<ControlCommand> {
        self.levels.iter_mut().rev().find_map(VecDeque::pop_front)
    }
}

/// Bounded, per-device sharded priority queue
pub struct ControlQueue {
    shards: HashMap<String, Mutex<Shard>>,
    capacity: usize,
}

impl ControlQueue {
    /// One shard per device name; `capacity` bounds each shard.
    pub fn new<I, S>(devices: I, capacity: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            shards: devices
                .into_iter()
                .map(|name| (name.into(), Mutex::new(Shard::default())))
                .collect(),
            capacity,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains_device(&self, device: &str) -> bool {
        self.shards.contains_key(device)
    }

    pub fn enqueue(&self, command: ControlCommand) -> GatewayResult<()> {
        let shard = self
            .shards
            .get(&command.target_device)
            .ok_or_else(|| GatewayError::UnknownDevice(command.target_device.clone()))?;
        let mut shard = shard.lock();

        if shard.len() >= self.capacity {
            let evicted = match command.priority {
                Priority::Emergency => shard.levels[Priority::Normal.level()].pop_front(),
                Priority::High | Priority::Normal => None,
            };
            match evicted {
                Some(evicted) => warn!(
                    device = %command.target_device,
                    evicted = %evicted.kind,
                    "control queue full, dropped oldest normal command"
                ),
                None => {
                    return Err(GatewayError::QueueFull {
                        device: command.target_device,
                    })
                }
            }
        }

        debug!(
            device = %command.target_device,
            command = %command.kind,
            priority = ?command.priority,
            "command enqueued"
        );
        shard.levels[command.priority.level()].push_back(command);
        Ok(())
    }

    /// Highest-priority pending command of `device`
    pub fn pop(&self, device: &str) -> Option<ControlCommand> {
        self.shards.get(device)?.lock().pop()
    }

    /// Remove every pending command of `device` in service order
    pub fn drain(&self, device: &str) -> Vec<ControlCommand> {
        let Some(shard) = self.shards.get(device) else {
            return Vec::new();
        };
        let mut shard = shard.lock();
        let mut drained = Vec::with_capacity(shard.len());
        while let Some(command) = shard.pop() {
            drained.push(command);
        }
        drained
    }

    pub fn len(&self, device: &str) -> usize {
        self.shards.get(device).map_or(0, |shard| shard.lock().len())
    }

    pub fn is_empty(&self, device: &str) -> bool {
        self.len(device) == 0
    }

    pub fn total_len(&self) -> usize {
        self.shards.values().map(|shard| shard.lock().len()).sum()
    }
}

/// Turn a command into the register write for its device.
pub fn resolve_write(map: &RegisterMap, command: &ControlCommand) -> GatewayResult<BusOp> {
    let value = match command.kind {
        CommandKind::TurnOn | CommandKind::ResetAlarm | CommandKind::EmergencyStop => 1.0,
        CommandKind::TurnOff => 0.0,
        CommandKind::SetPowerLimitPct => {
            let pct = command.payload.ok_or_else(|| {
                GatewayError::MalformedCommand("set_power_limit_pct requires a value".to_string())
            })?;
            if !(0.0..=100.0).contains(&pct) {
                return Err(GatewayError::OutOfRange {
                    name: CommandKind::SetPowerLimitPct.mapping_name().to_string(),
                    value: pct,
                    data_type: "percent",
                });
            }
            pct
        }
    };
    Ok(map.encode(command.kind.mapping_name(), value)?.into_op())
}

// ============================================================================
// Control intake
// ============================================================================

#[derive(Debug, Deserialize)]
struct ControlEnvelope {
    device_id: String,
    data: ControlData,
}

#[derive(Debug, Deserialize)]
struct ControlData {
    command: CommandKind,
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    priority: Option<Priority>,
}

/// Parse one intake message into a command.
///
/// ```rust
/// use voltage_gateway::control::{parse_control_envelope, CommandKind, Priority};
///
/// let cmd = parse_control_envelope(
///     br#"{"device_id":"inv_1","data":{"command":"emergency_stop"}}"#,
/// )
/// .unwrap();
/// assert_eq!(cmd.kind, CommandKind::EmergencyStop);
/// assert_eq!(cmd.priority, Priority::Emergency);
/// ```
pub fn parse_control_envelope(payload: &[u8]) -> GatewayResult<ControlCommand> {
    let envelope: ControlEnvelope = serde_json::from_slice(payload)
        .map_err(|err| GatewayError::MalformedCommand(err.to_string()))?;
    let data = envelope.data;
    Ok(ControlCommand::new(
        envelope.device_id,
        data.command,
        data.value,
        data.priority.unwrap_or_else(|| data.command.default_priority()),
    ))
}
