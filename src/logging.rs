//! Logging setup
//!
//! Library code only emits `tracing` events. The binary (or an embedding
//! application) installs a subscriber once through [`init`]; `RUST_LOG`
//! overrides the configured level.
//!
//! Raw frames are logged at `trace` level through [`HexFrame`], which only
//! formats when the event is actually recorded.

use std::fmt;

use serde::Deserialize;
use tracing_subscriber::{fmt as subscriber_fmt, EnvFilter};

/// Logging section of the gateway configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, e.g. `info` or `voltage_gateway=debug`
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed (tests, embedding
/// applications); that is not an error.
pub fn init(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = subscriber_fmt().with_env_filter(filter).with_target(true);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.is_ok()
}

/// Space-separated hex rendering of a frame
pub struct HexFrame<'a>(pub &'a [u8]);

impl fmt::Display for HexFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}
