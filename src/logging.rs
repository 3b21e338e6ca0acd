//! Log subscriber setup shared by the daemon and the simulator.

use crate::error::VdaError;
use crate::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Map a numeric debug level (0 = errors only) to a filter directive.
pub fn level_for_debug(debug_level: u8) -> &'static str {
    match debug_level {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
pub fn init(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| VdaError::Config(format!("Failed to init logging: {}", e)))
}
