//! Optional subscriber setup for applications embedding the engine.
//!
//! The level filter is taken from the `GRAFT_LOG` environment variable, using
//! the usual `tracing` directive syntax (e.g. `graft=debug`), and defaults to
//! `info`.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

pub const ENV_VAR: &str = "GRAFT_LOG";

/// Installs a global subscriber writing to stderr. Fails if one is already
/// installed.
pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env(ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!(e.to_string()))
}
