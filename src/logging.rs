//! Logging setup for binaries and tests embedding the store.

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Result, StoreError};

/// Installs a global `tracing` subscriber filtered by `level` (an `EnvFilter` directive).
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| StoreError::InvalidArgument(format!("Invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| StoreError::InvalidArgument("Logging already initialized".into()))
}
