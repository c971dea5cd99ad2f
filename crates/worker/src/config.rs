use std::time::Duration;

use cowork_collab::CollabConfig;
use cowork_core::CoreError;

/// Default sweep cadence.
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub sweep_interval: Duration,
    /// Shared timing settings; the sweeper uses the presence TTL.
    pub collab: CollabConfig,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var               | Default      |
    /// |-----------------------|--------------|
    /// | `DATABASE_URL`        | (required)   |
    /// | `SWEEP_INTERVAL_SECS` | `60`         |
    ///
    /// plus everything read by [`CollabConfig::from_env`].
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| CoreError::Validation("DATABASE_URL must be set".into()))?;

        let sweep_interval_secs = match lookup("SWEEP_INTERVAL_SECS") {
            None => DEFAULT_SWEEP_INTERVAL_SECS,
            Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
                CoreError::Validation(format!("SWEEP_INTERVAL_SECS must be a whole number, got {raw:?}"))
            })?,
        };
        if sweep_interval_secs == 0 {
            return Err(CoreError::Validation(
                "SWEEP_INTERVAL_SECS must be greater than zero".into(),
            ));
        }

        Ok(Self {
            database_url,
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            collab: CollabConfig::from_lookup(&lookup)?,
        })
    }
}
