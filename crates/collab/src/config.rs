use std::time::Duration;

use cowork_core::collaboration::{
    DEFAULT_LEASE_DURATION_SECS, DEFAULT_LEASE_HEARTBEAT_SECS, DEFAULT_PRESENCE_HEARTBEAT_SECS,
    DEFAULT_PRESENCE_TTL_SECS, DEFAULT_SUBSCRIPTION_RECHECK_SECS,
};
use cowork_core::types::UserId;
use cowork_core::CoreError;

/// Timing and authorization settings for the coordinator.
///
/// Every participant sharing a store must use the same lease duration and
/// presence TTL, since readers judge liveness against them.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Lifetime of a lease from its last renewal (default: 300s).
    pub lease_duration: Duration,
    /// Interval between lease renewals (default: 60s).
    pub lease_heartbeat: Duration,
    /// Age after which a presence record counts as stale (default: 30s).
    pub presence_ttl: Duration,
    /// Interval between presence refreshes (default: 15s).
    pub presence_heartbeat: Duration,
    /// How often derived subscriptions re-evaluate expiry (default: 5s).
    pub subscription_recheck: Duration,
    /// User ids allowed to force-release another user's lease.
    pub admin_ids: Vec<UserId>,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(DEFAULT_LEASE_DURATION_SECS),
            lease_heartbeat: Duration::from_secs(DEFAULT_LEASE_HEARTBEAT_SECS),
            presence_ttl: Duration::from_secs(DEFAULT_PRESENCE_TTL_SECS),
            presence_heartbeat: Duration::from_secs(DEFAULT_PRESENCE_HEARTBEAT_SECS),
            subscription_recheck: Duration::from_secs(DEFAULT_SUBSCRIPTION_RECHECK_SECS),
            admin_ids: Vec::new(),
        }
    }
}

impl CollabConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default |
    /// |-----------------------------|---------|
    /// | `LEASE_DURATION_SECS`       | `300`   |
    /// | `LEASE_HEARTBEAT_SECS`      | `60`    |
    /// | `PRESENCE_TTL_SECS`         | `30`    |
    /// | `PRESENCE_HEARTBEAT_SECS`   | `15`    |
    /// | `SUBSCRIPTION_RECHECK_SECS` | `5`     |
    /// | `LOCK_ADMIN_IDS`            | (empty) |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secs = |name: &str, default: u64| -> Result<Duration, CoreError> {
            match lookup(name) {
                None => Ok(Duration::from_secs(default)),
                Some(raw) => raw.trim().parse::<u64>().map(Duration::from_secs).map_err(|_| {
                    CoreError::Validation(format!("{name} must be a whole number of seconds, got {raw:?}"))
                }),
            }
        };

        let admin_ids = lookup("LOCK_ADMIN_IDS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let config = Self {
            lease_duration: secs("LEASE_DURATION_SECS", DEFAULT_LEASE_DURATION_SECS)?,
            lease_heartbeat: secs("LEASE_HEARTBEAT_SECS", DEFAULT_LEASE_HEARTBEAT_SECS)?,
            presence_ttl: secs("PRESENCE_TTL_SECS", DEFAULT_PRESENCE_TTL_SECS)?,
            presence_heartbeat: secs("PRESENCE_HEARTBEAT_SECS", DEFAULT_PRESENCE_HEARTBEAT_SECS)?,
            subscription_recheck: secs(
                "SUBSCRIPTION_RECHECK_SECS",
                DEFAULT_SUBSCRIPTION_RECHECK_SECS,
            )?,
            admin_ids,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject timings under which a live owner could lose its lease.
    ///
    /// A lease must survive at least one missed heartbeat, and a presence
    /// record must be refreshed before it goes stale.
    pub fn validate(&self) -> Result<(), CoreError> {
        let named = [
            ("lease_duration", self.lease_duration),
            ("lease_heartbeat", self.lease_heartbeat),
            ("presence_ttl", self.presence_ttl),
            ("presence_heartbeat", self.presence_heartbeat),
            ("subscription_recheck", self.subscription_recheck),
        ];
        for (name, value) in named {
            if value.is_zero() {
                return Err(CoreError::Validation(format!("{name} must be greater than zero")));
            }
        }
        if self.lease_heartbeat * 2 > self.lease_duration {
            return Err(CoreError::Validation(
                "lease_heartbeat must be at most half of lease_duration".into(),
            ));
        }
        if self.presence_heartbeat >= self.presence_ttl {
            return Err(CoreError::Validation(
                "presence_heartbeat must be shorter than presence_ttl".into(),
            ));
        }
        Ok(())
    }

    pub fn lease_span(&self) -> chrono::Duration {
        to_chrono(self.lease_duration)
    }

    pub fn presence_span(&self) -> chrono::Duration {
        to_chrono(self.presence_ttl)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
