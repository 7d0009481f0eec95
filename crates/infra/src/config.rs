//! Background processor configuration.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key}: cannot parse '{value}': {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("{key}: must be greater than zero")]
    Zero { key: String },
}

/// Worker pool settings for one background processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundProcessorConfig {
    /// Name for logging and stats
    pub name: String,
    /// Number of concurrent worker tasks
    pub worker_count: usize,
    /// Claimed objects waiting for a free worker
    pub queue_capacity: usize,
    /// Sleep when nothing is eligible
    pub poll_interval: Duration,
    /// Lease age after which the sweep reclaims an object
    pub lock_timeout: Duration,
    /// How often the sweep runs
    pub sweep_interval: Duration,
    /// Per-object budget used to size the graceful-stop wait
    pub processing_timeout: Duration,
    /// Lease owner written on every claim; unique per instance
    pub lock_owner: String,
}

impl Default for BackgroundProcessorConfig {
    fn default() -> Self {
        Self::named("leasehold")
    }
}

impl BackgroundProcessorConfig {
    /// Defaults with `name` and a fresh `{name}-{uuid}` lock owner.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            lock_owner: default_owner(&name),
            name,
            worker_count: 4,
            queue_capacity: 16,
            poll_interval: Duration::from_millis(500),
            lock_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            processing_timeout: Duration::from_secs(30),
        }
    }

    /// Keeps an explicitly set lock owner; otherwise derives a new one from `name`.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if self.lock_owner.starts_with(&format!("{}-", self.name)) {
            self.lock_owner = default_owner(&name);
        }
        self.name = name;
        self
    }

    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = owner.into();
        self
    }

    /// Read overrides from `{PREFIX}_*` environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `{PREFIX}_WORKERS` | `worker_count` |
    /// | `{PREFIX}_QUEUE_CAPACITY` | `queue_capacity` |
    /// | `{PREFIX}_POLL_INTERVAL_MS` | `poll_interval` |
    /// | `{PREFIX}_LOCK_TIMEOUT_SECS` | `lock_timeout` |
    /// | `{PREFIX}_SWEEP_INTERVAL_SECS` | `sweep_interval` |
    /// | `{PREFIX}_PROCESSING_TIMEOUT_MS` | `processing_timeout` |
    /// | `{PREFIX}_LOCK_OWNER` | `lock_owner` |
    pub fn from_env(name: impl Into<String>, prefix: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(name, prefix, |key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(name: impl Into<String>, prefix: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::named(name);
        let key = |suffix: &str| format!("{prefix}_{suffix}");

        if let Some(n) = positive(&lookup, &key("WORKERS"))? {
            config.worker_count = n as usize;
        }
        if let Some(n) = positive(&lookup, &key("QUEUE_CAPACITY"))? {
            config.queue_capacity = n as usize;
        }
        if let Some(ms) = positive(&lookup, &key("POLL_INTERVAL_MS"))? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = positive(&lookup, &key("LOCK_TIMEOUT_SECS"))? {
            config.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = positive(&lookup, &key("SWEEP_INTERVAL_SECS"))? {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = positive(&lookup, &key("PROCESSING_TIMEOUT_MS"))? {
            config.processing_timeout = Duration::from_millis(ms);
        }
        if let Some(owner) = lookup(&key("LOCK_OWNER")).filter(|o| !o.trim().is_empty()) {
            config.lock_owner = owner.trim().to_string();
        }

        Ok(config)
    }
}

fn default_owner(name: &str) -> String {
    format!("{name}-{}", Uuid::now_v7())
}

fn positive<F>(lookup: &F, key: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };

    let value: u64 = raw.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
        key: key.to_string(),
        value: raw.clone(),
        reason: e.to_string(),
    })?;

    if value == 0 {
        return Err(ConfigError::Zero {
            key: key.to_string(),
        });
    }
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn unset_variables_keep_defaults() {
        let config = BackgroundProcessorConfig::from_lookup("mailer", "MAILER", lookup(&[])).unwrap();
        let defaults = BackgroundProcessorConfig::named("mailer");

        assert_eq!(config.worker_count, defaults.worker_count);
        assert_eq!(config.lock_timeout, defaults.lock_timeout);
        assert!(config.lock_owner.starts_with("mailer-"));
        assert_ne!(config.lock_owner, defaults.lock_owner);
    }

    #[test]
    fn reads_every_variable() {
        let config = BackgroundProcessorConfig::from_lookup(
            "mailer",
            "MAILER",
            lookup(&[
                ("MAILER_WORKERS", "8"),
                ("MAILER_QUEUE_CAPACITY", "32"),
                ("MAILER_POLL_INTERVAL_MS", "250"),
                ("MAILER_LOCK_TIMEOUT_SECS", "120"),
                ("MAILER_SWEEP_INTERVAL_SECS", "15"),
                ("MAILER_PROCESSING_TIMEOUT_MS", "5000"),
                ("MAILER_LOCK_OWNER", " host-7 "),
            ]),
        )
        .unwrap();

        assert_eq!(config.worker_count, 8);
        assert_eq!(config.queue_capacity, 32);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.lock_timeout, Duration::from_secs(120));
        assert_eq!(config.sweep_interval, Duration::from_secs(15));
        assert_eq!(config.processing_timeout, Duration::from_millis(5000));
        assert_eq!(config.lock_owner, "host-7");
    }

    #[test]
    fn rejects_garbage_and_zero() {
        let err = BackgroundProcessorConfig::from_lookup("m", "M", lookup(&[("M_WORKERS", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "M_WORKERS"));

        let err = BackgroundProcessorConfig::from_lookup("m", "M", lookup(&[("M_LOCK_TIMEOUT_SECS", "0")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Zero {
                key: "M_LOCK_TIMEOUT_SECS".to_string()
            }
        );
    }

    #[test]
    fn renaming_regenerates_only_a_derived_owner() {
        let derived = BackgroundProcessorConfig::named("a").with_name("b");
        assert!(derived.lock_owner.starts_with("b-"));

        let explicit = BackgroundProcessorConfig::named("a")
            .with_lock_owner("pinned")
            .with_name("b");
        assert_eq!(explicit.lock_owner, "pinned");
    }

    #[test]
    fn builders_clamp_pool_sizes() {
        let config = BackgroundProcessorConfig::default()
            .with_worker_count(0)
            .with_queue_capacity(0);
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.queue_capacity, 1);
    }
}
