//! Configuration module for fleetwatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Passphrase used when `FLEETWATCH_ENCRYPTION_KEY` is unset. Development only.
pub const DEV_ENCRYPTION_KEY: &str = "fleetwatch-dev-key";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// HTTP port for the ops server (default: 8080)
    pub http_port: u16,
    /// Directory holding `system.db` and the tenant databases (default: "data")
    pub data_dir: String,
    pub encryption_key: String,
    pub scheduler_poll: Duration,
    pub job_workers: usize,
    pub job_timeout: Duration,
    pub collector_poll: Duration,
    pub collector_workers: usize,
    pub collection_timeout: Duration,
    pub retention_interval: Duration,
    pub retention_batch_size: usize,
    pub alert_resolve_threshold: u32,
    /// Pool queue depth is `workers * queue_factor`.
    pub queue_factor: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            data_dir: "data".to_string(),
            encryption_key: DEV_ENCRYPTION_KEY.to_string(),
            scheduler_poll: Duration::from_secs(30),
            job_workers: 5,
            job_timeout: Duration::from_secs(1800),
            collector_poll: Duration::from_secs(30),
            collector_workers: 10,
            collection_timeout: Duration::from_secs(5),
            retention_interval: Duration::from_secs(86_400),
            retention_batch_size: 10_000,
            alert_resolve_threshold: 2,
            queue_factor: 4,
        }
    }
}

impl ServerConfig {
    /// Load configuration from `FLEETWATCH_*` environment variables.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let mut cfg = Self::default();

        parse_into(&lookup, "FLEETWATCH_HTTP_PORT", &mut cfg.http_port);
        if let Some(dir) = lookup("FLEETWATCH_DATA_DIR") {
            cfg.data_dir = dir;
        }
        if let Some(key) = lookup("FLEETWATCH_ENCRYPTION_KEY").filter(|k| !k.is_empty()) {
            cfg.encryption_key = key;
        }

        parse_secs(&lookup, "FLEETWATCH_SCHEDULER_POLL_SECS", &mut cfg.scheduler_poll);
        parse_into(&lookup, "FLEETWATCH_JOB_WORKERS", &mut cfg.job_workers);
        parse_secs(&lookup, "FLEETWATCH_JOB_TIMEOUT_SECS", &mut cfg.job_timeout);
        parse_secs(&lookup, "FLEETWATCH_COLLECTOR_POLL_SECS", &mut cfg.collector_poll);
        parse_into(&lookup, "FLEETWATCH_COLLECTOR_WORKERS", &mut cfg.collector_workers);
        parse_secs(&lookup, "FLEETWATCH_COLLECTION_TIMEOUT_SECS", &mut cfg.collection_timeout);
        parse_secs(&lookup, "FLEETWATCH_RETENTION_INTERVAL_SECS", &mut cfg.retention_interval);
        parse_into(&lookup, "FLEETWATCH_RETENTION_BATCH_SIZE", &mut cfg.retention_batch_size);
        parse_into(&lookup, "FLEETWATCH_ALERT_RESOLVE_THRESHOLD", &mut cfg.alert_resolve_threshold);
        parse_into(&lookup, "FLEETWATCH_QUEUE_FACTOR", &mut cfg.queue_factor);

        cfg
    }

    pub fn uses_dev_key(&self) -> bool {
        self.encryption_key == DEV_ENCRYPTION_KEY
    }
}

/// Overwrite `slot` with a positive parsed value; anything else is ignored.
fn parse_into<T, F>(lookup: &F, key: &str, slot: &mut T)
where
    T: FromStr + PartialOrd + Default,
    F: Fn(&str) -> Option<String>,
{
    let raw = match lookup(key) {
        Some(v) => v,
        None => return,
    };
    match raw.trim().parse::<T>() {
        Ok(v) if v > T::default() => *slot = v,
        _ => tracing::warn!("Ignoring invalid {}={:?}", key, raw),
    }
}

fn parse_secs<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, slot: &mut Duration) {
    let mut secs = slot.as_secs();
    parse_into(lookup, key, &mut secs);
    *slot = Duration::from_secs(secs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.data_dir, "data");
        assert_eq!(cfg.job_workers, 5);
        assert_eq!(cfg.collector_workers, 10);
        assert_eq!(cfg.job_timeout, Duration::from_secs(1800));
        assert_eq!(cfg.retention_batch_size, 10_000);
        assert!(cfg.uses_dev_key());
        assert_eq!(load(&[]), cfg);
    }

    #[test]
    fn test_env_overrides() {
        let cfg = load(&[
            ("FLEETWATCH_HTTP_PORT", "9090"),
            ("FLEETWATCH_DATA_DIR", "/var/lib/fleetwatch"),
            ("FLEETWATCH_ENCRYPTION_KEY", "prod-secret"),
            ("FLEETWATCH_SCHEDULER_POLL_SECS", "10"),
            ("FLEETWATCH_COLLECTION_TIMEOUT_SECS", "8"),
            ("FLEETWATCH_ALERT_RESOLVE_THRESHOLD", "3"),
        ]);
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.data_dir, "/var/lib/fleetwatch");
        assert!(!cfg.uses_dev_key());
        assert_eq!(cfg.scheduler_poll, Duration::from_secs(10));
        assert_eq!(cfg.collection_timeout, Duration::from_secs(8));
        assert_eq!(cfg.alert_resolve_threshold, 3);
    }

    #[test]
    fn test_invalid_values_are_ignored() {
        let cfg = load(&[
            ("FLEETWATCH_HTTP_PORT", "not-a-port"),
            ("FLEETWATCH_JOB_WORKERS", "0"),
            ("FLEETWATCH_COLLECTOR_POLL_SECS", "-5"),
            ("FLEETWATCH_ENCRYPTION_KEY", ""),
        ]);
        assert_eq!(cfg, ServerConfig::default());
    }
}
