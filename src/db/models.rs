//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Returned when a stored or submitted enum value is not recognised.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a string-backed enum stored as TEXT.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum!(
    /// Tenant lifecycle in the system registry.
    TenantStatus {
        Active => "active",
        Suspended => "suspended",
    }
);

text_enum!(
    JobType {
        PolicyExecution => "policy_execution",
        DataCollection => "data_collection",
        CustomScript => "custom_script",
        AlertCheck => "alert_check",
    }
);

text_enum!(
    ScheduleType {
        Once => "once",
        Interval => "interval",
        Cron => "cron",
        EventTriggered => "event_triggered",
    }
);

text_enum!(
    ExecutionStatus {
        Pending => "pending",
        Running => "running",
        Success => "success",
        Failed => "failed",
        Cancelled => "cancelled",
    }
);

text_enum!(
    ServerStatus {
        Unknown => "unknown",
        Online => "online",
        Offline => "offline",
        Error => "error",
        Monitored => "monitored",
    }
);

text_enum!(
    AuthType {
        Sql => "sql",
        Windows => "windows",
    }
);

text_enum!(
    /// Metrics sampled by the collector and addressable by alert rules.
    MetricType {
        CpuPercent => "cpu_percent",
        MemoryPercent => "memory_percent",
        ConnectionCount => "connection_count",
        BatchRequestsSec => "batch_requests_sec",
        PageLifeExpectancy => "page_life_expectancy",
        BlockedProcesses => "blocked_processes",
    }
);

text_enum!(
    Operator {
        Gt => "gt",
        Gte => "gte",
        Lt => "lt",
        Lte => "lte",
        Eq => "eq",
    }
);

text_enum!(
    Severity {
        Info => "info",
        Warning => "warning",
        Critical => "critical",
    }
);

text_enum!(
    AlertStatus {
        Active => "active",
        Acknowledged => "acknowledged",
        Resolved => "resolved",
    }
);

impl Operator {
    /// Apply the comparison `value <op> threshold`.
    pub fn apply(&self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::Gt => value > threshold,
            Operator::Gte => value >= threshold,
            Operator::Lt => value < threshold,
            Operator::Lte => value <= threshold,
            Operator::Eq => (value - threshold).abs() < 1e-9,
        }
    }
}

/// A tenant registered in the system database.
#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub slug: String,
    pub name: String,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
}

/// A scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub configuration: serde_json::Value,
    pub schedule_type: ScheduleType,
    pub schedule_config: serde_json::Value,
    pub is_enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Timeout override from `configuration.timeout_seconds`.
    pub fn timeout_override(&self) -> Option<u64> {
        self.configuration
            .get("timeout_seconds")
            .and_then(|v| v.as_u64())
            .filter(|secs| *secs > 0)
    }

    /// Target server from `configuration.server_id`, when the job has one.
    pub fn target_server_id(&self) -> Option<i64> {
        self.configuration.get("server_id").and_then(|v| v.as_i64())
    }
}

/// Input for creating a job.
#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default = "empty_object")]
    pub configuration: serde_json::Value,
    pub schedule_type: ScheduleType,
    #[serde(default = "empty_object")]
    pub schedule_config: serde_json::Value,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

fn default_true() -> bool {
    true
}

/// One run of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobExecution {
    pub id: i64,
    pub job_id: i64,
    pub server_id: Option<i64>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

/// A monitored database server.
#[derive(Debug, Clone, Serialize)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub instance_name: Option<String>,
    pub auth_type: AuthType,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub encrypted_password: Option<String>,
    pub status: ServerStatus,
    pub last_checked: Option<DateTime<Utc>>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            hostname: String::new(),
            port: 1433,
            instance_name: None,
            auth_type: AuthType::Sql,
            username: None,
            encrypted_password: None,
            status: ServerStatus::Unknown,
            last_checked: None,
        }
    }
}

/// LIKE patterns restricting which in-flight queries are collected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilters {
    pub database: Option<String>,
    pub login: Option<String>,
    pub user: Option<String>,
    pub text_include: Option<String>,
    pub text_exclude: Option<String>,
}

/// Per-server collection settings.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionConfig {
    pub server_id: i64,
    pub interval_seconds: i64,
    pub enabled: bool,
    /// Metrics to sample; empty means all of them.
    pub metrics_enabled: Vec<MetricType>,
    pub last_collected_at: Option<DateTime<Utc>>,
    pub query_collection_enabled: bool,
    pub query_collection_interval: i64,
    pub query_min_duration_ms: i64,
    pub last_query_collected_at: Option<DateTime<Utc>>,
    pub query_filters: QueryFilters,
}

impl CollectionConfig {
    pub const MIN_INTERVAL_SECONDS: i64 = 30;
    pub const MAX_INTERVAL_SECONDS: i64 = 3600;

    pub fn new(server_id: i64) -> Self {
        Self {
            server_id,
            interval_seconds: 60,
            enabled: false,
            metrics_enabled: Vec::new(),
            last_collected_at: None,
            query_collection_enabled: false,
            query_collection_interval: 30,
            query_min_duration_ms: 0,
            last_query_collected_at: None,
            query_filters: QueryFilters::default(),
        }
    }

    /// Whether metric collection should run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_collected_at {
            Some(last) => (now - last).num_seconds() >= self.interval_seconds,
            None => true,
        }
    }

    /// Whether running-query collection should run at `now`.
    pub fn query_collection_due(&self, now: DateTime<Utc>) -> bool {
        if !self.query_collection_enabled {
            return false;
        }
        match self.last_query_collected_at {
            Some(last) => (now - last).num_seconds() >= self.query_collection_interval,
            None => true,
        }
    }

    /// Metrics the collector should sample for this server.
    pub fn effective_metrics(&self) -> Vec<MetricType> {
        if self.metrics_enabled.is_empty() {
            MetricType::ALL.to_vec()
        } else {
            self.metrics_enabled.clone()
        }
    }
}

/// Point-in-time metrics for one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub id: i64,
    pub server_id: i64,
    pub collected_at: DateTime<Utc>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub connection_count: Option<i64>,
    pub batch_requests_sec: Option<f64>,
    pub page_life_expectancy: Option<i64>,
    pub blocked_processes: Option<i64>,
    pub extended_metrics: Option<serde_json::Value>,
}

impl ServerSnapshot {
    pub fn empty(server_id: i64, collected_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            server_id,
            collected_at,
            cpu_percent: None,
            memory_percent: None,
            connection_count: None,
            batch_requests_sec: None,
            page_life_expectancy: None,
            blocked_processes: None,
            extended_metrics: None,
        }
    }

    pub fn get(&self, metric: MetricType) -> Option<f64> {
        match metric {
            MetricType::CpuPercent => self.cpu_percent,
            MetricType::MemoryPercent => self.memory_percent,
            MetricType::ConnectionCount => self.connection_count.map(|v| v as f64),
            MetricType::BatchRequestsSec => self.batch_requests_sec,
            MetricType::PageLifeExpectancy => self.page_life_expectancy.map(|v| v as f64),
            MetricType::BlockedProcesses => self.blocked_processes.map(|v| v as f64),
        }
    }

    pub fn set(&mut self, metric: MetricType, value: f64) {
        match metric {
            MetricType::CpuPercent => self.cpu_percent = Some(value),
            MetricType::MemoryPercent => self.memory_percent = Some((value * 100.0).round() / 100.0),
            MetricType::ConnectionCount => self.connection_count = Some(value as i64),
            MetricType::BatchRequestsSec => self.batch_requests_sec = Some(value),
            MetricType::PageLifeExpectancy => self.page_life_expectancy = Some(value as i64),
            MetricType::BlockedProcesses => self.blocked_processes = Some(value as i64),
        }
    }

    /// Collected values keyed by metric, omitting missing ones.
    pub fn metrics(&self) -> HashMap<MetricType, f64> {
        MetricType::ALL
            .iter()
            .filter_map(|m| self.get(*m).map(|v| (*m, v)))
            .collect()
    }
}

/// One in-flight query at `collected_at`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunningQuerySnapshot {
    pub id: i64,
    pub server_id: i64,
    pub collected_at: DateTime<Utc>,
    pub session_id: i64,
    pub request_id: Option<i64>,
    pub database_name: Option<String>,
    pub query_text: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: Option<String>,
    pub wait_type: Option<String>,
    pub wait_time_ms: Option<i64>,
    pub cpu_time_ms: Option<i64>,
    pub logical_reads: Option<i64>,
    pub physical_reads: Option<i64>,
    pub writes: Option<i64>,
    pub login_name: Option<String>,
    pub host_name: Option<String>,
    pub program_name: Option<String>,
    pub blocking_session_id: Option<i64>,
}

/// A threshold rule evaluated against collected metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub metric_type: MetricType,
    pub operator: Operator,
    pub threshold: f64,
    pub severity: Severity,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

impl AlertRule {
    /// True when `value` breaches this rule.
    pub fn evaluate(&self, value: f64) -> bool {
        self.operator.apply(value, self.threshold)
    }
}

/// An alert raised by a rule for a server.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: i64,
    pub rule_id: i64,
    pub server_id: i64,
    pub status: AlertStatus,
    pub metric_value: Option<f64>,
    pub triggered_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

/// Open alert counts grouped by rule severity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeverityCounts {
    pub info: i64,
    pub warning: i64,
    pub critical: i64,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_enum_text_round_trip() {
        for m in MetricType::ALL {
            assert_eq!(m.as_str().parse::<MetricType>().unwrap(), *m);
        }
        assert!("bogus".parse::<Operator>().is_err());
        assert_eq!(
            serde_json::to_string(&JobType::PolicyExecution).unwrap(),
            "\"policy_execution\""
        );
    }

    #[test]
    fn test_operator_apply() {
        assert!(Operator::Gt.apply(95.0, 90.0));
        assert!(!Operator::Gt.apply(90.0, 90.0));
        assert!(Operator::Gte.apply(90.0, 90.0));
        assert!(Operator::Lt.apply(10.0, 90.0));
        assert!(Operator::Lte.apply(90.0, 90.0));
        assert!(Operator::Eq.apply(3.0, 3.0));
        assert!(!Operator::Eq.apply(3.0, 3.1));
    }

    #[test]
    fn test_collection_due() {
        let now = Utc::now();
        let mut cfg = CollectionConfig::new(1);
        assert!(!cfg.is_due(now), "disabled config is never due");

        cfg.enabled = true;
        assert!(cfg.is_due(now), "never collected is due");

        cfg.last_collected_at = Some(now - Duration::seconds(30));
        assert!(!cfg.is_due(now));
        cfg.last_collected_at = Some(now - Duration::seconds(60));
        assert!(cfg.is_due(now));
    }

    #[test]
    fn test_snapshot_metrics_skip_missing() {
        let mut snap = ServerSnapshot::empty(1, Utc::now());
        snap.set(MetricType::CpuPercent, 42.0);
        snap.set(MetricType::ConnectionCount, 7.0);
        let metrics = snap.metrics();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[&MetricType::ConnectionCount], 7.0);
    }
}
