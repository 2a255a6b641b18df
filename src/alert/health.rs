//! Server health classification.

use crate::db::{DbError, Server, ServerSnapshot, ServerStatus, Severity, Store};

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Offline,
    Unknown,
}

/// Thresholds read from tenant settings.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub memory_warning: f64,
    pub memory_critical: f64,
    pub offline_seconds: i64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            cpu_warning: 80.0,
            cpu_critical: 95.0,
            memory_warning: 85.0,
            memory_critical: 95.0,
            offline_seconds: 300,
        }
    }
}

impl HealthThresholds {
    pub fn load(store: &Store) -> Result<Self, DbError> {
        let d = Self::default();
        Ok(Self {
            cpu_warning: store.get_setting_f64("health_cpu_warning", d.cpu_warning)?,
            cpu_critical: store.get_setting_f64("health_cpu_critical", d.cpu_critical)?,
            memory_warning: store.get_setting_f64("health_memory_warning", d.memory_warning)?,
            memory_critical: store.get_setting_f64("health_memory_critical", d.memory_critical)?,
            offline_seconds: store.get_setting_i64("health_offline_seconds", d.offline_seconds)?,
        })
    }
}

/// Classify from the latest snapshot. Stale data counts as offline.
pub fn classify(
    server: &Server,
    collection_enabled: bool,
    latest: Option<&ServerSnapshot>,
    thresholds: &HealthThresholds,
    now: DateTime<Utc>,
) -> HealthStatus {
    let snapshot = match latest {
        Some(s) if collection_enabled => s,
        _ => return HealthStatus::Unknown,
    };

    if (now - snapshot.collected_at).num_seconds() > thresholds.offline_seconds
        || server.status == ServerStatus::Offline
    {
        return HealthStatus::Offline;
    }

    let cpu = snapshot.cpu_percent.unwrap_or(0.0);
    let memory = snapshot.memory_percent.unwrap_or(0.0);

    if cpu > thresholds.cpu_critical || memory > thresholds.memory_critical {
        HealthStatus::Critical
    } else if cpu > thresholds.cpu_warning || memory > thresholds.memory_warning {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

/// Health implied by the severities of a server's open alerts.
pub fn alert_health(open_severities: &[Severity]) -> HealthStatus {
    if open_severities.contains(&Severity::Critical) {
        HealthStatus::Critical
    } else if open_severities.contains(&Severity::Warning) {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerHealth {
    pub server_id: i64,
    pub name: String,
    pub hostname: String,
    pub status: HealthStatus,
    pub alert_status: HealthStatus,
    pub collection_enabled: bool,
    pub last_collected_at: Option<DateTime<Utc>>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub connection_count: Option<i64>,
}

pub fn server_health(store: &Store, server_id: i64, now: DateTime<Utc>) -> Result<ServerHealth, DbError> {
    let server = store.get_server(server_id)?;
    let collection_enabled = store
        .get_collection_config(server_id)?
        .map(|c| c.enabled)
        .unwrap_or(false);
    let latest = store.latest_snapshot(server_id)?;
    let thresholds = HealthThresholds::load(store)?;
    let status = classify(&server, collection_enabled, latest.as_ref(), &thresholds, now);
    let alert_status = alert_health(&store.open_alert_severities(server_id)?);

    Ok(ServerHealth {
        server_id,
        name: server.name,
        hostname: server.hostname,
        status,
        alert_status,
        collection_enabled,
        last_collected_at: latest.as_ref().map(|s| s.collected_at),
        cpu_percent: latest.as_ref().and_then(|s| s.cpu_percent),
        memory_percent: latest.as_ref().and_then(|s| s.memory_percent),
        connection_count: latest.as_ref().and_then(|s| s.connection_count),
    })
}
