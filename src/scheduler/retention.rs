//! Retention manager for cleaning up old time-series rows.

use crate::db::{DbError, RegistryError, Store, TenantRegistry, TimeSeriesTable};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const RETENTION_DAYS_KEY: &str = "retention_days";
pub const DEFAULT_RETENTION_DAYS: i64 = 30;
pub const MIN_RETENTION_DAYS: i64 = 1;
pub const MAX_RETENTION_DAYS: i64 = 365;
pub const DEFAULT_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Configured retention for a tenant, clamped to the valid range.
pub fn retention_days(store: &Store) -> Result<i64, DbError> {
    let days = store.get_setting_i64(RETENTION_DAYS_KEY, DEFAULT_RETENTION_DAYS)?;
    if !(MIN_RETENTION_DAYS..=MAX_RETENTION_DAYS).contains(&days) {
        tracing::warn!("retention_days {} out of range, clamping", days);
    }
    Ok(days.clamp(MIN_RETENTION_DAYS, MAX_RETENTION_DAYS))
}

pub fn set_retention_days(store: &Store, days: i64) -> Result<(), DbError> {
    if !(MIN_RETENTION_DAYS..=MAX_RETENTION_DAYS).contains(&days) {
        return Err(DbError::Validation(vec![format!(
            "retention_days must be between {} and {}",
            MIN_RETENTION_DAYS, MAX_RETENTION_DAYS
        )]));
    }
    store.set_setting(RETENTION_DAYS_KEY, &serde_json::json!(days))
}

/// Rows removed from one tenant in one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub rows_deleted: usize,
    /// Batches that deleted at least one row.
    pub batches: usize,
}

/// Delete rows older than `cutoff` from every time-series table, one batch
/// at a time. A failing batch stops that table only.
pub fn cleanup_store(
    store: &Store,
    cutoff: DateTime<Utc>,
    batch_size: usize,
) -> RetentionReport {
    let batch_size = batch_size.max(1);
    let mut report = RetentionReport::default();

    for table in TimeSeriesTable::ALL {
        loop {
            match store.delete_batch_before(table, cutoff, batch_size) {
                Ok(0) => break,
                Ok(n) => {
                    report.rows_deleted += n;
                    report.batches += 1;
                    if n < batch_size {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        "RetentionManager: batch delete from {} failed: {}",
                        table.table(),
                        e
                    );
                    break;
                }
            }
        }
    }
    report
}

/// Manager for deleting data past each tenant's retention period.
pub struct RetentionManager {
    registry: Arc<TenantRegistry>,
    interval: Duration,
    batch_size: usize,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(registry: Arc<TenantRegistry>, interval: Duration, batch_size: usize) -> Self {
        Self {
            registry,
            interval,
            batch_size,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the background task. The first pass runs immediately.
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = manager.stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(manager.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        manager.run_once(Utc::now());
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }

    /// One pass over every active tenant.
    pub fn run_once(&self, now: DateTime<Utc>) -> Vec<(String, RetentionReport)> {
        let tenants = match self.registry.list_active_tenants() {
            Ok(t) => t,
            Err(e) => {
                tracing::error!("RetentionManager: Failed to list tenants: {}", e);
                return Vec::new();
            }
        };

        let mut reports = Vec::new();
        for tenant in tenants {
            match self.clean_tenant(&tenant, now) {
                Ok(report) => {
                    if report.rows_deleted > 0 {
                        tracing::info!(
                            "RetentionManager: deleted {} rows in {} batches for tenant {}",
                            report.rows_deleted,
                            report.batches,
                            tenant
                        );
                    }
                    reports.push((tenant, report));
                }
                Err(e) => {
                    tracing::error!("RetentionManager: tenant {} skipped: {}", tenant, e)
                }
            }
        }
        reports
    }

    fn clean_tenant(&self, tenant: &str, now: DateTime<Utc>) -> Result<RetentionReport, RegistryError> {
        let store = self.registry.get_store(tenant)?;
        let days = retention_days(&store)?;
        let cutoff = now - ChronoDuration::days(days);
        Ok(cleanup_store(&store, cutoff, self.batch_size))
    }
}
