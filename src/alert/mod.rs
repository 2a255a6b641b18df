//! Alert evaluation against collected metrics.

mod health;

pub use health::*;

use crate::db::{Alert, AlertRule, DbError, MetricType, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// Consecutive normal readings before an open alert auto-resolves.
pub const DEFAULT_RESOLVE_THRESHOLD: u32 = 2;

/// Averaging window for aggregate evaluation, in minutes.
pub const DEFAULT_WINDOW_MINUTES: i64 = 5;

/// Outcome of evaluating one server.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluationResult {
    pub new_alerts: Vec<Alert>,
    pub resolved_alerts: Vec<i64>,
    pub active_count: i64,
}

/// Totals over a batch of servers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvaluationSummary {
    pub servers_evaluated: usize,
    pub new_alerts: usize,
    pub resolved_alerts: usize,
}

/// One metric value and when it was collected.
#[derive(Debug, Clone, Copy)]
struct Reading {
    value: f64,
    at: DateTime<Utc>,
}

/// (tenant, rule_id, server_id)
type PairKey = (String, i64, i64);

/// Run of normal readings for one pair.
#[derive(Debug, Clone, Copy)]
struct NormalRun {
    count: u32,
    last_reading: DateTime<Utc>,
}

/// Opens and auto-resolves alerts.
///
/// Consecutive normal readings are counted per (tenant, rule, server) in
/// memory only, so a restart starts every pair from zero. A reading is
/// identified by its `collected_at`; evaluating the same reading again
/// (the collector and an `alert_check` job share one evaluator) does not
/// count it twice.
pub struct AlertEvaluator {
    resolve_threshold: u32,
    normal_readings: Mutex<HashMap<PairKey, NormalRun>>,
}

impl Default for AlertEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_RESOLVE_THRESHOLD)
    }
}

impl AlertEvaluator {
    pub fn new(resolve_threshold: u32) -> Self {
        Self {
            resolve_threshold: resolve_threshold.max(1),
            normal_readings: Mutex::new(HashMap::new()),
        }
    }

    fn reset(&self, key: &PairKey) {
        if let Ok(mut counts) = self.normal_readings.lock() {
            counts.remove(key);
        }
    }

    /// Count a normal reading taken at `reading_at`, returning the run length.
    fn bump(&self, key: PairKey, reading_at: DateTime<Utc>) -> u32 {
        let mut counts = match self.normal_readings.lock() {
            Ok(counts) => counts,
            Err(_) => return 0,
        };
        let run = counts.entry(key).or_insert(NormalRun {
            count: 0,
            last_reading: reading_at,
        });
        if run.count == 0 || run.last_reading != reading_at {
            run.count += 1;
            run.last_reading = reading_at;
        }
        run.count
    }

    /// Evaluate every enabled rule whose metric is present in `metrics`,
    /// the reading collected at `reading_at`.
    pub fn evaluate(
        &self,
        tenant: &str,
        store: &Store,
        server_id: i64,
        metrics: &HashMap<MetricType, f64>,
        reading_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<EvaluationResult, DbError> {
        let rules = store.list_enabled_rules()?;
        let mut result = EvaluationResult::default();

        for rule in rules {
            let value = match metrics.get(&rule.metric_type) {
                Some(v) => *v,
                None => continue,
            };
            let reading = Reading { value, at: reading_at };
            if let Err(e) = self.evaluate_rule(tenant, store, server_id, &rule, reading, now, &mut result) {
                tracing::error!(
                    "Alert rule {} failed for tenant {} server {}: {}",
                    rule.id,
                    tenant,
                    server_id,
                    e
                );
            }
        }

        result.active_count = store.count_open_alerts(server_id)?;
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_rule(
        &self,
        tenant: &str,
        store: &Store,
        server_id: i64,
        rule: &AlertRule,
        reading: Reading,
        now: DateTime<Utc>,
        result: &mut EvaluationResult,
    ) -> Result<(), DbError> {
        let value = reading.value;
        let key = (tenant.to_string(), rule.id, server_id);
        let open = store.get_open_alert(rule.id, server_id)?;

        if rule.evaluate(value) {
            self.reset(&key);
            if open.is_none() {
                if let Some(alert) = store.open_alert(rule, server_id, value, now)? {
                    tracing::warn!(
                        "Alert opened: tenant {} server {} rule {} ({} {} {}, value {})",
                        tenant,
                        server_id,
                        rule.name,
                        rule.metric_type,
                        rule.operator,
                        rule.threshold,
                        value
                    );
                    result.new_alerts.push(alert);
                }
            }
            return Ok(());
        }

        let alert = match open {
            Some(a) => a,
            None => {
                self.reset(&key);
                return Ok(());
            }
        };

        if self.bump(key.clone(), reading.at) < self.resolve_threshold {
            return Ok(());
        }

        let note = format!(
            "Auto-resolved: {} returned to normal ({})",
            rule.metric_type, value
        );
        if store.auto_resolve_alert(alert.id, &note, now)? {
            tracing::info!(
                "Alert {} resolved: tenant {} server {} rule {}",
                alert.id,
                tenant,
                server_id,
                rule.name
            );
            result.resolved_alerts.push(alert.id);
        }
        self.reset(&key);
        Ok(())
    }

    /// Evaluate each server's latest snapshot.
    pub fn evaluate_all_servers(
        &self,
        tenant: &str,
        store: &Store,
        now: DateTime<Utc>,
    ) -> Result<EvaluationSummary, DbError> {
        let mut summary = EvaluationSummary::default();
        for server in store.list_servers()? {
            let snapshot = match store.latest_snapshot(server.id)? {
                Some(s) => s,
                None => continue,
            };
            let r = self.evaluate(
                tenant,
                store,
                server.id,
                &snapshot.metrics(),
                snapshot.collected_at,
                now,
            )?;
            summary.servers_evaluated += 1;
            summary.new_alerts += r.new_alerts.len();
            summary.resolved_alerts += r.resolved_alerts.len();
        }
        Ok(summary)
    }

    /// Evaluate each server's metric averages over the last `window_minutes`.
    pub fn evaluate_with_aggregates(
        &self,
        tenant: &str,
        store: &Store,
        window_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<EvaluationSummary, DbError> {
        let since = now - ChronoDuration::minutes(window_minutes.max(1));
        let mut summary = EvaluationSummary::default();
        for server in store.list_servers()? {
            let averages = store.snapshot_averages(server.id, since)?;
            if averages.is_empty() {
                continue;
            }
            // A window average only counts as new once a newer snapshot lands.
            let reading_at = match store.latest_snapshot(server.id)? {
                Some(s) => s.collected_at,
                None => now,
            };
            let r = self.evaluate(tenant, store, server.id, &averages, reading_at, now)?;
            summary.servers_evaluated += 1;
            summary.new_alerts += r.new_alerts.len();
            summary.resolved_alerts += r.resolved_alerts.len();
        }
        Ok(summary)
    }
}
