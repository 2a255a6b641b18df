//! Alert rules, alerts and the activity log.

use super::models::*;
use super::store::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const RULE_COLUMNS: &str = "id, name, metric_type, operator, threshold, severity, is_enabled";

const ALERT_COLUMNS: &str = "id, rule_id, server_id, status, metric_value, triggered_at, \
     acknowledged_at, acknowledged_by, resolved_at, notes";

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<AlertRule> {
    Ok(AlertRule {
        id: row.get(0)?,
        name: row.get(1)?,
        metric_type: enum_col(row, 2)?,
        operator: enum_col(row, 3)?,
        threshold: row.get(4)?,
        severity: enum_col(row, 5)?,
        is_enabled: row.get(6)?,
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
    Ok(Alert {
        id: row.get(0)?,
        rule_id: row.get(1)?,
        server_id: row.get(2)?,
        status: enum_col(row, 3)?,
        metric_value: row.get(4)?,
        triggered_at: time_col(row, 5)?,
        acknowledged_at: opt_time_col(row, 6)?,
        acknowledged_by: row.get(7)?,
        resolved_at: opt_time_col(row, 8)?,
        notes: row.get(9)?,
    })
}

fn validate_rule(rule: &AlertRule) -> Result<(), DbError> {
    let mut errors = Vec::new();
    if rule.name.trim().is_empty() {
        errors.push("name must not be empty".to_string());
    }
    if !rule.threshold.is_finite() {
        errors.push("threshold must be a finite number".to_string());
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(DbError::Validation(errors))
    }
}

fn log_activity(
    conn: &Connection,
    action: &str,
    entity_id: i64,
    details: &serde_json::Value,
    at: DateTime<Utc>,
) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO activity_log (action, entity_type, entity_id, details, created_at)
         VALUES (?1, 'alert', ?2, ?3, ?4)",
        params![action, entity_id, serde_json::to_string(details)?, fmt_db_time(at)],
    )?;
    Ok(())
}

impl Store {
    // --- Rules ---

    pub fn create_alert_rule(&self, rule: &AlertRule) -> Result<i64, DbError> {
        validate_rule(rule)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO alert_rules (name, metric_type, operator, threshold, severity, is_enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rule.name.trim(),
                rule.metric_type.as_str(),
                rule.operator.as_str(),
                rule.threshold,
                rule.severity.as_str(),
                rule.is_enabled
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_alert_rule(&self, rule: &AlertRule) -> Result<(), DbError> {
        validate_rule(rule)?;
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE alert_rules SET name = ?1, metric_type = ?2, operator = ?3, threshold = ?4,
                severity = ?5, is_enabled = ?6
             WHERE id = ?7",
            params![
                rule.name.trim(),
                rule.metric_type.as_str(),
                rule.operator.as_str(),
                rule.threshold,
                rule.severity.as_str(),
                rule.is_enabled,
                rule.id
            ],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Delete a rule together with its alerts.
    pub fn delete_alert_rule(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM alerts WHERE rule_id = ?1", params![id])?;
        let n = tx.execute("DELETE FROM alert_rules WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_enabled_rules(&self) -> Result<Vec<AlertRule>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM alert_rules WHERE is_enabled = 1 ORDER BY id",
            RULE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rules = stmt
            .query_map([], rule_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rules)
    }

    // --- Alerts ---

    pub fn get_alert(&self, id: i64) -> Result<Alert, DbError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM alerts WHERE id = ?1", ALERT_COLUMNS);
        conn.query_row(&sql, params![id], alert_from_row)
            .optional()?
            .ok_or(DbError::NotFound)
    }

    /// The non-resolved alert for a (rule, server) pair, if any.
    pub fn get_open_alert(&self, rule_id: i64, server_id: i64) -> Result<Option<Alert>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM alerts WHERE rule_id = ?1 AND server_id = ?2 AND status != 'resolved'",
            ALERT_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![rule_id, server_id], alert_from_row)
            .optional()?)
    }

    pub fn list_alerts(&self, server_id: i64) -> Result<Vec<Alert>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM alerts WHERE server_id = ?1 ORDER BY id",
            ALERT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let alerts = stmt
            .query_map(params![server_id], alert_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(alerts)
    }

    /// Open an alert for `rule` on `server_id`, unless one is already open.
    ///
    /// Returns `None` when an open alert already exists. The check, the
    /// insert and the activity entry share one transaction.
    pub fn open_alert(
        &self,
        rule: &AlertRule,
        server_id: i64,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<Option<Alert>, DbError> {
        let id = {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;

            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM alerts WHERE rule_id = ?1 AND server_id = ?2 AND status != 'resolved'",
                    params![rule.id, server_id],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Ok(None);
            }

            tx.execute(
                "INSERT INTO alerts (rule_id, server_id, status, metric_value, triggered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    rule.id,
                    server_id,
                    AlertStatus::Active.as_str(),
                    value,
                    fmt_db_time(at)
                ],
            )?;
            let id = tx.last_insert_rowid();

            log_activity(
                &tx,
                "alert_triggered",
                id,
                &serde_json::json!({
                    "rule_id": rule.id,
                    "rule_name": rule.name,
                    "server_id": server_id,
                    "metric_type": rule.metric_type,
                    "metric_value": value,
                    "threshold": rule.threshold,
                    "severity": rule.severity,
                }),
                at,
            )?;
            tx.commit()?;
            id
        };
        self.get_alert(id).map(Some)
    }

    /// Resolve an open alert; returns false when it was no longer open.
    pub fn auto_resolve_alert(
        &self,
        id: i64,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let n = tx.execute(
            "UPDATE alerts SET status = 'resolved', resolved_at = ?1, notes = ?2
             WHERE id = ?3 AND status != 'resolved'",
            params![fmt_db_time(at), note, id],
        )?;
        if n == 0 {
            return Ok(false);
        }
        log_activity(
            &tx,
            "alert_resolved",
            id,
            &serde_json::json!({"auto": true, "note": note}),
            at,
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Operator acknowledgement; only active alerts can be acknowledged.
    pub fn acknowledge_alert(
        &self,
        id: i64,
        by: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Alert, DbError> {
        let alert = self.get_alert(id)?;
        if alert.status != AlertStatus::Active {
            return Err(DbError::Validation(vec![format!(
                "Alert {} is {} and cannot be acknowledged",
                id, alert.status
            )]));
        }
        {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE alerts SET status = 'acknowledged', acknowledged_at = ?1, acknowledged_by = ?2
                 WHERE id = ?3 AND status = 'active'",
                params![fmt_db_time(at), by, id],
            )?;
        }
        self.get_alert(id)
    }

    /// Operator resolution of an active or acknowledged alert.
    pub fn resolve_alert(
        &self,
        id: i64,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Alert, DbError> {
        let alert = self.get_alert(id)?;
        if alert.status == AlertStatus::Resolved {
            return Err(DbError::Validation(vec![format!(
                "Alert {} is already resolved",
                id
            )]));
        }
        {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "UPDATE alerts SET status = 'resolved', resolved_at = ?1, notes = COALESCE(?2, notes)
                 WHERE id = ?3 AND status != 'resolved'",
                params![fmt_db_time(at), notes, id],
            )?;
            log_activity(
                &tx,
                "alert_resolved",
                id,
                &serde_json::json!({"auto": false, "note": notes}),
                at,
            )?;
            tx.commit()?;
        }
        self.get_alert(id)
    }

    /// Open alerts on a server.
    pub fn count_open_alerts(&self, server_id: i64) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM alerts WHERE server_id = ?1 AND status != 'resolved'",
            params![server_id],
            |row| row.get(0),
        )?)
    }

    /// Open alert counts by rule severity, across the tenant.
    pub fn count_open_alerts_by_severity(&self) -> Result<SeverityCounts, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT r.severity, COUNT(*) FROM alerts a
             JOIN alert_rules r ON r.id = a.rule_id
             WHERE a.status != 'resolved'
             GROUP BY r.severity",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((enum_col::<Severity>(row, 0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = SeverityCounts::default();
        for (severity, n) in rows {
            match severity {
                Severity::Info => counts.info = n,
                Severity::Warning => counts.warning = n,
                Severity::Critical => counts.critical = n,
            }
            counts.total += n;
        }
        Ok(counts)
    }

    /// Severities of a server's open alerts.
    pub fn open_alert_severities(&self, server_id: i64) -> Result<Vec<Severity>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT r.severity FROM alerts a
             JOIN alert_rules r ON r.id = a.rule_id
             WHERE a.server_id = ?1 AND a.status != 'resolved'",
        )?;
        let rows = stmt
            .query_map(params![server_id], |row| enum_col::<Severity>(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
