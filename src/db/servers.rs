//! Servers, collection configs and collected snapshots.

use super::models::*;
use super::store::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use std::collections::HashMap;

const SERVER_COLUMNS: &str = "s.id, s.name, s.hostname, s.port, s.instance_name, s.auth_type, \
     s.username, s.encrypted_password, s.status, s.last_checked";

const CONFIG_COLUMNS: &str = "c.server_id, c.interval_seconds, c.enabled, c.metrics_enabled, \
     c.last_collected_at, c.query_collection_enabled, c.query_collection_interval, \
     c.query_min_duration_ms, c.last_query_collected_at, c.query_filter_database, \
     c.query_filter_login, c.query_filter_user, c.query_filter_text_include, \
     c.query_filter_text_exclude";

const SNAPSHOT_COLUMNS: &str = "id, server_id, collected_at, cpu_percent, memory_percent, \
     connection_count, batch_requests_sec, page_life_expectancy, blocked_processes, extended_metrics";

const QUERY_COLUMNS: &str = "id, server_id, collected_at, session_id, request_id, database_name, \
     query_text, start_time, duration_ms, status, wait_type, wait_time_ms, cpu_time_ms, \
     logical_reads, physical_reads, writes, login_name, host_name, program_name, blocking_session_id";

/// Number of columns in [`SERVER_COLUMNS`].
const SERVER_WIDTH: usize = 10;

fn server_from_row(row: &Row<'_>) -> rusqlite::Result<Server> {
    let port: i64 = row.get(3)?;
    Ok(Server {
        id: row.get(0)?,
        name: row.get(1)?,
        hostname: row.get(2)?,
        port: u16::try_from(port).unwrap_or(1433),
        instance_name: row.get(4)?,
        auth_type: enum_col(row, 5)?,
        username: row.get(6)?,
        encrypted_password: row.get(7)?,
        status: enum_col(row, 8)?,
        last_checked: opt_time_col(row, 9)?,
    })
}

/// Decode a config whose columns start at `base`.
fn config_from_row(row: &Row<'_>, base: usize) -> rusqlite::Result<CollectionConfig> {
    let metrics: Vec<String> = serde_json::from_value(json_col(row, base + 3)?).unwrap_or_default();
    let metrics_enabled = metrics
        .iter()
        .filter_map(|m| match m.parse::<MetricType>() {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!("Ignoring {}", e);
                None
            }
        })
        .collect();

    Ok(CollectionConfig {
        server_id: row.get(base)?,
        interval_seconds: row.get(base + 1)?,
        enabled: row.get(base + 2)?,
        metrics_enabled,
        last_collected_at: opt_time_col(row, base + 4)?,
        query_collection_enabled: row.get(base + 5)?,
        query_collection_interval: row.get(base + 6)?,
        query_min_duration_ms: row.get(base + 7)?,
        last_query_collected_at: opt_time_col(row, base + 8)?,
        query_filters: QueryFilters {
            database: row.get(base + 9)?,
            login: row.get(base + 10)?,
            user: row.get(base + 11)?,
            text_include: row.get(base + 12)?,
            text_exclude: row.get(base + 13)?,
        },
    })
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<ServerSnapshot> {
    Ok(ServerSnapshot {
        id: row.get(0)?,
        server_id: row.get(1)?,
        collected_at: time_col(row, 2)?,
        cpu_percent: row.get(3)?,
        memory_percent: row.get(4)?,
        connection_count: row.get(5)?,
        batch_requests_sec: row.get(6)?,
        page_life_expectancy: row.get(7)?,
        blocked_processes: row.get(8)?,
        extended_metrics: opt_json_col(row, 9)?,
    })
}

fn query_from_row(row: &Row<'_>) -> rusqlite::Result<RunningQuerySnapshot> {
    Ok(RunningQuerySnapshot {
        id: row.get(0)?,
        server_id: row.get(1)?,
        collected_at: time_col(row, 2)?,
        session_id: row.get(3)?,
        request_id: row.get(4)?,
        database_name: row.get(5)?,
        query_text: row.get(6)?,
        start_time: opt_time_col(row, 7)?,
        duration_ms: row.get(8)?,
        status: row.get(9)?,
        wait_type: row.get(10)?,
        wait_time_ms: row.get(11)?,
        cpu_time_ms: row.get(12)?,
        logical_reads: row.get(13)?,
        physical_reads: row.get(14)?,
        writes: row.get(15)?,
        login_name: row.get(16)?,
        host_name: row.get(17)?,
        program_name: row.get(18)?,
        blocking_session_id: row.get(19)?,
    })
}

fn insert_running_queries(
    tx: &Transaction<'_>,
    server_id: i64,
    collected_at: DateTime<Utc>,
    queries: &[RunningQuerySnapshot],
) -> Result<(), DbError> {
    let mut stmt = tx.prepare(
        "INSERT INTO running_query_snapshots (server_id, collected_at, session_id, request_id,
            database_name, query_text, start_time, duration_ms, status, wait_type, wait_time_ms,
            cpu_time_ms, logical_reads, physical_reads, writes, login_name, host_name,
            program_name, blocking_session_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
    )?;
    let collected_at = fmt_db_time(collected_at);
    for q in queries {
        stmt.execute(params![
            server_id,
            collected_at,
            q.session_id,
            q.request_id,
            q.database_name,
            q.query_text,
            fmt_opt_time(q.start_time),
            q.duration_ms,
            q.status,
            q.wait_type,
            q.wait_time_ms,
            q.cpu_time_ms,
            q.logical_reads,
            q.physical_reads,
            q.writes,
            q.login_name,
            q.host_name,
            q.program_name,
            q.blocking_session_id,
        ])?;
    }
    Ok(())
}

impl Store {
    // --- Servers ---

    /// Insert a server; `id`, `status` and `last_checked` are ignored.
    pub fn add_server(&self, server: &Server) -> Result<i64, DbError> {
        let mut errors = Vec::new();
        if server.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if server.hostname.trim().is_empty() {
            errors.push("hostname must not be empty".to_string());
        }
        if !errors.is_empty() {
            return Err(DbError::Validation(errors));
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO servers (name, hostname, port, instance_name, auth_type, username, encrypted_password)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                server.name.trim(),
                server.hostname.trim(),
                server.port as i64,
                server.instance_name,
                server.auth_type.as_str(),
                server.username,
                server.encrypted_password,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_server(&self, id: i64) -> Result<Server, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM servers s WHERE s.id = ?1 AND s.is_deleted = 0",
            SERVER_COLUMNS
        );
        conn.query_row(&sql, params![id], server_from_row)
            .optional()?
            .ok_or(DbError::NotFound)
    }

    pub fn list_servers(&self) -> Result<Vec<Server>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM servers s WHERE s.is_deleted = 0 ORDER BY s.id",
            SERVER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let servers = stmt
            .query_map([], server_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(servers)
    }

    pub fn set_server_status(
        &self,
        id: i64,
        status: ServerStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE servers SET status = ?1, last_checked = ?2 WHERE id = ?3",
            params![status.as_str(), fmt_db_time(checked_at), id],
        )?;
        Ok(())
    }

    // --- Collection configs ---

    /// Insert or replace a server's collection config.
    pub fn upsert_collection_config(&self, cfg: &CollectionConfig) -> Result<(), DbError> {
        let mut errors = Vec::new();
        if !(CollectionConfig::MIN_INTERVAL_SECONDS..=CollectionConfig::MAX_INTERVAL_SECONDS)
            .contains(&cfg.interval_seconds)
        {
            errors.push(format!(
                "interval_seconds must be between {} and {}",
                CollectionConfig::MIN_INTERVAL_SECONDS,
                CollectionConfig::MAX_INTERVAL_SECONDS
            ));
        }
        if cfg.query_collection_interval < 1 {
            errors.push("query_collection_interval must be positive".to_string());
        }
        if cfg.query_min_duration_ms < 0 {
            errors.push("query_min_duration_ms must not be negative".to_string());
        }
        if !errors.is_empty() {
            return Err(DbError::Validation(errors));
        }

        let metrics: Vec<&str> = cfg.metrics_enabled.iter().map(|m| m.as_str()).collect();
        let f = &cfg.query_filters;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO collection_configs (server_id, interval_seconds, enabled, metrics_enabled,
                last_collected_at, query_collection_enabled, query_collection_interval,
                query_min_duration_ms, last_query_collected_at, query_filter_database,
                query_filter_login, query_filter_user, query_filter_text_include,
                query_filter_text_exclude)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(server_id) DO UPDATE SET
                interval_seconds = excluded.interval_seconds,
                enabled = excluded.enabled,
                metrics_enabled = excluded.metrics_enabled,
                query_collection_enabled = excluded.query_collection_enabled,
                query_collection_interval = excluded.query_collection_interval,
                query_min_duration_ms = excluded.query_min_duration_ms,
                query_filter_database = excluded.query_filter_database,
                query_filter_login = excluded.query_filter_login,
                query_filter_user = excluded.query_filter_user,
                query_filter_text_include = excluded.query_filter_text_include,
                query_filter_text_exclude = excluded.query_filter_text_exclude",
            params![
                cfg.server_id,
                cfg.interval_seconds,
                cfg.enabled,
                serde_json::to_string(&metrics)?,
                fmt_opt_time(cfg.last_collected_at),
                cfg.query_collection_enabled,
                cfg.query_collection_interval,
                cfg.query_min_duration_ms,
                fmt_opt_time(cfg.last_query_collected_at),
                f.database,
                f.login,
                f.user,
                f.text_include,
                f.text_exclude,
            ],
        )?;
        Ok(())
    }

    pub fn get_collection_config(&self, server_id: i64) -> Result<Option<CollectionConfig>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM collection_configs c WHERE c.server_id = ?1",
            CONFIG_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![server_id], |row| config_from_row(row, 0))
            .optional()?)
    }

    /// Servers whose collection is enabled and whose interval has elapsed.
    pub fn get_due_collections(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Server, CollectionConfig)>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {}, {} FROM servers s
             JOIN collection_configs c ON c.server_id = s.id
             WHERE s.is_deleted = 0 AND c.enabled = 1
             ORDER BY s.id",
            SERVER_COLUMNS, CONFIG_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let pairs = stmt
            .query_map([], |row| {
                Ok((server_from_row(row)?, config_from_row(row, SERVER_WIDTH)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pairs.into_iter().filter(|(_, cfg)| cfg.is_due(now)).collect())
    }

    /// Clear `last_collected_at` so the collector treats the config as due.
    /// `None` targets every enabled config.
    pub fn reset_collection_schedule(&self, server_id: Option<i64>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let n = match server_id {
            Some(id) => conn.execute(
                "UPDATE collection_configs SET last_collected_at = NULL WHERE server_id = ?1 AND enabled = 1",
                params![id],
            )?,
            None => conn.execute(
                "UPDATE collection_configs SET last_collected_at = NULL WHERE enabled = 1",
                [],
            )?,
        };
        Ok(n)
    }

    // --- Collected data ---

    /// Persist one successful collection atomically: the snapshot, the
    /// running queries (when query collection ran), both collection
    /// timestamps and the server's `online` status.
    pub fn record_collection(
        &self,
        snapshot: &ServerSnapshot,
        running_queries: Option<&[RunningQuerySnapshot]>,
    ) -> Result<i64, DbError> {
        let extended = match &snapshot.extended_metrics {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };
        let collected_at = fmt_db_time(snapshot.collected_at);

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO server_snapshots (server_id, collected_at, cpu_percent, memory_percent,
                connection_count, batch_requests_sec, page_life_expectancy, blocked_processes,
                extended_metrics)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                snapshot.server_id,
                collected_at,
                snapshot.cpu_percent,
                snapshot.memory_percent,
                snapshot.connection_count,
                snapshot.batch_requests_sec,
                snapshot.page_life_expectancy,
                snapshot.blocked_processes,
                extended,
            ],
        )?;
        let snapshot_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE collection_configs SET last_collected_at = ?1 WHERE server_id = ?2",
            params![collected_at, snapshot.server_id],
        )?;

        if let Some(queries) = running_queries {
            insert_running_queries(&tx, snapshot.server_id, snapshot.collected_at, queries)?;
            tx.execute(
                "UPDATE collection_configs SET last_query_collected_at = ?1 WHERE server_id = ?2",
                params![collected_at, snapshot.server_id],
            )?;
        }

        tx.execute(
            "UPDATE servers SET status = ?1, last_checked = ?2 WHERE id = ?3",
            params![ServerStatus::Online.as_str(), collected_at, snapshot.server_id],
        )?;

        tx.commit()?;
        Ok(snapshot_id)
    }

    pub fn latest_snapshot(&self, server_id: i64) -> Result<Option<ServerSnapshot>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM server_snapshots WHERE server_id = ?1 ORDER BY collected_at DESC, id DESC LIMIT 1",
            SNAPSHOT_COLUMNS
        );
        Ok(conn.query_row(&sql, params![server_id], snapshot_from_row).optional()?)
    }

    pub fn count_snapshots(&self, server_id: i64) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM server_snapshots WHERE server_id = ?1",
            params![server_id],
            |row| row.get(0),
        )?)
    }

    /// Per-metric averages over snapshots collected at or after `since`.
    pub fn snapshot_averages(
        &self,
        server_id: i64,
        since: DateTime<Utc>,
    ) -> Result<HashMap<MetricType, f64>, DbError> {
        let conn = self.conn()?;
        let row: [Option<f64>; 6] = conn.query_row(
            "SELECT AVG(cpu_percent), AVG(memory_percent), AVG(connection_count),
                    AVG(batch_requests_sec), AVG(page_life_expectancy), AVG(blocked_processes)
             FROM server_snapshots WHERE server_id = ?1 AND collected_at >= ?2",
            params![server_id, fmt_db_time(since)],
            |row| {
                Ok([
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ])
            },
        )?;

        let order = [
            MetricType::CpuPercent,
            MetricType::MemoryPercent,
            MetricType::ConnectionCount,
            MetricType::BatchRequestsSec,
            MetricType::PageLifeExpectancy,
            MetricType::BlockedProcesses,
        ];
        Ok(order
            .into_iter()
            .zip(row)
            .filter_map(|(m, v)| v.map(|v| (m, v)))
            .collect())
    }

    /// Rows of the most recent running-query generation, by session id.
    pub fn latest_running_queries(&self, server_id: i64) -> Result<Vec<RunningQuerySnapshot>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM running_query_snapshots
             WHERE server_id = ?1 AND collected_at = (
                SELECT MAX(collected_at) FROM running_query_snapshots WHERE server_id = ?1)
             ORDER BY session_id, id",
            QUERY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![server_id], query_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::NamedTempFile;

    fn open() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn server(store: &Store, name: &str) -> i64 {
        store
            .add_server(&Server {
                name: name.to_string(),
                hostname: format!("{}.db.local", name),
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn test_due_collections() {
        let (_tmp, store) = open();
        let now = Utc::now();
        let a = server(&store, "a");
        let b = server(&store, "b");
        let c = server(&store, "c");

        let mut cfg = CollectionConfig::new(a);
        cfg.enabled = true;
        store.upsert_collection_config(&cfg).unwrap();

        let mut cfg = CollectionConfig::new(b);
        cfg.enabled = true;
        cfg.last_collected_at = Some(now - Duration::seconds(10));
        store.upsert_collection_config(&cfg).unwrap();

        store.upsert_collection_config(&CollectionConfig::new(c)).unwrap();

        let due = store.get_due_collections(now).unwrap();
        let ids: Vec<i64> = due.iter().map(|(s, _)| s.id).collect();
        assert_eq!(ids, vec![a]);

        assert_eq!(store.reset_collection_schedule(None).unwrap(), 2);
        assert_eq!(store.get_due_collections(now).unwrap().len(), 2);
    }

    #[test]
    fn test_collection_interval_bounds() {
        let (_tmp, store) = open();
        let id = server(&store, "a");
        let mut cfg = CollectionConfig::new(id);
        cfg.interval_seconds = 29;
        assert!(matches!(
            store.upsert_collection_config(&cfg),
            Err(DbError::Validation(_))
        ));
        cfg.interval_seconds = 3601;
        assert!(store.upsert_collection_config(&cfg).is_err());
        cfg.interval_seconds = 3600;
        cfg.metrics_enabled = vec![MetricType::CpuPercent];
        store.upsert_collection_config(&cfg).unwrap();
        let stored = store.get_collection_config(id).unwrap().unwrap();
        assert_eq!(stored.metrics_enabled, vec![MetricType::CpuPercent]);
    }

    #[test]
    fn test_record_collection_is_atomic_unit() {
        let (_tmp, store) = open();
        let id = server(&store, "a");
        let mut cfg = CollectionConfig::new(id);
        cfg.enabled = true;
        cfg.query_collection_enabled = true;
        store.upsert_collection_config(&cfg).unwrap();

        let now = Utc::now();
        let mut snap = ServerSnapshot::empty(id, now);
        snap.set(MetricType::CpuPercent, 12.5);
        let queries = vec![
            RunningQuerySnapshot {
                server_id: id,
                collected_at: now,
                session_id: 61,
                blocking_session_id: Some(55),
                ..Default::default()
            },
            RunningQuerySnapshot {
                server_id: id,
                collected_at: now,
                session_id: 55,
                ..Default::default()
            },
        ];
        store.record_collection(&snap, Some(queries.as_slice())).unwrap();

        let server = store.get_server(id).unwrap();
        assert_eq!(server.status, ServerStatus::Online);
        let cfg = store.get_collection_config(id).unwrap().unwrap();
        assert_eq!(cfg.last_collected_at, Some(now));
        assert_eq!(cfg.last_query_collected_at, Some(now));

        let latest = store.latest_snapshot(id).unwrap().unwrap();
        assert_eq!(latest.cpu_percent, Some(12.5));

        let rows = store.latest_running_queries(id).unwrap();
        let sessions: Vec<i64> = rows.iter().map(|r| r.session_id).collect();
        assert_eq!(sessions, vec![55, 61]);
    }

    #[test]
    fn test_latest_running_queries_only_newest_generation() {
        let (_tmp, store) = open();
        let id = server(&store, "a");
        store.upsert_collection_config(&CollectionConfig::new(id)).unwrap();

        let old = Utc::now() - Duration::seconds(60);
        let new = Utc::now();
        for (at, session) in [(old, 70), (new, 80)] {
            let q = RunningQuerySnapshot {
                server_id: id,
                collected_at: at,
                session_id: session,
                ..Default::default()
            };
            store
                .record_collection(&ServerSnapshot::empty(id, at), Some(&[q][..]))
                .unwrap();
        }

        let rows = store.latest_running_queries(id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].session_id, 80);
    }

    #[test]
    fn test_snapshot_averages() {
        let (_tmp, store) = open();
        let id = server(&store, "a");
        let now = Utc::now();
        for (i, cpu) in [40.0, 60.0].iter().enumerate() {
            let mut snap = ServerSnapshot::empty(id, now - Duration::seconds(i as i64));
            snap.set(MetricType::CpuPercent, *cpu);
            store.record_collection(&snap, None).unwrap();
        }
        let avg = store
            .snapshot_averages(id, now - Duration::minutes(5))
            .unwrap();
        assert_eq!(avg.get(&MetricType::CpuPercent), Some(&50.0));
        assert!(!avg.contains_key(&MetricType::MemoryPercent));
    }
}
