//! Running-query probe construction.

use crate::db::CollectionConfig;

/// Longest query text kept per collected row.
pub const QUERY_TEXT_MAX_CHARS: usize = 4000;

/// A bound parameter of a [`RunningQueryProbe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeParam {
    Int(i64),
    Text(String),
}

/// Probe SQL plus its parameters, bound in order as `@P1`, `@P2`, ...
///
/// Filter values never enter the SQL text; only fixed predicate fragments do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningQueryProbe {
    pub sql: String,
    pub params: Vec<ProbeParam>,
}

const SELECT_RUNNING: &str = "SELECT
    CAST(r.session_id AS INT) AS session_id,
    CAST(r.request_id AS INT) AS request_id,
    CAST(DB_NAME(r.database_id) AS NVARCHAR(128)) AS database_name,
    CAST(SUBSTRING(t.text,
        (r.statement_start_offset / 2) + 1,
        ((CASE WHEN r.statement_end_offset = -1
             THEN DATALENGTH(t.text)
             ELSE r.statement_end_offset
          END) - r.statement_start_offset) / 2 + 1) AS NVARCHAR(4000)) AS query_text,
    CONVERT(VARCHAR(33), DATEADD(MINUTE, DATEDIFF(MINUTE, GETDATE(), GETUTCDATE()), r.start_time), 126) AS start_time,
    CAST(DATEDIFF_BIG(MILLISECOND, r.start_time, GETDATE()) AS BIGINT) AS duration_ms,
    CAST(r.status AS NVARCHAR(30)) AS status,
    CAST(r.wait_type AS NVARCHAR(60)) AS wait_type,
    CAST(r.wait_time AS BIGINT) AS wait_time_ms,
    CAST(r.cpu_time AS BIGINT) AS cpu_time_ms,
    CAST(r.logical_reads AS BIGINT) AS logical_reads,
    CAST(r.reads AS BIGINT) AS physical_reads,
    CAST(r.writes AS BIGINT) AS writes,
    CAST(s.login_name AS NVARCHAR(128)) AS login_name,
    CAST(s.host_name AS NVARCHAR(128)) AS host_name,
    CAST(s.program_name AS NVARCHAR(128)) AS program_name,
    CAST(r.blocking_session_id AS INT) AS blocking_session_id
FROM sys.dm_exec_requests r
CROSS APPLY sys.dm_exec_sql_text(r.sql_handle) t
LEFT JOIN sys.dm_exec_sessions s ON r.session_id = s.session_id";

impl RunningQueryProbe {
    /// Build the probe for a server's query filters.
    pub fn build(cfg: &CollectionConfig) -> Self {
        let mut params = vec![ProbeParam::Int(cfg.query_min_duration_ms.max(0))];
        let mut predicates = vec![
            "r.session_id > 50".to_string(),
            "r.session_id <> @@SPID".to_string(),
            "r.sql_handle IS NOT NULL".to_string(),
            "DATEDIFF_BIG(MILLISECOND, r.start_time, GETDATE()) >= @P1".to_string(),
        ];

        let f = &cfg.query_filters;
        let filters = [
            ("DB_NAME(r.database_id) LIKE", &f.database),
            ("s.login_name LIKE", &f.login),
            ("s.nt_user_name LIKE", &f.user),
            ("t.text LIKE", &f.text_include),
            ("t.text NOT LIKE", &f.text_exclude),
        ];
        for (fragment, value) in filters {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                params.push(ProbeParam::Text(value.to_string()));
                predicates.push(format!("{} @P{}", fragment, params.len()));
            }
        }

        let sql = format!(
            "{}\nWHERE {}\nORDER BY r.start_time",
            SELECT_RUNNING,
            predicates.join("\n  AND ")
        );
        Self { sql, params }
    }

    /// The probe with parameters inlined as escaped literals, for clients
    /// that cannot bind parameters.
    pub fn inline(&self) -> String {
        // Substitute from the highest index so @P1 never matches inside @P10.
        let mut sql = self.sql.clone();
        for (i, param) in self.params.iter().enumerate().rev() {
            let literal = match param {
                ProbeParam::Int(v) => v.to_string(),
                ProbeParam::Text(s) => format!("N'{}'", escape_sql_literal(s)),
            };
            sql = sql.replace(&format!("@P{}", i + 1), &literal);
        }
        sql
    }
}

/// Escape a value for use inside a T-SQL `N'...'` literal: quotes are
/// doubled and NUL characters dropped.
pub fn escape_sql_literal(value: &str) -> String {
    value.chars().filter(|c| *c != '\0').collect::<String>().replace('\'', "''")
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
