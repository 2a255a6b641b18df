//! Probe module for remote database servers.
//!
//! The core talks to monitored servers only through [`RemoteClient`] and
//! [`RemoteConnection`]; [`MssqlClient`] is the SQL Server implementation.

#[cfg(test)]
pub(crate) mod fake;
mod mssql;
mod running;

pub use mssql::*;
pub use running::*;

use crate::crypto::{Cipher, CryptoError};
use crate::db::{AuthType, MetricType, RunningQuerySnapshot, Server};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Failure to open a connection.
#[derive(Error, Debug, Clone)]
pub enum ConnectError {
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("login failed: {0}")]
    Login(String),
    #[error("unsupported connection settings: {0}")]
    Unsupported(String),
}

/// Failure of one probe on an open connection.
#[derive(Error, Debug, Clone)]
pub enum ProbeError {
    #[error("query failed: {0}")]
    Query(String),
    #[error("unexpected result: {0}")]
    Decode(String),
}

/// Everything needed to reach one server, with the password decrypted.
#[derive(Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub instance_name: Option<String>,
    pub auth_type: AuthType,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("instance_name", &self.instance_name)
            .field("auth_type", &self.auth_type)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl ConnectParams {
    /// Connection settings for `server`, decrypting its stored password.
    pub fn for_server(
        server: &Server,
        cipher: &Cipher,
        connect_timeout: Duration,
    ) -> Result<Self, CryptoError> {
        let password = match &server.encrypted_password {
            Some(enc) => Some(cipher.decrypt(enc)?),
            None => None,
        };
        Ok(Self {
            host: server.hostname.clone(),
            port: server.port,
            instance_name: server.instance_name.clone(),
            auth_type: server.auth_type,
            username: server.username.clone(),
            password,
            connect_timeout,
        })
    }
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn RemoteConnection>, ConnectError>;
}

#[async_trait]
pub trait RemoteConnection: Send {
    /// Sample one metric. `Ok(None)` means the server returned no value.
    async fn run_probe(&mut self, metric: MetricType) -> Result<Option<f64>, ProbeError>;

    /// In-flight queries matching `probe`. `server_id` and `collected_at`
    /// are left for the caller to fill in.
    async fn running_queries(
        &mut self,
        probe: &RunningQueryProbe,
    ) -> Result<Vec<RunningQuerySnapshot>, ProbeError>;

    /// Run a script and return the affected row count.
    async fn execute(&mut self, script: &str) -> Result<u64, ProbeError>;

    async fn close(self: Box<Self>);
}

/// Sleep up to 100ms so many servers due in one cycle don't connect in
/// lockstep.
pub async fn jitter() {
    let jitter = rand::random::<u64>() % 100;
    tokio::time::sleep(Duration::from_millis(jitter)).await;
}

/// T-SQL returning one FLOAT value for `metric`.
pub fn metric_sql(metric: MetricType) -> &'static str {
    match metric {
        MetricType::CpuPercent => {
            "SELECT TOP 1 CAST(t.record.value('(./Record/SchedulerMonitorEvent/SystemHealth/ProcessUtilization)[1]', 'int') AS FLOAT)
             FROM (
                SELECT CAST(record AS XML) AS record, [timestamp] AS ts
                FROM sys.dm_os_ring_buffers
                WHERE ring_buffer_type = N'RING_BUFFER_SCHEDULER_MONITOR'
                  AND record LIKE N'%<SystemHealth>%'
             ) AS t
             ORDER BY t.ts DESC"
        }
        MetricType::MemoryPercent => {
            "SELECT CAST((total_physical_memory_kb - available_physical_memory_kb) * 100.0 / total_physical_memory_kb AS FLOAT)
             FROM sys.dm_os_sys_memory"
        }
        MetricType::ConnectionCount => {
            "SELECT CAST(COUNT(*) AS FLOAT) FROM sys.dm_exec_sessions WHERE is_user_process = 1"
        }
        MetricType::BatchRequestsSec => {
            "SELECT TOP 1 CAST(cntr_value AS FLOAT)
             FROM sys.dm_os_performance_counters
             WHERE counter_name = N'Batch Requests/sec'"
        }
        MetricType::PageLifeExpectancy => {
            "SELECT TOP 1 CAST(cntr_value AS FLOAT)
             FROM sys.dm_os_performance_counters
             WHERE counter_name = N'Page life expectancy'
               AND object_name LIKE N'%Buffer Manager%'"
        }
        MetricType::BlockedProcesses => {
            "SELECT CAST(COUNT(*) AS FLOAT) FROM sys.dm_exec_requests WHERE blocking_session_id > 0"
        }
    }
}
