//! SQL Server client implementation over tiberius.

use super::running::{truncate_chars, ProbeParam, RunningQueryProbe, QUERY_TEXT_MAX_CHARS};
use super::{metric_sql, ConnectError, ConnectParams, ProbeError, RemoteClient, RemoteConnection};
use crate::db::{parse_db_time, AuthType, MetricType, RunningQuerySnapshot};

use async_trait::async_trait;
use tiberius::{AuthMethod, Client, Config, Query, Row, SqlBrowser};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

/// Connects to SQL Server with SQL authentication.
#[derive(Debug, Default, Clone, Copy)]
pub struct MssqlClient;

pub struct MssqlConnection {
    client: Client<Compat<TcpStream>>,
}

fn query_err(e: tiberius::error::Error) -> ProbeError {
    ProbeError::Query(e.to_string())
}

fn decode_err(e: tiberius::error::Error) -> ProbeError {
    ProbeError::Decode(e.to_string())
}

#[async_trait]
impl RemoteClient for MssqlClient {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn RemoteConnection>, ConnectError> {
        let mut config = Config::new();
        config.host(&params.host);
        config.port(params.port);
        config.application_name("fleetwatch");
        config.trust_cert();
        if let Some(instance) = &params.instance_name {
            config.instance_name(instance);
        }

        match params.auth_type {
            AuthType::Sql => {
                let user = params.username.as_deref().unwrap_or_default();
                let password = params.password.as_deref().unwrap_or_default();
                config.authentication(AuthMethod::sql_server(user, password));
            }
            AuthType::Windows => {
                return Err(ConnectError::Unsupported(
                    "windows authentication is not available".to_string(),
                ))
            }
        }

        let connect = async {
            let tcp = if params.instance_name.is_some() {
                TcpStream::connect_named(&config)
                    .await
                    .map_err(|e| ConnectError::Network(e.to_string()))?
            } else {
                TcpStream::connect(config.get_addr())
                    .await
                    .map_err(|e| ConnectError::Network(e.to_string()))?
            };
            tcp.set_nodelay(true)
                .map_err(|e| ConnectError::Network(e.to_string()))?;

            Client::connect(config, tcp.compat_write())
                .await
                .map_err(|e| ConnectError::Login(e.to_string()))
        };

        let client = tokio::time::timeout(params.connect_timeout, connect)
            .await
            .map_err(|_| ConnectError::Timeout(params.connect_timeout))??;

        Ok(Box::new(MssqlConnection { client }))
    }
}

fn text(row: &Row, idx: usize) -> Result<Option<String>, ProbeError> {
    Ok(row.try_get::<&str, _>(idx).map_err(decode_err)?.map(str::to_string))
}

fn int(row: &Row, idx: usize) -> Result<Option<i64>, ProbeError> {
    Ok(row.try_get::<i32, _>(idx).map_err(decode_err)?.map(i64::from))
}

fn bigint(row: &Row, idx: usize) -> Result<Option<i64>, ProbeError> {
    row.try_get::<i64, _>(idx).map_err(decode_err)
}

fn running_query_from_row(row: &Row) -> Result<RunningQuerySnapshot, ProbeError> {
    let session_id = int(row, 0)?
        .ok_or_else(|| ProbeError::Decode("session_id is null".to_string()))?;

    Ok(RunningQuerySnapshot {
        session_id,
        request_id: int(row, 1)?,
        database_name: text(row, 2)?,
        query_text: text(row, 3)?.map(|t| truncate_chars(&t, QUERY_TEXT_MAX_CHARS)),
        start_time: text(row, 4)?.as_deref().and_then(parse_db_time),
        duration_ms: bigint(row, 5)?,
        status: text(row, 6)?,
        wait_type: text(row, 7)?,
        wait_time_ms: bigint(row, 8)?,
        cpu_time_ms: bigint(row, 9)?,
        logical_reads: bigint(row, 10)?,
        physical_reads: bigint(row, 11)?,
        writes: bigint(row, 12)?,
        login_name: text(row, 13)?,
        host_name: text(row, 14)?,
        program_name: text(row, 15)?,
        blocking_session_id: int(row, 16)?.filter(|id| *id != 0),
        ..Default::default()
    })
}

#[async_trait]
impl RemoteConnection for MssqlConnection {
    async fn run_probe(&mut self, metric: MetricType) -> Result<Option<f64>, ProbeError> {
        let row = self
            .client
            .simple_query(metric_sql(metric))
            .await
            .map_err(query_err)?
            .into_row()
            .await
            .map_err(query_err)?;
        match row {
            Some(row) => row.try_get::<f64, _>(0).map_err(decode_err),
            None => Ok(None),
        }
    }

    async fn running_queries(
        &mut self,
        probe: &RunningQueryProbe,
    ) -> Result<Vec<RunningQuerySnapshot>, ProbeError> {
        let mut query = Query::new(probe.sql.clone());
        for param in &probe.params {
            match param {
                ProbeParam::Int(v) => query.bind(*v),
                ProbeParam::Text(s) => query.bind(s.clone()),
            }
        }

        let rows = query
            .query(&mut self.client)
            .await
            .map_err(query_err)?
            .into_first_result()
            .await
            .map_err(query_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            match running_query_from_row(row) {
                Ok(q) => out.push(q),
                Err(e) => tracing::debug!("Skipping running query row: {}", e),
            }
        }
        Ok(out)
    }

    async fn execute(&mut self, script: &str) -> Result<u64, ProbeError> {
        let result = self.client.execute(script, &[]).await.map_err(query_err)?;
        Ok(result.total())
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.client.close().await {
            tracing::debug!("Error closing SQL Server connection: {}", e);
        }
    }
}
