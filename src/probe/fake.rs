//! In-memory remote servers for tests.

use super::*;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Behaviour of one fake server, selected by hostname.
#[derive(Clone, Default)]
pub struct FakeServer {
    pub metrics: HashMap<MetricType, f64>,
    pub failing_metrics: Vec<MetricType>,
    pub queries: Vec<RunningQuerySnapshot>,
    pub connect_error: Option<ConnectError>,
    pub connect_delay: Duration,
    pub rows_affected: u64,
}

#[derive(Clone, Default)]
pub struct FakeClient {
    pub servers: Arc<Mutex<HashMap<String, FakeServer>>>,
    /// Scripts executed, by hostname.
    pub executed: Arc<Mutex<Vec<(String, String)>>>,
    pub probes_run: Arc<Mutex<Vec<MetricType>>>,
}

impl FakeClient {
    pub fn with(self, host: &str, server: FakeServer) -> Self {
        self.servers.lock().unwrap().insert(host.to_string(), server);
        self
    }
}

struct FakeConnection {
    host: String,
    server: FakeServer,
    client: FakeClient,
}

#[async_trait]
impl RemoteClient for FakeClient {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn RemoteConnection>, ConnectError> {
        let server = self
            .servers
            .lock()
            .unwrap()
            .get(&params.host)
            .cloned()
            .ok_or_else(|| ConnectError::Network(format!("no route to {}", params.host)))?;
        if !server.connect_delay.is_zero() {
            tokio::time::sleep(server.connect_delay).await;
        }
        if let Some(e) = server.connect_error.clone() {
            return Err(e);
        }
        Ok(Box::new(FakeConnection {
            host: params.host.clone(),
            server,
            client: self.clone(),
        }))
    }
}

#[async_trait]
impl RemoteConnection for FakeConnection {
    async fn run_probe(&mut self, metric: MetricType) -> Result<Option<f64>, ProbeError> {
        self.client.probes_run.lock().unwrap().push(metric);
        if self.server.failing_metrics.contains(&metric) {
            return Err(ProbeError::Query(format!("{} unavailable", metric)));
        }
        Ok(self.server.metrics.get(&metric).copied())
    }

    async fn running_queries(
        &mut self,
        _probe: &RunningQueryProbe,
    ) -> Result<Vec<RunningQuerySnapshot>, ProbeError> {
        Ok(self.server.queries.clone())
    }

    async fn execute(&mut self, script: &str) -> Result<u64, ProbeError> {
        self.client
            .executed
            .lock()
            .unwrap()
            .push((self.host.clone(), script.to_string()));
        Ok(self.server.rows_affected)
    }

    async fn close(self: Box<Self>) {}
}
