//! Metric collector loop.
//!
//! Each cycle finds servers due for collection in every active tenant and
//! samples each one as an independent unit on a bounded pool.

mod blocking;

pub use blocking::*;

use crate::alert::AlertEvaluator;
use crate::crypto::Cipher;
use crate::db::{
    CollectionConfig, RegistryError, RunningQuerySnapshot, Server, ServerSnapshot, ServerStatus,
    Store, TenantRegistry,
};
use crate::pool::{Claim, ClaimSet, WorkerPool};
use crate::probe::{jitter, ConnectParams, RemoteClient, RunningQueryProbe};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_COLLECTOR_WORKERS: usize = 10;
pub const DEFAULT_UNIT_TIMEOUT: Duration = Duration::from_secs(5);

/// How one server's collection ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionOutcome {
    Collected {
        snapshot_id: i64,
        metrics_collected: usize,
        queries_collected: Option<usize>,
    },
    /// Stored credentials could not be decrypted.
    CredentialError(String),
    /// The server could not be reached.
    Offline(String),
    /// Every enabled probe failed.
    ProbesFailed,
    /// Persisting the results failed.
    StoreError(String),
    TimedOut,
}

/// Shared by every unit of a collector.
struct Collaborators {
    client: Arc<dyn RemoteClient>,
    cipher: Arc<Cipher>,
    evaluator: Arc<AlertEvaluator>,
    unit_timeout: Duration,
}

pub struct MetricCollector {
    registry: Arc<TenantRegistry>,
    deps: Arc<Collaborators>,
    pool: WorkerPool,
    poll_interval: Duration,
    in_flight: ClaimSet<(String, i64)>,
    stop: Arc<tokio::sync::Mutex<Option<broadcast::Sender<()>>>>,
}

impl MetricCollector {
    pub fn new(
        registry: Arc<TenantRegistry>,
        client: Arc<dyn RemoteClient>,
        cipher: Arc<Cipher>,
        evaluator: Arc<AlertEvaluator>,
        pool: WorkerPool,
        poll_interval: Duration,
        unit_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            deps: Arc::new(Collaborators {
                client,
                cipher,
                evaluator,
                unit_timeout,
            }),
            pool,
            poll_interval,
            in_flight: ClaimSet::new(),
            stop: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Start the collection loop. The first cycle runs immediately.
    pub fn start(self: &Arc<Self>) {
        let collector = self.clone();

        tokio::spawn(async move {
            let (tx, _) = broadcast::channel(1);
            {
                let mut stop_guard = collector.stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            tracing::info!("Collector started (poll every {:?})", collector.poll_interval);

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(collector.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        collector.collect_cycle(Utc::now());
                    }
                }
            }
            tracing::info!("Collector stopped");
        });
    }

    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }

    /// One cycle: dispatch every server due at `now` across all active tenants.
    pub fn collect_cycle(&self, now: DateTime<Utc>) -> Vec<JoinHandle<CollectionOutcome>> {
        let tenants = match self.registry.list_active_tenants() {
            Ok(t) => t,
            Err(e) => {
                tracing::error!("Collector: failed to list tenants: {}", e);
                return Vec::new();
            }
        };

        let mut handles = Vec::new();
        for tenant in tenants {
            match self.dispatch_tenant(&tenant, now) {
                Ok(mut h) => handles.append(&mut h),
                Err(e) => tracing::error!("Collector: tenant {} skipped this cycle: {}", tenant, e),
            }
        }
        handles
    }

    fn dispatch_tenant(
        &self,
        tenant: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<JoinHandle<CollectionOutcome>>, RegistryError> {
        let store = self.registry.get_store(tenant)?;
        let due = store.get_due_collections(now)?;

        let mut handles = Vec::new();
        for (server, cfg) in due {
            let claim = match self.in_flight.claim((tenant.to_string(), server.id)) {
                Some(c) => c,
                None => continue,
            };
            let server_name = server.name.clone();
            let unit = run_unit(
                self.deps.clone(),
                tenant.to_string(),
                store.clone(),
                server,
                cfg,
                claim,
            );
            match self.pool.spawn(unit) {
                Ok(h) => handles.push(h),
                Err(e) => tracing::warn!(
                    "Skipping collection for {} in tenant {} until next cycle: {}",
                    server_name,
                    tenant,
                    e
                ),
            }
        }
        Ok(handles)
    }
}

fn mark(store: &Store, tenant: &str, server: &Server, status: ServerStatus) {
    if let Err(e) = store.set_server_status(server.id, status, Utc::now()) {
        tracing::error!(
            "Failed to mark {} {} in tenant {}: {}",
            server.name,
            status,
            tenant,
            e
        );
    }
}

async fn run_unit(
    deps: Arc<Collaborators>,
    tenant: String,
    store: Arc<Store>,
    server: Server,
    cfg: CollectionConfig,
    _claim: Claim<(String, i64)>,
) -> CollectionOutcome {
    let collect = collect_server(&deps, &tenant, &store, &server, &cfg);
    match tokio::time::timeout(deps.unit_timeout, collect).await {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::warn!(
                "Collection timed out for {} in tenant {} after {:?}",
                server.name,
                tenant,
                deps.unit_timeout
            );
            mark(&store, &tenant, &server, ServerStatus::Error);
            CollectionOutcome::TimedOut
        }
    }
}

async fn collect_server(
    deps: &Collaborators,
    tenant: &str,
    store: &Store,
    server: &Server,
    cfg: &CollectionConfig,
) -> CollectionOutcome {
    jitter().await;
    let now = Utc::now();

    let params = match ConnectParams::for_server(server, &deps.cipher, deps.unit_timeout) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(
                "Cannot decrypt credentials for {} in tenant {}: {}",
                server.name,
                tenant,
                e
            );
            mark(store, tenant, server, ServerStatus::Error);
            return CollectionOutcome::CredentialError(e.to_string());
        }
    };

    let mut conn = match deps.client.connect(&params).await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("Cannot connect to {} in tenant {}: {}", server.name, tenant, e);
            mark(store, tenant, server, ServerStatus::Offline);
            return CollectionOutcome::Offline(e.to_string());
        }
    };

    let metrics = cfg.effective_metrics();
    let mut snapshot = ServerSnapshot::empty(server.id, now);
    let mut collected = 0;
    let mut failed = 0;
    for metric in &metrics {
        match conn.run_probe(*metric).await {
            Ok(Some(v)) => {
                snapshot.set(*metric, v);
                collected += 1;
            }
            Ok(None) => tracing::debug!("No {} value from {}", metric, server.name),
            Err(e) => {
                failed += 1;
                tracing::warn!("Probe {} failed on {}: {}", metric, server.name, e);
            }
        }
    }

    if failed == metrics.len() {
        conn.close().await;
        tracing::error!("All probes failed on {} in tenant {}", server.name, tenant);
        mark(store, tenant, server, ServerStatus::Error);
        return CollectionOutcome::ProbesFailed;
    }

    let queries: Option<Vec<RunningQuerySnapshot>> = if cfg.query_collection_due(now) {
        match conn.running_queries(&RunningQueryProbe::build(cfg)).await {
            Ok(rows) => Some(rows),
            Err(e) => {
                tracing::warn!("Running-query probe failed on {}: {}", server.name, e);
                None
            }
        }
    } else {
        None
    };

    conn.close().await;

    let snapshot_id = match store.record_collection(&snapshot, queries.as_deref()) {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(
                "Failed to store collection for {} in tenant {}: {}",
                server.name,
                tenant,
                e
            );
            mark(store, tenant, server, ServerStatus::Error);
            return CollectionOutcome::StoreError(e.to_string());
        }
    };

    tracing::debug!(
        "Collected {} metrics from {} in tenant {}",
        collected,
        server.name,
        tenant
    );

    if let Err(e) = deps
        .evaluator
        .evaluate(tenant, store, server.id, &snapshot.metrics(), snapshot.collected_at, now)
    {
        tracing::error!(
            "Alert evaluation failed for {} in tenant {}: {}",
            server.name,
            tenant,
            e
        );
    }

    CollectionOutcome::Collected {
        snapshot_id,
        metrics_collected: collected,
        queries_collected: queries.as_ref().map(Vec::len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AlertRule, MetricType, Operator, Severity};
    use crate::probe::fake::{FakeClient, FakeServer};
    use crate::probe::ConnectError;
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        registry: Arc<TenantRegistry>,
        store: Arc<Store>,
        cipher: Arc<Cipher>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TenantRegistry::open(dir.path()).unwrap());
        registry.add_tenant("acme", "Acme").unwrap();
        let store = registry.get_store("acme").unwrap();
        Fixture {
            _dir: dir,
            registry,
            store,
            cipher: Arc::new(Cipher::from_passphrase("test-key").unwrap()),
        }
    }

    impl Fixture {
        fn server(&self, host: &str, encrypted_password: Option<String>) -> i64 {
            let id = self
                .store
                .add_server(&Server {
                    name: host.to_string(),
                    hostname: host.to_string(),
                    username: Some("monitor".to_string()),
                    encrypted_password,
                    ..Default::default()
                })
                .unwrap();
            let mut cfg = CollectionConfig::new(id);
            cfg.enabled = true;
            self.store.upsert_collection_config(&cfg).unwrap();
            id
        }

        fn good_server(&self, host: &str) -> i64 {
            let pw = self.cipher.encrypt("secret").unwrap();
            self.server(host, Some(pw))
        }

        fn collector(&self, client: FakeClient, timeout: Duration) -> MetricCollector {
            MetricCollector::new(
                self.registry.clone(),
                Arc::new(client),
                self.cipher.clone(),
                Arc::new(AlertEvaluator::default()),
                WorkerPool::new("collector", 10, 4),
                DEFAULT_POLL_INTERVAL,
                timeout,
            )
        }
    }

    fn healthy() -> FakeServer {
        FakeServer {
            metrics: HashMap::from([
                (MetricType::CpuPercent, 42.0),
                (MetricType::MemoryPercent, 61.5),
                (MetricType::ConnectionCount, 17.0),
            ]),
            ..Default::default()
        }
    }

    async fn run(collector: &MetricCollector) -> Vec<CollectionOutcome> {
        let mut out = Vec::new();
        for h in collector.collect_cycle(Utc::now()) {
            out.push(h.await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_bad_credentials_do_not_affect_other_servers() {
        let f = fixture();
        let bad = f.server("bad-host", Some("not-a-ciphertext".to_string()));
        let good = f.good_server("good-host");
        let client = FakeClient::default()
            .with("bad-host", healthy())
            .with("good-host", healthy());

        let outcomes = run(&f.collector(client, DEFAULT_UNIT_TIMEOUT)).await;
        assert_eq!(outcomes.len(), 2);

        assert_eq!(f.store.get_server(bad).unwrap().status, ServerStatus::Error);
        assert_eq!(f.store.count_snapshots(bad).unwrap(), 0);

        assert_eq!(f.store.get_server(good).unwrap().status, ServerStatus::Online);
        let snap = f.store.latest_snapshot(good).unwrap().unwrap();
        assert_eq!(snap.cpu_percent, Some(42.0));
        assert_eq!(snap.connection_count, Some(17));
        assert!(f
            .store
            .get_collection_config(good)
            .unwrap()
            .unwrap()
            .last_collected_at
            .is_some());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_offline() {
        let f = fixture();
        let id = f.good_server("down-host");
        let client = FakeClient::default().with(
            "down-host",
            FakeServer {
                connect_error: Some(ConnectError::Login("bad password".to_string())),
                ..Default::default()
            },
        );

        let outcomes = run(&f.collector(client, DEFAULT_UNIT_TIMEOUT)).await;
        assert!(matches!(outcomes[0], CollectionOutcome::Offline(_)));
        assert_eq!(f.store.get_server(id).unwrap().status, ServerStatus::Offline);
        assert_eq!(f.store.count_snapshots(id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_probe_is_omitted() {
        let f = fixture();
        let id = f.good_server("db");
        let mut server = healthy();
        server.failing_metrics = vec![MetricType::CpuPercent];
        let client = FakeClient::default().with("db", server);

        let outcomes = run(&f.collector(client.clone(), DEFAULT_UNIT_TIMEOUT)).await;
        assert!(matches!(
            outcomes[0],
            CollectionOutcome::Collected {
                metrics_collected: 2,
                ..
            }
        ));
        let snap = f.store.latest_snapshot(id).unwrap().unwrap();
        assert_eq!(snap.cpu_percent, None);
        assert_eq!(snap.memory_percent, Some(61.5));
        // Every metric was still attempted.
        assert_eq!(client.probes_run.lock().unwrap().len(), MetricType::ALL.len());
    }

    #[tokio::test]
    async fn test_all_probes_failing_marks_error() {
        let f = fixture();
        let id = f.good_server("db");
        let client = FakeClient::default().with(
            "db",
            FakeServer {
                failing_metrics: MetricType::ALL.to_vec(),
                ..Default::default()
            },
        );

        let outcomes = run(&f.collector(client, DEFAULT_UNIT_TIMEOUT)).await;
        assert_eq!(outcomes, vec![CollectionOutcome::ProbesFailed]);
        assert_eq!(f.store.get_server(id).unwrap().status, ServerStatus::Error);
        assert_eq!(f.store.count_snapshots(id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let f = fixture();
        let id = f.good_server("slow");
        let mut server = healthy();
        server.connect_delay = Duration::from_secs(5);
        let client = FakeClient::default().with("slow", server);

        let outcomes = run(&f.collector(client, Duration::from_millis(300))).await;
        assert_eq!(outcomes, vec![CollectionOutcome::TimedOut]);
        assert_eq!(f.store.get_server(id).unwrap().status, ServerStatus::Error);
    }

    #[tokio::test]
    async fn test_collects_running_queries_when_due() {
        let f = fixture();
        let id = f.good_server("db");
        let mut cfg = f.store.get_collection_config(id).unwrap().unwrap();
        cfg.query_collection_enabled = true;
        f.store.upsert_collection_config(&cfg).unwrap();

        let mut server = healthy();
        server.queries = vec![
            RunningQuerySnapshot {
                session_id: 60,
                ..Default::default()
            },
            RunningQuerySnapshot {
                session_id: 61,
                blocking_session_id: Some(60),
                ..Default::default()
            },
        ];
        let client = FakeClient::default().with("db", server);

        let outcomes = run(&f.collector(client, DEFAULT_UNIT_TIMEOUT)).await;
        assert!(matches!(
            outcomes[0],
            CollectionOutcome::Collected {
                queries_collected: Some(2),
                ..
            }
        ));

        let chains = blocking_chains_for_server(&f.store, id).unwrap();
        assert_eq!(chains.chains.len(), 1);
        assert_eq!(chains.chains[0].session_id, 60);
        assert_eq!(chains.total_blocked_sessions, 1);
    }

    #[tokio::test]
    async fn test_collected_metrics_feed_alerts() {
        let f = fixture();
        let id = f.good_server("hot");
        f.store
            .create_alert_rule(&AlertRule {
                id: 0,
                name: "High CPU".to_string(),
                metric_type: MetricType::CpuPercent,
                operator: Operator::Gt,
                threshold: 90.0,
                severity: Severity::Critical,
                is_enabled: true,
            })
            .unwrap();
        let mut server = healthy();
        server.metrics.insert(MetricType::CpuPercent, 97.0);
        let client = FakeClient::default().with("hot", server);

        let collector = f.collector(client, DEFAULT_UNIT_TIMEOUT);
        run(&collector).await;
        assert_eq!(f.store.count_open_alerts(id).unwrap(), 1);

        // Not due again until the interval elapses.
        assert!(collector.collect_cycle(Utc::now()).is_empty());
    }
}
