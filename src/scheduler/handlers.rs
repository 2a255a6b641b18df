//! Built-in job handlers.

use super::executor::{HandlerRegistry, JobContext, JobError, JobHandler};
use crate::alert::AlertEvaluator;
use crate::crypto::Cipher;
use crate::db::JobType;
use crate::probe::{ConnectParams, RemoteClient};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Marks servers due so the collector samples them on its next cycle.
///
/// Configuration: `{"server_id": N}` or `{"all": true}`.
pub struct DataCollectionHandler;

#[async_trait]
impl JobHandler for DataCollectionHandler {
    async fn run(&self, ctx: JobContext) -> Result<Value, JobError> {
        let cfg = &ctx.job.configuration;
        let target = if let Some(id) = cfg.get("server_id").and_then(Value::as_i64) {
            Some(id)
        } else if cfg.get("all").and_then(Value::as_bool) == Some(true) {
            None
        } else {
            return Err(JobError::InvalidConfig(
                "data_collection needs server_id or all=true".to_string(),
            ));
        };

        let scheduled = ctx.store.reset_collection_schedule(target)?;
        tracing::info!(
            "Job {}: scheduled collection for {} servers in tenant {}",
            ctx.job.id,
            scheduled,
            ctx.tenant
        );
        Ok(json!({ "servers_scheduled": scheduled }))
    }
}

/// Runs the shared alert evaluator over every server.
///
/// With `window_minutes` set, averages over that window are evaluated
/// instead of the latest snapshot.
pub struct AlertCheckHandler {
    evaluator: Arc<AlertEvaluator>,
}

impl AlertCheckHandler {
    pub fn new(evaluator: Arc<AlertEvaluator>) -> Self {
        Self { evaluator }
    }
}

#[async_trait]
impl JobHandler for AlertCheckHandler {
    async fn run(&self, ctx: JobContext) -> Result<Value, JobError> {
        let now = Utc::now();
        let summary = match ctx.job.configuration.get("window_minutes") {
            Some(v) => {
                let minutes = v.as_i64().filter(|m| *m > 0).ok_or_else(|| {
                    JobError::InvalidConfig("window_minutes must be a positive integer".to_string())
                })?;
                self.evaluator
                    .evaluate_with_aggregates(&ctx.tenant, &ctx.store, minutes, now)?
            }
            None => self.evaluator.evaluate_all_servers(&ctx.tenant, &ctx.store, now)?,
        };
        Ok(serde_json::to_value(summary).map_err(crate::db::DbError::from)?)
    }
}

/// Executes `script_content` on `server_id`.
pub struct CustomScriptHandler {
    client: Arc<dyn RemoteClient>,
    cipher: Arc<Cipher>,
    connect_timeout: Duration,
}

impl CustomScriptHandler {
    pub fn new(client: Arc<dyn RemoteClient>, cipher: Arc<Cipher>, connect_timeout: Duration) -> Self {
        Self {
            client,
            cipher,
            connect_timeout,
        }
    }
}

#[async_trait]
impl JobHandler for CustomScriptHandler {
    async fn run(&self, ctx: JobContext) -> Result<Value, JobError> {
        let cfg = &ctx.job.configuration;
        let server_id = cfg
            .get("server_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| JobError::InvalidConfig("server_id is required".to_string()))?;
        let script = cfg
            .get("script_content")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| JobError::InvalidConfig("script_content is required".to_string()))?;

        let server = ctx.store.get_server(server_id)?;
        let params = ConnectParams::for_server(&server, &self.cipher, self.connect_timeout)?;
        let mut conn = self.client.connect(&params).await?;
        let result = conn.execute(script).await;
        conn.close().await;
        let rows_affected = result?;

        tracing::info!(
            "Job {}: script ran on {} ({} rows affected)",
            ctx.job.id,
            server.name,
            rows_affected
        );
        Ok(json!({
            "server_id": server_id,
            "rows_affected": rows_affected,
            "script_length": script.len(),
        }))
    }
}

/// Registry with the built-in handlers. `policy_execution` has none until
/// one is registered.
pub fn default_handlers(
    evaluator: Arc<AlertEvaluator>,
    client: Arc<dyn RemoteClient>,
    cipher: Arc<Cipher>,
    connect_timeout: Duration,
) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(JobType::DataCollection, Arc::new(DataCollectionHandler));
    registry.register(JobType::AlertCheck, Arc::new(AlertCheckHandler::new(evaluator)));
    registry.register(
        JobType::CustomScript,
        Arc::new(CustomScriptHandler::new(client, cipher, connect_timeout)),
    );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CollectionConfig, NewJob, ScheduleType, Server, Store};
    use crate::probe::fake::{FakeClient, FakeServer};
    use tempfile::NamedTempFile;

    fn ctx(store: Arc<Store>, job_type: JobType, configuration: Value) -> JobContext {
        let job = store
            .create_job(
                &NewJob {
                    name: "j".to_string(),
                    job_type,
                    configuration,
                    schedule_type: ScheduleType::EventTriggered,
                    schedule_config: json!({}),
                    is_enabled: true,
                },
                Utc::now(),
            )
            .unwrap();
        JobContext {
            tenant: "acme".to_string(),
            store,
            job,
            execution_id: 0,
        }
    }

    fn store_with_server(cipher: &Cipher) -> (NamedTempFile, Arc<Store>, i64) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let id = store
            .add_server(&Server {
                name: "sql-01".to_string(),
                hostname: "sql-01".to_string(),
                username: Some("sa".to_string()),
                encrypted_password: Some(cipher.encrypt("pw").unwrap()),
                ..Default::default()
            })
            .unwrap();
        (tmp, store, id)
    }

    #[tokio::test]
    async fn test_data_collection_marks_server_due() {
        let cipher = Cipher::from_passphrase("k").unwrap();
        let (_tmp, store, id) = store_with_server(&cipher);
        let mut cfg = CollectionConfig::new(id);
        cfg.enabled = true;
        cfg.last_collected_at = Some(Utc::now());
        store.upsert_collection_config(&cfg).unwrap();
        assert!(store.get_due_collections(Utc::now()).unwrap().is_empty());

        let out = DataCollectionHandler
            .run(ctx(store.clone(), JobType::DataCollection, json!({"server_id": id})))
            .await
            .unwrap();
        assert_eq!(out["servers_scheduled"], 1);
        assert_eq!(store.get_due_collections(Utc::now()).unwrap().len(), 1);

        let err = DataCollectionHandler
            .run(ctx(store, JobType::DataCollection, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_custom_script_runs_on_target() {
        let cipher = Arc::new(Cipher::from_passphrase("k").unwrap());
        let (_tmp, store, id) = store_with_server(&cipher);
        let client = FakeClient::default().with(
            "sql-01",
            FakeServer {
                rows_affected: 3,
                ..Default::default()
            },
        );
        let handler =
            CustomScriptHandler::new(Arc::new(client.clone()), cipher, Duration::from_secs(1));

        let script = "UPDATE t SET x = 1";
        let out = handler
            .run(ctx(
                store.clone(),
                JobType::CustomScript,
                json!({"server_id": id, "script_content": script}),
            ))
            .await
            .unwrap();
        assert_eq!(out["rows_affected"], 3);
        assert_eq!(out["script_length"], script.len());
        assert_eq!(
            client.executed.lock().unwrap().clone(),
            vec![("sql-01".to_string(), script.to_string())]
        );

        let err = handler
            .run(ctx(store, JobType::CustomScript, json!({"server_id": id})))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_custom_script_connect_failure() {
        let cipher = Arc::new(Cipher::from_passphrase("k").unwrap());
        let (_tmp, store, id) = store_with_server(&cipher);
        let handler = CustomScriptHandler::new(
            Arc::new(FakeClient::default()),
            cipher,
            Duration::from_secs(1),
        );
        let err = handler
            .run(ctx(
                store,
                JobType::CustomScript,
                json!({"server_id": id, "script_content": "SELECT 1"}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Connect(_)));
    }

    #[test]
    fn test_default_handlers_leave_policy_unregistered() {
        let registry = default_handlers(
            Arc::new(AlertEvaluator::default()),
            Arc::new(FakeClient::default()),
            Arc::new(Cipher::from_passphrase("k").unwrap()),
            Duration::from_secs(1),
        );
        assert!(registry.get(JobType::PolicyExecution).is_none());
        assert!(registry.get(JobType::CustomScript).is_some());
    }
}
