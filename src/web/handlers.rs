//! HTTP request handlers.

use super::AppState;
use crate::alert::server_health;
use crate::collector::blocking_chains_for_server;
use crate::db::{DbError, RegistryError, Store};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Failure of a request, mapped onto a status code.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Registry(RegistryError),
    Db(DbError),
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Db(db) => ApiError::Db(db),
            other => ApiError::Registry(other),
        }
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        ApiError::Db(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.message()),
            ApiError::Registry(RegistryError::InvalidSlug(_)) => {
                (StatusCode::BAD_REQUEST, self.message())
            }
            ApiError::Registry(_) => (StatusCode::NOT_FOUND, self.message()),
            ApiError::Db(DbError::Validation(_)) => (StatusCode::BAD_REQUEST, self.message()),
            ApiError::Db(DbError::NotFound) => (StatusCode::NOT_FOUND, self.message()),
            ApiError::Db(e) => {
                tracing::error!("Request failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal storage error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl ApiError {
    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(m) => m.clone(),
            ApiError::Registry(e) => e.to_string(),
            ApiError::Db(e) => e.to_string(),
        }
    }
}

type ApiResult = Result<Response, ApiError>;

fn store(state: &AppState, slug: &str) -> Result<Arc<Store>, ApiError> {
    Ok(state.registry.get_store(slug)?)
}

/// An optional JSON body; an empty body means all defaults.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))
}

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let tenants = state.registry.list_active_tenants().map(|t| t.len());
    let uptime = (Utc::now() - state.started_at).num_seconds();
    match tenants {
        Ok(n) => Json(json!({
            "status": "ok",
            "active_tenants": n,
            "uptime_seconds": uptime,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "error": e.to_string() })),
        )
            .into_response(),
    }
}

// ============================================================================
// Jobs
// ============================================================================

pub async fn handle_run_job(
    State(state): State<AppState>,
    Path((slug, id)): Path<(String, i64)>,
) -> ApiResult {
    let job = store(&state, &slug)?.run_job_now(id, Utc::now())?;
    tracing::info!("Run-now requested for job {} in tenant {}", id, slug);
    Ok(Json(job).into_response())
}

pub async fn handle_trigger_job(
    State(state): State<AppState>,
    Path((slug, id)): Path<(String, i64)>,
) -> ApiResult {
    let job = store(&state, &slug)?.trigger_event_job(id, Utc::now())?;
    tracing::info!("Event trigger for job {} in tenant {}", id, slug);
    Ok(Json(job).into_response())
}

pub async fn handle_enable_job(
    State(state): State<AppState>,
    Path((slug, id)): Path<(String, i64)>,
) -> ApiResult {
    let job = store(&state, &slug)?.enable_job(id, Utc::now())?;
    Ok(Json(job).into_response())
}

pub async fn handle_disable_job(
    State(state): State<AppState>,
    Path((slug, id)): Path<(String, i64)>,
) -> ApiResult {
    let job = store(&state, &slug)?.disable_job(id)?;
    Ok(Json(job).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ExecutionsQuery {
    pub limit: Option<usize>,
}

pub async fn handle_get_executions(
    State(state): State<AppState>,
    Path((slug, id)): Path<(String, i64)>,
    Query(params): Query<ExecutionsQuery>,
) -> ApiResult {
    let store = store(&state, &slug)?;
    store.get_job(id)?;
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(store.list_executions(id, limit)?).into_response())
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct AcknowledgeRequest {
    pub acknowledged_by: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolveRequest {
    pub notes: Option<String>,
}

pub async fn handle_acknowledge_alert(
    State(state): State<AppState>,
    Path((slug, id)): Path<(String, i64)>,
    body: Bytes,
) -> ApiResult {
    let req: AcknowledgeRequest = optional_body(&body)?;
    let alert = store(&state, &slug)?.acknowledge_alert(id, req.acknowledged_by.as_deref(), Utc::now())?;
    Ok(Json(alert).into_response())
}

pub async fn handle_resolve_alert(
    State(state): State<AppState>,
    Path((slug, id)): Path<(String, i64)>,
    body: Bytes,
) -> ApiResult {
    let req: ResolveRequest = optional_body(&body)?;
    let alert = store(&state, &slug)?.resolve_alert(id, req.notes.as_deref(), Utc::now())?;
    Ok(Json(alert).into_response())
}

pub async fn handle_alert_counts(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult {
    let counts = store(&state, &slug)?.count_open_alerts_by_severity()?;
    Ok(Json(counts).into_response())
}

// ============================================================================
// Servers
// ============================================================================

pub async fn handle_server_health(
    State(state): State<AppState>,
    Path((slug, id)): Path<(String, i64)>,
) -> ApiResult {
    let store = store(&state, &slug)?;
    Ok(Json(server_health(&store, id, Utc::now())?).into_response())
}

pub async fn handle_blocking_chains(
    State(state): State<AppState>,
    Path((slug, id)): Path<(String, i64)>,
) -> ApiResult {
    let store = store(&state, &slug)?;
    Ok(Json(blocking_chains_for_server(&store, id)?).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        AlertRule, JobType, MetricType, NewJob, Operator, ScheduleType, Server, Severity,
        TenantRegistry,
    };
    use tempfile::TempDir;

    fn state() -> (TempDir, AppState, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TenantRegistry::open(dir.path()).unwrap());
        registry.add_tenant("acme", "Acme").unwrap();
        let store = registry.get_store("acme").unwrap();
        let state = AppState {
            registry,
            started_at: Utc::now(),
        };
        (dir, state, store)
    }

    fn job(store: &Store, is_enabled: bool) -> i64 {
        store
            .create_job(
                &NewJob {
                    name: "collect".to_string(),
                    job_type: JobType::DataCollection,
                    configuration: json!({"all": true}),
                    schedule_type: ScheduleType::Interval,
                    schedule_config: json!({"interval_seconds": 300}),
                    is_enabled,
                },
                Utc::now(),
            )
            .unwrap()
            .id
    }

    fn path(id: i64) -> Path<(String, i64)> {
        Path(("acme".to_string(), id))
    }

    fn status(r: ApiResult) -> StatusCode {
        match r {
            Ok(resp) => resp.status(),
            Err(e) => e.into_response().status(),
        }
    }

    #[tokio::test]
    async fn test_run_now_sets_job_due() {
        let (_dir, state, store) = state();
        let id = job(&store, true);
        let before = Utc::now();
        assert_eq!(status(handle_run_job(State(state.clone()), path(id)).await), StatusCode::OK);
        assert!(store.get_job(id).unwrap().next_run_at.unwrap() <= Utc::now());
        assert!(store.get_job(id).unwrap().next_run_at.unwrap() >= before);
        assert_eq!(store.get_due_jobs(Utc::now()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let (_dir, state, store) = state();
        let disabled = job(&store, false);

        assert_eq!(
            status(handle_run_job(State(state.clone()), path(disabled)).await),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(handle_run_job(State(state.clone()), path(9999)).await),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(
                handle_run_job(State(state.clone()), Path(("nobody".to_string(), disabled))).await
            ),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(handle_trigger_job(State(state), path(disabled)).await),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_disable_then_enable() {
        let (_dir, state, store) = state();
        let id = job(&store, true);
        assert_eq!(status(handle_disable_job(State(state.clone()), path(id)).await), StatusCode::OK);
        assert!(store.get_job(id).unwrap().next_run_at.is_none());
        assert_eq!(status(handle_enable_job(State(state), path(id)).await), StatusCode::OK);
        assert!(store.get_job(id).unwrap().next_run_at.is_some());
    }

    #[tokio::test]
    async fn test_alert_acknowledge_and_resolve() {
        let (_dir, state, store) = state();
        let server_id = store
            .add_server(&Server {
                name: "db".to_string(),
                hostname: "db".to_string(),
                ..Default::default()
            })
            .unwrap();
        let rule_id = store
            .create_alert_rule(&AlertRule {
                id: 0,
                name: "cpu".to_string(),
                metric_type: MetricType::CpuPercent,
                operator: Operator::Gt,
                threshold: 90.0,
                severity: Severity::Warning,
                is_enabled: true,
            })
            .unwrap();
        let rule = store.list_enabled_rules().unwrap().remove(0);
        assert_eq!(rule.id, rule_id);
        let alert = store.open_alert(&rule, server_id, 95.0, Utc::now()).unwrap().unwrap();

        let ack = Bytes::from_static(br#"{"acknowledged_by": "oncall"}"#);
        assert_eq!(
            status(handle_acknowledge_alert(State(state.clone()), path(alert.id), ack).await),
            StatusCode::OK
        );
        assert_eq!(
            status(handle_resolve_alert(State(state.clone()), path(alert.id), Bytes::new()).await),
            StatusCode::OK
        );
        assert_eq!(
            status(handle_resolve_alert(State(state.clone()), path(alert.id), Bytes::new()).await),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(
                handle_acknowledge_alert(State(state.clone()), path(alert.id), Bytes::from_static(b"{oops"))
                    .await
            ),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(handle_alert_counts(State(state), Path("acme".to_string())).await),
            StatusCode::OK
        );
        assert_eq!(store.count_open_alerts_by_severity().unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_server_views() {
        let (_dir, state, store) = state();
        let id = store
            .add_server(&Server {
                name: "db".to_string(),
                hostname: "db".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            status(handle_server_health(State(state.clone()), path(id)).await),
            StatusCode::OK
        );
        assert_eq!(
            status(handle_blocking_chains(State(state.clone()), path(id)).await),
            StatusCode::OK
        );
        assert_eq!(
            status(handle_blocking_chains(State(state), path(id + 1)).await),
            StatusCode::NOT_FOUND
        );
    }
}
