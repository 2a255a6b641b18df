//! Operational HTTP surface.

mod handlers;

pub use handlers::*;

use crate::db::TenantRegistry;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TenantRegistry>,
    pub started_at: DateTime<Utc>,
}

pub struct Server {
    state: AppState,
    http_port: u16,
}

impl Server {
    pub fn new(registry: Arc<TenantRegistry>, http_port: u16) -> Self {
        Self {
            state: AppState {
                registry,
                started_at: Utc::now(),
            },
            http_port,
        }
    }

    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/health", get(handlers::handle_health))
            // Jobs
            .route("/api/tenants/{slug}/jobs/{id}/run", post(handlers::handle_run_job))
            .route("/api/tenants/{slug}/jobs/{id}/trigger", post(handlers::handle_trigger_job))
            .route("/api/tenants/{slug}/jobs/{id}/enable", post(handlers::handle_enable_job))
            .route("/api/tenants/{slug}/jobs/{id}/disable", post(handlers::handle_disable_job))
            .route(
                "/api/tenants/{slug}/jobs/{id}/executions",
                get(handlers::handle_get_executions),
            )
            // Alerts
            .route(
                "/api/tenants/{slug}/alerts/{id}/acknowledge",
                post(handlers::handle_acknowledge_alert),
            )
            .route(
                "/api/tenants/{slug}/alerts/{id}/resolve",
                post(handlers::handle_resolve_alert),
            )
            .route("/api/tenants/{slug}/alerts/counts", get(handlers::handle_alert_counts))
            // Servers
            .route(
                "/api/tenants/{slug}/servers/{id}/health",
                get(handlers::handle_server_health),
            )
            .route(
                "/api/tenants/{slug}/servers/{id}/blocking-chains",
                get(handlers::handle_blocking_chains),
            )
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(64 * 1024))
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
