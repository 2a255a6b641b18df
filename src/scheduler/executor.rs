//! Job execution with handler lookup and a per-run timeout.

use crate::crypto::CryptoError;
use crate::db::{DbError, Job, JobType, Store};
use crate::probe::{ConnectError, ProbeError};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors a handler reports; the message ends up in `error_message`.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Invalid job configuration: {0}")]
    InvalidConfig(String),
    #[error("Storage error: {0}")]
    Db(#[from] DbError),
    #[error("Credential decryption failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Connection failed: {0}")]
    Connect(#[from] ConnectError),
    #[error("Remote execution failed: {0}")]
    Probe(#[from] ProbeError),
    #[error("{0}")]
    Failed(String),
}

/// What a handler gets to work with.
#[derive(Clone)]
pub struct JobContext {
    pub tenant: String,
    pub store: Arc<Store>,
    pub job: Job,
    pub execution_id: i64,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value, JobError>;
}

/// Handlers keyed by job type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type, handler);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }
}

/// Result of one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    fn failed(error: String) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
        }
    }
}

pub struct JobExecutor {
    handlers: HandlerRegistry,
    default_timeout: Duration,
}

impl JobExecutor {
    pub fn new(handlers: HandlerRegistry, default_timeout: Duration) -> Self {
        Self {
            handlers,
            default_timeout,
        }
    }

    #[cfg(test)]
    pub async fn execute(&self, ctx: JobContext) -> ExecutionOutcome {
        self.execute_holding(ctx, ()).await
    }

    /// Run the handler for `ctx.job`. Never fails: every problem becomes an
    /// unsuccessful outcome.
    ///
    /// On timeout the handler task is detached, not cancelled, so it may
    /// still complete later; the outcome is reported as failed. `guard` is
    /// owned by the handler task and released only when the handler returns.
    pub async fn execute_holding<G>(&self, ctx: JobContext, guard: G) -> ExecutionOutcome
    where
        G: Send + 'static,
    {
        let job_type = ctx.job.job_type;
        let handler = match self.handlers.get(job_type) {
            Some(h) => h,
            None => {
                return ExecutionOutcome::failed(format!(
                    "No handler registered for job type: {}",
                    job_type
                ))
            }
        };

        let timeout = ctx
            .job
            .timeout_override()
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let task = tokio::spawn(async move {
            let _guard = guard;
            handler.run(ctx).await
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(result))) => ExecutionOutcome {
                success: true,
                result: Some(result),
                error: None,
            },
            Ok(Ok(Err(e))) => ExecutionOutcome::failed(e.to_string()),
            Ok(Err(join_err)) => {
                ExecutionOutcome::failed(format!("Job handler crashed: {}", join_err))
            }
            Err(_) => ExecutionOutcome::failed(format!(
                "Job execution timed out after {} seconds",
                timeout.as_secs()
            )),
        }
    }
}
