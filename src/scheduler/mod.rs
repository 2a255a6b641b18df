//! Scheduler loop: finds due jobs in every tenant and runs them.

mod executor;
mod handlers;
mod retention;
pub mod schedule;

pub use executor::*;
pub use handlers::*;
pub use retention::*;

use crate::db::{ExecutionStatus, Job, RegistryError, Store, TenantRegistry};
use crate::pool::{Claim, ClaimSet, Lease, WorkerPool};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_JOB_WORKERS: usize = 5;
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(1800);

/// Polls every active tenant for due jobs and hands them to a bounded pool.
pub struct Scheduler {
    registry: Arc<TenantRegistry>,
    executor: Arc<JobExecutor>,
    pool: WorkerPool,
    poll_interval: Duration,
    in_flight: ClaimSet<(String, i64)>,
    stop: Arc<tokio::sync::Mutex<Option<broadcast::Sender<()>>>>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<TenantRegistry>,
        executor: Arc<JobExecutor>,
        pool: WorkerPool,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            executor,
            pool,
            poll_interval,
            in_flight: ClaimSet::new(),
            stop: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Start the polling loop. The first cycle runs immediately.
    pub fn start(self: &Arc<Self>) {
        let scheduler = self.clone();

        tokio::spawn(async move {
            let (tx, _) = broadcast::channel(1);
            {
                let mut stop_guard = scheduler.stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            tracing::info!(
                "Scheduler started (poll every {:?}, {} pool)",
                scheduler.poll_interval,
                scheduler.pool.name()
            );

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(scheduler.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        scheduler.dispatch_due_jobs(Utc::now());
                    }
                }
            }
            tracing::info!("Scheduler stopped");
        });
    }

    /// Stop the polling loop. Jobs already dispatched run to completion.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }

    /// One cycle: dispatch every job due at `now` across all active tenants.
    pub fn dispatch_due_jobs(&self, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        let tenants = match self.registry.list_active_tenants() {
            Ok(t) => t,
            Err(e) => {
                tracing::error!("Scheduler: failed to list tenants: {}", e);
                return Vec::new();
            }
        };

        let mut handles = Vec::new();
        for tenant in tenants {
            match self.dispatch_tenant(&tenant, now) {
                Ok(mut h) => handles.append(&mut h),
                Err(e) => tracing::error!("Scheduler: tenant {} skipped this cycle: {}", tenant, e),
            }
        }
        handles
    }

    fn dispatch_tenant(
        &self,
        tenant: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<JoinHandle<()>>, RegistryError> {
        let store = self.registry.get_store(tenant)?;
        let jobs = store.get_due_jobs(now)?;
        if !jobs.is_empty() {
            tracing::debug!("Scheduler: {} due jobs in tenant {}", jobs.len(), tenant);
        }

        let mut handles = Vec::new();
        for job in jobs {
            let claim = match self.in_flight.claim((tenant.to_string(), job.id)) {
                Some(c) => c,
                None => {
                    tracing::debug!("Job {} in tenant {} is still running", job.id, tenant);
                    continue;
                }
            };

            let job_id = job.id;
            let executor = self.executor.clone();
            let tenant_slug = tenant.to_string();
            let unit_store = store.clone();
            // A refused unit is dropped along with its claim.
            match self
                .pool
                .spawn_leased(move |lease| run_job(executor, tenant_slug, unit_store, job, claim, lease))
            {
                Ok(h) => handles.push(h),
                Err(e) => tracing::warn!(
                    "Skipping job {} in tenant {} until next cycle: {}",
                    job_id,
                    tenant,
                    e
                ),
            }
        }
        Ok(handles)
    }
}

/// Run one job and record the outcome. The schedule is advanced whether or
/// not the run succeeded.
///
/// `lease` moves into the handler task, so a handler abandoned after a
/// timeout keeps its worker until it returns.
async fn run_job(
    executor: Arc<JobExecutor>,
    tenant: String,
    store: Arc<Store>,
    job: Job,
    _claim: Claim<(String, i64)>,
    lease: Lease,
) {
    let started_at = Utc::now();
    let execution_id = match store.create_execution(job.id, job.target_server_id(), started_at) {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(
                "Failed to record execution of job {} in tenant {}: {}",
                job.id,
                tenant,
                e
            );
            advance(&store, &tenant, &job);
            return;
        }
    };

    tracing::info!(
        "Running job {} ({}, {}) for tenant {}",
        job.id,
        job.name,
        job.job_type,
        tenant
    );

    let ctx = JobContext {
        tenant: tenant.clone(),
        store: store.clone(),
        job: job.clone(),
        execution_id,
    };
    let outcome = executor.execute_holding(ctx, lease).await;

    let status = if outcome.success {
        ExecutionStatus::Success
    } else {
        tracing::warn!(
            "Job {} in tenant {} failed: {}",
            job.id,
            tenant,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
        ExecutionStatus::Failed
    };

    if let Err(e) = store.complete_execution(
        execution_id,
        status,
        outcome.result.as_ref(),
        outcome.error.as_deref(),
        Utc::now(),
    ) {
        tracing::error!(
            "Failed to complete execution {} of job {} in tenant {}: {}",
            execution_id,
            job.id,
            tenant,
            e
        );
    }

    advance(&store, &tenant, &job);
}

fn advance(store: &Store, tenant: &str, job: &Job) {
    match store.update_job_after_execution(job, Utc::now()) {
        Ok(updated) => tracing::debug!(
            "Job {} in tenant {} next run at {:?}",
            job.id,
            tenant,
            updated.next_run_at
        ),
        Err(e) => tracing::error!(
            "Failed to advance schedule of job {} in tenant {}: {}",
            job.id,
            tenant,
            e
        ),
    }
}
