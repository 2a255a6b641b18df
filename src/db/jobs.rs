//! Job and execution persistence.

use super::models::*;
use super::store::*;
use crate::scheduler::schedule;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const JOB_COLUMNS: &str =
    "id, name, type, configuration, schedule_type, schedule_config, is_enabled, next_run_at, last_run_at";

const EXECUTION_COLUMNS: &str =
    "id, job_id, server_id, status, started_at, completed_at, result, error_message";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        job_type: enum_col(row, 2)?,
        configuration: json_col(row, 3)?,
        schedule_type: enum_col(row, 4)?,
        schedule_config: json_col(row, 5)?,
        is_enabled: row.get(6)?,
        next_run_at: opt_time_col(row, 7)?,
        last_run_at: opt_time_col(row, 8)?,
    })
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<JobExecution> {
    Ok(JobExecution {
        id: row.get(0)?,
        job_id: row.get(1)?,
        server_id: row.get(2)?,
        status: enum_col(row, 3)?,
        started_at: time_col(row, 4)?,
        completed_at: opt_time_col(row, 5)?,
        result: opt_json_col(row, 6)?,
        error_message: row.get(7)?,
    })
}

impl Store {
    /// Create a job after validating its schedule.
    pub fn create_job(&self, new: &NewJob, now: DateTime<Utc>) -> Result<Job, DbError> {
        let mut errors = Vec::new();
        if new.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if !new.configuration.is_object() {
            errors.push("configuration must be an object".to_string());
        }
        errors.extend(schedule::validate_schedule(new.schedule_type, &new.schedule_config));
        if !errors.is_empty() {
            return Err(DbError::Validation(errors));
        }

        let next_run_at = if new.is_enabled {
            schedule::initial_run(new.schedule_type, &new.schedule_config, None, now)
        } else {
            None
        };

        let id = {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO jobs (name, type, configuration, schedule_type, schedule_config, is_enabled, next_run_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new.name.trim(),
                    new.job_type.as_str(),
                    serde_json::to_string(&new.configuration)?,
                    new.schedule_type.as_str(),
                    serde_json::to_string(&new.schedule_config)?,
                    new.is_enabled,
                    fmt_opt_time(next_run_at),
                ],
            )?;
            conn.last_insert_rowid()
        };

        tracing::info!("Created job {} ({}) next run {:?}", id, new.name, next_run_at);
        self.get_job(id)
    }

    pub fn get_job(&self, id: i64) -> Result<Job, DbError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
        conn.query_row(&sql, params![id], job_from_row)
            .optional()?
            .ok_or(DbError::NotFound)
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>, DbError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM jobs ORDER BY id", JOB_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Enabled jobs due at `now`, oldest due first.
    pub fn get_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM jobs
             WHERE is_enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at ASC, id ASC",
            JOB_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(params![fmt_db_time(now)], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Replace a job's schedule and recompute its next run.
    pub fn update_job_schedule(
        &self,
        id: i64,
        schedule_type: ScheduleType,
        schedule_config: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Job, DbError> {
        let errors = schedule::validate_schedule(schedule_type, schedule_config);
        if !errors.is_empty() {
            return Err(DbError::Validation(errors));
        }

        let job = self.get_job(id)?;
        let next_run_at = if job.is_enabled {
            // A new schedule counts as a fresh one, so a once job may fire again.
            schedule::initial_run(schedule_type, schedule_config, None, now)
        } else {
            None
        };

        {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE jobs SET schedule_type = ?1, schedule_config = ?2, next_run_at = ?3 WHERE id = ?4",
                params![
                    schedule_type.as_str(),
                    serde_json::to_string(schedule_config)?,
                    fmt_opt_time(next_run_at),
                    id
                ],
            )?;
        }
        self.get_job(id)
    }

    pub fn enable_job(&self, id: i64, now: DateTime<Utc>) -> Result<Job, DbError> {
        let job = self.get_job(id)?;
        let next_run_at =
            schedule::initial_run(job.schedule_type, &job.schedule_config, job.last_run_at, now);
        {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE jobs SET is_enabled = 1, next_run_at = ?1 WHERE id = ?2",
                params![fmt_opt_time(next_run_at), id],
            )?;
        }
        tracing::info!("Enabled job {} next run {:?}", id, next_run_at);
        self.get_job(id)
    }

    pub fn disable_job(&self, id: i64) -> Result<Job, DbError> {
        {
            let conn = self.conn()?;
            let n = conn.execute(
                "UPDATE jobs SET is_enabled = 0, next_run_at = NULL WHERE id = ?1",
                params![id],
            )?;
            if n == 0 {
                return Err(DbError::NotFound);
            }
        }
        tracing::info!("Disabled job {}", id);
        self.get_job(id)
    }

    /// Make an enabled job due now; the scheduler loop picks it up.
    pub fn run_job_now(&self, id: i64, now: DateTime<Utc>) -> Result<Job, DbError> {
        let job = self.get_job(id)?;
        if !job.is_enabled {
            return Err(DbError::Validation(vec![format!(
                "Job {} is disabled and cannot be run",
                id
            )]));
        }
        {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE jobs SET next_run_at = ?1 WHERE id = ?2",
                params![fmt_db_time(now), id],
            )?;
        }
        self.get_job(id)
    }

    /// Fire an event-triggered job.
    pub fn trigger_event_job(&self, id: i64, now: DateTime<Utc>) -> Result<Job, DbError> {
        let job = self.get_job(id)?;
        if job.schedule_type != ScheduleType::EventTriggered {
            return Err(DbError::Validation(vec![format!(
                "Job {} is not event triggered",
                id
            )]));
        }
        self.run_job_now(id, now)
    }

    /// Record that `job` ran at `now` and store its next due time.
    ///
    /// `job` is the row as it was dispatched. The next run is computed from
    /// the stored schedule, and a `next_run_at` changed while the job was
    /// running (run-now, schedule edit) is kept. A job disabled while it was
    /// running keeps a null `next_run_at`.
    pub fn update_job_after_execution(&self, job: &Job, now: DateTime<Utc>) -> Result<Job, DbError> {
        {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;
            let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
            let current = tx
                .query_row(&sql, params![job.id], job_from_row)
                .optional()?
                .ok_or(DbError::NotFound)?;

            let next_run_at = if current.next_run_at != job.next_run_at {
                current.next_run_at
            } else {
                schedule::next_run(current.schedule_type, &current.schedule_config, now)
            };
            tx.execute(
                "UPDATE jobs SET last_run_at = ?1,
                    next_run_at = CASE WHEN is_enabled = 1 THEN ?2 ELSE NULL END
                 WHERE id = ?3",
                params![fmt_db_time(now), fmt_opt_time(next_run_at), job.id],
            )?;
            tx.commit()?;
        }
        self.get_job(job.id)
    }

    // --- Executions ---

    /// Open an execution in `running` state.
    pub fn create_execution(
        &self,
        job_id: i64,
        server_id: Option<i64>,
        started_at: DateTime<Utc>,
    ) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO job_executions (job_id, server_id, status, started_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                job_id,
                server_id,
                ExecutionStatus::Running.as_str(),
                fmt_db_time(started_at)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Move a running execution to its terminal state. Only the first call
    /// has an effect.
    pub fn complete_execution(
        &self,
        id: i64,
        status: ExecutionStatus,
        result: Option<&serde_json::Value>,
        error_message: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let result = match result {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE job_executions SET status = ?1, result = ?2, error_message = ?3, completed_at = ?4
             WHERE id = ?5 AND status = ?6",
            params![
                status.as_str(),
                result,
                error_message,
                fmt_db_time(completed_at),
                id,
                ExecutionStatus::Running.as_str()
            ],
        )?;
        Ok(n == 1)
    }

    pub fn get_execution(&self, id: i64) -> Result<JobExecution, DbError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM job_executions WHERE id = ?1", EXECUTION_COLUMNS);
        conn.query_row(&sql, params![id], execution_from_row)
            .optional()?
            .ok_or(DbError::NotFound)
    }

    /// Most recent executions of a job, newest first.
    pub fn list_executions(&self, job_id: i64, limit: usize) -> Result<Vec<JobExecution>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM job_executions WHERE job_id = ?1 ORDER BY started_at DESC, id DESC LIMIT ?2",
            EXECUTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![job_id, limit as i64], execution_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn open() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn interval_job(secs: i64) -> NewJob {
        NewJob {
            name: "collect".to_string(),
            job_type: JobType::DataCollection,
            configuration: json!({"all": true}),
            schedule_type: ScheduleType::Interval,
            schedule_config: json!({"interval_seconds": secs}),
            is_enabled: true,
        }
    }

    #[test]
    fn test_interval_job_next_run_after_execution() {
        let (_tmp, store) = open();
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();

        let job = store.create_job(&interval_job(60), t).unwrap();
        assert_eq!(job.next_run_at, Some(t + Duration::seconds(60)));

        let ran_at = t + Duration::seconds(5);
        let job = store.update_job_after_execution(&job, ran_at).unwrap();
        assert_eq!(job.last_run_at, Some(ran_at));
        assert_eq!(job.next_run_at, Some(t + Duration::seconds(65)));
    }

    #[test]
    fn test_create_job_rejects_bad_schedule() {
        let (_tmp, store) = open();
        let err = store.create_job(&interval_job(30), Utc::now()).unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));

        let mut cron = interval_job(60);
        cron.schedule_type = ScheduleType::Cron;
        cron.schedule_config = json!({"expression": "every tuesday"});
        assert!(matches!(
            store.create_job(&cron, Utc::now()),
            Err(DbError::Validation(_))
        ));
        assert!(store.list_jobs().unwrap().is_empty());
    }

    #[test]
    fn test_once_and_event_jobs() {
        let (_tmp, store) = open();
        let now = Utc::now();

        let mut once = interval_job(60);
        once.schedule_type = ScheduleType::Once;
        once.schedule_config = json!({"run_at": "2024-01-01T00:00:00Z"});
        let job = store.create_job(&once, now).unwrap();
        assert_eq!(
            job.next_run_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
        let job = store.update_job_after_execution(&job, now).unwrap();
        assert_eq!(job.next_run_at, None);
        let job = store.enable_job(job.id, now).unwrap();
        assert_eq!(job.next_run_at, None, "a once job fires only once");

        let mut event = interval_job(60);
        event.schedule_type = ScheduleType::EventTriggered;
        event.schedule_config = json!({});
        let job = store.create_job(&event, now).unwrap();
        assert_eq!(job.next_run_at, None);
        let job = store.trigger_event_job(job.id, now).unwrap();
        assert_eq!(job.next_run_at.map(|t| t.timestamp()), Some(now.timestamp()));
    }

    #[test]
    fn test_due_jobs_ordered_oldest_first_and_enabled_only() {
        let (_tmp, store) = open();
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();

        let a = store.create_job(&interval_job(120), t).unwrap();
        let b = store.create_job(&interval_job(60), t).unwrap();
        let c = store.create_job(&interval_job(60), t).unwrap();
        store.disable_job(c.id).unwrap();

        let due = store.get_due_jobs(t + Duration::seconds(30)).unwrap();
        assert!(due.is_empty());

        let due = store.get_due_jobs(t + Duration::seconds(300)).unwrap();
        let ids: Vec<i64> = due.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
    }

    #[test]
    fn test_run_now_and_disable() {
        let (_tmp, store) = open();
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let job = store.create_job(&interval_job(3600), t).unwrap();

        let job = store.run_job_now(job.id, t).unwrap();
        assert_eq!(job.next_run_at, Some(t));
        assert_eq!(store.get_due_jobs(t).unwrap().len(), 1);

        let job = store.disable_job(job.id).unwrap();
        assert!(!job.is_enabled);
        assert_eq!(job.next_run_at, None);
        assert!(matches!(
            store.run_job_now(job.id, t),
            Err(DbError::Validation(_))
        ));

        // Result of a run that was in flight when the job got disabled.
        let job = store.update_job_after_execution(&job, t).unwrap();
        assert_eq!(job.next_run_at, None);

        assert!(matches!(store.disable_job(999), Err(DbError::NotFound)));
    }

    #[test]
    fn test_execution_lifecycle() {
        let (_tmp, store) = open();
        let now = Utc::now();
        let job = store.create_job(&interval_job(60), now).unwrap();

        let exec_id = store.create_execution(job.id, None, now).unwrap();
        let exec = store.get_execution(exec_id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Running);

        assert!(store
            .complete_execution(exec_id, ExecutionStatus::Failed, None, Some("boom"), now)
            .unwrap());
        assert!(!store
            .complete_execution(exec_id, ExecutionStatus::Success, None, None, now)
            .unwrap());

        let exec = store.get_execution(exec_id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.error_message.as_deref(), Some("boom"));
        assert_eq!(store.list_executions(job.id, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_changes_made_while_running_survive_completion() {
        let (_tmp, store) = open();
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let dispatched = store.create_job(&interval_job(60), t).unwrap();

        // Schedule edited mid-run: the new interval drives the next run.
        let edited = store
            .update_job_schedule(
                dispatched.id,
                ScheduleType::Interval,
                &json!({"interval_seconds": 600}),
                t + Duration::seconds(10),
            )
            .unwrap();
        let ran_at = t + Duration::seconds(20);
        let job = store.update_job_after_execution(&dispatched, ran_at).unwrap();
        assert_eq!(job.next_run_at, edited.next_run_at);
        assert_eq!(job.last_run_at, Some(ran_at));

        // Run-now requested mid-run stays due.
        let dispatched = job;
        let requested = ran_at + Duration::seconds(5);
        store.run_job_now(dispatched.id, requested).unwrap();
        let job = store
            .update_job_after_execution(&dispatched, ran_at + Duration::seconds(30))
            .unwrap();
        assert_eq!(job.next_run_at, Some(requested));

        // Unchanged rows advance from the stored schedule.
        let dispatched = job;
        let job = store.update_job_after_execution(&dispatched, requested).unwrap();
        assert_eq!(job.next_run_at, Some(requested + Duration::seconds(600)));
    }
}
