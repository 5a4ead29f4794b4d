use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use tracing::{info, warn};

use crate::database::open_connection;
use crate::error::{PipelineError, Result};
use crate::now_s;
use crate::queue::job::{Job, JobId, JobStatus, RetryPolicy, Task};

/// A durable work queue with retries, dependencies and a dead-letter registry.
pub trait Broker {
    fn enqueue(
        &mut self,
        queue: &str,
        task: &Task,
        policy: RetryPolicy,
        depends_on: Option<JobId>,
        attachment: Option<&[u8]>,
    ) -> Result<JobId>;

    /// Claims the next dispatchable job on `queue` and marks it running. Expired claims are
    /// reclaimed first.
    fn poll(&mut self, queue: &str) -> Result<Option<Job>>;

    /// Puts running jobs whose claim has expired back in line, or dead-letters them when their
    /// attempts are used up. Returns how many were reclaimed.
    fn reclaim_expired(&mut self) -> Result<usize>;

    fn ack(&mut self, id: JobId) -> Result<()>;

    /// Records a failed attempt; the job is re-queued after its backoff or dead-lettered once
    /// its attempts are used up. Returns the new status.
    fn fail(&mut self, id: JobId, error: &str) -> Result<JobStatus>;

    fn get(&self, id: JobId) -> Result<Option<Job>>;

    fn dead_letters(&self, queue: Option<&str>) -> Result<Vec<Job>>;

    /// Every job that directly or transitively waits on `id`.
    fn blocked_by(&self, id: JobId) -> Result<Vec<Job>>;

    /// Deletes a job together with the chain of jobs waiting on it.
    fn purge(&mut self, id: JobId) -> Result<usize>;

    /// Gives a dead-lettered job a fresh set of attempts.
    fn requeue(&mut self, id: JobId) -> Result<()>;

    /// Deletes a job that has not started yet. Running and finished jobs are left alone.
    fn cancel(&mut self, id: JobId) -> Result<bool>;
}

/// How long a claimed job may stay running before another worker may take it over.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30 * 60);

const LEASE_EXPIRED: &str = "lease expired before the job finished";

pub struct SqliteBroker {
    conn: Connection,
    lease: Duration,
}

impl SqliteBroker {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self {
            conn: open_connection(path)?,
            lease: DEFAULT_LEASE,
        })
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn query_jobs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, RawJob::from_row)?;
        let raw = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(RawJob::into_job).collect()
    }
}

const JOB_COLUMNS: &str = "id, queue, task, status, attempts, max_attempts, backoff_secs, \
     depends_on, last_error, attachment";

const DEPENDENT_CHAIN: &str = "WITH RECURSIVE chain(id) AS (
         SELECT id FROM jobs WHERE depends_on = ?1
         UNION
         SELECT j.id FROM jobs j JOIN chain c ON j.depends_on = c.id
     )";

/// For running jobs `available_at` holds the lease deadline.
fn reclaim(tx: &Transaction, now: i64) -> Result<usize> {
    let dead = tx.execute(
        "UPDATE jobs SET status = 'dead_lettered', last_error = ?2, updated_at = ?1
         WHERE status = 'running' AND available_at <= ?1 AND attempts >= max_attempts",
        params![now, LEASE_EXPIRED],
    )?;
    let retried = tx.execute(
        "UPDATE jobs SET status = 'retrying', last_error = ?2,
             available_at = ?1 + backoff_secs, updated_at = ?1
         WHERE status = 'running' AND available_at <= ?1",
        params![now, LEASE_EXPIRED],
    )?;
    if dead + retried > 0 {
        warn!(
            "Reclaimed {} abandoned job(s): {} retrying, {} dead-lettered",
            dead + retried,
            retried,
            dead
        );
    }
    Ok(dead + retried)
}

struct RawJob {
    id: JobId,
    queue: String,
    task: String,
    status: String,
    attempts: u32,
    max_attempts: u32,
    backoff_secs: i64,
    depends_on: Option<JobId>,
    last_error: Option<String>,
    attachment: Option<Vec<u8>>,
}

impl RawJob {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            queue: row.get(1)?,
            task: row.get(2)?,
            status: row.get(3)?,
            attempts: row.get(4)?,
            max_attempts: row.get(5)?,
            backoff_secs: row.get(6)?,
            depends_on: row.get(7)?,
            last_error: row.get(8)?,
            attachment: row.get(9)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            queue: self.queue,
            task: serde_json::from_str(&self.task)?,
            status: self.status.parse()?,
            attempts: self.attempts,
            policy: RetryPolicy::new(
                self.max_attempts,
                Duration::from_secs(self.backoff_secs.max(0) as u64),
            ),
            depends_on: self.depends_on,
            last_error: self.last_error,
            attachment: self.attachment,
        })
    }
}

impl Broker for SqliteBroker {
    fn enqueue(
        &mut self,
        queue: &str,
        task: &Task,
        policy: RetryPolicy,
        depends_on: Option<JobId>,
        attachment: Option<&[u8]>,
    ) -> Result<JobId> {
        let now = now_s();
        self.conn.execute(
            "INSERT INTO jobs (queue, task, status, attempts, max_attempts, backoff_secs,
                 depends_on, available_at, attachment, created_at, updated_at)
             VALUES (?1, ?2, 'queued', 0, ?3, ?4, ?5, ?6, ?7, ?6, ?6)",
            params![
                queue,
                serde_json::to_string(task)?,
                policy.max_attempts,
                policy.backoff.as_secs() as i64,
                depends_on,
                now,
                attachment
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(
            "Enqueued job {} ({}) on {} for {}",
            id,
            task.method_name(),
            queue,
            task.event_name()
        );
        Ok(id)
    }

    fn poll(&mut self, queue: &str) -> Result<Option<Job>> {
        let now = now_s();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        reclaim(&tx, now)?;

        // Backoff elapsed: retrying -> queued.
        tx.execute(
            "UPDATE jobs SET status = 'queued', updated_at = ?2
             WHERE queue = ?1 AND status = 'retrying' AND available_at <= ?2",
            params![queue, now],
        )?;

        // A job whose parent is missing or not yet succeeded stays queued.
        let next: Option<JobId> = tx
            .query_row(
                "SELECT j.id FROM jobs j
                 LEFT JOIN jobs p ON p.id = j.depends_on
                 WHERE j.queue = ?1 AND j.status = 'queued' AND j.available_at <= ?2
                   AND (j.depends_on IS NULL OR p.status = 'succeeded')
                 ORDER BY j.id
                 LIMIT 1",
                params![queue, now],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = next else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET status = 'running', attempts = attempts + 1, available_at = ?3,
                 updated_at = ?2
             WHERE id = ?1",
            params![id, now, now + self.lease.as_secs() as i64],
        )?;
        let raw = tx.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            params![id],
            RawJob::from_row,
        )?;
        tx.commit()?;

        raw.into_job().map(Some)
    }

    fn reclaim_expired(&mut self) -> Result<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let reclaimed = reclaim(&tx, now_s())?;
        tx.commit()?;
        Ok(reclaimed)
    }

    fn ack(&mut self, id: JobId) -> Result<()> {
        // The attachment has been consumed; keep the row small.
        let changed = self.conn.execute(
            "UPDATE jobs SET status = 'succeeded', attachment = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'running'",
            params![id, now_s()],
        )?;
        if changed == 0 {
            return Err(PipelineError::InvalidInput(format!(
                "job {} is not running",
                id
            )));
        }
        Ok(())
    }

    fn fail(&mut self, id: JobId, error: &str) -> Result<JobStatus> {
        let now = now_s();
        let job = self
            .get(id)?
            .ok_or_else(|| PipelineError::InvalidInput(format!("no job {}", id)))?;
        if job.status != JobStatus::Running {
            return Err(PipelineError::InvalidInput(format!(
                "job {} is {}, not running",
                id, job.status
            )));
        }

        let status = if job.attempts >= job.policy.max_attempts {
            JobStatus::DeadLettered
        } else {
            JobStatus::Retrying
        };
        let available_at = now + job.policy.backoff.as_secs() as i64;
        self.conn.execute(
            "UPDATE jobs SET status = ?2, last_error = ?3, available_at = ?4, updated_at = ?5
             WHERE id = ?1",
            params![id, status.as_str(), error, available_at, now],
        )?;

        if status == JobStatus::DeadLettered {
            let exhausted = PipelineError::TaskRetryExhausted {
                job_id: id,
                attempts: job.attempts,
                reason: error.to_string(),
            };
            warn!("Dead-lettered {} on {}: {}", job.task.method_name(), job.queue, exhausted);
        } else {
            info!(
                "Job {} failed attempt {}/{}; retrying in {:?}",
                id, job.attempts, job.policy.max_attempts, job.policy.backoff
            );
        }
        Ok(status)
    }

    fn get(&self, id: JobId) -> Result<Option<Job>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                RawJob::from_row,
            )
            .optional()?;
        raw.map(RawJob::into_job).transpose()
    }

    fn dead_letters(&self, queue: Option<&str>) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {} FROM jobs
             WHERE status = 'dead_lettered' AND (?1 IS NULL OR queue = ?1)
             ORDER BY id",
            JOB_COLUMNS
        );
        self.query_jobs(&sql, params![queue])
    }

    fn blocked_by(&self, id: JobId) -> Result<Vec<Job>> {
        let sql = format!(
            "{} SELECT {} FROM jobs WHERE id IN (SELECT id FROM chain) ORDER BY id",
            DEPENDENT_CHAIN, JOB_COLUMNS
        );
        self.query_jobs(&sql, params![id])
    }

    fn purge(&mut self, id: JobId) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let dependents = tx.execute(
            &format!(
                "{} DELETE FROM jobs WHERE id IN (SELECT id FROM chain)",
                DEPENDENT_CHAIN
            ),
            params![id],
        )?;
        let own = tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(dependents + own)
    }

    fn requeue(&mut self, id: JobId) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE jobs SET status = 'queued', attempts = 0, available_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'dead_lettered'",
            params![id, now_s()],
        )?;
        if changed == 0 {
            return Err(PipelineError::InvalidInput(format!(
                "job {} is not dead-lettered",
                id
            )));
        }
        info!("Requeued job {}", id);
        Ok(())
    }

    fn cancel(&mut self, id: JobId) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM jobs WHERE id = ?1 AND status IN ('queued', 'retrying')",
            params![id],
        )?;
        Ok(changed > 0)
    }
}
