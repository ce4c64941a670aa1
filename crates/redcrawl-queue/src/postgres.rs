use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{Delivery, EnqueueResult, Job, JobKind, JobQueue, QueueDepth, QueueError};

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub visibility_timeout: Duration,
    pub max_connections: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            max_connections: 5,
        }
    }
}

/// [`JobQueue`] over the `crawl_jobs` table.
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so any number of worker processes
/// can share one table. A running job whose `visible_at` has passed is
/// claimable again.
pub struct PgJobQueue {
    pool: PgPool,
    options: QueueOptions,
    closed: AtomicBool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, options: QueueOptions) -> Self {
        Self {
            pool,
            options,
            closed: AtomicBool::new(false),
        }
    }

    pub async fn connect(database_url: &str, options: QueueOptions) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .connect(database_url)
            .await
            .map_err(queue_error)?;
        Ok(Self::new(pool, options))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    async fn find_live(&self, post_id: &str) -> Result<Option<Uuid>, QueueError> {
        sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM crawl_jobs
            WHERE post_id = $1 AND status IN ('pending', 'running') AND kind <> 'recrawl'
            LIMIT 1
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(queue_error)
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        sql: &'static str,
        reason: Option<&str>,
        delay_secs: Option<f64>,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut query = sqlx::query(sql).bind(delivery.job.id).bind(delivery.lease);
        if let Some(reason) = reason {
            query = query.bind(reason);
        }
        if let Some(delay) = delay_secs {
            query = query.bind(delay);
        }
        let result = query.execute(&self.pool).await.map_err(queue_error)?;
        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost {
                job_id: delivery.job.id,
                lease: delivery.lease,
            });
        }
        Ok(())
    }
}

pub(crate) fn queue_error(err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::PoolClosed => QueueError::Closed,
        sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_) => QueueError::Serialization(err.to_string()),
        other => QueueError::Unavailable(other.to_string()),
    }
}

fn attempt_to_db(attempt: u32) -> i32 {
    i32::try_from(attempt).unwrap_or(i32::MAX)
}

fn attempt_from_db(attempt: i32) -> u32 {
    u32::try_from(attempt).unwrap_or(0)
}

fn kind_from_db(kind: &str) -> Result<JobKind, sqlx::Error> {
    JobKind::parse(kind)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown job kind {kind:?}").into()))
}

fn job_from_row(row: &PgRow) -> Result<Job, sqlx::Error> {
    let kind: String = row.try_get("kind")?;
    Ok(Job {
        id: row.try_get("id")?,
        post_id: row.try_get("post_id")?,
        subreddit: row.try_get("subreddit")?,
        attempt: attempt_from_db(row.try_get("attempt")?),
        kind: kind_from_db(&kind)?,
        not_before: None,
    })
}

const INSERT_JOB: &str = r#"
    INSERT INTO crawl_jobs (id, post_id, subreddit, attempt, kind, status, visible_at)
    VALUES ($1, $2, $3, $4, $5, 'pending', COALESCE($6, NOW()))
    ON CONFLICT (post_id) WHERE status IN ('pending', 'running') AND kind <> 'recrawl'
    DO NOTHING
    RETURNING id
"#;

const CLAIM_JOB: &str = r#"
    WITH next_job AS (
        SELECT id
        FROM crawl_jobs
        WHERE status IN ('pending', 'running') AND visible_at <= NOW()
        ORDER BY visible_at, created_at
        LIMIT 1
        FOR UPDATE SKIP LOCKED
    )
    UPDATE crawl_jobs
    SET status = 'running',
        lease = $1,
        visible_at = NOW() + make_interval(secs => $2),
        updated_at = NOW()
    WHERE id IN (SELECT id FROM next_job)
    RETURNING id, post_id, subreddit, attempt, kind
"#;

const ACK_JOB: &str = r#"
    UPDATE crawl_jobs
    SET status = 'succeeded', lease = NULL, updated_at = NOW()
    WHERE id = $1 AND lease = $2 AND status = 'running'
"#;

const NACK_JOB: &str = r#"
    UPDATE crawl_jobs
    SET status = 'pending',
        lease = NULL,
        attempt = attempt + 1,
        last_error = $3,
        visible_at = NOW() + make_interval(secs => $4),
        updated_at = NOW()
    WHERE id = $1 AND lease = $2 AND status = 'running'
"#;

const RELEASE_JOB: &str = r#"
    UPDATE crawl_jobs
    SET status = 'pending', lease = NULL, visible_at = NOW(), updated_at = NOW()
    WHERE id = $1 AND lease = $2 AND status = 'running'
"#;

const FAIL_JOB: &str = r#"
    UPDATE crawl_jobs
    SET status = 'failed', lease = NULL, last_error = $3, updated_at = NOW()
    WHERE id = $1 AND lease = $2 AND status = 'running'
"#;

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn push(&self, job: Job) -> Result<EnqueueResult, QueueError> {
        self.ensure_open()?;
        // A conflicting job can finish between the insert and the lookup; one
        // more insert settles it.
        for _ in 0..2 {
            let inserted = sqlx::query_scalar::<_, Uuid>(INSERT_JOB)
                .bind(job.id)
                .bind(&job.post_id)
                .bind(&job.subreddit)
                .bind(attempt_to_db(job.attempt))
                .bind(job.kind.as_str())
                .bind(job.not_before)
                .fetch_optional(&self.pool)
                .await
                .map_err(queue_error)?;
            if let Some(id) = inserted {
                debug!(job_id = %id, post_id = %job.post_id, kind = %job.kind, "job enqueued");
                return Ok(EnqueueResult::Created(id));
            }
            if let Some(existing) = self.find_live(&job.post_id).await? {
                return Ok(EnqueueResult::Duplicate(existing));
            }
        }
        warn!(post_id = %job.post_id, "enqueue kept conflicting with a finishing job");
        Err(QueueError::Unavailable(format!(
            "could not enqueue job for post {}",
            job.post_id
        )))
    }

    async fn pull(&self) -> Result<Option<Delivery>, QueueError> {
        self.ensure_open()?;
        let lease = Uuid::new_v4();
        let row = sqlx::query(CLAIM_JOB)
            .bind(lease)
            .bind(self.options.visibility_timeout.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(queue_error)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let job = job_from_row(&row).map_err(queue_error)?;
        Ok(Some(Delivery { job, lease }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.settle(delivery, ACK_JOB, None, None).await
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        delay: Duration,
        reason: &str,
    ) -> Result<(), QueueError> {
        self.settle(delivery, NACK_JOB, Some(reason), Some(delay.as_secs_f64()))
            .await
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.settle(delivery, RELEASE_JOB, None, None).await
    }

    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        self.settle(delivery, FAIL_JOB, Some(reason), None).await
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        self.ensure_open()?;
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM crawl_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(queue_error)?;
        let mut depth = QueueDepth::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(queue_error)?;
            let n: i64 = row.try_get("n").map_err(queue_error)?;
            let n = u64::try_from(n).unwrap_or(0);
            match status.as_str() {
                "pending" => depth.pending = n,
                "running" => depth.running = n,
                "succeeded" => depth.succeeded = n,
                "failed" => depth.failed = n,
                _ => {}
            }
        }
        Ok(depth)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_pool_maps_to_closed() {
        assert!(matches!(queue_error(sqlx::Error::PoolClosed), QueueError::Closed));
        assert!(matches!(
            queue_error(sqlx::Error::PoolTimedOut),
            QueueError::Unavailable(_)
        ));
        assert!(matches!(
            queue_error(sqlx::Error::ColumnNotFound("lease".into())),
            QueueError::Serialization(_)
        ));
    }

    #[test]
    fn unknown_kind_is_a_serialization_error() {
        assert_eq!(kind_from_db("refresh").unwrap(), JobKind::Refresh);
        let err = kind_from_db("urgent").unwrap_err();
        assert!(matches!(queue_error(err), QueueError::Serialization(_)));
    }

    #[test]
    fn attempt_conversion_saturates() {
        assert_eq!(attempt_to_db(u32::MAX), i32::MAX);
        assert_eq!(attempt_to_db(3), 3);
        assert_eq!(attempt_from_db(-1), 0);
        assert_eq!(attempt_from_db(2), 2);
    }

    #[test]
    fn settle_statements_require_the_current_lease() {
        for sql in [ACK_JOB, NACK_JOB, RELEASE_JOB, FAIL_JOB] {
            assert!(sql.contains("lease = $2 AND status = 'running'"));
        }
        assert!(CLAIM_JOB.contains("FOR UPDATE SKIP LOCKED"));
    }

    #[test]
    fn default_visibility_is_five_minutes() {
        assert_eq!(QueueOptions::default().visibility_timeout, Duration::from_secs(300));
    }
}
