//! Job queue client: comment-fetch jobs with at-least-once delivery.
//!
//! A pulled job is leased, not removed. Until the lease is settled with
//! [`JobQueue::ack`], [`JobQueue::nack`], [`JobQueue::release`] or
//! [`JobQueue::fail`] the job stays hidden for the visibility timeout, after
//! which any worker may pull it again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryQueue;
pub use postgres::{PgJobQueue, QueueOptions};

pub const CRATE_NAME: &str = "redcrawl-queue";

/// Why a job was enqueued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// First crawl of a post discovery has never stored.
    #[default]
    Initial,
    /// Discovery found the stored post stale.
    Refresh,
    /// Scheduled follow-up after an initial crawl.
    Recrawl,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Initial => "initial",
            JobKind::Refresh => "refresh",
            JobKind::Recrawl => "recrawl",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initial" => Some(JobKind::Initial),
            "refresh" => Some(JobKind::Refresh),
            "recrawl" => Some(JobKind::Recrawl),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to fetch one post's comment tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub post_id: String,
    pub subreddit: String,
    /// Number of earlier failed runs.
    pub attempt: u32,
    pub kind: JobKind,
    /// Earliest time the job may be delivered.
    pub not_before: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(post_id: impl Into<String>, subreddit: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            post_id: post_id.into(),
            subreddit: subreddit.into(),
            attempt: 0,
            kind: JobKind::Initial,
            not_before: None,
        }
    }

    /// Re-fetch of a post whose stored row went stale.
    pub fn refresh(post_id: impl Into<String>, subreddit: impl Into<String>) -> Self {
        Self {
            kind: JobKind::Refresh,
            ..Self::new(post_id, subreddit)
        }
    }

    pub fn recrawl_at(
        post_id: impl Into<String>,
        subreddit: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: JobKind::Recrawl,
            not_before: Some(at),
            ..Self::new(post_id, subreddit)
        }
    }

    /// Discovery jobs (initial or refresh) are unique per post while
    /// pending or running.
    pub fn idempotency_key(&self) -> Option<&str> {
        (self.kind != JobKind::Recrawl).then_some(self.post_id.as_str())
    }
}

/// A pulled job plus the lease that proves this worker owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job: Job,
    pub lease: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Created(Uuid),
    /// A live job for the same post already exists.
    Duplicate(Uuid),
}

impl EnqueueResult {
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub pending: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("lease {lease} on job {job_id} is no longer held")]
    LeaseLost { job_id: Uuid, lease: Uuid },
    #[error("queue client is closed")]
    Closed,
    #[error("job record could not be decoded: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, job: Job) -> Result<EnqueueResult, QueueError>;

    /// Claim the next visible job, or `None` when nothing is ready.
    async fn pull(&self) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Return the job for another try: `attempt + 1`, visible after `delay`.
    async fn nack(
        &self,
        delivery: &Delivery,
        delay: Duration,
        reason: &str,
    ) -> Result<(), QueueError>;

    /// Hand the job back untouched, e.g. on shutdown.
    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Terminal failure; the job is never delivered again.
    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_jobs_start_at_attempt_zero() {
        let job = Job::new("p1", "rust");
        assert_eq!(job.attempt, 0);
        assert_eq!(job.kind, JobKind::Initial);
        assert_eq!(job.idempotency_key(), Some("p1"));
    }

    #[test]
    fn refreshes_share_the_discovery_key() {
        let job = Job::refresh("p1", "rust");
        assert_eq!(job.kind, JobKind::Refresh);
        assert_eq!(job.idempotency_key(), Job::new("p1", "rust").idempotency_key());
    }

    #[test]
    fn kinds_round_trip_through_their_column_text() {
        for kind in [JobKind::Initial, JobKind::Refresh, JobKind::Recrawl] {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::parse("urgent"), None);
    }

    #[test]
    fn recrawls_have_no_idempotency_key() {
        let at = Utc::now();
        let job = Job::recrawl_at("p1", "rust", at);
        assert_eq!(job.kind, JobKind::Recrawl);
        assert_eq!(job.not_before, Some(at));
        assert_eq!(job.idempotency_key(), None);
    }

    #[test]
    fn enqueue_result_helpers() {
        let created = EnqueueResult::Created(Uuid::new_v4());
        assert!(created.is_created());
        let duplicate = EnqueueResult::Duplicate(created.job_id());
        assert!(!duplicate.is_created());
        assert_eq!(duplicate.job_id(), created.job_id());
    }
}
