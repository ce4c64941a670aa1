use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use redcrawl_core::Clock;
use redcrawl_queue::{Delivery, Job, JobKind, JobQueue, QueueError};
use redcrawl_source::{ContentSource, FetchError};
use redcrawl_storage::{PersistenceError, RecordStore};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::retry::BackoffPolicy;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Wait between pulls when the queue is empty.
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
    /// Delays between pulls while the queue is unreachable. Only the delay
    /// curve is used; workers keep retrying.
    pub queue_backoff: BackoffPolicy,
    /// Follow-up crawls scheduled after a post's first successful crawl.
    pub recrawl_delays: Vec<chrono::Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            queue_backoff: BackoffPolicy {
                max_retries: u32::MAX,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
            },
            recrawl_delays: vec![chrono::Duration::days(1), chrono::Duration::days(7)],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    /// In-flight jobs handed back to the queue on shutdown.
    pub abandoned: u64,
    /// Settlements rejected because the job was redelivered elsewhere.
    pub lease_lost: u64,
    pub recrawls_scheduled: u64,
}

impl AddAssign for PoolStats {
    fn add_assign(&mut self, other: Self) {
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.failed += other.failed;
        self.abandoned += other.abandoned;
        self.lease_lost += other.lease_lost;
        self.recrawls_scheduled += other.recrawls_scheduled;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    Permanent,
    RetriesExhausted,
}

/// A job that reached the terminal `failed` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub job: Job,
    pub reason: String,
    pub kind: FailureKind,
}

#[derive(Debug, Error)]
enum JobError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl JobError {
    fn is_retryable(&self) -> bool {
        match self {
            JobError::Fetch(err) => err.is_transient(),
            JobError::Persistence(_) => true,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            JobError::Fetch(err) => err.retry_after(),
            JobError::Persistence(_) => None,
        }
    }
}

struct Shared {
    source: Arc<dyn ContentSource>,
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    failures: Option<mpsc::UnboundedSender<JobFailure>>,
}

/// Independent workers draining the crawl queue into the record store.
pub struct WorkerPool {
    source: Arc<dyn ContentSource>,
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    failures: Option<mpsc::UnboundedSender<JobFailure>>,
}

impl WorkerPool {
    pub fn new(
        source: Arc<dyn ContentSource>,
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            source,
            store,
            queue,
            clock,
            config,
            failures: None,
        }
    }

    /// Report every terminally failed job on `sender`.
    pub fn with_failure_channel(mut self, sender: mpsc::UnboundedSender<JobFailure>) -> Self {
        self.failures = Some(sender);
        self
    }

    /// Run until `shutdown` is cancelled or the queue is closed.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<PoolStats> {
        let concurrency = self.config.concurrency.max(1);
        info!(concurrency, "worker pool starting");

        let shared = Arc::new(Shared {
            source: self.source.clone(),
            store: self.store.clone(),
            queue: self.queue.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            failures: self.failures.clone(),
        });
        let mut workers = JoinSet::new();
        for worker_id in 0..concurrency {
            let shared = shared.clone();
            let shutdown = shutdown.clone();
            workers.spawn(
                async move { shared.work(shutdown).await }
                    .instrument(info_span!("worker", worker_id)),
            );
        }

        let mut stats = PoolStats::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(worker_stats) => stats += worker_stats,
                Err(e) => error!(error = %e, "worker task panicked"),
            }
        }
        info!(
            succeeded = stats.succeeded,
            retried = stats.retried,
            failed = stats.failed,
            abandoned = stats.abandoned,
            "worker pool stopped"
        );
        Ok(stats)
    }
}

async fn sleep_or_shutdown(delay: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

impl Shared {
    async fn work(&self, shutdown: CancellationToken) -> PoolStats {
        let mut stats = PoolStats::default();
        let mut queue_failures = 0u32;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let pulled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                pulled = self.queue.pull() => pulled,
            };

            match pulled {
                Ok(Some(delivery)) => {
                    queue_failures = 0;
                    self.handle(delivery, &shutdown, &mut stats).await;
                }
                Ok(None) => {
                    queue_failures = 0;
                    sleep_or_shutdown(self.config.poll_interval, &shutdown).await;
                }
                Err(QueueError::Closed) => {
                    info!("queue closed; worker exiting");
                    break;
                }
                Err(e) => {
                    let delay = self.config.queue_backoff.delay_for_attempt(queue_failures);
                    queue_failures = queue_failures.saturating_add(1);
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "queue pull failed; backing off");
                    sleep_or_shutdown(delay, &shutdown).await;
                }
            }
        }
        stats
    }

    async fn handle(&self, delivery: Delivery, shutdown: &CancellationToken, stats: &mut PoolStats) {
        let job = &delivery.job;
        let span = info_span!(
            "process_job",
            job_id = %job.id,
            post_id = %job.post_id,
            subreddit = %job.subreddit,
            attempt = job.attempt,
            kind = %job.kind,
        );

        let outcome = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            result = self.process(job).instrument(span.clone()) => Some(result),
        };

        async {
            match outcome {
                None => {
                    match self.queue.release(&delivery).await {
                        Ok(()) => info!("shutdown; in-flight job released"),
                        Err(e) => warn!(error = %e, "could not release job; it will reappear after the visibility timeout"),
                    }
                    stats.abandoned += 1;
                }
                Some(Ok(score)) => self.succeed(&delivery, score, stats).await,
                Some(Err(err)) if err.is_retryable() => self.retry(&delivery, err, stats).await,
                Some(Err(err)) => {
                    self.fail(&delivery, err.to_string(), FailureKind::Permanent, stats)
                        .await
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Fetch the thread and upsert it; returns the post's score.
    async fn process(&self, job: &Job) -> Result<i64, JobError> {
        let thread = self.source.fetch_thread(&job.post_id).await?;
        self.store.upsert_post(&thread.post).await?;
        for comment in &thread.comments {
            self.store.upsert_comment(comment).await?;
        }
        debug!(comments = thread.comments.len(), "thread stored");
        Ok(thread.post.score)
    }

    async fn succeed(&self, delivery: &Delivery, score: i64, stats: &mut PoolStats) {
        match self.queue.ack(delivery).await {
            Ok(()) => stats.succeeded += 1,
            Err(e) => {
                warn!(error = %e, "ack rejected; job will be redelivered");
                stats.lease_lost += 1;
                return;
            }
        }
        info!(score, "job complete");

        let job = &delivery.job;
        if job.kind != JobKind::Initial || score <= 0 {
            return;
        }
        let now = self.clock.now();
        for delay in &self.config.recrawl_delays {
            let at = now + *delay;
            let recrawl = Job::recrawl_at(job.post_id.clone(), job.subreddit.clone(), at);
            match self.queue.push(recrawl).await {
                Ok(result) => {
                    stats.recrawls_scheduled += 1;
                    debug!(job_id = %result.job_id(), run_at = %at, "recrawl scheduled");
                }
                Err(e) => warn!(error = %e, run_at = %at, "could not schedule recrawl"),
            }
        }
    }

    async fn retry(&self, delivery: &Delivery, err: JobError, stats: &mut PoolStats) {
        let attempt = delivery.job.attempt;
        if !self.config.backoff.should_retry(attempt) {
            let reason = format!("retries exhausted after {} attempts: {err}", attempt + 1);
            self.fail(delivery, reason, FailureKind::RetriesExhausted, stats)
                .await;
            return;
        }

        let delay = self.config.backoff.delay_with_hint(attempt, err.retry_after());
        warn!(error = %err, delay_ms = delay.as_millis() as u64, "job failed; retrying");
        match self.queue.nack(delivery, delay, &err.to_string()).await {
            Ok(()) => stats.retried += 1,
            Err(e) => {
                warn!(error = %e, "nack rejected");
                stats.lease_lost += 1;
            }
        }
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        reason: String,
        kind: FailureKind,
        stats: &mut PoolStats,
    ) {
        match self.queue.fail(delivery, &reason).await {
            Ok(()) => {}
            Err(e @ QueueError::LeaseLost { .. }) => {
                warn!(error = %e, "fail rejected; another worker owns the job");
                stats.lease_lost += 1;
                return;
            }
            Err(e) => {
                warn!(error = %e, "could not mark job failed; it may be redelivered");
            }
        }
        error!(reason = %reason, ?kind, "job failed");
        stats.failed += 1;
        if let Some(failures) = &self.failures {
            let failure = JobFailure {
                job: delivery.job.clone(),
                reason,
                kind,
            };
            if failures.send(failure).is_err() {
                debug!("failure channel closed");
            }
        }
    }
}
