use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redcrawl_core::{Clock, SystemClock};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{Delivery, EnqueueResult, Job, JobQueue, QueueDepth, QueueError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Running,
}

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    job: Job,
    status: Status,
    visible_at: DateTime<Utc>,
    lease: Option<Uuid>,
    last_error: Option<String>,
}

/// Live jobs only. Settled jobs leave the map and are tallied.
#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    entries: HashMap<Uuid, Entry>,
    live_keys: HashMap<String, Uuid>,
    succeeded: u64,
    failed: u64,
}

impl State {
    fn leased(&mut self, delivery: &Delivery) -> Result<&mut Entry, QueueError> {
        match self.entries.get_mut(&delivery.job.id) {
            Some(entry)
                if entry.status == Status::Running && entry.lease == Some(delivery.lease) =>
            {
                Ok(entry)
            }
            _ => Err(QueueError::LeaseLost {
                job_id: delivery.job.id,
                lease: delivery.lease,
            }),
        }
    }

    /// Drop a settled job, freeing its idempotency key.
    fn settle(&mut self, delivery: &Delivery) -> Result<Entry, QueueError> {
        self.leased(delivery)?;
        let entry = self
            .entries
            .remove(&delivery.job.id)
            .ok_or(QueueError::LeaseLost {
                job_id: delivery.job.id,
                lease: delivery.lease,
            })?;
        if let Some(key) = entry.job.idempotency_key() {
            if self.live_keys.get(key) == Some(&entry.job.id) {
                self.live_keys.remove(key);
            }
        }
        Ok(entry)
    }
}

/// In-process queue with the same lease and visibility semantics as
/// [`crate::PgJobQueue`].
///
/// Succeeded and failed jobs are not retained; [`JobQueue::depth`] reports
/// them as running totals.
pub struct MemoryQueue {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    visibility_timeout: chrono::Duration,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self::with_clock(visibility_timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(visibility_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            visibility_timeout: to_chrono(visibility_timeout),
            closed: AtomicBool::new(false),
        }
    }

    /// Attempt counter and last error of a live job, for inspection.
    pub async fn job_state(&self, job_id: Uuid) -> Option<(u32, Option<String>)> {
        let state = self.state.lock().await;
        state
            .entries
            .get(&job_id)
            .map(|e| (e.job.attempt, e.last_error.clone()))
    }

    /// Live jobs in push order.
    pub async fn jobs(&self) -> Vec<Job> {
        let state = self.state.lock().await;
        let mut entries = state.entries.values().collect::<Vec<_>>();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.job.clone()).collect()
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn push(&self, job: Job) -> Result<EnqueueResult, QueueError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;

        if let Some(key) = job.idempotency_key() {
            if let Some(existing) = state.live_keys.get(key) {
                return Ok(EnqueueResult::Duplicate(*existing));
            }
            state.live_keys.insert(key.to_string(), job.id);
        }

        let now = self.clock.now();
        let seq = state.next_seq;
        state.next_seq += 1;
        let id = job.id;
        state.entries.insert(
            id,
            Entry {
                seq,
                visible_at: job.not_before.unwrap_or(now),
                job,
                status: Status::Pending,
                lease: None,
                last_error: None,
            },
        );
        Ok(EnqueueResult::Created(id))
    }

    async fn pull(&self) -> Result<Option<Delivery>, QueueError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let Some(entry) = state
            .entries
            .values_mut()
            .filter(|e| e.visible_at <= now)
            .min_by_key(|e| (e.visible_at, e.seq))
        else {
            return Ok(None);
        };

        if entry.status == Status::Running {
            debug!(job_id = %entry.job.id, "lease expired; redelivering");
        }
        let lease = Uuid::new_v4();
        entry.status = Status::Running;
        entry.lease = Some(lease);
        entry.visible_at = now + self.visibility_timeout;

        Ok(Some(Delivery {
            job: entry.job.clone(),
            lease,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        state.settle(delivery)?;
        state.succeeded += 1;
        Ok(())
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        delay: Duration,
        reason: &str,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let entry = state.leased(delivery)?;
        entry.status = Status::Pending;
        entry.lease = None;
        entry.job.attempt += 1;
        entry.visible_at = now + to_chrono(delay);
        entry.last_error = Some(reason.to_string());
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.ensure_open()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let entry = state.leased(delivery)?;
        entry.status = Status::Pending;
        entry.lease = None;
        entry.visible_at = now;
        Ok(())
    }

    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let entry = state.settle(delivery)?;
        state.failed += 1;
        debug!(job_id = %entry.job.id, reason, "job failed");
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        let mut depth = QueueDepth {
            succeeded: state.succeeded,
            failed: state.failed,
            ..QueueDepth::default()
        };
        for entry in state.entries.values() {
            match entry.status {
                Status::Pending => depth.pending += 1,
                Status::Running => depth.running += 1,
            }
        }
        Ok(depth)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobKind;
    use chrono::TimeZone;
    use redcrawl_core::ManualClock;

    fn queue() -> (MemoryQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).single().unwrap(),
        ));
        (
            MemoryQueue::with_clock(Duration::from_secs(300), clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn pulled_job_is_hidden_until_visibility_timeout() {
        let (queue, clock) = queue();
        queue.push(Job::new("p1", "rust")).await.unwrap();

        let first = queue.pull().await.unwrap().expect("delivery");
        assert!(queue.pull().await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(301));
        let second = queue.pull().await.unwrap().expect("redelivery");
        assert_eq!(first.job.id, second.job.id);
        assert_ne!(first.lease, second.lease);

        let err = queue.ack(&first).await.unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost { .. }));
        queue.ack(&second).await.expect("current lease acks");
        assert_eq!(queue.depth().await.unwrap().succeeded, 1);
    }

    #[tokio::test]
    async fn duplicate_initial_jobs_are_collapsed() {
        let (queue, _clock) = queue();
        let first = queue.push(Job::new("p1", "rust")).await.unwrap();
        let second = queue.push(Job::new("p1", "rust")).await.unwrap();
        assert!(first.is_created());
        assert_eq!(second, EnqueueResult::Duplicate(first.job_id()));

        let recrawl = queue
            .push(Job::recrawl_at("p1", "rust", Utc::now()))
            .await
            .unwrap();
        assert!(recrawl.is_created());

        let refresh = queue.push(Job::refresh("p1", "rust")).await.unwrap();
        assert_eq!(refresh, EnqueueResult::Duplicate(first.job_id()));
    }

    #[tokio::test]
    async fn finished_job_does_not_block_a_new_one() {
        let (queue, _clock) = queue();
        queue.push(Job::new("p1", "rust")).await.unwrap();
        let delivery = queue.pull().await.unwrap().unwrap();
        queue.ack(&delivery).await.unwrap();
        assert!(queue.push(Job::new("p1", "rust")).await.unwrap().is_created());
    }

    #[tokio::test]
    async fn nack_bumps_attempt_and_delays() {
        let (queue, clock) = queue();
        let id = queue.push(Job::new("p1", "rust")).await.unwrap().job_id();
        let delivery = queue.pull().await.unwrap().unwrap();
        queue
            .nack(&delivery, Duration::from_secs(30), "429")
            .await
            .unwrap();

        assert!(queue.pull().await.unwrap().is_none());
        clock.advance(chrono::Duration::seconds(30));
        let retry = queue.pull().await.unwrap().expect("retry visible");
        assert_eq!(retry.job.attempt, 1);
        assert_eq!(queue.job_state(id).await, Some((1, Some("429".into()))));
    }

    #[tokio::test]
    async fn release_keeps_attempt_and_fail_is_terminal() {
        let (queue, clock) = queue();
        queue.push(Job::new("p1", "rust")).await.unwrap();
        let delivery = queue.pull().await.unwrap().unwrap();
        queue.release(&delivery).await.unwrap();

        let again = queue.pull().await.unwrap().expect("released job");
        assert_eq!(again.job.attempt, 0);
        queue.fail(&again, "404").await.unwrap();

        clock.advance(chrono::Duration::hours(2));
        assert!(queue.pull().await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn scheduled_jobs_wait_for_not_before() {
        let (queue, clock) = queue();
        let at = clock.now() + chrono::Duration::days(1);
        queue.push(Job::recrawl_at("p1", "rust", at)).await.unwrap();
        assert!(queue.pull().await.unwrap().is_none());
        clock.set(at);
        let delivery = queue.pull().await.unwrap().expect("due");
        assert_eq!(delivery.job.kind, JobKind::Recrawl);
    }

    #[tokio::test]
    async fn settled_jobs_are_dropped_but_counted() {
        let (queue, _clock) = queue();
        for round in 0..50 {
            let id = queue.push(Job::new("p1", "rust")).await.unwrap().job_id();
            let delivery = queue.pull().await.unwrap().expect("delivery");
            if round % 5 == 0 {
                queue.fail(&delivery, "404").await.unwrap();
            } else {
                queue.ack(&delivery).await.unwrap();
            }
            assert_eq!(queue.job_state(id).await, None);
        }

        assert!(queue.jobs().await.is_empty());
        assert_eq!(
            queue.depth().await.unwrap(),
            QueueDepth {
                pending: 0,
                running: 0,
                succeeded: 40,
                failed: 10,
            }
        );
    }

    #[tokio::test]
    async fn settling_twice_reports_lost_lease() {
        let (queue, _clock) = queue();
        queue.push(Job::new("p1", "rust")).await.unwrap();
        let delivery = queue.pull().await.unwrap().unwrap();
        queue.ack(&delivery).await.unwrap();
        assert!(matches!(
            queue.fail(&delivery, "late").await,
            Err(QueueError::LeaseLost { .. })
        ));
        assert_eq!(queue.depth().await.unwrap().failed, 0);
    }

    #[tokio::test]
    async fn closed_queue_rejects_operations() {
        let (queue, _clock) = queue();
        queue.close().await;
        assert!(matches!(
            queue.push(Job::new("p1", "rust")).await,
            Err(QueueError::Closed)
        ));
        assert!(matches!(queue.pull().await, Err(QueueError::Closed)));
    }
}
