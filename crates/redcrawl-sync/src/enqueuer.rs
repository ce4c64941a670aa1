use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redcrawl_core::{Clock, Cursor, Post};
use redcrawl_queue::{EnqueueResult, Job, JobQueue};
use redcrawl_source::{ContentSource, ListingPager};
use redcrawl_storage::RecordStore;
use serde::Serialize;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EnqueuerConfig {
    /// A post crawled more recently than this is not enqueued again.
    pub staleness: chrono::Duration,
    pub max_pages: usize,
}

impl Default for EnqueuerConfig {
    fn default() -> Self {
        Self {
            staleness: chrono::Duration::minutes(60),
            max_pages: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub subreddit: String,
    /// Distinct posts seen in the listing.
    pub seen: usize,
    pub fresh_skipped: usize,
    pub enqueued: usize,
    /// Posts that already had a live job.
    pub duplicates: usize,
    pub jobs: Vec<Uuid>,
    /// Set when the pass stopped at the page limit with more pages left.
    pub resume_cursor: Option<String>,
}

/// Walks subreddit listings and schedules comment-fetch jobs for posts that
/// are new or stale.
pub struct Enqueuer {
    source: Arc<dyn ContentSource>,
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    config: EnqueuerConfig,
}

impl Enqueuer {
    pub fn new(
        source: Arc<dyn ContentSource>,
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        config: EnqueuerConfig,
    ) -> Self {
        Self {
            source,
            store,
            queue,
            clock,
            config,
        }
    }

    pub async fn discover(&self, subreddit: &str) -> Result<DiscoveryReport> {
        self.discover_from(subreddit, None).await
    }

    /// Like [`Enqueuer::discover`], continuing a listing at `cursor`.
    pub async fn discover_from(
        &self,
        subreddit: &str,
        cursor: Option<Cursor>,
    ) -> Result<DiscoveryReport> {
        let span = info_span!("discover", subreddit = %subreddit);
        self.walk(subreddit, cursor).instrument(span).await
    }

    async fn walk(&self, subreddit: &str, cursor: Option<Cursor>) -> Result<DiscoveryReport> {
        let mut pager = match cursor {
            Some(cursor) => ListingPager::resume(self.source.as_ref(), subreddit, cursor),
            None => ListingPager::new(self.source.as_ref(), subreddit),
        }
        .with_max_pages(self.config.max_pages);

        let mut report = DiscoveryReport {
            subreddit: subreddit.to_string(),
            ..DiscoveryReport::default()
        };
        let mut considered = HashSet::new();
        let now = self.clock.now();

        while let Some(posts) = pager.next_page().await.with_context(|| {
            format!(
                "listing r/{subreddit} failed after {} page(s), {} job(s) enqueued",
                pager.pages_fetched(),
                report.enqueued
            )
        })? {
            for post in posts {
                if !considered.insert(post.post_id.clone()) {
                    continue;
                }
                report.seen += 1;
                self.consider(&post, now, &mut report).await?;
            }
        }

        if !pager.is_exhausted() {
            report.resume_cursor = pager.cursor().map(|c| c.as_str().to_string());
        }
        info!(
            seen = report.seen,
            enqueued = report.enqueued,
            fresh_skipped = report.fresh_skipped,
            duplicates = report.duplicates,
            pages = pager.pages_fetched(),
            "discovery pass finished"
        );
        Ok(report)
    }

    async fn consider(
        &self,
        post: &Post,
        now: DateTime<Utc>,
        report: &mut DiscoveryReport,
    ) -> Result<()> {
        let last_updated = self
            .store
            .post_last_updated(&post.post_id)
            .await
            .with_context(|| format!("looking up post {}", post.post_id))?;
        let job = match last_updated {
            Some(last_updated)
                if now.signed_duration_since(last_updated) <= self.config.staleness =>
            {
                debug!(post_id = %post.post_id, %last_updated, "post is fresh; skipping");
                report.fresh_skipped += 1;
                return Ok(());
            }
            Some(_) => Job::refresh(post.post_id.clone(), post.subreddit.clone()),
            None => Job::new(post.post_id.clone(), post.subreddit.clone()),
        };

        let result = self
            .queue
            .push(job)
            .await
            .with_context(|| format!("enqueueing post {}", post.post_id))?;
        match result {
            EnqueueResult::Created(id) => {
                debug!(post_id = %post.post_id, job_id = %id, "job enqueued");
                report.enqueued += 1;
                report.jobs.push(id);
            }
            EnqueueResult::Duplicate(id) => {
                debug!(post_id = %post.post_id, job_id = %id, "job already queued");
                report.duplicates += 1;
            }
        }
        Ok(())
    }
}
