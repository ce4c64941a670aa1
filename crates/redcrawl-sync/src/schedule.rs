use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{error, info};

use crate::config::CrawlSettings;
use crate::enqueuer::{DiscoveryReport, Enqueuer};

/// One discovery pass over every configured subreddit. A failing subreddit
/// is logged and skipped.
pub async fn discover_all(enqueuer: &Enqueuer, settings: &CrawlSettings) -> Vec<DiscoveryReport> {
    let mut reports = Vec::with_capacity(settings.subreddits.len());
    for subreddit in &settings.subreddits {
        match enqueuer.discover(&subreddit.name).await {
            Ok(report) => reports.push(report),
            Err(e) => error!(subreddit = %subreddit.name, error = %format!("{e:#}"), "discovery failed"),
        }
    }
    reports
}

/// Per-subreddit discovery intervals, in configuration order.
pub fn discovery_intervals(settings: &CrawlSettings) -> Vec<(String, Duration)> {
    settings
        .subreddits
        .iter()
        .map(|s| (s.name.clone(), settings.crawl_interval(s)))
        .collect()
}

/// Scheduler with one repeated discovery job per configured subreddit.
/// The caller starts it.
pub async fn build_discovery_scheduler(
    enqueuer: Arc<Enqueuer>,
    settings: &CrawlSettings,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for (subreddit, interval) in discovery_intervals(settings) {
        let enqueuer = enqueuer.clone();
        let name = subreddit.clone();
        let job = CronJob::new_repeated_async(interval, move |_uuid, _lock| {
            let enqueuer = enqueuer.clone();
            let subreddit = name.clone();
            Box::pin(async move {
                match enqueuer.discover(&subreddit).await {
                    Ok(report) => info!(
                        subreddit = %subreddit,
                        enqueued = report.enqueued,
                        "scheduled discovery finished"
                    ),
                    Err(e) => error!(subreddit = %subreddit, error = %format!("{e:#}"), "scheduled discovery failed"),
                }
            })
        })
        .with_context(|| format!("creating discovery job for r/{subreddit}"))?;
        sched.add(job).await.context("adding discovery job")?;
        info!(subreddit = %subreddit, interval_secs = interval.as_secs(), "discovery scheduled");
    }
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enqueuer::EnqueuerConfig;
    use crate::testing::fixture_source;
    use redcrawl_core::SystemClock;
    use redcrawl_queue::MemoryQueue;
    use redcrawl_storage::MemoryStore;

    fn settings() -> CrawlSettings {
        CrawlSettings::from_yaml(
            "subreddits:\n  - name: rust\n    crawl_interval_minutes: 5\n  - name: golang\n",
        )
        .unwrap()
    }

    fn enqueuer() -> Enqueuer {
        Enqueuer::new(
            Arc::new(fixture_source()),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryQueue::new(Duration::from_secs(300))),
            Arc::new(SystemClock),
            EnqueuerConfig::default(),
        )
    }

    #[test]
    fn intervals_fall_back_to_default() {
        assert_eq!(
            discovery_intervals(&settings()),
            vec![
                ("rust".to_string(), Duration::from_secs(300)),
                ("golang".to_string(), Duration::from_secs(1800)),
            ]
        );
    }

    #[tokio::test]
    async fn discover_all_skips_failing_subreddits() {
        // No fixture listing exists for golang.
        let reports = discover_all(&enqueuer(), &settings()).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].subreddit, "rust");
        assert_eq!(reports[0].enqueued, 3);
    }

    #[tokio::test]
    async fn scheduler_builds_for_every_subreddit() {
        let sched = build_discovery_scheduler(Arc::new(enqueuer()), &settings()).await;
        assert!(sched.is_ok());
    }
}
