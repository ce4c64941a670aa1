//! Crawl orchestration: listing discovery, the worker pool, retry policy,
//! configuration and the discovery scheduler.

pub mod config;
pub mod enqueuer;
pub mod retry;
pub mod schedule;
pub mod worker;

pub use config::{CrawlConfig, CrawlSettings, CrawlTuning, LoggingSettings, SubredditConfig};
pub use enqueuer::{DiscoveryReport, Enqueuer, EnqueuerConfig};
pub use retry::BackoffPolicy;
pub use schedule::{build_discovery_scheduler, discover_all, discovery_intervals};
pub use worker::{FailureKind, JobFailure, PoolStats, WorkerConfig, WorkerPool};

pub const CRATE_NAME: &str = "redcrawl-sync";

impl CrawlTuning {
    pub fn enqueuer_config(&self) -> EnqueuerConfig {
        EnqueuerConfig {
            staleness: self.staleness(),
            max_pages: self.max_pages,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.consumer_concurrency,
            poll_interval: self.poll_interval(),
            backoff: self.backoff(),
            recrawl_delays: self.recrawl_delays(),
            ..WorkerConfig::default()
        }
    }
}
