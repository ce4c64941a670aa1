use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use redcrawl_core::{Clock, SystemClock};
use redcrawl_queue::{JobQueue, MemoryQueue, PgJobQueue, QueueOptions};
use redcrawl_source::{ContentSource, FixtureSource, RedditClientConfig, RedditSource};
use redcrawl_storage::{MemoryStore, PgStore, RecordStore, MIGRATOR};
use redcrawl_sync::{
    build_discovery_scheduler, discover_all, CrawlConfig, CrawlSettings, DiscoveryReport, Enqueuer,
    WorkerPool,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "redcrawl")]
#[command(about = "Crawl subreddit posts and comment trees into Postgres")]
struct Cli {
    /// Serve listings and threads from a fixture directory instead of Reddit.
    #[arg(long, global = true, value_name = "DIR")]
    fixtures: Option<PathBuf>,
    /// Keep the queue and records in memory (dry run).
    #[arg(long, global = true)]
    memory: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One discovery pass over a subreddit, or all configured ones.
    Discover { subreddit: Option<String> },
    /// Run the worker pool until Ctrl-C.
    Work,
    /// Scheduled discovery plus workers until Ctrl-C.
    Run,
    /// Apply the bundled database migrations.
    Migrate,
}

struct Components {
    source: Arc<dyn ContentSource>,
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = CrawlConfig::from_env();
    let settings = load_settings(&config).await?;
    init_tracing(&settings.logging.level);

    match &cli.command {
        Commands::Migrate => migrate(&cli, &config).await,
        Commands::Discover { subreddit } => {
            let components = build_components(&cli, &config, &settings).await?;
            let result = discover(&components, &config, &settings, subreddit.as_deref()).await;
            components.queue.close().await;
            result
        }
        Commands::Work => {
            let components = build_components(&cli, &config, &settings).await?;
            let stats = worker_pool(&components, &settings)
                .run(shutdown_on_ctrl_c())
                .await?;
            components.queue.close().await;
            println!(
                "workers stopped: succeeded={} retried={} failed={} abandoned={}",
                stats.succeeded, stats.retried, stats.failed, stats.abandoned
            );
            Ok(())
        }
        Commands::Run => {
            let components = build_components(&cli, &config, &settings).await?;
            let result = run(&components, &config, &settings).await;
            components.queue.close().await;
            result
        }
    }
}

async fn migrate(cli: &Cli, config: &CrawlConfig) -> Result<()> {
    if cli.memory {
        bail!("migrate needs a database; drop --memory");
    }
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to the database")?;
    MIGRATOR
        .run(store.pool())
        .await
        .context("running migrations")?;
    println!("migrations applied");
    Ok(())
}

fn enqueuer(components: &Components, settings: &CrawlSettings) -> Enqueuer {
    Enqueuer::new(
        components.source.clone(),
        components.store.clone(),
        components.queue.clone(),
        components.clock.clone(),
        settings.crawl_settings.enqueuer_config(),
    )
}

async fn discover(
    components: &Components,
    config: &CrawlConfig,
    settings: &CrawlSettings,
    subreddit: Option<&str>,
) -> Result<()> {
    let enqueuer = enqueuer(components, settings);
    let reports = match subreddit {
        Some(name) => {
            let Some(configured) = settings.subreddit(name) else {
                bail!("r/{name} is not listed in {}", config.settings_path.display());
            };
            vec![enqueuer.discover(&configured.name).await?]
        }
        None => discover_all(&enqueuer, settings).await,
    };
    for report in &reports {
        print_report(report);
    }
    Ok(())
}

async fn run(components: &Components, config: &CrawlConfig, settings: &CrawlSettings) -> Result<()> {
    if settings.subreddits.is_empty() {
        warn!(path = %config.settings_path.display(), "no subreddits configured");
    }
    let enqueuer = Arc::new(enqueuer(components, settings));
    for report in discover_all(&enqueuer, settings).await {
        print_report(&report);
    }
    let mut scheduler = build_discovery_scheduler(enqueuer, settings).await?;
    scheduler.start().await.context("starting scheduler")?;

    let stats = worker_pool(components, settings)
        .run(shutdown_on_ctrl_c())
        .await?;
    scheduler.shutdown().await.context("stopping scheduler")?;
    println!(
        "crawler stopped: succeeded={} retried={} failed={} recrawls={}",
        stats.succeeded, stats.retried, stats.failed, stats.recrawls_scheduled
    );
    Ok(())
}

async fn load_settings(config: &CrawlConfig) -> Result<CrawlSettings> {
    if tokio::fs::try_exists(&config.settings_path)
        .await
        .unwrap_or(false)
    {
        CrawlSettings::load(&config.settings_path).await
    } else {
        Ok(CrawlSettings::default())
    }
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{default_level},sqlx=warn").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn build_components(
    cli: &Cli,
    config: &CrawlConfig,
    settings: &CrawlSettings,
) -> Result<Components> {
    let tuning = &settings.crawl_settings;

    let source: Arc<dyn ContentSource> = match &cli.fixtures {
        Some(dir) => Arc::new(
            FixtureSource::from_dir(dir)
                .with_context(|| format!("loading fixtures from {}", dir.display()))?,
        ),
        None => {
            if !config.has_credentials() {
                bail!("REDDIT_CLIENT_ID and REDDIT_CLIENT_SECRET are required (or pass --fixtures)");
            }
            let client = RedditClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                listing_limit: tuning.listing_page_limit,
                ..RedditClientConfig::default()
            };
            Arc::new(RedditSource::new(config.credentials.clone(), client)?)
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    if cli.memory {
        info!("using in-memory store and queue");
        return Ok(Components {
            source,
            store: Arc::new(MemoryStore::with_clock(clock.clone())),
            queue: Arc::new(MemoryQueue::with_clock(tuning.visibility_timeout(), clock.clone())),
            clock,
        });
    }

    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to the database")?;
    let options = QueueOptions {
        visibility_timeout: tuning.visibility_timeout(),
        ..QueueOptions::default()
    };
    let queue = PgJobQueue::new(store.pool().clone(), options);
    Ok(Components {
        source,
        store: Arc::new(store),
        queue: Arc::new(queue),
        clock,
    })
}

fn worker_pool(components: &Components, settings: &CrawlSettings) -> WorkerPool {
    WorkerPool::new(
        components.source.clone(),
        components.store.clone(),
        components.queue.clone(),
        components.clock.clone(),
        settings.crawl_settings.worker_config(),
    )
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "could not listen for Ctrl-C");
            return;
        }
        info!("Ctrl-C received; shutting down");
        trigger.cancel();
    });
    token
}

fn print_report(report: &DiscoveryReport) {
    println!(
        "r/{}: seen={} enqueued={} fresh={} duplicates={}{}",
        report.subreddit,
        report.seen,
        report.enqueued,
        report.fresh_skipped,
        report.duplicates,
        report
            .resume_cursor
            .as_deref()
            .map(|c| format!(" resume_after={c}"))
            .unwrap_or_default()
    );
}
