use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use afters_common::{Clock, Config, FetchBackend, SystemClock, VisionBackend};
use afters_scout::classify::{
    ClassificationCache, ClassificationClient, ClaudeVisionService, HttpVisionService, VisionService,
};
use afters_scout::dedup::DedupCache;
use afters_scout::fetch::{
    ApifyLocationSource, FetchWorkerPool, IdentityPool, InstagramLocationSource, MediaSource,
};
use afters_scout::pulse::{ChannelSubscriber, PulseBroadcaster};
use afters_scout::registry::JsonFileRegistry;
use afters_scout::scheduling::CrawlScheduler;
use afters_scout::score::ScoreAggregator;
use afters_scout::store::{MemoryStore, PostgresStore, PulseStore};
use afters_scout::{notify, ScoutConfig, ScoutDeps, VibeScout};
use apify_client::ApifyClient;

#[derive(Parser)]
#[command(name = "afters-scout", about = "Venue vibe scout: crawl, classify, score, push")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline until Ctrl-C.
    Run,
    /// One crawl and classification pass, then print stats.
    Once,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let config = Config::from_env()?;
    config.log_redacted();
    let tuning = ScoutConfig::from_env()?;

    let scout = build(&config, &tuning).await?;
    if let Err(e) = scout.warm().await {
        warn!(error = %e, "Warm-up from store failed, starting cold");
    }

    let (pulse_tx, pulse_rx) = ChannelSubscriber::new(256);
    scout.deps().broadcaster.subscribe(Arc::new(pulse_tx));
    let pulse_log = tokio::spawn(log_pulses(pulse_rx));

    match cli.command {
        Command::Run => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown requested");
                }
                let _ = shutdown_tx.send(true);
            });
            scout.run(shutdown_rx).await?;
        }
        Command::Once => {
            scout.sync_registry().await?;
            let stats = scout.crawl_once().await;
            scout.deps().broadcaster.shutdown().await;
            println!("{stats}");
        }
    }

    pulse_log.abort();
    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("afters=info".parse()?);
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

async fn build(config: &Config, tuning: &ScoutConfig) -> Result<VibeScout> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store: Arc<dyn PulseStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresStore::connect(url)
                .await
                .context("connecting to Postgres")?;
            store.migrate().await?;
            info!("Using Postgres store");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set, classifications and scores are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let identities = IdentityPool::new(config.user_agents.clone(), config.proxy_urls.clone());
    let source: Arc<dyn MediaSource> = match config.fetch_backend {
        FetchBackend::Direct => Arc::new(InstagramLocationSource::new(
            &identities,
            tuning.fetch.request_timeout,
        )?),
        FetchBackend::Apify => {
            let token = config
                .apify_api_token
                .clone()
                .context("APIFY_API_TOKEN missing")?;
            Arc::new(ApifyLocationSource::new(ApifyClient::new(token)))
        }
    };

    let vision: Arc<dyn VisionService> = match config.vision_backend {
        VisionBackend::Claude => {
            let key = config
                .anthropic_api_key
                .clone()
                .context("ANTHROPIC_API_KEY missing")?;
            Arc::new(ClaudeVisionService::new(
                key,
                config.vision_model.clone(),
                tuning.classify.call_timeout,
            ))
        }
        VisionBackend::Http => {
            let endpoint = config
                .vision_endpoint
                .clone()
                .context("VISION_ENDPOINT missing")?;
            Arc::new(HttpVisionService::new(endpoint, tuning.classify.call_timeout))
        }
    };

    let scheduler = Arc::new(CrawlScheduler::new(tuning.scheduler.clone(), clock.clone()));
    let fetcher = Arc::new(FetchWorkerPool::new(
        source,
        scheduler.clone(),
        identities,
        notify::from_config(config.slack_webhook_url.as_deref()),
        tuning.fetch.clone(),
        clock.clone(),
    ));
    let classifier = Arc::new(ClassificationClient::new(
        vision,
        Arc::new(ClassificationCache::new()),
        store.clone(),
        tuning.classify.clone(),
        clock.clone(),
    ));

    let deps = ScoutDeps::builder()
        .scheduler(scheduler)
        .fetcher(fetcher)
        .dedup(Arc::new(DedupCache::new(&tuning.dedup, clock.clone())))
        .classifier(classifier)
        .aggregator(Arc::new(ScoreAggregator::new(tuning.score.clone(), clock.clone())))
        .broadcaster(Arc::new(PulseBroadcaster::new(tuning.pulse.clone())))
        .registry(Arc::new(JsonFileRegistry::new(&config.venues_file)))
        .store(store)
        .config(tuning.pipeline.clone())
        .clock(clock)
        .build();

    Ok(VibeScout::new(deps))
}

async fn log_pulses(mut rx: broadcast::Receiver<afters_common::PulseDelta>) {
    loop {
        match rx.recv().await {
            Ok(delta) => info!(
                venue_id = %delta.venue_id,
                energy = delta.energy,
                crowd = delta.crowd,
                vibe = %delta.vibe,
                samples = delta.sample_count,
                stale = delta.stale,
                "Pulse"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Pulse log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
