use clap::Parser;
use ge_collector::adapters::{PostgresStore, WikiPriceClient};
use ge_collector::cli::{self, Cli, Commands};
use ge_collector::collector::{
    Backfiller, BackgroundSync, GapFiller, ItemSyncer, PriceRepository, PricePoller, PriceSource,
    RateLimiter, RunOutcome, VolumePoller,
};
use ge_collector::config::{AppConfig, LoggingConfig};
use ge_collector::domain::Resolution;
use ge_collector::error::{CollectorError, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Upper bound on the catalog sync done before the services start
const STARTUP_ITEM_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)?;
    let _log_guard = init_logging(&config.logging);

    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("config: {}", e);
        }
        return Err(CollectorError::Validation(errors.join("; ")));
    }

    let database_url = config.database_url().map_err(CollectorError::Validation)?;
    let store = PostgresStore::new(
        database_url,
        config.database.max_connections,
        config.database.min_connections,
    )
    .await?;
    store.migrate().await?;
    let repo: Arc<dyn PriceRepository> = Arc::new(store);

    let source: Arc<dyn PriceSource> = Arc::new(WikiPriceClient::with_options(
        &config.feed.base_url,
        &config.feed.user_agent,
        config.feed.timeout(),
    )?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_collector(&config, source, repo, cli.skip_item_sync).await?,
        Commands::Backfill { resolution } => {
            if !cli.skip_item_sync {
                startup_item_sync(&config, source.clone(), repo.clone()).await;
            }
            run_backfill(&config, source, repo, resolution).await?;
        }
        Commands::GapFill { resolution, items } => {
            if !cli.skip_item_sync {
                startup_item_sync(&config, source.clone(), repo.clone()).await;
            }
            run_gap_fill(&config, source, repo, resolution, items).await?;
        }
        Commands::SyncItems => {
            let syncer = ItemSyncer::new(source, repo, config.item_sync.to_item_syncer_config());
            syncer.sync(&CancellationToken::new()).await?;
        }
        Commands::Status {
            resolution,
            show_zero,
        } => {
            let retention = config.retention.policy();
            cli::print_status(repo.as_ref(), &retention, resolution, show_zero).await?;
        }
        Commands::FlagVolume { ids, unset } => {
            let updated = repo.set_poll_volume(&ids, !unset).await?;
            info!(
                items = ids.len(),
                rows_updated = updated,
                poll_volume = !unset,
                "updated volume polling flags"
            );
        }
    }

    info!("collector shutdown complete");
    Ok(())
}

/// Continuous mode: live poller, volume poller, background sync and periodic
/// catalog refresh until Ctrl-C or SIGTERM
async fn run_collector(
    config: &AppConfig,
    source: Arc<dyn PriceSource>,
    repo: Arc<dyn PriceRepository>,
    skip_item_sync: bool,
) -> Result<()> {
    let shutdown = CancellationToken::new();
    let retention = config.retention.policy();
    let limiter = Arc::new(RateLimiter::new(config.feed.rate_limit()));

    let syncer = Arc::new(ItemSyncer::new(
        source.clone(),
        repo.clone(),
        config.item_sync.to_item_syncer_config(),
    ));
    if !skip_item_sync {
        startup_item_sync(config, source.clone(), repo.clone()).await;
    }
    let periodic_sync = {
        let syncer = syncer.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move { syncer.run_periodic(cancel).await })
    };

    let poller = Arc::new(PricePoller::new(
        source.clone(),
        repo.clone(),
        config.poller.to_poller_config(),
    ));
    poller.start();

    let volume_poller = config.volume_poller.enabled.then(|| {
        let vp = Arc::new(VolumePoller::new(
            source.clone(),
            repo.clone(),
            limiter.clone(),
            retention,
            config.volume_poller.to_volume_poller_config(),
        ));
        vp.start();
        vp
    });

    let background_sync = config.sync.enabled.then(|| {
        let sync = Arc::new(BackgroundSync::new(
            source.clone(),
            repo.clone(),
            limiter.clone(),
            retention,
            config.sync.to_sync_config(),
        ));
        sync.start();
        sync
    });

    info!(
        poll_interval_secs = config.poller.interval_secs,
        volume_poller = config.volume_poller.enabled,
        background_sync = config.sync.enabled,
        "collector fully initialized, polling started"
    );

    shutdown_signal().await;
    info!("shutdown signal received, gracefully stopping");

    poller.stop();
    if let Some(vp) = &volume_poller {
        vp.stop().await;
    }
    if let Some(sync) = &background_sync {
        sync.stop().await;
    }
    shutdown.cancel();
    if let Err(e) = periodic_sync.await {
        warn!(error = %e, "item sync task ended abnormally");
    }

    let stats = poller.stats();
    info!(
        polls_completed = stats.polls_completed,
        observations_inserted = stats.observations_inserted,
        "collector stopped"
    );
    Ok(())
}

async fn run_backfill(
    config: &AppConfig,
    source: Arc<dyn PriceSource>,
    repo: Arc<dyn PriceRepository>,
    resolution: Option<Resolution>,
) -> Result<()> {
    let mut backfill_config = config.backfill.to_backfiller_config();
    if let Some(r) = resolution {
        backfill_config.resolutions = vec![r];
    }
    info!(
        resolutions = ?backfill_config.resolutions,
        item_delay_ms = backfill_config.item_delay.as_millis() as u64,
        "starting backfill mode"
    );

    let backfiller = Arc::new(Backfiller::new(source, repo, backfill_config));
    let signal_watch = {
        let backfiller = backfiller.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received, stopping backfill after current item");
            backfiller.stop();
        })
    };

    let outcome = backfiller.run(&CancellationToken::new()).await;
    signal_watch.abort();

    match outcome {
        Ok(RunOutcome::Stopped) => info!("backfill interrupted; rerun to resume"),
        Ok(_) => {}
        Err(e) => error!(error = %e, "backfill failed"),
    }
    Ok(())
}

async fn run_gap_fill(
    config: &AppConfig,
    source: Arc<dyn PriceSource>,
    repo: Arc<dyn PriceRepository>,
    resolution: Option<Resolution>,
    items: Option<usize>,
) -> Result<()> {
    let mut gap_config = config.gap_fill.to_gap_filler_config();
    if let Some(r) = resolution {
        gap_config.resolutions = vec![r];
    }
    if let Some(n) = items {
        gap_config.items_per_run = n;
    }
    info!(
        resolutions = ?gap_config.resolutions,
        items_per_run = gap_config.items_per_run,
        rate_limit_ms = config.feed.rate_limit_ms,
        "starting gap fill mode"
    );

    let limiter = Arc::new(RateLimiter::new(config.feed.rate_limit()));
    let filler = Arc::new(GapFiller::new(
        source,
        repo,
        limiter,
        config.retention.policy(),
        gap_config,
    ));

    let signal_watch = {
        let filler = filler.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received, stopping gap fill after current item");
            filler.stop();
        })
    };

    let outcome = filler.run(&CancellationToken::new()).await;
    signal_watch.abort();

    match outcome {
        Ok(RunOutcome::Stopped) => {
            let progress = filler.progress().await;
            info!(
                items_processed = progress.items_processed,
                buckets_filled = progress.buckets_filled,
                "gap fill interrupted"
            );
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "gap fill failed"),
    }
    Ok(())
}

/// Sync the catalog once, bounded in time; failures only warn
async fn startup_item_sync(
    config: &AppConfig,
    source: Arc<dyn PriceSource>,
    repo: Arc<dyn PriceRepository>,
) {
    let syncer = ItemSyncer::new(source, repo, config.item_sync.to_item_syncer_config());
    info!("syncing item metadata from API");

    let cancel = CancellationToken::new();
    match tokio::time::timeout(STARTUP_ITEM_SYNC_TIMEOUT, syncer.start(&cancel)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "item sync failed, continuing without item metadata"),
        Err(_) => {
            cancel.cancel();
            warn!("item sync timed out, continuing without item metadata");
        }
    }
}

fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},ge_collector=debug,sqlx=warn", logging.level))
    });

    // File logging is opt-in via GE_COLLECTOR_LOG_DIR.
    //
    // `tracing_appender::rolling::daily` panics if it can't create the initial
    // log file, so writability is checked first.
    let mut guard = None;
    let file_layer = std::env::var("GE_COLLECTOR_LOG_DIR").ok().and_then(|log_dir| {
        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            eprintln!(
                "Warning: Could not create log directory {log_dir} ({e}), file logging disabled"
            );
            return None;
        }
        let test_path = std::path::Path::new(&log_dir).join(".ge_collector_write_test");
        if let Err(e) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            eprintln!(
                "Warning: Could not write to log directory {log_dir} ({e}), file logging disabled"
            );
            return None;
        }
        let _ = std::fs::remove_file(&test_path);

        let file_appender = tracing_appender::rolling::daily(&log_dir, "ge-collector.log");
        let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(worker_guard);
        eprintln!("Logging to: {log_dir}/ge-collector.log");

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
    });

    let console_layer = if logging.json {
        tracing_subscriber::fmt::layer().json().with_target(true).boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
