use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::{error, info, warn};

use mail_classifier::cache::{CacheStats, MultiLevelCache};
use mail_classifier::classification::{DeepClassifier, FastClassifier, TierUsage, TieredRouter};
use mail_classifier::cli::args::Args;
use mail_classifier::config::Config;
use mail_classifier::infrastructure::logging::{bootstrap_subscriber, setup_logging};
use mail_classifier::{measure_time, EngineError};
use mail_classifier::memory::{MemoryMonitorStats, MemoryPressureMonitor};
use mail_classifier::persistence::{BulkPersistenceManager, MemorySink, PersistenceSink, PersistenceStats};
use mail_classifier::processing::{BatchSummary, ParallelBatchProcessor, PoolManager, Progress, ProgressFn};
use mail_classifier::simulation::{KeywordClassifier, SimulatedDeepClassifier, WorkloadGenerator};

#[derive(Serialize)]
struct RunReport {
    mode: &'static str,
    sink: String,
    run: BatchSummary,
    tier_usage: TierUsage,
    deep_calls: u64,
    threshold: f64,
    cache: CacheStats,
    persistence: PersistenceStats,
    memory: MemoryMonitorStats,
}

fn log_engine_error(stage: &str, e: &EngineError) {
    error!(
        stage,
        severity = ?e.severity(),
        category = ?e.category(),
        error = %e,
        "run failed"
    );
}

async fn open_sink(config: &Config) -> anyhow::Result<Arc<dyn PersistenceSink>> {
    match &config.persistence.database_url {
        #[cfg(feature = "storage-sqlite")]
        Some(url) => {
            let sink = mail_classifier::persistence::SqliteSink::connect(url, 4).await?;
            Ok(Arc::new(sink))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        Some(_) => anyhow::bail!("SQLite persistence requires the storage-sqlite feature"),
        None => Ok(Arc::new(MemorySink::new())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Environment warnings are emitted before the configured subscriber exists
    let config = tracing::subscriber::with_default(bootstrap_subscriber(std::io::stderr), || {
        let mut config = Config::new();
        config.update_from_args(&args);
        config
            .validate()
            .map_err(|e| EngineError::config(e.to_string()))
            .inspect_err(|e| log_engine_error("config", e))?;
        Ok::<_, EngineError>(config)
    })?;
    setup_logging(config.logging_config())?;

    let pools = Arc::new(PoolManager::new());
    let shutdown = pools.cancellation_token();
    let signal_token = shutdown.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing current work");
            signal_token.cancel();
        }
    });

    let cache = Arc::new(MultiLevelCache::new(config.cache_config()));
    let monitor = Arc::new(MemoryPressureMonitor::new(config.monitor_config()));
    monitor.register_hook(cache.clone()).await;

    let sink = measure_time!("open_sink", { open_sink(&config).await? });
    let sink_name = sink.name().to_string();
    let persistence = Arc::new(BulkPersistenceManager::new(config.persistence_config(), sink));

    let background = shutdown.child_token();
    let background_tasks = vec![
        cache.start_cleanup_task(background.clone()),
        monitor.start(background.clone()),
        persistence.start_auto_flush(
            Duration::from_secs(config.persistence.flush_interval_secs.max(1)),
            background.clone(),
        ),
    ];

    let router = Arc::new(TieredRouter::new(config.router_config()).with_cache(cache.clone()));
    let fast: Arc<dyn FastClassifier> = Arc::new(KeywordClassifier);
    let deep = Arc::new(SimulatedDeepClassifier::new(Duration::from_millis(args.deep_latency_ms)));
    let deep_dyn: Arc<dyn DeepClassifier> = deep.clone();

    let processor = ParallelBatchProcessor::new(config.processor_config(), pools.clone(), persistence.clone())
        .with_monitor(monitor.clone());
    let tasks = WorkloadGenerator::new(args.seed, args.spam_ratio, args.uncertain_ratio).generate(args.tasks);

    info!(tasks = tasks.len(), workers = config.pool.workers, stream = args.stream, "starting simulation");

    let (mode, run) = if args.stream {
        let outcome = processor
            .process_stream(
                futures_util::stream::iter(tasks),
                router.clone(),
                fast,
                Some(deep_dyn),
                shutdown.clone(),
                |report| {
                    info!(
                        chunk = report.index,
                        processed = report.outcome.results.len(),
                        escalated = report.outcome.escalated,
                        reclaimed = ?report.reclaimed,
                        "chunk finished"
                    )
                },
            )
            .await
            .map_err(EngineError::from)
            .inspect_err(|e| log_engine_error("stream", e))?;
        ("stream", outcome.summary)
    } else {
        let progress: ProgressFn = Arc::new(|p: Progress| {
            info!(
                completed = p.completed,
                total = p.total,
                progress = %format!("{:.0}%", p.fraction * 100.0),
                "batch progress"
            )
        });
        let outcome = processor
            .process_batch(tasks, router.clone(), fast, Some(deep_dyn), Some(progress))
            .await
            .map_err(EngineError::from)
            .inspect_err(|e| log_engine_error("batch", e))?;
        ("batch", outcome.summary())
    };

    let threshold = router.auto_tune();

    background.cancel();
    for handle in background_tasks {
        if let Err(e) = handle.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    pools
        .shutdown_all(true, Duration::from_secs(config.pool.shutdown_timeout_secs))
        .await
        .map_err(EngineError::from)
        .inspect_err(|e| log_engine_error("shutdown", e))?;
    signal_task.abort();

    let report = RunReport {
        mode,
        sink: sink_name,
        run,
        tier_usage: router.tier_usage(),
        deep_calls: deep.calls(),
        threshold,
        cache: cache.stats(None).await,
        persistence: persistence.stats().await,
        memory: monitor.stats().await,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
