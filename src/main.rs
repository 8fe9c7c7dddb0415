//! Sumi-Sluice main entry point
//!
//! This is the command-line interface for the Sumi-Sluice crawl pipeline.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sumi_sluice::config::{load_config_with_hash, Config};
use sumi_sluice::crawler::{read_seed_file, Coordinator, IterSource, Passthrough, SeedSource};
use sumi_sluice::output::{JsonLinesSink, SinkBackend, SqliteSink};
use sumi_sluice::state::Seed;
use sumi_sluice::storage::{open_store, DurableStore, RunStatus, SqliteSeedStore};
use tracing_subscriber::EnvFilter;

/// Sumi-Sluice: a crawl-task pipeline
///
/// Sumi-Sluice moves seeds from a durable SQLite store through a pool of
/// workers into batching sinks, retrying failed seeds and stopping once
/// every queue has drained.
#[derive(Parser, Debug)]
#[command(name = "sumi-sluice")]
#[command(version = "1.0.0")]
#[command(about = "A crawl-task pipeline with durable seeds", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Start from an empty seed store, discarding previous seeds
    #[arg(long)]
    fresh: bool,

    /// Validate config and show what would run without running it
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show statistics from the seed store and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            (cfg, hash)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if cli.dry_run {
        handle_dry_run(&config);
    } else if cli.stats {
        handle_stats(&config)?;
    } else {
        handle_run(config, &config_hash, cli.fresh).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("sumi_sluice=info,warn"),
            1 => EnvFilter::new("sumi_sluice=debug,info"),
            2 => EnvFilter::new("sumi_sluice=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: shows the effective configuration
fn handle_dry_run(config: &Config) {
    println!("=== Sumi-Sluice Dry Run ===\n");

    println!("Pipeline:");
    println!("  Workers: {}", config.pipeline.workers);
    println!("  Schedulers: {}", config.pipeline.schedulers);
    println!("  Max retries: {}", config.pipeline.max_retries);
    println!("  Scheduler size cap: {}", config.pipeline.scheduler_size_cap);
    println!("  Queue length threshold: {}", config.pipeline.queue_length_threshold);
    println!("  Sink batch length: {}", config.pipeline.sink_batch_length);
    println!("  Idle mode: {:?}", config.pipeline.idle_mode);

    println!("\nStore:");
    println!("  Database: {}", config.store.database_path);
    println!("  Lock TTL: {}ms", config.store.lock_ttl_ms);

    println!("\nSinks:");
    match &config.sink.jsonl_path {
        Some(path) => println!("  JSON lines: {}", path),
        None => println!("  Database: {}", config.sink.database_path),
    }
    println!("  Destinations: {}", config.sink.destinations.join(", "));

    println!("\nSource:");
    println!("  Inline seeds: {}", config.source.seeds.len());
    if let Some(path) = &config.source.seed_file {
        println!("  Seed file: {}", path);
    }

    println!("\n✓ Configuration is valid");
}

/// Handles the --stats mode: shows statistics from the seed store
fn handle_stats(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    use sumi_sluice::output::{load_statistics, print_statistics};

    println!("Database: {}\n", config.store.database_path);

    let store = open_store(Path::new(&config.store.database_path), lock_ttl(config))?;
    let stats = load_statistics(&store)?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the main pipeline run
async fn handle_run(
    config: Config,
    config_hash: &str,
    fresh: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(open_store(
        Path::new(&config.store.database_path),
        lock_ttl(&config),
    )?);

    if fresh {
        tracing::info!("Starting fresh run (clearing stored seeds)");
        store.clear()?;
    }
    let recovered = store.recover_locked()?;
    if recovered > 0 {
        tracing::info!("Recovered {} seeds left locked by a previous run", recovered);
    }

    let run_id = store.begin_run(config_hash)?;
    let coordinator = build_coordinator(config, Arc::clone(&store))?;

    // Ctrl-C raises stop; every role exits at its next tick
    let interrupted = Arc::new(AtomicBool::new(false));
    let ctx = coordinator.context();
    let flag = Arc::clone(&interrupted);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping pipeline");
            flag.store(true, Ordering::SeqCst);
            ctx.raise_stop();
        }
    });

    let result = tokio::task::spawn_blocking(move || coordinator.run()).await?;

    let status = match &result {
        Ok(_) if interrupted.load(Ordering::SeqCst) => RunStatus::Interrupted,
        Ok(_) => RunStatus::Completed,
        Err(_) => RunStatus::Failed,
    };
    store.finish_run(run_id, status)?;

    match result {
        Ok(report) => {
            tracing::info!(
                "Run {} {}: {} dispatched, {} follow-ups, {} batches stored, {} batches failed",
                run_id,
                status.to_db_string(),
                report.counters.dispatched,
                report.counters.follow_ups,
                report.counters.batches_stored,
                report.counters.batches_failed
            );
            if report.unsettled_writes > 0 {
                tracing::warn!(
                    "{} store writes were not applied; their seeds return on the next start",
                    report.unsettled_writes
                );
            }
            Ok(())
        }
        Err(e) => {
            tracing::error!("Run {} failed: {}", run_id, e);
            Err(e.into())
        }
    }
}

/// Wires the configured sinks, seed source and extractor into a coordinator
fn build_coordinator(
    config: Config,
    store: Arc<SqliteSeedStore>,
) -> Result<Coordinator, Box<dyn std::error::Error>> {
    let backend: Arc<dyn SinkBackend> = match &config.sink.jsonl_path {
        Some(path) => Arc::new(JsonLinesSink::new(Path::new(path))?),
        None => Arc::new(SqliteSink::new(Path::new(&config.sink.database_path))?),
    };
    let source = build_source(&config)?;

    // Validation guarantees at least one destination
    let primary = config.sink.destinations.first().cloned().unwrap_or_default();
    let destinations = config.sink.destinations.clone();

    let store: Arc<dyn DurableStore> = store;
    let mut coordinator = Coordinator::new(config, store, Arc::new(Passthrough::new(primary)));
    for destination in destinations {
        coordinator = coordinator.with_sink(destination, Arc::clone(&backend));
    }
    if let Some(source) = source {
        coordinator = coordinator.with_source(source);
    }
    Ok(coordinator)
}

/// Combines inline seeds and the seed file into one source, if any are set
fn build_source(
    config: &Config,
) -> Result<Option<Arc<dyn SeedSource>>, Box<dyn std::error::Error>> {
    let inline: Vec<Seed> = config.source.seeds.iter().map(Seed::new).collect();
    let source = match &config.source.seed_file {
        Some(path) => {
            let file = read_seed_file(Path::new(path))?;
            IterSource::new(inline.into_iter().chain(file))
        }
        None if inline.is_empty() => return Ok(None),
        None => IterSource::new(inline),
    };
    Ok(Some(Arc::new(source)))
}

fn lock_ttl(config: &Config) -> Duration {
    Duration::from_millis(config.store.lock_ttl_ms)
}
