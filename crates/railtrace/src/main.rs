//! `railtrace` - CLI for the railtrace telemetry recorder
//!
//! This binary runs the recorder and manages its local store.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::BufReader;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use railtrace::cli::{Cli, Command, ConfigCommand, FeedSource, PruneCommand, RunCommand};
use railtrace::feed::spawn_line_reader;
use railtrace::logging::LogFormat;
use railtrace::recorder::sink_from_config;
use railtrace::{
    init_logging, Config, PositionFeed, RecordStore, Recorder, SamplingMode, StatusReporter,
    SyncEngine, SyncOutcome, SyncReason,
};

/// How often `run` checks the persisted session for an external stop.
const SESSION_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if matches!(cli.command, Command::Run(_)) {
        LogFormat::Compact
    } else {
        LogFormat::Full
    };
    init_logging(cli.verbosity(), format);

    match cli.command {
        Command::Run(run_cmd) => handle_run(load_config(cli.config)?, run_cmd).await,
        Command::Stop => handle_stop(&load_config(cli.config)?),
        Command::Status(status_cmd) => handle_status(&load_config(cli.config)?, status_cmd.json),
        Command::Sync => handle_sync(&load_config(cli.config)?).await,
        Command::Prune(prune_cmd) => handle_prune(&load_config(cli.config)?, &prune_cmd),
        Command::Config(config_cmd) => handle_config(cli.config, config_cmd),
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    Ok(Config::load_from(path)?)
}

fn open_store(config: &Config) -> anyhow::Result<Arc<RecordStore>> {
    let path = config.database_path();
    let store = RecordStore::open_with_busy_timeout(&path, config.busy_timeout())
        .with_context(|| format!("opening store at {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn handle_run(mut config: Config, cmd: RunCommand) -> anyhow::Result<()> {
    if cmd.synthetic {
        config.recording.mode = SamplingMode::Synthetic;
    }
    let interval = cmd.interval_ms.map(Duration::from_millis);
    if interval.is_some_and(|i| i.is_zero()) {
        anyhow::bail!("--interval-ms must be greater than 0");
    }

    let feed = PositionFeed::new();
    let reader = match cmd.feed {
        FeedSource::Stdin => Some(spawn_line_reader(
            BufReader::new(tokio::io::stdin()),
            feed.clone(),
        )),
        FeedSource::Disabled => None,
    };

    let mut recorder = Recorder::from_config(&config, feed)?;
    let mut events = recorder.subscribe();

    let resumed = recorder.resume()?;
    if cmd.start && !resumed {
        recorder.start_recording(interval)?;
    } else if let (true, Some(interval)) = (resumed, interval) {
        recorder.update_interval(interval)?;
    }
    recorder.trigger_sync(SyncReason::Foreground)?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut poll = tokio::time::interval(SESSION_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(text) = event.notification() {
                        println!("{text}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Status output fell behind");
                }
                Err(RecvError::Closed) => break,
            },
            _ = poll.tick() => recorder.follow_persisted_session(),
        }
    }

    // Leaves the persisted session in place so the next run resumes it.
    recorder.shutdown();
    if let Some(reader) = reader {
        reader.abort();
    }
    Ok(())
}

fn handle_stop(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let was_active = store
        .load_session()?
        .is_some_and(|s| s.should_resume());
    store.clear_session()?;

    if was_active {
        println!("Recording session stopped.");
    } else {
        println!("No active recording session.");
    }
    Ok(())
}

fn handle_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let session = store.load_session()?;
    let stats = store.stats()?;

    if json {
        let status = serde_json::json!({
            "database_path": config.database_path(),
            "session": session,
            "store": stats,
            "endpoint": config.sync.endpoint,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("railtrace status");
    println!("----------------");
    println!("Database:      {}", config.database_path().display());
    match session.filter(railtrace::RecordingSession::should_resume) {
        Some(s) => {
            println!("Recording:     active (every {} ms)", s.interval_ms());
            if let Some(started_at) = s.started_at {
                println!("Started:       {}", started_at.to_rfc3339());
            }
        }
        None => println!("Recording:     inactive"),
    }
    println!("Records:       {}", stats.total_records);
    println!("Pending:       {}", stats.undelivered_records);
    if let Some(oldest) = stats.oldest_capture {
        println!("Oldest:        {}", oldest.to_rfc3339());
    }
    if let Some(newest) = stats.newest_capture {
        println!("Newest:        {}", newest.to_rfc3339());
    }
    println!("Size:          {} bytes", stats.db_size_bytes);
    println!(
        "Endpoint:      {}",
        config.sync.endpoint.as_deref().unwrap_or("(not configured)")
    );
    Ok(())
}

async fn handle_sync(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let sink = sink_from_config(config)?;
    let engine = SyncEngine::new(
        store,
        sink,
        StatusReporter::new(),
        config.sync.max_batch_size,
    );

    match engine.sync_once(SyncReason::Manual).await {
        SyncOutcome::Empty => println!("Nothing to sync."),
        SyncOutcome::InFlight => println!("A sync is already running."),
        SyncOutcome::Delivered {
            submitted,
            delivered,
        } => println!("{delivered} of {submitted} points synced."),
        SyncOutcome::Failed { submitted, error } => {
            anyhow::bail!("sync of {submitted} points failed: {error}");
        }
    }
    Ok(())
}

fn handle_prune(config: &Config, cmd: &PruneCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let keep = cmd.keep.unwrap_or(config.storage.max_records);

    let evicted = store.evict_oldest(keep)?;
    let expired = match config.retain_delivered() {
        Some(max_age) => store.prune_delivered_older_than(max_age)?,
        None => 0,
    };

    println!("Evicted {evicted} records over the {keep} record bound.");
    println!("Removed {expired} delivered records past retention.");
    Ok(())
}

fn handle_config(path: Option<PathBuf>, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            let config = Config::load_from(path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                println!("  Max records:        {}", config.storage.max_records);
                println!(
                    "  Retain delivered:   {} days",
                    config.storage.retain_delivered_days
                );
                println!();
                println!("[Recording]");
                println!("  Interval:           {} ms", config.recording.interval_ms);
                println!("  Mode:               {}", config.recording.mode);
                println!();
                println!("[Queue]");
                println!("  Max queue size:     {}", config.queue.max_queue_size);
                println!("  Sync threshold:     {}", config.queue.sync_threshold);
                println!();
                println!("[Sync]");
                println!(
                    "  Endpoint:           {}",
                    config.sync.endpoint.as_deref().unwrap_or("(not configured)")
                );
                println!("  Action:             {}", config.sync.action);
                println!("  Interval:           {} s", config.sync.sync_interval_secs);
                println!("  Max batch size:     {}", config.sync.max_batch_size);
                println!();
                println!("[Runtime]");
                println!("  Background sync:    {}", config.runtime.background_sync);
                println!("  Dedicated worker:   {}", config.runtime.dedicated_worker);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.or(path).unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => anyhow::bail!("configuration error: {e}"),
            }
        }
    }
    Ok(())
}
