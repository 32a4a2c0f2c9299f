//! itg-buddy application binary - composition root.
//!
//! 1. Load configuration from TOML and resolve the import settings
//! 2. Start the event log, the front end pump and the import workers
//! 3. Read console commands until `quit`, end of input or Ctrl-C
//! 4. Drain the import queues and exit
//!
//! A bad `[import]` configuration only disables importing; the console keeps
//! running.

mod cli;
mod console;
mod importer;

use std::sync::Arc;

use buddy_bridge::{frontend, BridgeConfig, ConfirmationGate, FrontEnd, JobDispatcher, JobHandle};
use buddy_core::config::{BuddyConfig, ImportSettings};
use buddy_core::events::BridgeEvent;
use buddy_core::types::UserId;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};

use cli::CliArgs;
use console::{ConsoleOutput, Flow, Session};
use importer::LocalImportEngine;

/// Log every bridge event as JSON at debug level.
async fn log_events(mut rx: broadcast::Receiver<BridgeEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match event.to_json() {
                Ok(json) => tracing::debug!(event = %json, "Bridge event"),
                Err(e) => tracing::warn!(error = %e, "Failed to serialize bridge event"),
            },
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event log fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Log a job's result once it completes. The user sees it via the front end.
fn watch_job(handle: JobHandle) {
    tokio::spawn(async move {
        let job_id = handle.job_id();
        match handle.await {
            Ok(result) => tracing::debug!(job_id = %job_id, status = %result.status(), "Job complete"),
            Err(e) => tracing::warn!(error = %e, "Job ended without a result"),
        }
    });
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config is read before tracing so its log level can seed the filter.
    let config_file = args.resolve_config_path();
    let loaded = BuddyConfig::load(&config_file);
    let config_level = loaded
        .as_ref()
        .map(|c| c.general.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(args.resolve_log_level(&config_level))
            }),
        )
        .init();

    tracing::info!("Starting itg-buddy v{}", env!("CARGO_PKG_VERSION"));

    let config = match loaded {
        Ok(config) => {
            tracing::info!(path = %config_file.display(), "Configuration loaded");
            config
        }
        Err(e) => {
            tracing::warn!(path = %config_file.display(), error = %e, "Using default configuration");
            BuddyConfig::default()
        }
    };

    // Event log.
    let events = buddy_core::EventBus::default();
    tokio::spawn(log_events(events.subscribe()));

    // Import settings. Failure disables importing only.
    let settings = match ImportSettings::from_env(&config.import) {
        Ok(settings) => {
            tracing::info!(
                packs = %settings.packs.display(),
                courses = %settings.courses.display(),
                singles = %settings.singles.display(),
                "Import settings resolved"
            );
            Some(settings)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Import subsystem disabled");
            None
        }
    };

    // Front end and workers.
    let (tx, rx) = frontend::channel();
    let gate = Arc::new(ConfirmationGate::new());
    let front_end = tokio::spawn(FrontEnd::new(rx, Arc::clone(&gate)).run());

    let dispatcher = if settings.is_some() {
        match JobDispatcher::start(
            Arc::new(LocalImportEngine::new()),
            BridgeConfig::from(&config.bridge),
            tx,
            events.clone(),
        ) {
            Ok(dispatcher) => Some(dispatcher),
            Err(e) => {
                tracing::error!(error = %e, "Failed to start import workers");
                None
            }
        }
    } else {
        drop(tx);
        None
    };

    let session = Session::new(
        dispatcher,
        settings,
        gate,
        UserId::new(args.user.clone()),
        ConsoleOutput::stdout(),
    );
    tracing::info!(user = %args.user, "Console ready, type `help` for commands");

    // === Input loop ===

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match session.handle_line(&line).await {
                    Flow::Continue => {}
                    Flow::Submitted(handles) => handles.into_iter().for_each(watch_job),
                    Flow::Quit => break,
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read console input");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    // === Shutdown ===

    if let Some(mut dispatcher) = session.into_dispatcher() {
        tracing::info!("Waiting for queued imports to finish");
        tokio::task::spawn_blocking(move || dispatcher.shutdown()).await?;
    }
    front_end.await?;
    tracing::info!("Stopped");
    Ok(())
}
