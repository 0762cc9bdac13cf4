//! # grog
//!
//! Tails stdin (and optionally a second file) into a temporary embedded
//! store and streams windows of it to browser viewers over WebSocket.

#![deny(unsafe_code)]

mod cli;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use grog_ingest::{IngestPipeline, Source, DEFAULT_EVENT_QUEUE};
use grog_server::{CloseReason, ShutdownCoordinator};
use grog_store::{remove_database_files, Database, LogStore};
use grog_telemetry::{init_telemetry, MetricsRecorder};
use tokio::fs::File;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::Cli;

/// Blocking stdin reads cannot be interrupted; the runtime gives up on them
/// after this long.
const RUNTIME_SHUTDOWN: Duration = Duration::from_millis(500);

fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = init_telemetry(cli.telemetry_config());

    cli.window()
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid window configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("grog-worker")
        .build()
        .context("build tokio runtime")?;

    // Listeners go in before the database exists, so an early signal still
    // reaches the cleanup below instead of killing the process.
    let signals = {
        let _guard = runtime.enter();
        ShutdownSignals::install()
    };

    let db_path = cli.database_path(Utc::now())?;
    // Nothing to clean up if this fails: the file belongs to someone else
    // or was never created.
    let db = Database::create_ephemeral(&db_path).context("create database")?;

    let result = runtime.block_on(run(&cli, db, telemetry.metrics(), signals));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN);

    match remove_database_files(&db_path) {
        Ok(()) => info!(path = %db_path.display(), "database removed"),
        Err(e) => error!(path = %db_path.display(), error = %e, "failed to remove database"),
    }

    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "grog exited with error");
    }
    result
}

async fn run(
    cli: &Cli,
    db: Database,
    metrics: Arc<MetricsRecorder>,
    mut signals: ShutdownSignals,
) -> Result<()> {
    let db_path = db.path().to_owned();
    let store = LogStore::open(db).context("open log store")?;

    let config = cli.server_config();
    let shutdown = ShutdownCoordinator::new(config.shutdown_timeout);
    let ingest_cancel = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::channel(DEFAULT_EVENT_QUEUE);

    let server = grog_server::start(
        config,
        store.clone(),
        Arc::clone(&metrics),
        events_rx,
        shutdown.token(),
    )
    .await
    .with_context(|| format!("start server on port {}", cli.port))?;

    info!(
        port = server.port(),
        db = %db_path.display(),
        "grog ready"
    );

    let pipeline = IngestPipeline::new(store, events_tx, metrics);
    let mut sources = vec![pipeline.spawn_source(
        Source::Primary,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        ingest_cancel.clone(),
    )];

    // Opening a FIFO blocks until a writer appears; a signal must still get
    // through while it waits.
    let mut early_signal = None;
    let mut startup_error = None;
    if let Some(path) = &cli.secondary {
        match open_secondary(path, signals.recv()).await {
            Ok(SecondaryOpen::Opened(file)) => sources.push(pipeline.spawn_source(
                Source::Secondary,
                BufReader::new(file),
                tokio::io::stderr(),
                ingest_cancel.clone(),
            )),
            Ok(SecondaryOpen::Interrupted(signal)) => early_signal = Some(signal),
            Err(e) => {
                early_signal = Some("startup failure");
                startup_error = Some(e);
            }
        }
    }
    drop(pipeline);

    let signal = match early_signal {
        Some(signal) => signal,
        None => signals.recv().await,
    };
    info!(signal, "shutting down");

    // Stop ingestion first so no append lands after sessions are gone.
    ingest_cancel.cancel();
    if let Some(results) = shutdown.drain("ingest", sources).await {
        for result in results {
            match result {
                Ok(persisted) => info!(persisted, "source stopped"),
                Err(e) => warn!(error = %e, "source failed"),
            }
        }
    }

    shutdown.shutdown();
    let closing = server.engine().registry().close_all(CloseReason::Shutdown);
    info!(sessions = closing, "closing viewer sessions");
    shutdown.drain("server", server.into_tasks()).await;

    match startup_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

enum SecondaryOpen {
    Opened(File),
    Interrupted(&'static str),
}

async fn open_secondary(
    path: &Path,
    stop: impl Future<Output = &'static str>,
) -> Result<SecondaryOpen> {
    tokio::select! {
        opened = File::open(path) => {
            let file = opened
                .with_context(|| format!("open secondary source {}", path.display()))?;
            Ok(SecondaryOpen::Opened(file))
        }
        signal = stop => {
            warn!(path = %path.display(), signal, "stopped while opening secondary source");
            Ok(SecondaryOpen::Interrupted(signal))
        }
    }
}

/// SIGINT and SIGTERM listeners. Must be created inside the runtime.
#[cfg(unix)]
struct ShutdownSignals {
    interrupt: Option<tokio::signal::unix::Signal>,
    terminate: Option<tokio::signal::unix::Signal>,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn install() -> Self {
        use tokio::signal::unix::{signal, SignalKind};

        let listen = |kind: SignalKind, name: &str| match signal(kind) {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!(error = %e, signal = name, "cannot listen for signal");
                None
            }
        };
        Self {
            interrupt: listen(SignalKind::interrupt(), "SIGINT"),
            terminate: listen(SignalKind::terminate(), "SIGTERM"),
        }
    }

    async fn recv(&mut self) -> &'static str {
        async fn next(listener: &mut Option<tokio::signal::unix::Signal>) {
            match listener {
                Some(listener) => {
                    listener.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        }
        tokio::select! {
            _ = next(&mut self.interrupt) => "SIGINT",
            _ = next(&mut self.terminate) => "SIGTERM",
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    fn install() -> Self {
        Self
    }

    async fn recv(&mut self) -> &'static str {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}
