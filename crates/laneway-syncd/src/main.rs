#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use laneway_core::config::{ConfigError, laneway_home, load_project_config};
use laneway_sync::batch::SyncClient;
use laneway_sync::queue::OfflineQueue;
use laneway_sync::worker::{SyncWorker, WorkerConfig, run_pass};
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const TOKEN_ENV: &str = "LANEWAY_TOKEN";
const WORKER_POLL: Duration = Duration::from_millis(500);
const SERVER_URL_ENV: &str = "LANEWAY_SERVER_URL";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "laneway-syncd: drain the offline event queue to the sync server",
    long_about = None
)]
struct Cli {
    /// Project root holding `.laneway/config.toml` (default: current dir).
    #[arg(long)]
    root: Option<PathBuf>,

    /// Node state directory (default: `$LANEWAY_HOME` or `~/.laneway`).
    #[arg(long)]
    home: Option<PathBuf>,

    /// Sync server URL, overriding config and environment.
    #[arg(long)]
    server_url: Option<String>,

    /// Run a single pass and exit.
    #[arg(long)]
    once: bool,

    /// Print queue statistics as JSON and exit.
    #[arg(long, conflicts_with = "once")]
    stats: bool,

    /// Seconds between passes.
    #[arg(long)]
    interval: Option<u64>,

    /// Events per request.
    #[arg(long)]
    batch_size: Option<usize>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LANEWAY_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "laneway=debug,info"
        } else {
            "laneway=info,warn"
        })
    });

    let format = env::var("LANEWAY_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry.with(fmt::layer().json().with_ansi(false)).init();
        }
        _ => {
            registry.with(fmt::layer().compact()).init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => env::current_dir()?,
    };
    let config = load_project_config(&root).inspect_err(|err| {
        if let Some(cause) = err.downcast_ref::<ConfigError>() {
            error!(
                code = cause.code().code(),
                hint = cause.code().hint().unwrap_or_default(),
                "{cause}"
            );
        }
    })?;
    let home = match cli.home {
        Some(home) => home,
        None => laneway_home()?,
    };

    let mut queue = OfflineQueue::open_in(&home)
        .with_context(|| format!("failed to open queue under {}", home.display()))?
        .with_max_size(config.sync.max_queue_size);

    if cli.stats {
        let stats = queue.stats()?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let server_url = cli
        .server_url
        .or_else(|| env::var(SERVER_URL_ENV).ok())
        .or_else(|| config.sync.server_url.clone())
        .with_context(|| {
            format!("no sync server configured; set [sync] server_url or {SERVER_URL_ENV}")
        })?;
    let token = env::var(TOKEN_ENV).with_context(|| format!("{TOKEN_ENV} is not set"))?;

    let client = SyncClient::with_timeout(
        server_url,
        token,
        Duration::from_secs(config.sync.request_timeout_secs),
    );
    let batch_size = cli.batch_size.unwrap_or(config.sync.batch_size);

    if cli.once {
        let result = run_pass(&client, &mut queue, batch_size, &AtomicBool::new(false))?;
        info!(
            synced = result.synced_count,
            duplicates = result.duplicate_count,
            errors = result.error_count,
            remaining = queue.size()?,
            "sync pass complete"
        );
        if result.error_count > 0 {
            warn!(failed = ?result.error_messages, "some events were not accepted");
        }
        return Ok(());
    }

    let interval = Duration::from_secs(cli.interval.unwrap_or(config.sync.interval_secs));
    let worker = SyncWorker::spawn(
        client,
        queue,
        WorkerConfig {
            interval,
            batch_size,
        },
    )
    .context("failed to start sync thread")?;

    supervise(worker, shutdown_signal())
}

/// Run until `shutdown` resolves or the sync thread exits, then cancel the
/// worker and wait for the batch in flight to be applied.
fn supervise<F>(worker: SyncWorker, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<&'static str>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start signal runtime")?;

    let outcome = runtime.block_on(async {
        tokio::select! {
            received = shutdown => received.map(Some),
            () = worker_exit(&worker) => Ok(None),
        }
    });
    match &outcome {
        Ok(Some(name)) => info!(signal = *name, "shutdown requested; finishing current batch"),
        Ok(None) => warn!("sync thread exited on its own"),
        Err(err) => warn!(error = %err, "signal handling failed; stopping"),
    }

    worker
        .stop()
        .map_err(|_| anyhow::anyhow!("sync thread panicked"))?;
    info!("laneway-syncd stopped");
    outcome.map(|_| ())
}

async fn worker_exit(worker: &SyncWorker) {
    let mut poll = tokio::time::interval(WORKER_POLL);
    while !worker.is_finished() {
        poll.tick().await;
    }
}

async fn shutdown_signal() -> anyhow::Result<&'static str> {
    #[cfg(unix)]
    let terminate = {
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        async move {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to install Ctrl-C handler")?;
            Ok("SIGINT")
        }
        () = terminate => Ok("SIGTERM"),
    }
}
