use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mediasync::{
    config::Config, database::Database, media_server, models::FileEventKind,
    service::SyncService, web::WebServer,
};

#[derive(Parser)]
#[command(name = "mediasync")]
#[command(version)]
#[command(about = "Keeps Plex, Jellyfin and Emby libraries in sync with on-disk media")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Database URL (overrides the default SQLite file)
    #[arg(short = 'd', long, value_name = "URL", default_value = "sqlite://./mediasync.db")]
    database_url: String,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    /// Enable real-time file monitoring
    #[arg(long)]
    watch: bool,

    /// Log what would happen without triggering any refresh
    #[arg(long)]
    dry_run: bool,

    /// Scan a specific file or directory immediately and exit
    #[arg(long, value_name = "PATH")]
    scan_now: Option<PathBuf>,

    /// List all files marked as stuck and exit
    #[arg(long)]
    list_stuck: bool,

    /// Clear all stuck files from history and exit
    #[arg(long)]
    clear_stuck: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("mediasync={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting mediasync v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(Path::new(&cli.config))?;
    if cli.dry_run {
        config.behaviour.dry_run = true;
    }
    if cli.watch {
        config.behaviour.watch = true;
    }
    if config.behaviour.dry_run {
        info!("DRY RUN MODE ENABLED - no refreshes will be issued");
    }

    let database = Database::new(&cli.database_url).await?;
    database.migrate().await?;

    if cli.list_stuck {
        let stuck = database.stuck_files().all().await?;
        if stuck.is_empty() {
            println!("No stuck files found.");
        } else {
            println!("Found {} stuck files:", stuck.len());
            for entry in stuck {
                println!("[{} attempts] {}: {}", entry.attempts, entry.last_seen, entry.path);
            }
        }
        return Ok(());
    }
    if cli.clear_stuck {
        let cleared = database.stuck_files().clear_all().await?;
        println!("Cleared {cleared} stuck files from history.");
        return Ok(());
    }

    let server = media_server::build(&config)?;
    let watch_mode = config.behaviour.watch;
    let run_on_startup = config.behaviour.run_on_startup;
    let service = SyncService::new(config, database, server);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    // One-shot targeted scan.
    if let Some(path) = cli.scan_now {
        media_server::connect(service.server().as_ref(), false).await?;
        service.spawn_scheduler(shutdown_rx.clone());

        if path.is_file() {
            info!("Targeted scan for file: {}", path.display());
            service.load_sections().await?;
            service.submit_file_event(FileEventKind::Created, path);
            drain_pending(&service).await;
        } else if path.is_dir() {
            info!("Targeted scan for directory: {}", path.display());
            service.sweep_directory(&path).await?;
        } else {
            error!("Path not found: {}", path.display());
        }
        return Ok(());
    }

    service.spawn_scheduler(shutdown_rx.clone());

    let web_server = WebServer::new(service.clone(), shutdown_rx.clone())?;
    info!("Web API listening on http://{}", web_server.addr());
    tokio::spawn(async move {
        if let Err(e) = web_server.serve().await {
            error!("Web server failed: {e}");
        }
    });

    media_server::connect(service.server().as_ref(), true).await?;
    service.load_sections().await?;

    if run_on_startup {
        info!("Running startup sweep...");
        let _ = service.run_sweep(&shutdown_rx).await;
    }

    if watch_mode {
        info!("Starting real-time watcher...");
        service.run_watcher(shutdown_rx.clone()).await?;
    } else {
        service.run_schedule(shutdown_rx.clone()).await;
    }

    info!("mediasync shutdown complete");
    Ok(())
}

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        error!("Failed to install SIGTERM handler: {e}");
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("Received shutdown signal, stopping...");
        let _ = shutdown_tx.send(true);
    });
}

/// Wait for the scheduler's queue to drain so a one-shot invocation does
/// not exit with refreshes still debouncing.
async fn drain_pending(service: &std::sync::Arc<SyncService>) {
    tokio::time::sleep(Duration::from_secs(1)).await;
    while !service.scheduler().pending_snapshot().is_empty() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    // Give in-flight dispatches a moment to finish.
    tokio::time::sleep(Duration::from_secs(2)).await;
}
