use clap::Parser;
use portgate::config::Config;
use portgate::diag;
use portgate::proxy::Proxy;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;

/// Multi-tenant TCP reverse proxy with least-connections balancing
#[derive(Debug, Parser)]
#[command(name = "portgate", version)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Log verbosity: 0=debug, 1=info, 2=warn, 3=error, 4=fatal, 7=disabled
    #[arg(long, default_value_t = 3)]
    loglevel: u8,

    /// Expose the diagnostics HTTP endpoint on port 6060
    #[arg(long)]
    pprof: bool,
}

fn log_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::DEBUG,
        1 => LevelFilter::INFO,
        2 => LevelFilter::WARN,
        3 | 4 => LevelFilter::ERROR,
        _ => LevelFilter::OFF,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(log_filter(args.loglevel))
        .init();

    let config = Config::load(&args.config)?;
    info!(
        path = %args.config.display(),
        apps = config.apps.len(),
        "configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy = Arc::new(Proxy::new(&config, shutdown_rx.clone())?);

    if args.pprof {
        let diag_proxy = Arc::clone(&proxy);
        let diag_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = diag::run(diag_proxy, diag_rx).await {
                error!(error = %e, "diagnostics endpoint failed");
            }
        });
    }

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    // blocks until every frontend and backend has finished closing
    proxy.run().await;
    info!("proxy stopped");
    Ok(())
}

/// Wait for any of the termination signals.
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).expect("Failed to register SIGHUP handler");
    let mut interrupt =
        signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");
    let mut terminate =
        signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    let mut quit = signal(SignalKind::quit()).expect("Failed to register SIGQUIT handler");

    tokio::select! {
        _ = hangup.recv() => {}
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = quit.recv() => {}
    }
}
