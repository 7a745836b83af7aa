use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

/// Generations can run long; give in-flight requests time to finish.
const DRAIN_GRACE: Duration = Duration::from_secs(45);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config_path = "config.json".to_string();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config_path = args.next().ok_or("missing value for --config")?;
            }
            other => {
                return Err(format!("unknown arg: {other}\nusage: llproxy [--config config.json]").into());
            }
        }
    }

    let config = llproxy::config::Config::load(Path::new(&config_path))?;
    llproxy::logging::init(&config.logging)?;

    let client = reqwest::Client::new();
    let table = llproxy::routes::RouteTable::build(&config, client)?;
    let app = llproxy::routes::router(table);

    // Health probes live on their own server so they keep answering while the
    // main server drains.
    let ready = Arc::new(AtomicBool::new(true));
    let health_port = config.app.health_port;
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(err) = llproxy::health::serve(health_port, health_ready).await {
            error!(error = %err, "liveness server failed");
            std::process::exit(1);
        }
    });

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let shutdown_ready = ready.clone();
    let shutdown = async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        info!("received signal, draining requests and shutting down");
        shutdown_ready.store(false, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::select! {
                _ = async {
                    tokio::select! {
                        _ = sigint.recv() => {}
                        _ = sigterm.recv() => {}
                    }
                } => {
                    error!("second signal received, exiting immediately");
                    std::process::exit(1);
                }
                _ = tokio::time::sleep(DRAIN_GRACE) => {
                    warn!("drain grace period elapsed, exiting");
                    std::process::exit(0);
                }
            }
        });
    };

    let listener = TcpListener::bind(("0.0.0.0", config.app.port)).await?;
    info!(port = config.app.port, health_port, "llproxy listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("shutdown complete");
    Ok(())
}
