//! trickled: selective domain-based egress routing daemon
//!
//! Takes no flags. Reads its config from a fixed path, writes a PID file
//! and serves the control API over HTTP and a Unix socket.
//!
//! Signals: SIGTERM/SIGINT stop the daemon gracefully (exit code 0),
//! SIGHUP reloads the config file.

use std::sync::Arc;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};

use trickle_router::{api, logging, paths, App};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "fatal error");
        eprintln!("trickled: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let app = App::new();

    // Logging comes up at defaults first so config load failures are
    // visible, then the imported level is re-applied.
    let log_handle = logging::init(&app.settings().log_level);
    app.set_log_handle(log_handle);
    app.load_config().await?;

    info!(version = trickle_router::VERSION, "starting trickled");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    spawn_signal_handler(Arc::clone(&app), shutdown_tx.clone())?;

    // Control surfaces run for the whole process lifetime
    let settings = app.settings();
    tokio::spawn(serve_and_report(api::serve_unix(
        Arc::clone(&app),
        paths::CONTROL_SOCKET.to_string(),
        shutdown_rx.clone(),
    )));
    if settings.http_web.enabled {
        let addr = format!(
            "{}:{}",
            settings.http_web.host.address, settings.http_web.host.port
        );
        tokio::spawn(serve_and_report(api::serve_http(
            Arc::clone(&app),
            addr,
            shutdown_rx.clone(),
        )));
    }

    app.start(shutdown_rx).await?;
    info!("stopped");
    Ok(())
}

async fn serve_and_report(serve: impl std::future::Future<Output = Result<(), trickle_router::AppError>>) {
    if let Err(e) = serve.await {
        error!(error = %e, "api server failed");
    }
}

/// SIGTERM/SIGINT trigger shutdown; SIGHUP reloads the config
fn spawn_signal_handler(app: Arc<App>, shutdown_tx: watch::Sender<bool>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                    let _ = shutdown_tx.send(true);
                }
                _ = sigint.recv() => {
                    info!("received SIGINT");
                    let _ = shutdown_tx.send(true);
                }
                _ = sighup.recv() => {
                    info!("received SIGHUP, reloading config");
                    app.reload_config().await;
                }
            }
        }
    });
    Ok(())
}
