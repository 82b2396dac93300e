// src/main.rs
mod commands;
mod config;
mod errors;
mod lock;
mod logging;
mod net;
mod process;
mod telemetry;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{Cli, Settings};
use crate::lock::SingletonLock;
use crate::process::{DaqClient, DaqProcess};
use crate::telemetry::broker::NatsBroker;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let term = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received"),
        _ = term => info!("SIGTERM received"),
    }
}

/// Log `get_status` through the run loop every `every` until cancelled.
async fn report_status(client: DaqClient, every: Duration, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(every);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => match client.call("get_status", Value::Null).await {
                Ok(status) => info!(%status, "status"),
                Err(e) => debug!(error = %e, "status unavailable"),
            },
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // -------- config + logging ----------
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;
    let _log_guard = logging::init(&settings.logging)?;

    // -------- single instance ----------
    let _lock = SingletonLock::acquire(&cli.lock_file)?;
    info!(pid = std::process::id(), ?settings, "mesh-daq starting");

    // -------- process ----------
    let broker = NatsBroker::new(settings.nats.external_publish_server.clone());
    let mut daq = DaqProcess::new(&settings, broker);
    let readings = daq.last_device_data();

    let cancel = CancellationToken::new();
    if settings.daq.status_interval > 0.0 {
        let every = Duration::from_secs_f64(settings.daq.status_interval);
        tokio::spawn(report_status(daq.client(), every, cancel.clone()));
    }
    let mut run = tokio::spawn({
        let cancel = cancel.clone();
        async move { daq.run(cancel).await }
    });

    let outcome = tokio::select! {
        res = &mut run => res,
        _ = shutdown_signal() => {
            cancel.cancel();
            run.await
        }
    };

    match outcome {
        Ok(Ok(())) => info!(devices = readings.len(), "mesh-daq stopped"),
        Ok(Err(e)) => return Err(e).context("daq process failed"),
        Err(e) => bail!("daq task aborted: {e}"),
    }
    Ok(())
}
