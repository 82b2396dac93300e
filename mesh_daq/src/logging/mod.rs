// tracing setup: compact console output, optional daily-rolling file
use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn filter() -> Result<EnvFilter> {
    Ok(EnvFilter::from_default_env()
        .add_directive("mesh_daq=info".parse()?)
        .add_directive("mesh_protocol=info".parse()?)
        .add_directive("tokio=warn".parse()?))
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered file output is lost.
pub fn init(cfg: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let console = fmt::layer().compact();

    let Some(dir) = &cfg.dir else {
        tracing_subscriber::registry()
            .with(filter()?)
            .with(console)
            .try_init()
            .context("installing tracing subscriber")?;
        return Ok(None);
    };

    std::fs::create_dir_all(dir).with_context(|| format!("creating log dir {}", dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "mesh-daq.log"));
    tracing_subscriber::registry()
        .with(filter()?)
        .with(console)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(Some(guard))
}
