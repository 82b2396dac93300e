//Command line interface
// runtime configuration: layered defaults -> TOML file -> MESH_DAQ__* env
use crate::errors::DaqError;
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "mesh-daq", about = "Mesh telemetry gateway and ingestion pipeline")]
pub struct Cli {
    /// Optional TOML file layered over the built-in defaults.
    #[arg(long)] pub config: Option<PathBuf>,
    #[arg(long, default_value = "/tmp/mesh-daq.lock")] pub lock_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub comm_host: String,
    pub comm_port: u16,
    pub ad_host: String,
    pub ad_listen_port: u16,
    pub ad_respond_port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            comm_host: "127.0.0.1".into(),
            comm_port: 59990,
            ad_host: "0.0.0.0".into(),
            ad_listen_port: 59991,
            ad_respond_port: 59992,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub external_publish_server: String,
    pub topic: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            external_publish_server: "nats://127.0.0.1:4222".into(),
            topic: "mesh.external".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub batch_on: u64,
    /// Seconds since the last flush before a non-empty batch is forced out.
    pub batch_at: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { batch_on: 4, batch_at: 0.5 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    pub throttle_delay: f64,
    pub backpressure_qsize: usize,
    pub publish_backoff: f64,
    /// Seconds between status log lines; 0 turns them off.
    pub status_interval: f64,
    pub compression: CompressionConfig,
}

impl Default for DaqConfig {
    fn default() -> Self {
        Self {
            throttle_delay: 0.01,
            backpressure_qsize: 256,
            publish_backoff: 1.0,
            status_interval: 60.0,
            compression: CompressionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// When set, a daily-rolling log file is written here as well.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub gateway: GatewayConfig,
    pub nats: NatsConfig,
    pub daq: DaqConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self, DaqError> {
        let mut builder = config::Config::builder();
        if let Some(p) = path {
            builder = builder.add_source(config::File::from(p).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MESH_DAQ")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), DaqError> {
        let secs = [
            ("daq.throttle_delay", self.daq.throttle_delay),
            ("daq.publish_backoff", self.daq.publish_backoff),
            ("daq.status_interval", self.daq.status_interval),
            ("daq.compression.batch_at", self.daq.compression.batch_at),
        ];
        for (key, v) in secs {
            if Duration::try_from_secs_f64(v).is_err() {
                return Err(DaqError::InvalidConfig(format!("{key} must be a non-negative number of seconds, got {v}")));
            }
        }
        if self.daq.backpressure_qsize == 0 {
            return Err(DaqError::InvalidConfig("daq.backpressure_qsize must be at least 1".into()));
        }
        if self.daq.compression.batch_on == 0 {
            return Err(DaqError::InvalidConfig("daq.compression.batch_on must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_a_file() {
        let s = Settings::load(None).unwrap();
        assert_eq!(s.gateway.comm_port, 59990);
        assert_eq!(s.daq.backpressure_qsize, 256);
        assert_eq!(s.daq.compression.batch_on, 4);
        assert_eq!(s.nats.topic, "mesh.external");
    }

    #[test]
    fn file_overrides_only_what_it_names() {
        let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(f, "[gateway]\ncomm_port = 6000\n\n[daq.compression]\nbatch_on = 10").unwrap();
        let s = Settings::load(Some(f.path())).unwrap();
        assert_eq!(s.gateway.comm_port, 6000);
        assert_eq!(s.gateway.ad_listen_port, 59991);
        assert_eq!(s.daq.compression.batch_on, 10);
        assert_eq!(s.daq.compression.batch_at, 0.5);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Settings::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn rejects_negative_delays() {
        let mut s = Settings::default();
        s.daq.throttle_delay = -1.0;
        assert!(matches!(s.validate(), Err(DaqError::InvalidConfig(_))));

        let mut s = Settings::default();
        s.daq.status_interval = f64::NAN;
        assert!(matches!(s.validate(), Err(DaqError::InvalidConfig(_))));
    }
}
