use crate::faults::FaultKind;
use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug, Clone)]
#[command(name = "panel-emulator", about = "Emulated solar panels speaking the MI protocol")]
pub struct Cli {
    /// Same TOML file the daq reads; only [gateway] ports and [emulator] are used.
    #[arg(long)] pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayPorts {
    pub comm_port: u16,
    pub ad_listen_port: u16,
    pub ad_respond_port: u16,
}

impl Default for GatewayPorts {
    fn default() -> Self {
        Self { comm_port: 59990, ad_listen_port: 59991, ad_respond_port: 59992 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub panel_delay: f64,
    pub cycle_delay: f64,
    /// Where MARCO goes. Use 127.0.0.1 when the daq runs on this host.
    pub discovery_target: String,
    pub panels: Vec<String>,
    pub faults: HashMap<String, FaultKind>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            panel_delay: 0.25,
            cycle_delay: 0.5,
            discovery_target: "255.255.255.255".into(),
            panels: (1..=4).map(|n| format!("fa:29:eb:6d:87:{n:02x}")).collect(),
            faults: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub gateway: GatewayPorts,
    pub emulator: EmulatorConfig,
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(p) = path {
            builder = builder.add_source(config::File::from(p).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("PANEL_EMULATOR")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        Ok(builder.build()?.try_deserialize()?)
    }
}
