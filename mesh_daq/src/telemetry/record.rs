use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One reading as it enters the pipeline. Field names are what external
/// consumers of the published batches see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    #[serde(rename = "type")]
    pub dtype: u8,
    pub macaddr: String,
    /// Device timestamp resolved against the sunrise reference.
    pub freezetime: DateTime<Utc>,
    pub localtime: DateTime<Utc>,
    pub reg_stat: u8,
    pub op_stat: u8,
    #[serde(rename = "Vi")] pub vi: f64,
    #[serde(rename = "Vo")] pub vo: f64,
    #[serde(rename = "Ii")] pub ii: f64,
    #[serde(rename = "Io")] pub io: f64,
    #[serde(rename = "Pi")] pub pi: f64,
    #[serde(rename = "Po")] pub po: f64,
}

/// Last-known-reading key.
pub type DeviceKey = (String, u8);

impl TelemetryRecord {
    pub fn key(&self) -> DeviceKey {
        (self.macaddr.clone(), self.dtype)
    }
}

/// Link-quality report, kept per device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub parent: String,
    pub rssi: i8,
    pub hopcount: u8,
    pub updated: DateTime<Utc>,
}
