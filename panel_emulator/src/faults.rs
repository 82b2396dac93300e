// src/faults.rs
use mesh_protocol::Address;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    ShortCircuit,
    OpenCircuit,
    LowVoltage,
    DeadPanel,
    Normal,
    /// Pick one of the concrete faults for every sample.
    Random,
}

impl FaultKind {
    pub const CONCRETE: [FaultKind; 5] = [
        FaultKind::ShortCircuit,
        FaultKind::OpenCircuit,
        FaultKind::LowVoltage,
        FaultKind::DeadPanel,
        FaultKind::Normal,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Profile {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub status: FaultKind,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Per-panel fault assignment. Keys are normalised, so `FA:29:...` and
/// `fa29...` name the same panel.
#[derive(Debug, Clone, Default)]
pub struct FaultMap(HashMap<Address, FaultKind>);

impl FaultMap {
    pub fn from_config(raw: &HashMap<String, FaultKind>) -> anyhow::Result<Self> {
        let mut map = HashMap::new();
        for (mac, kind) in raw {
            map.insert(mac.parse::<Address>()?, *kind);
        }
        Ok(Self(map))
    }

    pub fn get(&self, addr: &Address) -> FaultKind {
        self.0.get(addr).copied().unwrap_or(FaultKind::Normal)
    }
}

pub fn generate_profile<R: Rng + ?Sized>(rng: &mut R, kind: FaultKind) -> Profile {
    let status = match kind {
        FaultKind::Random => FaultKind::CONCRETE[rng.random_range(0..FaultKind::CONCRETE.len())],
        k => k,
    };

    let (v, i) = match status {
        FaultKind::ShortCircuit => (0.0, rng.random_range(91.0..100.0)),
        FaultKind::OpenCircuit => (rng.random_range(96.0..100.0), 0.0),
        FaultKind::LowVoltage => (rng.random_range(18.0..24.0), rng.random_range(6.0..7.5)),
        FaultKind::DeadPanel => (0.0, 0.0),
        FaultKind::Normal | FaultKind::Random => (rng.random_range(38.0..40.0), rng.random_range(7.0..8.0)),
    };

    Profile {
        voltage: round2(v),
        current: round2(i),
        power: round2(v * i),
        status,
    }
}
