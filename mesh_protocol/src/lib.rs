// lib.rs — MI mesh protocol: message envelope, embedded commands, sunrise clock

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

// =============================== Common =====================================

pub type Timestamp = DateTime<Utc>;

/// Normalized view of one command: named fields consumed by handlers.
pub type Response = Map<String, Value>;

pub const FRAME_MARKER: [u8; 2] = *b"MI";
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;
pub const HEADER_LEN: usize = 11; // addr(6) + request_id(2) + hopcount + queue_len + dtype
pub const MAX_DEVICE_SECONDS: u16 = 0xFFFE;

pub const DEVICE_TYPE_PLM: u8 = 0x01;

pub const DISCOVERY_REQUEST: &[u8] = b"MARCO";
pub const DISCOVERY_RESPONSE: &[u8] = b"POLO";

// =============================== Errors =====================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("framing: declared {declared} bytes, got {actual}")]
    Framing { declared: usize, actual: usize },
    #[error("decode: {0}")]
    Decode(String),
    #[error("address: {0}")]
    Address(String),
    #[error("encode: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

// =============================== Address ====================================

/// 6-byte device identifier, rendered as 12 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 6]);

impl Address {
    pub const LEN: usize = 6;

    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    fn from_slice(b: &[u8]) -> Result<Self> {
        let arr: [u8; 6] = b
            .try_into()
            .map_err(|_| ProtocolError::Address(format!("need 6 bytes, got {}", b.len())))?;
        Ok(Self(arr))
    }
}

impl FromStr for Address {
    type Err = ProtocolError;

    /// Accepts `fa29eb6d8701` as well as `fa:29:eb:6d:87:01` / `fa-29-...`, any case.
    fn from_str(s: &str) -> Result<Self> {
        let clean: String = s
            .trim()
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();
        if clean.len() != 2 * Self::LEN {
            return Err(ProtocolError::Address(format!("{s:?} is not 6 bytes")));
        }
        let mut out = [0u8; 6];
        hex::decode_to_slice(&clean, &mut out)
            .map_err(|e| ProtocolError::Address(format!("{s:?}: {e}")))?;
        Ok(Self(out))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================== Enums ======================================

/// What a frame on the inbound queue carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Telemetry/report frame received from the mesh.
    MeshIndication,
    /// Inbound RPC: `{func, args}` object instead of a binary message.
    CommandRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    DataIndication,
    LinkIndication,
    DataRequest,
    SetOperatingMode,
}

impl CommandKind {
    pub const ALL: [CommandKind; 4] = [
        CommandKind::DataIndication,
        CommandKind::LinkIndication,
        CommandKind::DataRequest,
        CommandKind::SetOperatingMode,
    ];

    pub const fn id(self) -> u8 {
        match self {
            CommandKind::DataIndication => 0x10,
            CommandKind::LinkIndication => 0x11,
            CommandKind::DataRequest => 0x20,
            CommandKind::SetOperatingMode => 0x21,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.id() == id)
    }

    pub const fn name(self) -> &'static str {
        match self {
            CommandKind::DataIndication => "data_indication",
            CommandKind::LinkIndication => "link_indication",
            CommandKind::DataRequest => "data_request",
            CommandKind::SetOperatingMode => "set_operating_mode",
        }
    }
}

// =============================== Commands ===================================

/// Registration / operating status bytes reported by a panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelStatus {
    pub reg_stat: u8,
    pub op_stat: u8,
}

/// One reading. Voltages and currents travel as hundredths in a u16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSample {
    /// Seconds since the sunrise reference.
    pub timestamp: u16,
    pub vi: u16,
    pub vo: u16,
    pub ii: u16,
    pub io: u16,
}

fn to_centi(v: f64) -> u16 {
    (v * 100.0).round().clamp(0.0, u16::MAX as f64) as u16
}

fn from_centi(v: u16) -> f64 {
    v as f64 / 100.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

impl DataSample {
    pub const LEN: usize = 10;

    pub fn from_readings(timestamp: u16, vi: f64, vo: f64, ii: f64, io: f64) -> Self {
        Self {
            timestamp,
            vi: to_centi(vi),
            vo: to_centi(vo),
            ii: to_centi(ii),
            io: to_centi(io),
        }
    }

    pub fn input_voltage(&self) -> f64 {
        from_centi(self.vi)
    }
    pub fn output_voltage(&self) -> f64 {
        from_centi(self.vo)
    }
    pub fn input_current(&self) -> f64 {
        from_centi(self.ii)
    }
    pub fn output_current(&self) -> f64 {
        from_centi(self.io)
    }
    pub fn input_power(&self) -> f64 {
        round2(self.input_voltage() * self.input_current())
    }
    pub fn output_power(&self) -> f64 {
        round2(self.output_voltage() * self.output_current())
    }

    fn decode(b: &[u8]) -> Self {
        let w = |i: usize| u16::from_be_bytes([b[i], b[i + 1]]);
        Self {
            timestamp: w(0),
            vi: w(2),
            vo: w(4),
            ii: w(6),
            io: w(8),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        for w in [self.timestamp, self.vi, self.vo, self.ii, self.io] {
            out.extend_from_slice(&w.to_be_bytes());
        }
    }
}

/// Periodic panel report.
/// body: flags(bit0 = status present) [reg_stat op_stat] sample*
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataIndication {
    pub status: Option<PanelStatus>,
    pub samples: Vec<DataSample>,
}

impl DataIndication {
    const FLAG_STATUS: u8 = 0x01;

    pub fn with_status(reg_stat: u8, op_stat: u8) -> Self {
        Self {
            status: Some(PanelStatus { reg_stat, op_stat }),
            samples: Vec::new(),
        }
    }

    pub fn add_data(&mut self, timestamp: u16, vi: f64, vo: f64, ii: f64, io: f64) {
        self.samples
            .push(DataSample::from_readings(timestamp, vi, vo, ii, io));
    }

    fn decode(body: &[u8]) -> Result<Self> {
        let (&flags, mut rest) = body
            .split_first()
            .ok_or_else(|| ProtocolError::Decode("data indication: empty body".into()))?;

        let status = if flags & Self::FLAG_STATUS != 0 {
            if rest.len() < 2 {
                return Err(ProtocolError::Decode("data indication: truncated status".into()));
            }
            let st = PanelStatus {
                reg_stat: rest[0],
                op_stat: rest[1],
            };
            rest = &rest[2..];
            Some(st)
        } else {
            None
        };

        if rest.is_empty() || rest.len() % DataSample::LEN != 0 {
            return Err(ProtocolError::Decode(format!(
                "data indication: {} sample bytes is not a positive multiple of {}",
                rest.len(),
                DataSample::LEN
            )));
        }

        let samples = rest.chunks_exact(DataSample::LEN).map(DataSample::decode).collect();
        Ok(Self { status, samples })
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        if self.samples.is_empty() {
            return Err(ProtocolError::Encode("data indication without samples".into()));
        }
        match self.status {
            Some(st) => out.extend_from_slice(&[Self::FLAG_STATUS, st.reg_stat, st.op_stat]),
            None => out.push(0),
        }
        for s in &self.samples {
            s.encode(out);
        }
        Ok(())
    }
}

/// Mesh link quality towards the device's parent node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkIndication {
    pub parent: Address,
    pub rssi: i8,
}

impl LinkIndication {
    const LEN: usize = Address::LEN + 1;

    fn decode(body: &[u8]) -> Result<Self> {
        if body.len() != Self::LEN {
            return Err(ProtocolError::Decode(format!(
                "link indication: expected {} bytes, got {}",
                Self::LEN,
                body.len()
            )));
        }
        Ok(Self {
            parent: Address::from_slice(&body[..Address::LEN])?,
            rssi: body[Address::LEN] as i8,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.parent.as_bytes());
        out.push(self.rssi as u8);
    }
}

/// Gateway → device: change the operating state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetOperatingMode {
    pub op_stat: u8,
}

/// One protocol operation embedded in a [`Message`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    DataIndication(DataIndication),
    LinkIndication(LinkIndication),
    /// Gateway → device: report now.
    DataRequest,
    SetOperatingMode(SetOperatingMode),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::DataIndication(_) => CommandKind::DataIndication,
            Command::LinkIndication(_) => CommandKind::LinkIndication,
            Command::DataRequest => CommandKind::DataRequest,
            Command::SetOperatingMode(_) => CommandKind::SetOperatingMode,
        }
    }

    pub fn decode(kind: CommandKind, body: &[u8]) -> Result<Self> {
        match kind {
            CommandKind::DataIndication => DataIndication::decode(body).map(Command::DataIndication),
            CommandKind::LinkIndication => LinkIndication::decode(body).map(Command::LinkIndication),
            CommandKind::DataRequest if body.is_empty() => Ok(Command::DataRequest),
            CommandKind::DataRequest => Err(ProtocolError::Decode(format!(
                "data request: unexpected {} byte body",
                body.len()
            ))),
            CommandKind::SetOperatingMode => match body {
                [op_stat] => Ok(Command::SetOperatingMode(SetOperatingMode { op_stat: *op_stat })),
                _ => Err(ProtocolError::Decode(format!(
                    "set operating mode: expected 1 byte, got {}",
                    body.len()
                ))),
            },
        }
    }

    pub fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Command::DataIndication(d) => d.encode(out)?,
            Command::LinkIndication(l) => l.encode(out),
            Command::DataRequest => {}
            Command::SetOperatingMode(m) => out.push(m.op_stat),
        }
        Ok(())
    }

    /// Named fields for this command in the context of its message.
    pub fn response(&self, msg: &Message) -> Response {
        let mut r = Response::new();
        r.insert("command".into(), self.kind().name().into());
        r.insert("type".into(), msg.dtype.into());
        r.insert("macaddr".into(), msg.addr.to_string().into());
        r.insert("request_id".into(), msg.request_id.into());
        r.insert("hopcount".into(), msg.source_hopcount.into());
        r.insert("queue_length".into(), msg.source_queue_length.into());

        match self {
            Command::DataIndication(d) => {
                if let Some(st) = d.status {
                    r.insert("reg_stat".into(), st.reg_stat.into());
                    r.insert("op_stat".into(), st.op_stat.into());
                }
                let data = d
                    .samples
                    .iter()
                    .map(|s| {
                        json!({
                            "timestamp": s.timestamp,
                            "Vi": s.input_voltage(),
                            "Vo": s.output_voltage(),
                            "Ii": s.input_current(),
                            "Io": s.output_current(),
                            "Pi": s.input_power(),
                            "Po": s.output_power(),
                        })
                    })
                    .collect();
                r.insert("data".into(), Value::Array(data));
            }
            Command::LinkIndication(l) => {
                r.insert("parent".into(), l.parent.to_string().into());
                r.insert("rssi".into(), l.rssi.into());
            }
            Command::DataRequest => {}
            Command::SetOperatingMode(m) => {
                r.insert("op_stat".into(), m.op_stat.into());
            }
        }
        r
    }
}

// =============================== Message ====================================

/// Decoded MI frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub addr: Address,
    pub request_id: u16,
    pub source_hopcount: u8,
    pub source_queue_length: u8,
    pub dtype: u8,
    pub commands: Vec<Command>,
    /// Wall-clock instant the frame was read off the wire.
    pub received_at: Timestamp,
}

impl Message {
    pub fn new(kind: MessageKind, addr: Address) -> Self {
        Self {
            kind,
            addr,
            request_id: 0,
            source_hopcount: 0,
            source_queue_length: 0,
            dtype: DEVICE_TYPE_PLM,
            commands: Vec::new(),
            received_at: Utc::now(),
        }
    }

    pub fn set_addr(&mut self, addr: &str) -> Result<()> {
        self.addr = addr.parse()?;
        Ok(())
    }

    pub fn add_command(&mut self, cmd: Command) {
        self.commands.push(cmd);
    }

    /// Decode one frame payload.
    ///
    /// A length mismatch is a framing error. Unknown command ids and bodies that
    /// fail to parse inside their own bounds are skipped with a warning; a
    /// command header that runs past the payload makes the frame undecodable.
    pub fn decode(
        kind: MessageKind,
        declared_length: u8,
        raw: &[u8],
        received_at: Timestamp,
    ) -> Result<Self> {
        if raw.len() != declared_length as usize {
            return Err(ProtocolError::Framing {
                declared: declared_length as usize,
                actual: raw.len(),
            });
        }
        if raw.len() < HEADER_LEN {
            return Err(ProtocolError::Decode(format!(
                "payload of {} bytes is shorter than the {HEADER_LEN} byte header",
                raw.len()
            )));
        }

        let addr = Address::from_slice(&raw[..Address::LEN])?;
        let mut msg = Self {
            kind,
            addr,
            request_id: u16::from_be_bytes([raw[6], raw[7]]),
            source_hopcount: raw[8],
            source_queue_length: raw[9],
            dtype: raw[10],
            commands: Vec::new(),
            received_at,
        };

        let mut rest = &raw[HEADER_LEN..];
        while !rest.is_empty() {
            let offset = raw.len() - rest.len();
            let [id, len, ..] = *rest else {
                return Err(ProtocolError::Decode(format!(
                    "truncated command header at offset {offset}"
                )));
            };
            let len = len as usize;
            if rest.len() < 2 + len {
                return Err(ProtocolError::Decode(format!(
                    "command 0x{id:02x} at offset {offset} overruns payload ({len} byte body)"
                )));
            }
            let body = &rest[2..2 + len];
            rest = &rest[2 + len..];

            let Some(cmd_kind) = CommandKind::from_id(id) else {
                warn!(id = format_args!("0x{id:02x}"), len, addr = %addr, "skipping unknown command");
                continue;
            };
            match Command::decode(cmd_kind, body) {
                Ok(cmd) => msg.commands.push(cmd),
                Err(e) => warn!(kind = cmd_kind.name(), addr = %addr, error = %e, "skipping malformed command"),
            }
        }

        Ok(msg)
    }

    /// Payload bytes (without marker/length) for this message.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_LEN + 16 * self.commands.len());
        out.extend_from_slice(self.addr.as_bytes());
        out.extend_from_slice(&self.request_id.to_be_bytes());
        out.extend_from_slice(&[self.source_hopcount, self.source_queue_length, self.dtype]);

        let mut body = Vec::new();
        for cmd in &self.commands {
            body.clear();
            cmd.encode_body(&mut body)?;
            let len = u8::try_from(body.len()).map_err(|_| {
                ProtocolError::Encode(format!(
                    "{} body of {} bytes exceeds 255",
                    cmd.kind().name(),
                    body.len()
                ))
            })?;
            out.push(cmd.kind().id());
            out.push(len);
            out.extend_from_slice(&body);
        }

        if out.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::Encode(format!(
                "payload of {} bytes exceeds {MAX_PAYLOAD_LEN}",
                out.len()
            )));
        }
        Ok(out)
    }

    /// Full wire frame: marker + length + payload.
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let payload = self.encode()?;
        let mut framed = Vec::with_capacity(3 + payload.len());
        framed.extend_from_slice(&FRAME_MARKER);
        framed.push(payload.len() as u8);
        framed.extend_from_slice(&payload);
        Ok(framed)
    }
}

// ============================ Sunrise reference =============================

/// Wall-clock origin for device-relative timestamps: 06:00 UTC on a given day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sunrise(Timestamp);

impl Sunrise {
    const SECONDS_AFTER_MIDNIGHT: i64 = 6 * 3600;

    pub fn today() -> Self {
        Self::on(Utc::now())
    }

    pub fn on(now: Timestamp) -> Self {
        let midnight = now.date_naive().and_time(NaiveTime::MIN);
        Self((midnight + Duration::seconds(Self::SECONDS_AFTER_MIDNIGHT)).and_utc())
    }

    pub fn instant(&self) -> Timestamp {
        self.0
    }

    pub fn from_seconds_since_sunrise(&self, seconds: u16) -> Timestamp {
        self.0 + Duration::seconds(seconds as i64)
    }

    /// Clamped to `0..=0xFFFE`.
    pub fn to_seconds_since_sunrise(&self, t: Timestamp) -> u16 {
        (t - self.0)
            .num_seconds()
            .clamp(0, MAX_DEVICE_SECONDS as i64) as u16
    }
}

// ================================ Tests =====================================
