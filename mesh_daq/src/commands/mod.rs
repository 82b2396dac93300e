//! Dispatch tables for decoded device commands and inbound control calls.
//!
//! Both tables are plain static data enumerated once when the process is
//! built; nothing registers itself at runtime.

pub mod control;
pub mod handler;

use mesh_protocol::CommandKind;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerId {
    DataReport,
    LinkReport,
}

impl HandlerId {
    pub const fn name(self) -> &'static str {
        match self {
            HandlerId::DataReport => "handle_data_report",
            HandlerId::LinkReport => "handle_link_report",
        }
    }
}

/// Which handlers accept which command kinds.
pub const COMMAND_HANDLERS: &[(HandlerId, &[CommandKind])] = &[
    (HandlerId::DataReport, &[CommandKind::DataIndication]),
    (HandlerId::LinkReport, &[CommandKind::LinkIndication]),
];

#[derive(Debug, Default)]
pub struct HandlerRegistry {
    by_kind: HashMap<CommandKind, Vec<HandlerId>>,
}

impl HandlerRegistry {
    pub fn build(table: &[(HandlerId, &[CommandKind])]) -> Self {
        let mut by_kind: HashMap<CommandKind, Vec<HandlerId>> = HashMap::new();
        for (id, kinds) in table {
            for kind in kinds.iter() {
                by_kind.entry(*kind).or_default().push(*id);
            }
        }
        Self { by_kind }
    }

    pub fn handlers_for(&self, kind: CommandKind) -> &[HandlerId] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_kind.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFn {
    GetLastData,
    RequestData,
    SetOperatingMode,
    GetStatus,
}

pub const CONTROL_FUNCTIONS: &[(&str, ControlFn)] = &[
    ("get_last_data", ControlFn::GetLastData),
    ("request_data", ControlFn::RequestData),
    ("set_operating_mode", ControlFn::SetOperatingMode),
    ("get_status", ControlFn::GetStatus),
];

#[derive(Debug, Default)]
pub struct ControlRegistry {
    by_name: HashMap<&'static str, ControlFn>,
}

impl ControlRegistry {
    pub fn build(table: &[(&'static str, ControlFn)]) -> Self {
        Self { by_name: table.iter().copied().collect() }
    }

    pub fn lookup(&self, func: &str) -> Option<ControlFn> {
        self.by_name.get(func).copied()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }
}

/// `{func, args}` control call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandRequest {
    pub func: String,
    #[serde(default)]
    pub args: Option<Map<String, Value>>,
}

impl CommandRequest {
    pub fn new(func: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(m) => Some(m),
            _ => None,
        };
        Self { func: func.into(), args }
    }
}

pub fn failure(msg: impl Into<String>) -> Value {
    json!({ "status": false, "msg": msg.into() })
}
