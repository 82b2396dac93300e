// Control calls: {func, args} -> result object. Failures never escape as errors.
use super::{CommandRequest, ControlFn, failure};
use crate::errors::DaqError;
use crate::process::DaqProcess;
use crate::telemetry::broker::Broker;
use crate::telemetry::record::TelemetryRecord;
use bytes::Bytes;
use mesh_protocol::{Address, Command, Message, MessageKind, SetOperatingMode};
use serde_json::{Map, Value, json};
use tracing::{error, info, warn};

type Args = Map<String, Value>;

fn arg_addr(args: &Args) -> Result<Address, DaqError> {
    let raw = args
        .get("macaddr")
        .and_then(Value::as_str)
        .ok_or_else(|| DaqError::Dispatch("macaddr is required".into()))?;
    Ok(raw.parse()?)
}

fn arg_u8(args: &Args, key: &str) -> Result<u8, DaqError> {
    args.get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u8::try_from(v).ok())
        .ok_or_else(|| DaqError::Dispatch(format!("{key} must be an integer 0-255")))
}

impl<B: Broker> DaqProcess<B> {
    pub fn dispatch_command_request(&mut self, request: &CommandRequest) -> Value {
        let Some(func) = self.controls.lookup(&request.func) else {
            warn!(func = %request.func, "unknown command");
            return failure("Unknown command");
        };

        let empty = Args::new();
        let args = request.args.as_ref().unwrap_or(&empty);
        let result = match func {
            ControlFn::GetLastData => self.get_last_data(args),
            ControlFn::RequestData => arg_addr(args).and_then(|addr| self.send_to_device(addr, Command::DataRequest)),
            ControlFn::SetOperatingMode => arg_addr(args).and_then(|addr| {
                let op_stat = arg_u8(args, "op_stat")?;
                self.send_to_device(addr, Command::SetOperatingMode(SetOperatingMode { op_stat }))
            }),
            ControlFn::GetStatus => Ok(self.get_status()),
        };

        result.unwrap_or_else(|e| {
            error!(func = %request.func, error = %e, "command failed");
            failure(format!("Error: {e}"))
        })
    }

    fn get_last_data(&self, args: &Args) -> Result<Value, DaqError> {
        let only = match args.get("macaddr") {
            None | Some(Value::Null) => None,
            Some(_) => Some(arg_addr(args)?.to_string()),
        };
        let mut records: Vec<TelemetryRecord> = self
            .last_device_data
            .iter()
            .filter(|e| only.as_ref().is_none_or(|m| &e.key().0 == m))
            .map(|e| e.value().clone())
            .collect();
        records.sort_by(|a, b| a.macaddr.cmp(&b.macaddr).then(a.dtype.cmp(&b.dtype)));
        Ok(json!({ "status": true, "data": records }))
    }

    fn send_to_device(&mut self, addr: Address, cmd: Command) -> Result<Value, DaqError> {
        let mut msg = Message::new(MessageKind::CommandRequest, addr);
        msg.request_id = self.next_request_id();
        let command = cmd.kind().name();
        msg.add_command(cmd);

        let payload = msg.encode()?;
        let receivers = self
            .outbound
            .send(Bytes::from(payload))
            .map_err(|_| DaqError::Dispatch("no device connection to send on".into()))?;
        info!(%addr, command, request_id = msg.request_id, receivers, "command sent");
        Ok(json!({ "status": true, "request_id": msg.request_id, "receivers": receivers }))
    }

    fn get_status(&self) -> Value {
        let mut stages = Map::new();
        stages.insert(self.encoder.name().into(), self.encoder.is_running().into());
        stages.insert(self.batcher.name().into(), self.batcher.is_running().into());
        stages.insert(self.pitcher.name().into(), self.pitcher.is_running().into());
        json!({
            "status": true,
            "state": self.state,
            "sunrise": self.sunrise.instant(),
            "stages": stages,
            "gateway": self.gateway.is_running(),
            "devices": self.last_device_data.len(),
            "links": self.link_status.len(),
        })
    }
}
