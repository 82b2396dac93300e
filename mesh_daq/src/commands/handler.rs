use super::{CommandRequest, HandlerId};
use crate::errors::DaqError;
use crate::net::{GatewayFrame, Inbound};
use crate::process::DaqProcess;
use crate::telemetry::broker::Broker;
use crate::telemetry::record::{LinkStatus, TelemetryRecord};
use chrono::Utc;
use mesh_protocol::{Command, Message, MessageKind, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// One element of a data report's `data` array.
#[derive(Debug, Deserialize)]
struct ReportedSample {
    timestamp: u16,
    #[serde(rename = "Vi")] vi: f64,
    #[serde(rename = "Vo")] vo: f64,
    #[serde(rename = "Ii")] ii: f64,
    #[serde(rename = "Io")] io: f64,
    #[serde(rename = "Pi")] pi: f64,
    #[serde(rename = "Po")] po: f64,
}

fn field<'a>(response: &'a Response, key: &str) -> Result<&'a Value, DaqError> {
    response
        .get(key)
        .ok_or_else(|| DaqError::Dispatch(format!("response is missing {key}")))
}

fn small_uint(response: &Response, key: &str) -> Result<u8, DaqError> {
    field(response, key)?
        .as_u64()
        .and_then(|v| u8::try_from(v).ok())
        .ok_or_else(|| DaqError::Dispatch(format!("{key} is not a byte")))
}

fn text<'a>(response: &'a Response, key: &str) -> Result<&'a str, DaqError> {
    field(response, key)?
        .as_str()
        .ok_or_else(|| DaqError::Dispatch(format!("{key} is not a string")))
}

impl<B: Broker> DaqProcess<B> {
    pub async fn process_gateway_indication(&mut self, item: Inbound) {
        match item {
            Inbound::Structured(value) => {
                if self.encode_tx.send(value).await.is_err() {
                    warn!("encode queue closed, dropping record");
                }
            }
            Inbound::Request { request, reply } => {
                let result = self.dispatch_command_request(&request);
                if reply.send(result).is_err() {
                    debug!(func = %request.func, "caller went away before the reply");
                }
            }
            Inbound::Frame(frame) => self.process_frame(frame).await,
        }
    }

    async fn process_frame(&mut self, frame: GatewayFrame) {
        if frame.raw.len() != frame.length as usize {
            warn!(
                source = %frame.source,
                declared = frame.length,
                actual = frame.raw.len(),
                "dropping frame with mismatched length"
            );
            return;
        }

        match frame.kind {
            MessageKind::MeshIndication => {
                let msg = match Message::decode(frame.kind, frame.length, &frame.raw, frame.received_at) {
                    Ok(m) => m,
                    Err(e) => {
                        error!(source = %frame.source, error = %e, "unable to parse mesh indication");
                        return;
                    }
                };
                for cmd in &msg.commands {
                    self.command_response(cmd, &msg).await;
                }
            }
            MessageKind::CommandRequest => match serde_json::from_slice::<CommandRequest>(&frame.raw) {
                Ok(request) => {
                    let result = self.dispatch_command_request(&request);
                    info!(source = %frame.source, func = %request.func, %result, "command request handled");
                }
                Err(e) => warn!(source = %frame.source, error = %e, "malformed command request"),
            },
        }
    }

    /// Build the response for one command and run it through its handlers.
    pub async fn command_response(&mut self, cmd: &Command, msg: &Message) -> bool {
        let response = cmd.response(msg);
        self.dispatch_command_handlers(cmd, &response).await
    }

    /// AND of every matching handler's result. No handlers means true; a
    /// handler error counts as false.
    pub async fn dispatch_command_handlers(&mut self, cmd: &Command, response: &Response) -> bool {
        let ids = self.handlers.handlers_for(cmd.kind()).to_vec();
        if ids.is_empty() {
            debug!(command = cmd.kind().name(), "no handler for command");
        }

        let mut pass = true;
        for id in ids {
            let ok = match id {
                HandlerId::DataReport => self.handle_data_report(response).await,
                HandlerId::LinkReport => self.handle_link_report(response),
            };
            match ok {
                Ok(true) => {}
                Ok(false) => {
                    debug!(handler = id.name(), "handler declined");
                    pass = false;
                }
                Err(e) => {
                    error!(handler = id.name(), error = %e, "handler failed");
                    pass = false;
                }
            }
        }
        pass
    }

    /// Flatten a data report into one record per sample and feed the pipeline.
    /// Reports without `reg_stat`/`op_stat` are declined.
    pub async fn handle_data_report(&mut self, response: &Response) -> Result<bool, DaqError> {
        if !response.contains_key("reg_stat") || !response.contains_key("op_stat") {
            return Ok(false);
        }
        let reg_stat = small_uint(response, "reg_stat")?;
        let op_stat = small_uint(response, "op_stat")?;
        let dtype = small_uint(response, "type")?;
        let macaddr = text(response, "macaddr")?.to_string();
        let samples: Vec<ReportedSample> = serde_json::from_value(field(response, "data")?.clone())?;

        for s in samples {
            let record = TelemetryRecord {
                dtype,
                macaddr: macaddr.clone(),
                freezetime: self.sunrise.from_seconds_since_sunrise(s.timestamp),
                localtime: Utc::now(),
                reg_stat,
                op_stat,
                vi: s.vi,
                vo: s.vo,
                ii: s.ii,
                io: s.io,
                pi: s.pi,
                po: s.po,
            };
            let payload = serde_json::to_value(&record)?;
            self.encode_tx
                .send(payload)
                .await
                .map_err(|_| DaqError::Dispatch("encode queue closed".into()))?;
            self.last_device_data.insert(record.key(), record);
        }
        Ok(true)
    }

    pub fn handle_link_report(&mut self, response: &Response) -> Result<bool, DaqError> {
        let macaddr = text(response, "macaddr")?.to_string();
        let rssi = field(response, "rssi")?
            .as_i64()
            .and_then(|v| i8::try_from(v).ok())
            .ok_or_else(|| DaqError::Dispatch("rssi is not a signed byte".into()))?;
        let status = LinkStatus {
            parent: text(response, "parent")?.to_string(),
            rssi,
            hopcount: small_uint(response, "hopcount")?,
            updated: Utc::now(),
        };
        debug!(%macaddr, parent = %status.parent, rssi, "link report");
        self.link_status.insert(macaddr, status);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::telemetry::broker::MockBroker;
    use bytes::Bytes;
    use mesh_protocol::{Address, DataIndication, LinkIndication};
    use tokio::sync::oneshot;

    fn daq() -> DaqProcess<MockBroker> {
        DaqProcess::new(&Settings::default(), MockBroker::new())
    }

    fn queued(daq: &DaqProcess<MockBroker>) -> usize {
        daq.encode_tx.max_capacity() - daq.encode_tx.capacity()
    }

    fn addr() -> Address {
        Address::new([0xfa, 0x29, 0xeb, 0x6d, 0x87, 0x01])
    }

    fn frame_of(msg: &Message) -> GatewayFrame {
        let raw = msg.encode().unwrap();
        GatewayFrame {
            source: "test".into(),
            kind: MessageKind::MeshIndication,
            length: raw.len() as u8,
            raw: Bytes::from(raw),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn data_report_without_status_is_declined() {
        let mut d = daq();
        let mut msg = Message::new(MessageKind::MeshIndication, addr());
        let mut di = DataIndication::default();
        di.add_data(10, 40.0, 40.0, 8.0, 8.0);
        let cmd = Command::DataIndication(di);
        msg.add_command(cmd.clone());

        assert!(!d.command_response(&cmd, &msg).await);
        assert_eq!(queued(&d), 0);
        assert!(d.last_device_data.is_empty());
    }

    #[tokio::test]
    async fn data_report_feeds_one_record_per_sample() {
        let mut d = daq();
        let mut msg = Message::new(MessageKind::MeshIndication, addr());
        let mut di = DataIndication::with_status(1, 2);
        di.add_data(10, 40.0, 38.5, 8.0, 8.2);
        di.add_data(11, 40.0, 38.5, 8.0, 8.2);
        msg.add_command(Command::DataIndication(di));

        d.process_gateway_indication(Inbound::Frame(frame_of(&msg))).await;
        assert_eq!(queued(&d), 2);

        let rec = d.last_device_data.get(&("fa29eb6d8701".to_string(), 1)).unwrap().clone();
        assert_eq!(rec.pi, 320.0);
        assert_eq!(rec.op_stat, 2);
        assert_eq!(rec.freezetime, d.sunrise.from_seconds_since_sunrise(11));
    }

    #[tokio::test]
    async fn mismatched_length_is_dropped() {
        let mut d = daq();
        let mut msg = Message::new(MessageKind::MeshIndication, addr());
        let mut di = DataIndication::with_status(1, 1);
        di.add_data(10, 40.0, 40.0, 8.0, 8.0);
        msg.add_command(Command::DataIndication(di));
        let mut frame = frame_of(&msg);
        frame.length -= 1;

        d.process_gateway_indication(Inbound::Frame(frame)).await;
        assert_eq!(queued(&d), 0);
    }

    #[tokio::test]
    async fn link_report_is_tracked() {
        let mut d = daq();
        let mut msg = Message::new(MessageKind::MeshIndication, addr());
        msg.source_hopcount = 3;
        msg.add_command(Command::LinkIndication(LinkIndication { parent: Address::new([0xfa, 0x29, 0xeb, 0x6d, 0x87, 0x00]), rssi: -71 }));

        d.process_gateway_indication(Inbound::Frame(frame_of(&msg))).await;
        let link = d.link_status.get("fa29eb6d8701").unwrap().clone();
        assert_eq!(link.rssi, -71);
        assert_eq!(link.hopcount, 3);
        assert_eq!(link.parent, "fa29eb6d8700");
    }

    #[tokio::test]
    async fn command_without_handler_passes() {
        let mut d = daq();
        let msg = Message::new(MessageKind::MeshIndication, addr());
        assert!(d.command_response(&Command::DataRequest, &msg).await);
    }

    #[tokio::test]
    async fn structured_records_go_straight_to_encode() {
        let mut d = daq();
        d.process_gateway_indication(Inbound::Structured(serde_json::json!({"k": 1}))).await;
        assert_eq!(queued(&d), 1);
    }

    #[tokio::test]
    async fn command_request_frame_is_dispatched() {
        let mut d = daq();
        let raw = br#"{"func": "no_such_thing", "args": {}}"#.to_vec();
        let frame = GatewayFrame {
            source: "test".into(),
            kind: MessageKind::CommandRequest,
            length: raw.len() as u8,
            raw: Bytes::from(raw),
            received_at: Utc::now(),
        };
        // logged, never panics, never touches the pipeline
        d.process_gateway_indication(Inbound::Frame(frame)).await;
        assert_eq!(queued(&d), 0);

        let (reply, rx) = oneshot::channel();
        let request = CommandRequest::new("no_such_thing", serde_json::json!({}));
        d.process_gateway_indication(Inbound::Request { request, reply }).await;
        let result = rx.await.unwrap();
        assert_eq!(result["status"], false);
        assert_eq!(result["msg"], "Unknown command");
    }

    #[tokio::test]
    async fn failing_handler_counts_as_false() {
        let mut d = daq();
        let mut msg = Message::new(MessageKind::MeshIndication, addr());
        let mut di = DataIndication::with_status(1, 1);
        di.add_data(10, 40.0, 40.0, 8.0, 8.0);
        let cmd = Command::DataIndication(di);
        msg.add_command(cmd.clone());

        let mut response = cmd.response(&msg);
        response.insert("reg_stat".into(), 300.into());
        assert!(d.handle_data_report(&response).await.is_err());

        assert!(!d.dispatch_command_handlers(&cmd, &response).await);
        assert_eq!(queued(&d), 0);
        assert!(d.last_device_data.is_empty());
    }
}
