//! The DAQ process: owns the gateway and the three pipeline stages, runs the
//! inbound dispatch loop, and tears everything down in order.

use crate::commands::{CONTROL_FUNCTIONS, COMMAND_HANDLERS, CommandRequest, ControlRegistry, HandlerRegistry};
use crate::config::Settings;
use crate::errors::DaqError;
use crate::net::{BoundAddrs, GatewayManager, Inbound};
use crate::telemetry::batcher::BatchStage;
use crate::telemetry::broker::Broker;
use crate::telemetry::encoder::EncodeStage;
use crate::telemetry::pitcher::PublishStage;
use crate::telemetry::record::{DeviceKey, LinkStatus, TelemetryRecord};
use crate::telemetry::StageHandle;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use mesh_protocol::Sunrise;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Initializing,
    Running,
    Stopping,
    Stopped,
}

/// Optional auxiliary data source, stopped between the pipeline and the gateway.
/// It feeds records in through the client it is started with.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Collector: Send + 'static {
    async fn start(&mut self, client: DaqClient) -> Result<(), DaqError>;
    async fn stop(&mut self) -> Result<(), DaqError>;
}

/// In-process handle onto the run loop. Calls queue behind device traffic
/// and are answered in order.
#[derive(Debug, Clone)]
pub struct DaqClient {
    inbound: mpsc::Sender<Inbound>,
}

impl DaqClient {
    /// Run a control function and wait for its result.
    pub async fn call(&self, func: &str, args: Value) -> Result<Value, DaqError> {
        let (reply, rx) = oneshot::channel();
        let request = CommandRequest::new(func, args);
        self.inbound
            .send(Inbound::Request { request, reply })
            .await
            .map_err(|_| DaqError::Dispatch("daq process is gone".into()))?;
        rx.await
            .map_err(|_| DaqError::Dispatch(format!("{func} was dropped before it ran")))
    }

    /// Hand an already-structured record to the encode stage.
    pub async fn submit(&self, record: Value) -> Result<(), DaqError> {
        self.inbound
            .send(Inbound::Structured(record))
            .await
            .map_err(|_| DaqError::Dispatch("daq process is gone".into()))
    }
}

pub struct DaqProcess<B: Broker> {
    pub(crate) state: ProcessState,
    pub(crate) sunrise: Sunrise,
    pub(crate) request_id: u16,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: mpsc::Receiver<Inbound>,
    pub(crate) encode_tx: mpsc::Sender<Value>,
    pub(crate) outbound: broadcast::Sender<Bytes>,
    pub(crate) gateway: GatewayManager,
    pub(crate) encoder: StageHandle<EncodeStage>,
    pub(crate) batcher: StageHandle<BatchStage>,
    pub(crate) pitcher: StageHandle<PublishStage<B>>,
    collector: Option<Box<dyn Collector>>,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) controls: ControlRegistry,
    pub(crate) last_device_data: Arc<DashMap<DeviceKey, TelemetryRecord>>,
    pub(crate) link_status: Arc<DashMap<String, LinkStatus>>,
}

impl<B: Broker> DaqProcess<B> {
    pub fn new(settings: &Settings, broker: B) -> Self {
        let qsize = settings.daq.backpressure_qsize.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(qsize);
        let (encode_tx, encode_rx) = mpsc::channel(qsize);
        let (batch_tx, batch_rx) = mpsc::channel(qsize);
        let (publish_tx, publish_rx) = mpsc::channel(qsize);

        let encoder = StageHandle::new(EncodeStage::new(encode_rx, batch_tx));

        let batcher = StageHandle::new(BatchStage::new(batch_rx, publish_tx));
        batcher.set("batch_on", settings.daq.compression.batch_on);
        batcher.set("batch_at", settings.daq.compression.batch_at);

        let pitcher = StageHandle::new(PublishStage::new(publish_rx, broker, settings.nats.topic.clone()));
        pitcher.set("throttle_delay", settings.daq.throttle_delay);
        pitcher.set("backoff", settings.daq.publish_backoff);

        let gateway = GatewayManager::new(settings.gateway.clone(), inbound_tx.clone());
        let outbound = gateway.outbound();

        let handlers = HandlerRegistry::build(COMMAND_HANDLERS);
        let controls = ControlRegistry::build(CONTROL_FUNCTIONS);
        info!(
            handlers = handlers.len(),
            controls = controls.len(),
            qsize,
            "dispatch tables built"
        );

        Self {
            state: ProcessState::Initializing,
            sunrise: Sunrise::today(),
            request_id: rand::random(),
            inbound_tx,
            inbound_rx,
            encode_tx,
            outbound,
            gateway,
            encoder,
            batcher,
            pitcher,
            collector: None,
            handlers,
            controls,
            last_device_data: Arc::default(),
            link_status: Arc::default(),
        }
    }

    pub fn with_collector(mut self, collector: Box<dyn Collector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn client(&self) -> DaqClient {
        DaqClient { inbound: self.inbound_tx.clone() }
    }

    /// Latest reading per device, shared with the run loop.
    pub fn last_device_data(&self) -> Arc<DashMap<DeviceKey, TelemetryRecord>> {
        Arc::clone(&self.last_device_data)
    }

    pub(crate) fn next_request_id(&mut self) -> u16 {
        self.request_id = self.request_id.wrapping_add(1);
        self.request_id
    }

    /// Idempotent: a second call only reports the bound addresses.
    pub async fn start(&mut self) -> Result<BoundAddrs, DaqError> {
        let bound = self.gateway.start().await?;
        if self.state == ProcessState::Running {
            return Ok(bound);
        }
        let client = self.client();
        if let Some(c) = self.collector.as_mut() {
            c.start(client).await?;
        }
        self.encoder.start();
        self.batcher.start();
        self.pitcher.start();
        self.state = ProcessState::Running;
        Ok(bound)
    }

    /// Stages first, then the collector, then the gateway. A failure in one
    /// step is logged and the rest still run.
    pub async fn stop(&mut self) {
        if self.state == ProcessState::Stopped {
            return;
        }
        self.state = ProcessState::Stopping;
        info!("stopping daq process");

        self.encoder.stop().await;
        self.batcher.stop().await;
        self.pitcher.stop().await;

        if let Some(c) = self.collector.as_mut() {
            if let Err(e) = c.stop().await {
                error!(error = %e, "collector stop failed");
            }
        }

        self.gateway.stop().await;
        self.state = ProcessState::Stopped;
        info!("daq process stopped");
    }

    /// Start everything, drain the inbound queue until `cancel` fires, then stop.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), DaqError> {
        let result = match self.start().await {
            Ok(bound) => {
                info!(stream = %bound.stream, discovery = %bound.discovery, "daq process running");
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break Ok(()),
                        next = self.inbound_rx.recv() => next,
                    };
                    match next {
                        // a full pipeline must not hold up shutdown
                        Some(item) => tokio::select! {
                            _ = cancel.cancelled() => break Ok(()),
                            _ = self.process_gateway_indication(item) => {}
                        },
                        None => {
                            warn!("inbound queue closed");
                            break Ok(());
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "daq process failed to start");
                Err(e)
            }
        };
        self.stop().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::telemetry::batcher::decompress;
    use crate::telemetry::broker::MockBroker;
    use mesh_protocol::{Address, Command, DataIndication, Message, MessageKind};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    fn test_settings() -> Settings {
        let mut s = Settings::default();
        s.gateway = GatewayConfig {
            comm_host: "127.0.0.1".into(),
            comm_port: 0,
            ad_host: "127.0.0.1".into(),
            ad_listen_port: 0,
            ad_respond_port: 0,
        };
        s.daq.throttle_delay = 0.0;
        s.daq.compression.batch_at = 60.0;
        s
    }

    fn quiet_broker() -> MockBroker {
        let mut b = MockBroker::new();
        b.expect_connect().returning(|| Ok(()));
        b.expect_publish().returning(|_, _| Ok(()));
        b.expect_close().returning(|| ());
        b
    }

    #[tokio::test]
    async fn stop_runs_every_step_even_if_the_collector_fails() {
        let mut collector = MockCollector::new();
        collector.expect_start().times(1).returning(|_| Ok(()));
        collector.expect_stop().times(1).returning(|| Err(DaqError::Dispatch("collector wedged".into())));

        let mut daq = DaqProcess::new(&test_settings(), quiet_broker()).with_collector(Box::new(collector));
        let bound = daq.start().await.unwrap();
        assert_eq!(daq.start().await.unwrap(), bound);
        assert_eq!(daq.state(), ProcessState::Running);
        assert!(daq.encoder.is_running() && daq.pitcher.is_running());

        daq.stop().await;
        assert_eq!(daq.state(), ProcessState::Stopped);
        assert!(!daq.encoder.is_running());
        assert!(!daq.batcher.is_running());
        assert!(!daq.pitcher.is_running());
        assert!(!daq.gateway.is_running());
    }

    #[tokio::test]
    async fn request_ids_wrap() {
        let mut daq = DaqProcess::new(&test_settings(), quiet_broker());
        daq.request_id = u16::MAX;
        assert_eq!(daq.next_request_id(), 0);
        assert_eq!(daq.next_request_id(), 1);
    }

    #[tokio::test]
    async fn device_readings_end_up_published_as_one_batch() {
        let (pub_tx, mut pub_rx) = mpsc::unbounded_channel::<Bytes>();
        let mut broker = MockBroker::new();
        broker.expect_connect().returning(|| Ok(()));
        broker.expect_publish().returning(move |_, payload| {
            let _ = pub_tx.send(payload);
            Ok(())
        });
        broker.expect_close().returning(|| ());

        let mut settings = test_settings();
        settings.daq.compression.batch_on = 2;
        let mut daq = DaqProcess::new(&settings, broker);
        let bound = daq.start().await.unwrap();

        let mut msg = Message::new(MessageKind::MeshIndication, "fa:29:eb:6d:87:01".parse::<Address>().unwrap());
        let mut di = DataIndication::with_status(1, 1);
        di.add_data(100, 40.0, 38.5, 8.0, 8.2);
        di.add_data(101, 41.0, 39.0, 8.1, 8.3);
        msg.add_command(Command::DataIndication(di));

        let mut dev = TcpStream::connect(bound.stream).await.unwrap();
        dev.write_all(&msg.to_frame().unwrap()).await.unwrap();

        // one turn of the run loop, by hand
        let item = timeout(Duration::from_secs(2), daq.inbound_rx.recv()).await.unwrap().unwrap();
        daq.process_gateway_indication(item).await;

        let batch = timeout(Duration::from_secs(3), pub_rx.recv()).await.unwrap().unwrap();
        let batch = decompress(&batch).unwrap();
        assert_eq!(batch.cache.len(), 2);
        let first: Value = rmp_serde::from_slice(&batch.cache[0]).unwrap();
        assert_eq!(first["macaddr"], "fa29eb6d8701");
        assert_eq!(first["Pi"], 320.0);

        let key = ("fa29eb6d8701".to_string(), mesh_protocol::DEVICE_TYPE_PLM);
        assert_eq!(daq.last_device_data.get(&key).unwrap().vi, 41.0);
        daq.stop().await;
    }

    #[tokio::test]
    async fn run_returns_after_cancel_and_leaves_everything_stopped() {
        let mut daq = DaqProcess::new(&test_settings(), quiet_broker());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        timeout(Duration::from_secs(3), daq.run(cancel)).await.unwrap().unwrap();
        assert_eq!(daq.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn client_calls_are_answered_by_the_run_loop() {
        let mut daq = DaqProcess::new(&test_settings(), quiet_broker());
        let client = daq.client();
        let readings = daq.last_device_data();
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let cancel = cancel.clone();
            async move { daq.run(cancel).await }
        });

        let status = timeout(Duration::from_secs(2), client.call("get_status", Value::Null)).await.unwrap().unwrap();
        assert_eq!(status["status"], true);
        assert_eq!(status["state"], "running");
        assert_eq!(status["gateway"], true);

        let unknown = client.call("reboot", serde_json::json!({})).await.unwrap();
        assert_eq!(unknown["msg"], "Unknown command");

        let last = client.call("get_last_data", Value::Null).await.unwrap();
        assert_eq!(last["data"].as_array().map(Vec::len), Some(readings.len()));

        cancel.cancel();
        timeout(Duration::from_secs(3), run).await.unwrap().unwrap().unwrap();
        assert!(client.call("get_status", Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn cancel_is_honoured_while_the_pipeline_is_backed_up() {
        let mut broker = MockBroker::new();
        broker.expect_connect().returning(|| Ok(()));
        broker.expect_publish().returning(|_, _| Err(DaqError::Publish("down".into())));
        broker.expect_close().returning(|| ());

        let mut settings = test_settings();
        settings.daq.backpressure_qsize = 1;
        settings.daq.publish_backoff = 3600.0;
        settings.daq.compression.batch_on = 1;
        let mut daq = DaqProcess::new(&settings, broker);
        let client = daq.client();
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let cancel = cancel.clone();
            async move { daq.run(cancel).await }
        });

        // more records than every queue can hold; the feeder ends up blocked
        tokio::spawn(async move {
            for n in 0..16 {
                if client.submit(serde_json::json!({ "n": n })).await.is_err() {
                    break;
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        cancel.cancel();
        timeout(Duration::from_secs(3), run).await.expect("run ignored cancel").unwrap().unwrap();
    }
}
