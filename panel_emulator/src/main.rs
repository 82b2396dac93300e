// src/main.rs
mod config;
mod faults;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use mesh_protocol::{
    Address, Command, DISCOVERY_REQUEST, DISCOVERY_RESPONSE, DataIndication, MAX_PAYLOAD_LEN, Message, MessageKind,
    Sunrise,
};
use rand::Rng;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, GatewayPorts, Settings};
use crate::faults::{FaultKind, FaultMap, generate_profile};

const DISCOVERY_WAIT: Duration = Duration::from_secs(2);
const DISCOVERY_RETRY: Duration = Duration::from_secs(5);

/// One MARCO broadcast; the gateway's address if a POLO comes back in time.
async fn find_gateway(ports: &GatewayPorts, target: &str) -> Result<Option<IpAddr>> {
    let sock = UdpSocket::bind(("0.0.0.0", ports.ad_respond_port)).await?;
    sock.set_broadcast(true)?;
    sock.send_to(DISCOVERY_REQUEST, (target, ports.ad_listen_port)).await?;

    let mut buf = [0u8; 64];
    match timeout(DISCOVERY_WAIT, sock.recv_from(&mut buf)).await {
        Ok(Ok((n, from))) if buf[..n].trim_ascii() == DISCOVERY_RESPONSE => {
            info!(%from, "gateway answered discovery");
            Ok(Some(from.ip()))
        }
        Ok(Ok((_, from))) => {
            warn!(%from, "unexpected discovery reply");
            Ok(None)
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Ok(None),
    }
}

/// One status report for `addr` under the given fault.
fn panel_message<R: Rng + ?Sized>(rng: &mut R, addr: Address, fault: FaultKind, timestamp: u16) -> Message {
    let profile = generate_profile(rng, fault);
    let op_stat = u8::from(profile.status != FaultKind::DeadPanel);

    let mut msg = Message::new(MessageKind::MeshIndication, addr);
    msg.request_id = rng.random();
    msg.source_hopcount = rng.random_range(1..=10);
    msg.source_queue_length = 0;

    let mut di = DataIndication::with_status(1, op_stat);
    di.add_data(timestamp, profile.voltage, profile.voltage, profile.current, profile.current);
    msg.add_command(Command::DataIndication(di));
    msg
}

async fn run(settings: &Settings, panels: &[Address], faults: &FaultMap) -> Result<()> {
    // -------- discovery ----------
    let host = loop {
        match find_gateway(&settings.gateway, &settings.emulator.discovery_target).await {
            Ok(Some(ip)) => break ip,
            Ok(None) => info!("gateway not found, retrying in 5s"),
            Err(e) => warn!(error = %e, "discovery failed, retrying in 5s"),
        }
        sleep(DISCOVERY_RETRY).await;
    };

    let mut stream = TcpStream::connect((host, settings.gateway.comm_port))
        .await
        .with_context(|| format!("connecting to {host}:{}", settings.gateway.comm_port))?;
    info!(%host, port = settings.gateway.comm_port, "connected to gateway");

    // -------- report loop ----------
    let panel_delay = Duration::try_from_secs_f64(settings.emulator.panel_delay)?;
    let cycle_delay = Duration::try_from_secs_f64(settings.emulator.cycle_delay)?;
    let sunrise = Sunrise::today();
    let mut rng = rand::rng();

    loop {
        for addr in panels {
            let timestamp = sunrise.to_seconds_since_sunrise(Utc::now());
            let msg = panel_message(&mut rng, *addr, faults.get(addr), timestamp);
            match msg.to_frame() {
                Ok(frame) => {
                    stream.write_all(&frame).await?;
                    info!(%addr, hop = msg.source_hopcount, len = frame.len(), "sent status");
                }
                Err(e) => warn!(%addr, error = %e, limit = MAX_PAYLOAD_LEN, "skipping oversized report"),
            }
            sleep(panel_delay).await;
        }
        sleep(cycle_delay).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("panel_emulator=info".parse()?)
                .add_directive("mesh_protocol=info".parse()?),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;
    let panels = settings
        .emulator
        .panels
        .iter()
        .map(|p| p.parse::<Address>())
        .collect::<Result<Vec<_>, _>>()?;
    let faults = FaultMap::from_config(&settings.emulator.faults)?;
    info!(panels = panels.len(), "panel emulator starting");

    tokio::select! {
        res = run(&settings, &panels, &faults) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn reports_decode_on_the_gateway_side() {
        let mut rng = StdRng::seed_from_u64(3);
        let addr: Address = "fa:29:eb:6d:87:01".parse().unwrap();
        let msg = panel_message(&mut rng, addr, FaultKind::Normal, 1200);
        assert!((1..=10).contains(&msg.source_hopcount));

        let raw = msg.encode().unwrap();
        let back = Message::decode(MessageKind::MeshIndication, raw.len() as u8, &raw, Utc::now()).unwrap();
        let Command::DataIndication(di) = &back.commands[0] else { panic!("expected data indication") };
        assert_eq!(di.status.map(|s| s.op_stat), Some(1));
        assert_eq!(di.samples[0].timestamp, 1200);
        assert!((38.0..=40.0).contains(&di.samples[0].input_voltage()));
    }

    #[test]
    fn dead_panel_reports_not_operating() {
        let mut rng = StdRng::seed_from_u64(3);
        let msg = panel_message(&mut rng, Address::new([0; 6]), FaultKind::DeadPanel, 0);
        let Command::DataIndication(di) = &msg.commands[0] else { panic!("expected data indication") };
        assert_eq!(di.status.map(|s| s.op_stat), Some(0));
    }
}
