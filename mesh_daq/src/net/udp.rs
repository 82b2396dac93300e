// Discovery responder: a trimmed MARCO datagram is answered with POLO.
use mesh_protocol::{DISCOVERY_REQUEST, DISCOVERY_RESPONSE};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Broadcast-capable, address-reusable UDP socket for the discovery port.
pub fn bind_discovery(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Local interface address the OS would route to `remote` from.
/// Falls back to loopback when no route exists.
pub fn local_ip_for(remote: IpAddr) -> IpAddr {
    let probe = || -> io::Result<IpAddr> {
        let unspecified: IpAddr = match remote {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let s = std::net::UdpSocket::bind((unspecified, 0))?;
        s.connect((remote, 9))?;
        Ok(s.local_addr()?.ip())
    };
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Where the POLO for a MARCO from `sender` should go.
pub fn reply_target(sender: IpAddr, respond_port: u16) -> SocketAddr {
    if local_ip_for(sender) == sender {
        let loopback: IpAddr = match sender {
            IpAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
            IpAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
        };
        return SocketAddr::new(loopback, respond_port);
    }
    SocketAddr::new(sender, respond_port)
}

pub async fn serve_discovery(socket: UdpSocket, respond_port: u16, cancel: CancellationToken) {
    let mut buf = [0u8; 512];
    loop {
        let (n, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok(x) => x,
                Err(e) => {
                    warn!(error = %e, "discovery recv failed");
                    super::pause_after_error().await;
                    continue;
                }
            },
        };

        if buf[..n].trim_ascii() != DISCOVERY_REQUEST {
            debug!(%from, len = n, "ignoring non-discovery datagram");
            continue;
        }

        let target = reply_target(from.ip(), respond_port);
        match socket.send_to(DISCOVERY_RESPONSE, target).await {
            Ok(_) => info!(%from, %target, "answered discovery"),
            Err(e) => warn!(%from, %target, error = %e, "discovery reply failed"),
        }
    }
    debug!("discovery responder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn loopback_sender_is_answered_on_loopback() {
        let target = reply_target(Ipv4Addr::LOCALHOST.into(), 4000);
        assert_eq!(target, SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 4000));
    }

    #[tokio::test]
    async fn marco_gets_exactly_one_polo() {
        let responder = bind_discovery("127.0.0.1:0".parse().unwrap()).unwrap();
        let responder_addr = responder.local_addr().unwrap();

        let panel = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let respond_port = panel.local_addr().unwrap().port();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve_discovery(responder, respond_port, cancel.clone()));

        panel.send_to(b"MARCO\n", responder_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = timeout(Duration::from_secs(2), panel.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"POLO");

        // Nothing else arrives for a non-discovery datagram.
        panel.send_to(b"hello", responder_addr).await.unwrap();
        assert!(timeout(Duration::from_millis(200), panel.recv_from(&mut buf)).await.is_err());

        cancel.cancel();
        task.await.unwrap();
    }
}
