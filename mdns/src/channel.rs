//! Channel/reactor: one multicast socket pair per network interface, a FIFO
//! send queue, and fan-out of decoded inbound messages to every subscriber
//! via a broadcast channel.
//!
//! Network interface enumeration is an external collaborator: the caller
//! passes a plain `&[Interface]` list at construction time.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{self, Message};
use crate::config::MdnsConfig;

pub const MAX_DATAGRAM_SIZE: usize = 65_536;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("no usable network interface (including loopback)")]
    NoInterface,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel is closed")]
    Closed,
}

/// A plain description of a local network interface, produced by an
/// external enumerator and handed to `Channel::bind`.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub is_loopback: bool,
}

/// An inbound message decoded off the wire, fanned out to every subscriber.
#[derive(Debug, Clone)]
pub struct Received {
    pub message: Message,
    pub from: SocketAddr,
    pub received_at: Instant,
}

struct BoundSocket {
    socket: Arc<UdpSocket>,
    interface: String,
}

pub struct Channel {
    v4_sockets: Vec<BoundSocket>,
    v6_sockets: Vec<BoundSocket>,
    v4_group: SocketAddrV4,
    v6_group: SocketAddrV6,
    send_tx: mpsc::UnboundedSender<Message>,
    send_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    inbound_tx: broadcast::Sender<Arc<Received>>,
    enabled: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Channel {
    /// Binds a socket per interface per family; falls back to loopback if no
    /// non-loopback interface yields one; fails `NoInterface` if none do.
    pub fn bind(interfaces: &[Interface], config: &MdnsConfig) -> Result<Self, ChannelError> {
        let ipv4_group: Ipv4Addr = config
            .ipv4_group
            .parse()
            .unwrap_or(Ipv4Addr::new(224, 0, 0, 251));
        let ipv6_group: Ipv6Addr = config.ipv6_group.parse().unwrap_or_else(|_| "ff02::fb".parse().unwrap());

        let mut v4_sockets = bind_all(interfaces, false, config.port, ipv4_group, ipv6_group);
        let mut v6_sockets_all = bind_all(interfaces, true, config.port, ipv4_group, ipv6_group);

        if v4_sockets.is_empty() && v6_sockets_all.is_empty() {
            let loopback: Vec<Interface> = interfaces.iter().filter(|i| i.is_loopback).cloned().collect();
            if loopback.is_empty() {
                return Err(ChannelError::NoInterface);
            }
            v4_sockets = bind_all(&loopback, false, config.port, ipv4_group, ipv6_group);
            v6_sockets_all = bind_all(&loopback, true, config.port, ipv4_group, ipv6_group);
            if v4_sockets.is_empty() && v6_sockets_all.is_empty() {
                return Err(ChannelError::NoInterface);
            }
        }

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (inbound_tx, _) = broadcast::channel(config.inbound_channel_capacity);

        Ok(Self {
            v4_sockets,
            v6_sockets: v6_sockets_all,
            v4_group: SocketAddrV4::new(ipv4_group, config.port),
            v6_group: SocketAddrV6::new(ipv6_group, config.port, 0, 0),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            inbound_tx,
            enabled: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Received>> {
        self.inbound_tx.subscribe()
    }

    pub fn send(&self, message: Message) -> Result<(), ChannelError> {
        self.send_tx.send(message).map_err(|_| ChannelError::Closed)
    }

    /// Idempotently starts the sender and receiver workers.
    pub async fn enable(self: &Arc<Self>) {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock().await;

        if let Some(rx) = self.send_rx.lock().await.take() {
            tasks.push(tokio::spawn(sender_loop(self.clone(), rx)));
        }
        for bound in &self.v4_sockets {
            tasks.push(tokio::spawn(receiver_loop(bound.socket.clone(), bound.interface.clone(), self.inbound_tx.clone())));
        }
        for bound in &self.v6_sockets {
            tasks.push(tokio::spawn(receiver_loop(bound.socket.clone(), bound.interface.clone(), self.inbound_tx.clone())));
        }
        info!(
            v4 = self.v4_sockets.len(),
            v6 = self.v6_sockets.len(),
            "mdns channel enabled"
        );
    }

    /// Cancels both workers and drops all sockets (best-effort).
    pub async fn close(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

fn bind_all(interfaces: &[Interface], ipv6: bool, port: u16, ipv4_group: Ipv4Addr, ipv6_group: Ipv6Addr) -> Vec<BoundSocket> {
    let mut out = Vec::new();
    for iface in interfaces {
        let bound = if ipv6 {
            iface.ipv6.map(|addr| bind_v6(iface, addr, port, ipv6_group))
        } else {
            iface.ipv4.map(|addr| bind_v4(iface, addr, port, ipv4_group))
        };
        match bound {
            Some(Ok(socket)) => out.push(BoundSocket {
                socket: Arc::new(socket),
                interface: iface.name.clone(),
            }),
            Some(Err(e)) => warn!(interface = %iface.name, error = %e, "failed to bind mdns socket"),
            None => {}
        }
    }
    out
}

fn bind_v4(iface: &Interface, addr: Ipv4Addr, port: u16, group: Ipv4Addr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.set_multicast_ttl_v4(255)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_if_v4(&addr)?;
    socket.join_multicast_v4(&group, &addr)?;
    socket.set_nonblocking(true)?;
    debug!(interface = %iface.name, %addr, "bound ipv4 mdns socket");
    UdpSocket::from_std(socket.into())
}

fn bind_v6(iface: &Interface, addr: Ipv6Addr, port: u16, group: Ipv6Addr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0).into())?;
    socket.set_multicast_hops_v6(255)?;
    socket.set_multicast_loop_v6(true)?;
    socket.set_multicast_if_v6(iface.index)?;
    socket.join_multicast_v6(&group, iface.index)?;
    socket.set_only_v6(true).ok();
    socket.set_nonblocking(true)?;
    debug!(interface = %iface.name, %addr, "bound ipv6 mdns socket");
    UdpSocket::from_std(socket.into())
}

async fn sender_loop(channel: Arc<Channel>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        let bytes = match codec::encode(&message) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to encode outbound mdns message");
                continue;
            }
        };
        for bound in &channel.v4_sockets {
            if let Err(e) = bound.socket.send_to(&bytes, channel.v4_group).await {
                warn!(interface = %bound.interface, error = %e, "ipv4 send failed");
            }
        }
        for bound in &channel.v6_sockets {
            if let Err(e) = bound.socket.send_to(&bytes, channel.v6_group).await {
                warn!(interface = %bound.interface, error = %e, "ipv6 send failed");
            }
        }
    }
}

async fn receiver_loop(socket: Arc<UdpSocket>, interface: String, inbound_tx: broadcast::Sender<Arc<Received>>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(interface = %interface, error = %e, "mdns recv error");
                continue;
            }
        };
        let now = Instant::now();
        match codec::decode(&buf[..len], now) {
            Ok(message) => {
                let _ = inbound_tx.send(Arc::new(Received {
                    message,
                    from,
                    received_at: now,
                }));
            }
            Err(e) => {
                debug!(interface = %interface, %from, error = %e, "failed to decode mdns packet");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_interface() -> Interface {
        Interface {
            name: "lo".to_string(),
            index: 1,
            ipv4: Some(Ipv4Addr::LOCALHOST),
            ipv6: None,
            is_loopback: true,
        }
    }

    #[test]
    fn no_interfaces_is_no_interface_error() {
        let config = MdnsConfig::default();
        let err = Channel::bind(&[], &config).unwrap_err();
        assert!(matches!(err, ChannelError::NoInterface));
    }

    #[tokio::test]
    async fn binds_loopback_and_round_trips_a_message() {
        let mut config = MdnsConfig::default();
        config.port = 0; // let the OS pick a free port so tests don't collide
        let non_loopback: Vec<Interface> = Vec::new();
        let channel = Channel::bind(&non_loopback, &config);
        // With zero interfaces the constructor should report NoInterface,
        // since there is nothing to fall back to either.
        assert!(channel.is_err());

        let iface = loopback_interface();
        let channel = Channel::bind(&[iface], &config).unwrap();
        assert_eq!(channel.v4_sockets.len(), 1);
    }
}
