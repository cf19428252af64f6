//! UDP datagram transport.
//!
//! One frame occupies exactly one datagram; there is no length prefix and
//! no connection. The server side synthesizes a peer id per source address
//! so the cores can answer the right remote. Loss, reordering, and
//! duplication are not compensated: a request whose response datagram is
//! lost surfaces as a deadline `Timeout` when one was set, else stays
//! pending until disconnect.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::address::Address;
use crate::config::EngineConfig;
use crate::error::{Result, RpcError};
use crate::frame::{self, Frame};

use super::{
    next_peer_id, peer_id_counter, retire_peer, DisconnectReason, Outbound, Transport,
    TransportEvent, EVENT_CHANNEL_CAPACITY, SERVER_PEER,
};

/// Hard ceiling on one datagram, before the configured receive buffer is
/// taken into account.
const MAX_DATAGRAM: usize = 64 * 1024;

/// UDP transport implementation.
pub struct UdpTransport {
    outbound: Arc<Outbound>,
    next_peer_id: Arc<AtomicU64>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl UdpTransport {
    pub fn new() -> UdpTransport {
        UdpTransport {
            outbound: Outbound::new(),
            next_peer_id: peer_id_counter(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn datagram_payload_limit(config: &EngineConfig) -> usize {
    config
        .recv_buffer_bytes
        .min(MAX_DATAGRAM)
        .saturating_sub(frame::HEADER_LEN)
        .min(config.max_payload_bytes)
}

fn tune_socket(socket: UdpSocket, config: &EngineConfig) -> io::Result<UdpSocket> {
    let std_socket = socket.into_std()?;
    let raw = socket2::Socket::from(std_socket.try_clone()?);
    raw.set_recv_buffer_size(config.recv_buffer_bytes)?;
    raw.set_send_buffer_size(config.send_buffer_bytes)?;
    UdpSocket::from_std(std_socket)
}

#[async_trait]
impl Transport for UdpTransport {
    async fn listen(&mut self, config: &EngineConfig) -> Result<mpsc::Receiver<TransportEvent>> {
        let Address::Udp { host, port } = &config.address else {
            return Err(RpcError::InvalidArgument(format!(
                "udp transport cannot serve {}",
                config.address
            )));
        };

        let socket = UdpSocket::bind((host.as_str(), *port)).await?;
        let socket = Arc::new(tune_socket(socket, config)?);
        debug!("udp server listening on {}", socket.local_addr()?);

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let outbound = self.outbound.clone();
        let next_id = self.next_peer_id.clone();
        let tasks = self.tasks.clone();
        let max_payload = datagram_payload_limit(config);
        let max_concurrent = config.max_concurrent;

        let recv = tokio::spawn(async move {
            let mut peers_by_addr: HashMap<SocketAddr, u64> = HashMap::new();
            let mut buf = vec![0u8; frame::HEADER_LEN + 2 * frame::MAX_SHORT_FIELD + max_payload];
            loop {
                let (len, remote) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        error!("udp receive failed: {}", e);
                        return;
                    }
                };

                let peer = match peers_by_addr.get(&remote) {
                    Some(peer) => *peer,
                    None => {
                        if peers_by_addr.len() >= max_concurrent {
                            warn!(
                                "dropping datagram from {}: limit of {} peers reached",
                                remote, max_concurrent
                            );
                            continue;
                        }
                        let peer = next_peer_id(&next_id);
                        debug!("udp peer {} attributed to {}", peer, remote);
                        let (tx, rx) = mpsc::channel(max_concurrent);
                        outbound.register(peer, tx);
                        peers_by_addr.insert(remote, peer);
                        tasks.lock().unwrap().push(tokio::spawn(send_loop(
                            peer,
                            socket.clone(),
                            Some(remote),
                            rx,
                            max_payload,
                        )));
                        if events_tx
                            .send(TransportEvent::PeerConnected(peer))
                            .await
                            .is_err()
                        {
                            return;
                        }
                        peer
                    }
                };

                match Frame::decode(&buf[..len], max_payload) {
                    Ok(decoded) => {
                        if events_tx
                            .send(TransportEvent::Frame(peer, decoded))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("undecodable datagram from {}: {}", remote, e);
                        peers_by_addr.remove(&remote);
                        retire_peer(&outbound, &events_tx, peer, DisconnectReason::Protocol).await;
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(recv);

        Ok(events_rx)
    }

    async fn connect(&mut self, config: &EngineConfig) -> Result<mpsc::Receiver<TransportEvent>> {
        let Address::Udp { host, port } = &config.address else {
            return Err(RpcError::InvalidArgument(format!(
                "udp transport cannot reach {}",
                config.address
            )));
        };

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((host.as_str(), *port)).await?;
        let socket = Arc::new(tune_socket(socket, config)?);
        debug!("udp client bound to {} for {}:{}", socket.local_addr()?, host, port);

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let max_payload = datagram_payload_limit(config);
        let (tx, rx) = mpsc::channel(config.max_concurrent);
        self.outbound.register(SERVER_PEER, tx);
        let _ = events_tx.send(TransportEvent::PeerConnected(SERVER_PEER)).await;

        let sender = tokio::spawn(send_loop(
            SERVER_PEER,
            socket.clone(),
            None,
            rx,
            max_payload,
        ));

        let outbound = self.outbound.clone();
        let receiver = tokio::spawn(async move {
            let mut buf = vec![0u8; frame::HEADER_LEN + 2 * frame::MAX_SHORT_FIELD + max_payload];
            loop {
                let len = match socket.recv(&mut buf).await {
                    Ok(len) => len,
                    Err(e) => {
                        debug!("udp receive failed: {}", e);
                        retire_peer(&outbound, &events_tx, SERVER_PEER, DisconnectReason::Transport)
                            .await;
                        return;
                    }
                };
                match Frame::decode(&buf[..len], max_payload) {
                    Ok(decoded) => {
                        if events_tx
                            .send(TransportEvent::Frame(SERVER_PEER, decoded))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("undecodable datagram from server: {}", e);
                        retire_peer(&outbound, &events_tx, SERVER_PEER, DisconnectReason::Protocol)
                            .await;
                        return;
                    }
                }
            }
        });
        self.tasks.lock().unwrap().extend([sender, receiver]);

        Ok(events_rx)
    }

    fn outbound(&self) -> Arc<Outbound> {
        self.outbound.clone()
    }

    async fn close(&mut self) -> Result<()> {
        debug!("closing udp transport");
        self.outbound.clear();
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        // Await the cancellations so the port is really free before
        // close returns.
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "udp"
    }

    fn max_payload(&self, config: &EngineConfig) -> usize {
        datagram_payload_limit(config)
    }
}

/// Drain one peer's queue onto the socket. `remote` is set on the server
/// side (unconnected socket); the client socket is connected and sends
/// without a destination. A failed transmission is the OS losing a
/// datagram early; it is logged and the peer stays usable.
async fn send_loop(
    peer: u64,
    socket: Arc<UdpSocket>,
    remote: Option<SocketAddr>,
    mut queue: mpsc::Receiver<Frame>,
    max_payload: usize,
) {
    while let Some(datagram) = queue.recv().await {
        let bytes = match datagram.encode(max_payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("udp peer {}: dropping unencodable frame: {}", peer, e);
                continue;
            }
        };
        let sent = match remote {
            Some(addr) => socket.send_to(&bytes, addr).await,
            None => socket.send(&bytes).await,
        };
        if let Err(e) = sent {
            debug!("udp peer {} send failed: {}", peer, e);
        }
    }
}
