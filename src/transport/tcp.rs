//! TCP stream transport.
//!
//! One peer is one connection. Each encoded frame travels behind a 4-byte
//! little-endian length prefix; the reader reassembles exactly one frame
//! per prefix, so short reads never surface to the codec.

use std::io;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::address::Address;
use crate::config::{EngineConfig, PerformanceMode};
use crate::error::{Result, RpcError};
use crate::frame::{self, Frame};

use super::{
    next_peer_id, peer_id_counter, retire_peer, DisconnectReason, Outbound, Transport,
    TransportEvent, EVENT_CHANNEL_CAPACITY, SERVER_PEER,
};

/// TCP transport implementation.
pub struct TcpTransport {
    outbound: Arc<Outbound>,
    next_peer_id: Arc<AtomicU64>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TcpTransport {
    pub fn new() -> TcpTransport {
        TcpTransport {
            outbound: Outbound::new(),
            next_peer_id: peer_id_counter(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply socket options from the config: buffer sizes, linger, and
/// `TCP_NODELAY` in low-latency mode.
fn tune_stream(stream: TcpStream, config: &EngineConfig) -> io::Result<TcpStream> {
    let std_stream = stream.into_std()?;
    let socket = socket2::Socket::from(std_stream.try_clone()?);
    if config.performance_mode == PerformanceMode::LowLatency {
        socket.set_nodelay(true)?;
    }
    socket.set_recv_buffer_size(config.recv_buffer_bytes)?;
    socket.set_send_buffer_size(config.send_buffer_bytes)?;
    if config.linger_ms > 0 {
        socket.set_linger(Some(Duration::from_millis(config.linger_ms)))?;
    }
    TcpStream::from_std(std_stream)
}

/// Spawn the reader/writer pair for one established connection.
fn start_peer(
    peer: u64,
    stream: TcpStream,
    outbound: &Arc<Outbound>,
    events: &mpsc::Sender<TransportEvent>,
    config: &EngineConfig,
    queue: mpsc::Receiver<Frame>,
) -> Vec<JoinHandle<()>> {
    let (rd, wr) = stream.into_split();
    let reader = tokio::spawn(read_loop(
        peer,
        rd,
        events.clone(),
        outbound.clone(),
        config.max_payload_bytes,
    ));
    let writer = tokio::spawn(write_loop(
        peer,
        wr,
        queue,
        events.clone(),
        outbound.clone(),
        config.max_payload_bytes,
    ));
    vec![reader, writer]
}

async fn read_loop(
    peer: u64,
    mut rd: OwnedReadHalf,
    events: mpsc::Sender<TransportEvent>,
    outbound: Arc<Outbound>,
    max_payload: usize,
) {
    let frame_cap = frame::HEADER_LEN + 2 * frame::MAX_SHORT_FIELD + max_payload;
    loop {
        let mut len_bytes = [0u8; 4];
        if let Err(e) = rd.read_exact(&mut len_bytes).await {
            if e.kind() != io::ErrorKind::UnexpectedEof {
                debug!("tcp peer {} read failed: {}", peer, e);
            }
            retire_peer(&outbound, &events, peer, DisconnectReason::Transport).await;
            return;
        }
        let frame_len = u32::from_le_bytes(len_bytes) as usize;
        if frame_len < frame::HEADER_LEN || frame_len > frame_cap {
            warn!(
                "tcp peer {}: frame length {} outside protocol bounds, closing",
                peer, frame_len
            );
            retire_peer(&outbound, &events, peer, DisconnectReason::Protocol).await;
            return;
        }
        let mut buf = vec![0u8; frame_len];
        if rd.read_exact(&mut buf).await.is_err() {
            retire_peer(&outbound, &events, peer, DisconnectReason::Transport).await;
            return;
        }
        match Frame::decode(&buf, max_payload) {
            Ok(frame) => {
                if events.send(TransportEvent::Frame(peer, frame)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("tcp peer {}: undecodable frame: {}", peer, e);
                retire_peer(&outbound, &events, peer, DisconnectReason::Protocol).await;
                return;
            }
        }
    }
}

async fn write_loop(
    peer: u64,
    mut wr: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Frame>,
    events: mpsc::Sender<TransportEvent>,
    outbound: Arc<Outbound>,
    max_payload: usize,
) {
    while let Some(frame) = queue.recv().await {
        let bytes = match frame.encode(max_payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                // Cores validate before enqueueing; anything here is a bug.
                warn!("tcp peer {}: dropping unencodable frame: {}", peer, e);
                continue;
            }
        };
        let len = (bytes.len() as u32).to_le_bytes();
        let wrote = async {
            wr.write_all(&len).await?;
            wr.write_all(&bytes).await?;
            wr.flush().await
        }
        .await;
        if let Err(e) = wrote {
            debug!("tcp peer {} write failed: {}", peer, e);
            retire_peer(&outbound, &events, peer, DisconnectReason::Transport).await;
            return;
        }
    }
    // Queue sender gone: the peer was retired elsewhere.
    let _ = wr.shutdown().await;
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&mut self, config: &EngineConfig) -> Result<mpsc::Receiver<TransportEvent>> {
        let Address::Tcp { host, port } = &config.address else {
            return Err(RpcError::InvalidArgument(format!(
                "tcp transport cannot serve {}",
                config.address
            )));
        };

        let listener = TcpListener::bind((host.as_str(), *port)).await?;
        debug!("tcp server listening on {}", listener.local_addr()?);

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let outbound = self.outbound.clone();
        let next_id = self.next_peer_id.clone();
        let tasks = self.tasks.clone();
        let config = config.clone();

        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        if outbound.len() >= config.max_concurrent {
                            warn!(
                                "refusing tcp connection from {}: limit of {} peers reached",
                                remote, config.max_concurrent
                            );
                            drop(stream);
                            continue;
                        }
                        let stream = match tune_stream(stream, &config) {
                            Ok(stream) => stream,
                            Err(e) => {
                                warn!("failed to configure socket from {}: {}", remote, e);
                                continue;
                            }
                        };
                        let peer = next_peer_id(&next_id);
                        debug!("accepted tcp peer {} from {}", peer, remote);
                        let (tx, rx) = mpsc::channel(config.max_concurrent);
                        outbound.register(peer, tx);
                        if events_tx
                            .send(TransportEvent::PeerConnected(peer))
                            .await
                            .is_err()
                        {
                            return;
                        }
                        let spawned = start_peer(peer, stream, &outbound, &events_tx, &config, rx);
                        tasks.lock().unwrap().extend(spawned);
                    }
                    Err(e) => {
                        error!("tcp accept failed: {}", e);
                        return;
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(accept);

        Ok(events_rx)
    }

    async fn connect(&mut self, config: &EngineConfig) -> Result<mpsc::Receiver<TransportEvent>> {
        let Address::Tcp { host, port } = &config.address else {
            return Err(RpcError::InvalidArgument(format!(
                "tcp transport cannot reach {}",
                config.address
            )));
        };

        let stream = TcpStream::connect((host.as_str(), *port)).await?;
        let stream = tune_stream(stream, config)?;
        debug!("tcp client connected to {}:{}", host, port);

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (tx, rx) = mpsc::channel(config.max_concurrent);
        self.outbound.register(SERVER_PEER, tx);
        let _ = events_tx.send(TransportEvent::PeerConnected(SERVER_PEER)).await;

        let spawned = start_peer(SERVER_PEER, stream, &self.outbound, &events_tx, config, rx);
        self.tasks.lock().unwrap().extend(spawned);

        Ok(events_rx)
    }

    fn outbound(&self) -> Arc<Outbound> {
        self.outbound.clone()
    }

    async fn close(&mut self) -> Result<()> {
        debug!("closing tcp transport");
        self.outbound.clear();
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        // Await the cancellations so sockets are really gone (and ports
        // really free) before close returns.
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tcp"
    }

    fn max_payload(&self, config: &EngineConfig) -> usize {
        config.max_payload_bytes
    }
}
