//! Unix-domain-socket transport.
//!
//! Semantically identical to TCP: one peer per connection, frames behind a
//! 4-byte little-endian length prefix. The server unlinks a stale socket
//! file before binding and removes the file it created on close; clients
//! never touch the filesystem entry.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
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

/// Unix-domain-socket transport implementation.
pub struct UnixSocketTransport {
    outbound: Arc<Outbound>,
    next_peer_id: Arc<AtomicU64>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    // Set only on the listening side; the owner unlinks the file on close.
    owned_socket_file: Option<PathBuf>,
}

impl UnixSocketTransport {
    pub fn new() -> UnixSocketTransport {
        UnixSocketTransport {
            outbound: Outbound::new(),
            next_peer_id: peer_id_counter(),
            tasks: Arc::new(Mutex::new(Vec::new())),
            owned_socket_file: None,
        }
    }

    fn cleanup_socket_file(&mut self) {
        if let Some(path) = self.owned_socket_file.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("failed to remove socket file {}: {}", path.display(), e);
                }
            }
        }
    }
}

impl Default for UnixSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn start_peer(
    peer: u64,
    stream: UnixStream,
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
                debug!("ipc peer {} read failed: {}", peer, e);
            }
            retire_peer(&outbound, &events, peer, DisconnectReason::Transport).await;
            return;
        }
        let frame_len = u32::from_le_bytes(len_bytes) as usize;
        if frame_len < frame::HEADER_LEN || frame_len > frame_cap {
            warn!(
                "ipc peer {}: frame length {} outside protocol bounds, closing",
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
                warn!("ipc peer {}: undecodable frame: {}", peer, e);
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
                warn!("ipc peer {}: dropping unencodable frame: {}", peer, e);
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
            debug!("ipc peer {} write failed: {}", peer, e);
            retire_peer(&outbound, &events, peer, DisconnectReason::Transport).await;
            return;
        }
    }
    let _ = wr.shutdown().await;
}

#[async_trait]
impl Transport for UnixSocketTransport {
    async fn listen(&mut self, config: &EngineConfig) -> Result<mpsc::Receiver<TransportEvent>> {
        let Address::Ipc { path } = &config.address else {
            return Err(RpcError::InvalidArgument(format!(
                "ipc transport cannot serve {}",
                config.address
            )));
        };

        // A previous server that died uncleanly leaves its socket file
        // behind; binding over it requires the unlink.
        match std::fs::remove_file(path) {
            Ok(()) => debug!("removed stale socket file {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(RpcError::Transport(e)),
        }

        let listener = UnixListener::bind(path)?;
        self.owned_socket_file = Some(path.clone());
        debug!("ipc server listening on {}", path.display());

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let outbound = self.outbound.clone();
        let next_id = self.next_peer_id.clone();
        let tasks = self.tasks.clone();
        let config = config.clone();

        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        if outbound.len() >= config.max_concurrent {
                            warn!(
                                "refusing ipc connection: limit of {} peers reached",
                                config.max_concurrent
                            );
                            drop(stream);
                            continue;
                        }
                        let peer = next_peer_id(&next_id);
                        debug!("accepted ipc peer {}", peer);
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
                        error!("ipc accept failed: {}", e);
                        return;
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(accept);

        Ok(events_rx)
    }

    async fn connect(&mut self, config: &EngineConfig) -> Result<mpsc::Receiver<TransportEvent>> {
        let Address::Ipc { path } = &config.address else {
            return Err(RpcError::InvalidArgument(format!(
                "ipc transport cannot reach {}",
                config.address
            )));
        };

        let stream = UnixStream::connect(path).await?;
        debug!("ipc client connected to {}", path.display());

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
        debug!("closing ipc transport");
        self.outbound.clear();
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        // Await the cancellations so the listener has let go of the
        // socket before its file is unlinked.
        for task in tasks {
            let _ = task.await;
        }
        self.cleanup_socket_file();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ipc"
    }

    fn max_payload(&self, config: &EngineConfig) -> usize {
        config.max_payload_bytes
    }
}
