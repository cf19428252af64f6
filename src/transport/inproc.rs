//! In-process transport.
//!
//! A process-wide registry maps `inproc` names to the listening endpoint.
//! Connecting is an atomic attach: the client hands the listener a bounded
//! queue pair and both sides exchange [`Frame`] values by ownership, no
//! byte encoding involved. The registry mutex is only touched during
//! listen, attach, and teardown; the live frame path is plain channel
//! traffic. Queue capacity is `max_concurrent` in each direction, which is
//! how inproc sends honor backpressure.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::address::Address;
use crate::config::EngineConfig;
use crate::error::{Result, RpcError};
use crate::frame::Frame;

use super::{
    next_peer_id, peer_id_counter, retire_peer, DisconnectReason, Outbound, Transport,
    TransportEvent, EVENT_CHANNEL_CAPACITY, SERVER_PEER,
};

/// One attachment handed from a connecting client to the listener.
struct Attach {
    /// Client-to-server frames; the listener drains this.
    ingress_rx: mpsc::Receiver<Frame>,
    /// Server-to-client frames; the listener sends here.
    egress_tx: mpsc::Sender<Frame>,
}

struct ListenerEntry {
    attach_tx: mpsc::UnboundedSender<Attach>,
}

fn registry() -> &'static Mutex<HashMap<String, ListenerEntry>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, ListenerEntry>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// In-process transport implementation.
pub struct InprocTransport {
    outbound: Arc<Outbound>,
    next_peer_id: Arc<AtomicU64>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    // Set on the listening side: the registered name and our own handle,
    // so close removes exactly our entry and not a successor's.
    registration: Option<(String, mpsc::UnboundedSender<Attach>)>,
}

impl InprocTransport {
    pub fn new() -> InprocTransport {
        InprocTransport {
            outbound: Outbound::new(),
            next_peer_id: peer_id_counter(),
            tasks: Arc::new(Mutex::new(Vec::new())),
            registration: None,
        }
    }

    fn unregister(&mut self) {
        if let Some((name, ours)) = self.registration.take() {
            let mut names = registry().lock().unwrap();
            if let Some(entry) = names.get(&name) {
                if entry.attach_tx.same_channel(&ours) {
                    names.remove(&name);
                    debug!("inproc listener {:?} unregistered", name);
                }
            }
        }
    }
}

impl Default for InprocTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InprocTransport {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[async_trait]
impl Transport for InprocTransport {
    async fn listen(&mut self, config: &EngineConfig) -> Result<mpsc::Receiver<TransportEvent>> {
        let Address::Inproc { name } = &config.address else {
            return Err(RpcError::InvalidArgument(format!(
                "inproc transport cannot serve {}",
                config.address
            )));
        };

        let (attach_tx, mut attach_rx) = mpsc::unbounded_channel::<Attach>();
        {
            let mut names = registry().lock().unwrap();
            match names.get(name) {
                // A dropped listener may not have unregistered yet; a dead
                // entry is fair to replace.
                Some(entry) if !entry.attach_tx.is_closed() => {
                    return Err(RpcError::Transport(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("inproc name {name:?} already has a listener"),
                    )));
                }
                _ => {
                    names.insert(
                        name.clone(),
                        ListenerEntry {
                            attach_tx: attach_tx.clone(),
                        },
                    );
                }
            }
        }
        self.registration = Some((name.clone(), attach_tx));
        debug!("inproc listener registered as {:?}", name);

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let outbound = self.outbound.clone();
        let next_id = self.next_peer_id.clone();
        let tasks = self.tasks.clone();
        let max_concurrent = config.max_concurrent;

        let accept = tokio::spawn(async move {
            while let Some(attach) = attach_rx.recv().await {
                if outbound.len() >= max_concurrent {
                    // Dropping the attachment closes both queues; the
                    // client observes a refused connection.
                    warn!("refusing inproc attach: limit of {} peers reached", max_concurrent);
                    continue;
                }
                let peer = next_peer_id(&next_id);
                debug!("inproc peer {} attached", peer);
                outbound.register(peer, attach.egress_tx);
                if events_tx
                    .send(TransportEvent::PeerConnected(peer))
                    .await
                    .is_err()
                {
                    return;
                }
                let mut ingress = attach.ingress_rx;
                let events = events_tx.clone();
                let outbound = outbound.clone();
                tasks.lock().unwrap().push(tokio::spawn(async move {
                    while let Some(frame) = ingress.recv().await {
                        if events.send(TransportEvent::Frame(peer, frame)).await.is_err() {
                            return;
                        }
                    }
                    retire_peer(&outbound, &events, peer, DisconnectReason::Transport).await;
                }));
            }
        });
        self.tasks.lock().unwrap().push(accept);

        Ok(events_rx)
    }

    async fn connect(&mut self, config: &EngineConfig) -> Result<mpsc::Receiver<TransportEvent>> {
        let Address::Inproc { name } = &config.address else {
            return Err(RpcError::InvalidArgument(format!(
                "inproc transport cannot reach {}",
                config.address
            )));
        };

        let (ingress_tx, ingress_rx) = mpsc::channel(config.max_concurrent);
        let (egress_tx, mut egress_rx) = mpsc::channel(config.max_concurrent);

        {
            let names = registry().lock().unwrap();
            let entry = names.get(name).ok_or_else(|| {
                RpcError::Transport(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("no inproc listener named {name:?}"),
                ))
            })?;
            entry
                .attach_tx
                .send(Attach {
                    ingress_rx,
                    egress_tx,
                })
                .map_err(|_| {
                    RpcError::Transport(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        format!("inproc listener {name:?} is gone"),
                    ))
                })?;
        }
        debug!("inproc client attached to {:?}", name);

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.outbound.register(SERVER_PEER, ingress_tx);
        let _ = events_tx.send(TransportEvent::PeerConnected(SERVER_PEER)).await;

        let outbound = self.outbound.clone();
        let forward = tokio::spawn(async move {
            while let Some(frame) = egress_rx.recv().await {
                if events_tx
                    .send(TransportEvent::Frame(SERVER_PEER, frame))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            retire_peer(&outbound, &events_tx, SERVER_PEER, DisconnectReason::Transport).await;
        });
        self.tasks.lock().unwrap().push(forward);

        Ok(events_rx)
    }

    fn outbound(&self) -> Arc<Outbound> {
        self.outbound.clone()
    }

    async fn close(&mut self) -> Result<()> {
        debug!("closing inproc transport");
        self.unregister();
        self.outbound.clear();
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "inproc"
    }

    fn max_payload(&self, config: &EngineConfig) -> usize {
        config.max_payload_bytes
    }
}
