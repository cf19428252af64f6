//! Transport abstraction.
//!
//! All four transports expose the same contract to the client, server, and
//! broadcast cores, so the cores never branch on the address family:
//!
//! - `listen`/`connect` bring the endpoint up and hand back the stream of
//!   [`TransportEvent`] upcalls (inbound frames, peer lifecycle);
//! - [`Outbound`] is the synchronous send path: one bounded queue per peer,
//!   drained by a writer task, with a full queue surfacing as
//!   `Backpressure` instead of blocking or dropping;
//! - `close` tears the endpoint down and releases whatever the transport
//!   owns (sockets, tasks, the IPC socket file, the inproc registry entry).
//!
//! A *peer* is a logical remote endpoint: a connection for the stream
//! transports, a source-address entry for UDP, an attachment for inproc.
//! Client-mode links always address their server as peer [`SERVER_PEER`];
//! server-mode peer ids start at 1.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::address::Address;
use crate::config::EngineConfig;
use crate::error::{Result, RpcError};
use crate::frame::Frame;

pub mod inproc;
pub mod ipc;
pub mod tcp;
pub mod udp;

pub use inproc::InprocTransport;
pub use ipc::UnixSocketTransport;
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// Identifier for one peer attached to a transport.
pub type PeerId = u64;

/// The peer id a client-mode link uses for its server.
pub const SERVER_PEER: PeerId = 0;

/// Capacity of the upcall event channel between a transport's I/O tasks
/// and the core consuming it.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Upcalls a transport delivers to the core driving it.
#[derive(Debug)]
pub enum TransportEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId, DisconnectReason),
    Frame(PeerId, Frame),
}

/// Why a peer went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// I/O failure or orderly close by the remote end.
    Transport,
    /// The peer sent bytes that failed to decode; the connection is closed.
    Protocol,
    /// Local teardown.
    Local,
}

/// Synchronous send path shared by a transport and the core using it.
///
/// Each live peer owns a bounded frame queue; a writer task drains it onto
/// the wire. `send` is enqueue-and-return: it never blocks and never
/// silently drops, a saturated queue is reported as `Backpressure`.
pub struct Outbound {
    peers: Mutex<HashMap<PeerId, mpsc::Sender<Frame>>>,
}

impl Outbound {
    pub(crate) fn new() -> Arc<Outbound> {
        Arc::new(Outbound {
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Enqueue one frame for `peer`.
    pub fn send(&self, peer: PeerId, frame: Frame) -> Result<()> {
        let tx = {
            let peers = self.peers.lock().unwrap();
            match peers.get(&peer) {
                Some(tx) => tx.clone(),
                None => return Err(RpcError::Disconnected),
            }
        };
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RpcError::Backpressure),
            Err(TrySendError::Closed(_)) => Err(RpcError::Disconnected),
        }
    }

    pub(crate) fn register(&self, peer: PeerId, tx: mpsc::Sender<Frame>) {
        self.peers.lock().unwrap().insert(peer, tx);
    }

    /// Drop `peer`'s queue. Returns whether the peer was still registered,
    /// so exactly one of the racing I/O tasks emits the disconnect upcall.
    pub(crate) fn remove(&self, peer: PeerId) -> bool {
        self.peers.lock().unwrap().remove(&peer).is_some()
    }

    pub(crate) fn clear(&self) {
        self.peers.lock().unwrap().clear();
    }

    /// Ids of the currently live peers.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().unwrap().is_empty()
    }
}

/// Retire a peer: drop its outbound queue and, if it was still live, emit
/// the disconnect upcall. Reader and writer tasks may race here; the
/// `remove` result arbitrates so the event fires once.
pub(crate) async fn retire_peer(
    outbound: &Outbound,
    events: &mpsc::Sender<TransportEvent>,
    peer: PeerId,
    reason: DisconnectReason,
) {
    if outbound.remove(peer) {
        let _ = events
            .send(TransportEvent::PeerDisconnected(peer, reason))
            .await;
    }
}

/// Uniform adapter contract implemented by all four transports.
#[async_trait]
pub trait Transport: Send {
    /// Bind the endpoint and start accepting peers (server-side roles).
    async fn listen(&mut self, config: &EngineConfig) -> Result<mpsc::Receiver<TransportEvent>>;

    /// Establish a link to the remote endpoint (client-side roles). The
    /// remote end is addressed as [`SERVER_PEER`] afterwards.
    async fn connect(&mut self, config: &EngineConfig) -> Result<mpsc::Receiver<TransportEvent>>;

    /// Handle to the synchronous send path. Stable across reconnects.
    fn outbound(&self) -> Arc<Outbound>;

    /// Tear the endpoint down: abort I/O tasks, close sockets, release
    /// owned resources.
    async fn close(&mut self) -> Result<()>;

    fn name(&self) -> &'static str;

    /// Largest payload one frame may carry over this transport.
    fn max_payload(&self, config: &EngineConfig) -> usize;
}

/// Shared peer-id allocator. Server-side ids start at 1; zero is reserved
/// for [`SERVER_PEER`].
pub(crate) fn peer_id_counter() -> Arc<AtomicU64> {
    Arc::new(AtomicU64::new(1))
}

pub(crate) fn next_peer_id(counter: &AtomicU64) -> PeerId {
    counter.fetch_add(1, Ordering::Relaxed)
}

/// Create the transport matching an address family.
pub fn create(address: &Address) -> Box<dyn Transport> {
    match address {
        Address::Tcp { .. } => Box::new(TcpTransport::new()),
        Address::Udp { .. } => Box::new(UdpTransport::new()),
        Address::Ipc { .. } => Box::new(UnixSocketTransport::new()),
        Address::Inproc { .. } => Box::new(InprocTransport::new()),
    }
}
