//! Server core.
//!
//! A [`Server`] accepts inbound frames on its transport and dispatches
//! them to registered handlers. Dispatch is inline on the event order, so
//! over a stream transport responses leave in the order the requests
//! arrived. Handlers respond through the [`RequestContext`], which is
//! consumed by [`RequestContext::respond`]: responding twice is
//! unrepresentable, and a context dropped without responding is flagged in
//! debug builds.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::{EngineConfig, Role};
use crate::error::{Result, RpcError, Status};
use crate::frame::{Frame, FrameKind};
use crate::registry::{Handler, HandlerRegistry};
use crate::transport::{self, Outbound, PeerId, Transport, TransportEvent};

/// RPC server bound to one listening endpoint.
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: EngineConfig,
    transport: AsyncMutex<Box<dyn Transport>>,
    outbound: Arc<Outbound>,
    payload_limit: usize,
    registry: Mutex<HandlerRegistry>,
    started: AtomicBool,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    requests_received: AtomicU64,
    responses_sent: AtomicU64,
}

impl Server {
    /// Build a server from its configuration snapshot.
    pub fn new(config: EngineConfig) -> Result<Server> {
        if config.role != Role::Server {
            return Err(RpcError::InvalidArgument(format!(
                "server constructed with role {:?}",
                config.role
            )));
        }
        let boxed = transport::create(&config.address);
        let outbound = boxed.outbound();
        let payload_limit = boxed.max_payload(&config);
        Ok(Server {
            inner: Arc::new(ServerInner {
                config,
                transport: AsyncMutex::new(boxed),
                outbound,
                payload_limit,
                registry: Mutex::new(HandlerRegistry::new()),
                started: AtomicBool::new(false),
                dispatch: Mutex::new(None),
                requests_received: AtomicU64::new(0),
                responses_sent: AtomicU64::new(0),
            }),
        })
    }

    /// Bind `handler` under `method`. Only permitted before
    /// [`start`](Server::start).
    pub fn register<F>(&self, method: &str, handler: F) -> Result<()>
    where
        F: Fn(RequestContext, &[u8]) + Send + Sync + 'static,
    {
        self.inner
            .registry
            .lock()
            .unwrap()
            .register(method, Arc::new(handler))
    }

    /// Freeze the registry, bind the transport, and begin dispatching.
    /// A started server cannot be started again.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(RpcError::InvalidState("server already started"));
        }
        self.inner.registry.lock().unwrap().freeze();

        let events = match self.inner.transport.lock().await.listen(&self.inner.config).await {
            Ok(events) => events,
            Err(e) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        debug!("server started on {}", self.inner.config.address);

        let dispatch = tokio::spawn(dispatch(self.inner.clone(), events));
        *self.inner.dispatch.lock().unwrap() = Some(dispatch);
        Ok(())
    }

    /// Close the transport and stop dispatching. Connected clients observe
    /// a disconnect.
    pub async fn stop(&self) -> Result<()> {
        if let Some(dispatch) = self.inner.dispatch.lock().unwrap().take() {
            dispatch.abort();
        }
        self.inner.transport.lock().await.close().await?;
        debug!("server on {} stopped", self.inner.config.address);
        Ok(())
    }

    /// Requests (including oneways) accepted so far.
    pub fn requests_received(&self) -> u64 {
        self.inner.requests_received.load(Ordering::Relaxed)
    }

    /// Responses put on the wire so far, error replies included.
    pub fn responses_sent(&self) -> u64 {
        self.inner.responses_sent.load(Ordering::Relaxed)
    }

    /// Peers currently attached to the transport.
    pub fn connected_peers(&self) -> usize {
        self.inner.outbound.len()
    }
}

/// Everything a handler needs to answer one request.
///
/// `respond` consumes the context, which is what makes the at-most-one
/// response rule structural. For a oneway request responding is disabled.
pub struct RequestContext {
    server: Arc<ServerInner>,
    peer: PeerId,
    msgid: u32,
    method: String,
    oneway: bool,
    responded: bool,
}

impl RequestContext {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn msgid(&self) -> u32 {
        self.msgid
    }

    pub fn is_oneway(&self) -> bool {
        self.oneway
    }

    /// Send the response for this request. Consumes the context; at most
    /// one response can ever leave for a given request.
    pub fn respond(mut self, status: Status, payload: &[u8]) -> Result<()> {
        if self.oneway {
            return Err(RpcError::InvalidState(
                "a oneway request does not take a response",
            ));
        }
        self.responded = true;
        if payload.len() > self.server.payload_limit {
            return Err(RpcError::InvalidArgument(format!(
                "payload of {} bytes exceeds the {}-byte limit",
                payload.len(),
                self.server.payload_limit
            )));
        }
        self.server
            .outbound
            .send(self.peer, Frame::response(self.msgid, status, payload.to_vec()))?;
        self.server.responses_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        // A request that never gets a response is only observable to the
        // client as a timeout or disconnect; flag it where it is cheap.
        if cfg!(debug_assertions) && !self.responded && !self.oneway && !std::thread::panicking() {
            warn!(
                "request {:?} (msgid {}) dropped without a response",
                self.method, self.msgid
            );
        }
    }
}

async fn dispatch(inner: Arc<ServerInner>, mut events: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Frame(peer, frame) => inner.dispatch_frame(peer, frame),
            TransportEvent::PeerConnected(peer) => debug!("peer {} connected", peer),
            TransportEvent::PeerDisconnected(peer, reason) => {
                debug!("peer {} disconnected: {:?}", peer, reason)
            }
        }
    }
}

impl ServerInner {
    fn dispatch_frame(self: &Arc<Self>, peer: PeerId, frame: Frame) {
        let oneway = match frame.kind {
            FrameKind::Request => false,
            FrameKind::Oneway => true,
            other => {
                debug!("server ignoring inbound {:?} frame from peer {}", other, peer);
                return;
            }
        };
        self.requests_received.fetch_add(1, Ordering::Relaxed);

        let handler = self.registry.lock().unwrap().lookup(&frame.method);
        let Some(handler) = handler else {
            debug!("no handler for method {:?}", frame.method);
            if !oneway {
                self.send_status(peer, frame.msgid, Status::MethodNotFound);
            }
            return;
        };

        self.invoke(handler, peer, frame, oneway);
    }

    /// Run one handler with the borrowed payload. A panicking handler is
    /// answered with `InternalError` and the connection stays usable.
    fn invoke(self: &Arc<Self>, handler: Handler, peer: PeerId, frame: Frame, oneway: bool) {
        let ctx = RequestContext {
            server: self.clone(),
            peer,
            msgid: frame.msgid,
            method: frame.method.clone(),
            oneway,
            responded: false,
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(ctx, &frame.payload)));
        if outcome.is_err() {
            error!("handler for {:?} panicked", frame.method);
            if !oneway {
                self.send_status(peer, frame.msgid, Status::InternalError);
            }
        }
    }

    fn send_status(&self, peer: PeerId, msgid: u32, status: Status) {
        match self.outbound.send(peer, Frame::response(msgid, status, Vec::new())) {
            Ok(()) => {
                self.responses_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(
                "failed to send {:?} reply to peer {}: {}",
                status, peer, e
            ),
        }
    }
}
