//! Client core.
//!
//! A [`Client`] issues named calls against one remote server. `call` is
//! enqueue-and-return: it allocates a msgid, records the completion in the
//! pending table, and hands the encoded request to the transport, all
//! without blocking. The completion fires later, exactly once, from the
//! client's driver task, never synchronously from inside `call`, so
//! re-entrant calls from inside a completion cannot deadlock.
//!
//! The connection lifecycle is
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──success──► Connected
//!       ▲                         │                       │
//!       │                         │ failure               │ transport error /
//!       │                         ▼                       │ disconnect()
//!       └────────────────── (retry with backoff) ◄────────┘
//! ```
//!
//! with the retry delay doubling from `reconnect_initial_ms` up to
//! `reconnect_max_ms` and resetting on success.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{EngineConfig, Role};
use crate::error::{Result, RpcError, Status};
use crate::frame::{self, Frame, FrameKind};
use crate::pending::{Completion, PendingEntry, PendingTable};
use crate::transport::{self, Outbound, Transport, TransportEvent, SERVER_PEER};

/// Where a client stands in the connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// RPC client bound to one server endpoint.
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: EngineConfig,
    transport: AsyncMutex<Box<dyn Transport>>,
    outbound: Arc<Outbound>,
    payload_limit: usize,
    state: Mutex<ConnectionState>,
    pending: Mutex<PendingTable>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Build a client from its configuration snapshot.
    pub fn new(config: EngineConfig) -> Result<Client> {
        if config.role != Role::Client {
            return Err(RpcError::InvalidArgument(format!(
                "client constructed with role {:?}",
                config.role
            )));
        }
        let boxed = transport::create(&config.address);
        let outbound = boxed.outbound();
        let payload_limit = boxed.max_payload(&config);
        let pending = PendingTable::new(config.max_pending_callbacks);
        Ok(Client {
            inner: Arc::new(ClientInner {
                config,
                transport: AsyncMutex::new(boxed),
                outbound,
                payload_limit,
                state: Mutex::new(ConnectionState::Disconnected),
                pending: Mutex::new(pending),
                driver: Mutex::new(None),
            }),
        })
    }

    /// Establish the link, retrying with bounded exponential backoff until
    /// it comes up. The returned future resolves exactly once per
    /// invocation: `Ok` when connected, `Err(Disconnected)` when a
    /// concurrent [`disconnect`](Client::disconnect) cancels the attempt.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
                ConnectionState::Connecting => {
                    return Err(RpcError::InvalidState("connect is already in progress"))
                }
                ConnectionState::Connected => {
                    return Err(RpcError::InvalidState("client is already connected"))
                }
                ConnectionState::Closing => {
                    return Err(RpcError::InvalidState("client is closing"))
                }
            }
        }

        let events = self.inner.connect_with_backoff().await?;

        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != ConnectionState::Connecting {
                // disconnect() raced the final attempt; it owns the teardown.
                return Err(RpcError::Disconnected);
            }
            *state = ConnectionState::Connected;
        }
        let driver = tokio::spawn(drive(self.inner.clone(), events));
        *self.inner.driver.lock().unwrap() = Some(driver);
        debug!("connected to {}", self.inner.config.address);
        Ok(())
    }

    /// Issue a call. `completion` fires exactly once with the outcome,
    /// from the driver task.
    pub fn call<F>(&self, method: &str, payload: &[u8], completion: F) -> Result<()>
    where
        F: FnOnce(Status, &[u8]) + Send + 'static,
    {
        self.call_inner(method, payload, None, Box::new(completion))
    }

    /// Like [`call`](Client::call), with a deadline. If no response arrives
    /// in time the completion fires with `Timeout` and a late response is
    /// silently dropped.
    pub fn call_with_deadline<F>(
        &self,
        method: &str,
        payload: &[u8],
        deadline: Duration,
        completion: F,
    ) -> Result<()>
    where
        F: FnOnce(Status, &[u8]) + Send + 'static,
    {
        self.call_inner(method, payload, Some(deadline), Box::new(completion))
    }

    /// Fire-and-forget call: no msgid, no pending entry, no completion.
    /// A saturated outbound queue fails with `Backpressure`; the message
    /// is then not enqueued. Silent dropping is not an outcome.
    pub fn call_oneway(&self, method: &str, payload: &[u8]) -> Result<()> {
        self.inner.check_connected()?;
        validate_method(method)?;
        self.inner.validate_payload(payload)?;
        self.inner
            .outbound
            .send(SERVER_PEER, Frame::oneway(method, payload.to_vec()))
    }

    /// Tear the connection down. Every outstanding completion fires with
    /// `Disconnected` before this returns; afterwards no completion fires
    /// and `call` fails with `InvalidState`. Also cancels an in-flight
    /// `connect`.
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                ConnectionState::Disconnected => return Ok(()),
                ConnectionState::Closing => {
                    return Err(RpcError::InvalidState("disconnect is already in progress"))
                }
                _ => *state = ConnectionState::Closing,
            }
        }
        if let Some(driver) = self.inner.driver.lock().unwrap().take() {
            driver.abort();
        }
        self.inner.fail_pending();
        self.inner.transport.lock().await.close().await?;
        *self.inner.state.lock().unwrap() = ConnectionState::Disconnected;
        debug!("disconnected from {}", self.inner.config.address);
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    /// Number of calls whose completion has not fired yet.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    fn call_inner(
        &self,
        method: &str,
        payload: &[u8],
        deadline: Option<Duration>,
        completion: Completion,
    ) -> Result<()> {
        let inner = &self.inner;
        inner.check_connected()?;
        validate_method(method)?;
        inner.validate_payload(payload)?;

        let msgid = {
            let mut pending = inner.pending.lock().unwrap();
            match pending.insert(PendingEntry {
                completion,
                deadline,
                inserted_at: Instant::now(),
            }) {
                Ok(msgid) => msgid,
                Err(_refused) => return Err(RpcError::Backpressure),
            }
        };

        if let Err(e) = inner
            .outbound
            .send(SERVER_PEER, Frame::request(msgid, method, payload.to_vec()))
        {
            // The wire was not touched; roll the insertion back so the
            // completion never fires for a call that was never issued.
            inner.pending.lock().unwrap().take(msgid);
            return Err(e);
        }

        if let Some(deadline) = deadline {
            inner.spawn_deadline(msgid, deadline);
        }
        Ok(())
    }
}

impl ClientInner {
    fn check_connected(&self) -> Result<()> {
        if *self.state.lock().unwrap() == ConnectionState::Connected {
            Ok(())
        } else {
            Err(RpcError::InvalidState("client is not connected"))
        }
    }

    fn validate_payload(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.payload_limit {
            return Err(RpcError::InvalidArgument(format!(
                "payload of {} bytes exceeds the {}-byte limit",
                payload.len(),
                self.payload_limit
            )));
        }
        Ok(())
    }

    /// Attempt the transport connect until it succeeds or the state leaves
    /// `Connecting`. The delay doubles per failure, caps at
    /// `reconnect_max_ms`, and restarts from the initial value on the next
    /// lifecycle.
    async fn connect_with_backoff(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let initial = Duration::from_millis(self.config.reconnect_initial_ms.max(1));
        let cap = initial.max(Duration::from_millis(self.config.reconnect_max_ms));
        let mut delay = initial;
        loop {
            if *self.state.lock().unwrap() != ConnectionState::Connecting {
                return Err(RpcError::Disconnected);
            }
            let attempt = {
                let mut transport = self.transport.lock().await;
                transport.connect(&self.config).await
            };
            match attempt {
                Ok(events) => return Ok(events),
                Err(e) => {
                    debug!(
                        "connect to {} failed: {}; next attempt in {:?}",
                        self.config.address, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(cap);
                }
            }
        }
    }

    /// Route one inbound frame. Only responses matter to a client.
    fn deliver(&self, frame: Frame) {
        match frame.kind {
            FrameKind::Response => {
                let entry = self.pending.lock().unwrap().take(frame.msgid);
                match entry {
                    Some(entry) => {
                        (entry.completion)(Status::from_wire(frame.status), &frame.payload);
                    }
                    // Deadline expiry or a wrap collision already consumed
                    // the entry.
                    None => debug!("dropping response for unknown msgid {}", frame.msgid),
                }
            }
            other => debug!("client ignoring inbound {:?} frame", other),
        }
    }

    /// Complete every outstanding call with `Disconnected`.
    fn fail_pending(&self) {
        let drained = self.pending.lock().unwrap().drain();
        if drained.is_empty() {
            return;
        }
        debug!("failing {} outstanding calls", drained.len());
        for (_msgid, entry) in drained {
            (entry.completion)(Status::Disconnected, &[]);
        }
    }

    fn spawn_deadline(self: &Arc<Self>, msgid: u32, deadline: Duration) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let entry = inner.pending.lock().unwrap().take(msgid);
            if let Some(entry) = entry {
                debug!("call {} timed out after {:?}", msgid, deadline);
                (entry.completion)(Status::Timeout, &[]);
            }
        });
    }
}

fn validate_method(method: &str) -> Result<()> {
    if method.is_empty() {
        return Err(RpcError::InvalidArgument("empty method name".to_string()));
    }
    if method.len() > frame::MAX_SHORT_FIELD {
        return Err(RpcError::InvalidArgument(format!(
            "method of {} bytes exceeds the {}-byte limit",
            method.len(),
            frame::MAX_SHORT_FIELD
        )));
    }
    Ok(())
}

/// Event-consuming driver. Lives for the whole connected lifetime of the
/// client, across reconnects; exits when the client closes.
async fn drive(inner: Arc<ClientInner>, mut events: mpsc::Receiver<TransportEvent>) {
    loop {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Frame(_, frame) => inner.deliver(frame),
                TransportEvent::PeerConnected(_) => {}
                TransportEvent::PeerDisconnected(_, reason) => {
                    debug!("link to {} went down: {:?}", inner.config.address, reason);
                    break;
                }
            }
        }

        // The link is gone, one way or another.
        inner.fail_pending();
        {
            let mut state = inner.state.lock().unwrap();
            match *state {
                ConnectionState::Closing | ConnectionState::Disconnected => return,
                _ => *state = ConnectionState::Connecting,
            }
        }
        warn!("connection to {} lost; reconnecting", inner.config.address);

        match inner.connect_with_backoff().await {
            Ok(fresh) => {
                let mut state = inner.state.lock().unwrap();
                if *state != ConnectionState::Connecting {
                    return;
                }
                *state = ConnectionState::Connected;
                drop(state);
                debug!("reconnected to {}", inner.config.address);
                events = fresh;
            }
            // Cancelled by disconnect().
            Err(_) => return,
        }
    }
}
