//! Broadcast layer: publisher fan-out and topic-filtered subscribers.
//!
//! A publisher emits `PubMessage` frames to every attached subscriber
//! (stream and inproc transports) or to its configured unicast target
//! (UDP). Filtering happens on the subscriber side: a subscription is a
//! topic *prefix*, and every callback whose prefix starts the message's
//! topic fires, in registration order. The empty prefix matches all
//! topics.
//!
//! `publish` reports the local send outcome only, never delivery: over
//! streams per-subscriber ordering is preserved, over datagrams nothing is
//! guaranteed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::address::Address;
use crate::config::{EngineConfig, Role};
use crate::error::{Result, RpcError};
use crate::frame::{self, Frame, FrameKind};
use crate::transport::{self, Outbound, Transport, TransportEvent};

/// Subscription callback, fired with the message topic and a payload view
/// valid only during the call.
pub type TopicCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync + 'static>;

/// Ordered set of (topic-prefix, callback) pairs.
pub struct SubscriptionTable {
    entries: Vec<(String, TopicCallback)>,
}

impl SubscriptionTable {
    fn new() -> SubscriptionTable {
        SubscriptionTable {
            entries: Vec::new(),
        }
    }

    fn add(&mut self, prefix: &str, callback: TopicCallback) {
        self.entries.push((prefix.to_string(), callback));
    }

    /// Remove every entry registered under exactly `prefix`.
    fn remove(&mut self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(p, _)| p != prefix);
        before - self.entries.len()
    }

    /// Callbacks whose prefix starts `topic`, in registration order.
    fn matching(&self, topic: &str) -> Vec<TopicCallback> {
        self.entries
            .iter()
            .filter(|(prefix, _)| topic.as_bytes().starts_with(prefix.as_bytes()))
            .map(|(_, callback)| callback.clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Broadcast publisher bound to one endpoint.
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    config: EngineConfig,
    transport: AsyncMutex<Box<dyn Transport>>,
    outbound: Arc<Outbound>,
    payload_limit: usize,
    started: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Publisher {
    pub fn new(config: EngineConfig) -> Result<Publisher> {
        if config.role != Role::Publisher {
            return Err(RpcError::InvalidArgument(format!(
                "publisher constructed with role {:?}",
                config.role
            )));
        }
        let boxed = transport::create(&config.address);
        let outbound = boxed.outbound();
        let payload_limit = boxed.max_payload(&config);
        Ok(Publisher {
            inner: Arc::new(PublisherInner {
                config,
                transport: AsyncMutex::new(boxed),
                outbound,
                payload_limit,
                started: AtomicBool::new(false),
                driver: Mutex::new(None),
            }),
        })
    }

    /// Bring the publish endpoint up. Stream and inproc publishers listen
    /// and let subscribers attach; a UDP publisher binds toward its
    /// configured unicast target.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(RpcError::InvalidState("publisher already started"));
        }
        let bring_up = async {
            let mut transport = self.inner.transport.lock().await;
            match self.inner.config.address {
                Address::Udp { .. } => transport.connect(&self.inner.config).await,
                _ => transport.listen(&self.inner.config).await,
            }
        };
        let events = match bring_up.await {
            Ok(events) => events,
            Err(e) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        debug!("publisher started on {}", self.inner.config.address);

        // Subscribers never send frames; the driver only tracks lifecycle.
        let driver = tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::PeerConnected(peer) => {
                        debug!("subscriber {} attached", peer)
                    }
                    TransportEvent::PeerDisconnected(peer, reason) => {
                        debug!("subscriber {} detached: {:?}", peer, reason)
                    }
                    TransportEvent::Frame(peer, _) => {
                        debug!("ignoring inbound frame from subscriber {}", peer)
                    }
                }
            }
        });
        *self.inner.driver.lock().unwrap() = Some(driver);
        Ok(())
    }

    /// Emit one publication to every attached subscriber. The result is
    /// the local enqueue outcome: if any subscriber's queue was saturated
    /// the call reports `Backpressure`, after still enqueueing to the
    /// others. Delivery is not acknowledged.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(RpcError::InvalidState("publisher is not started"));
        }
        if topic.len() > frame::MAX_SHORT_FIELD {
            return Err(RpcError::InvalidArgument(format!(
                "topic of {} bytes exceeds the {}-byte limit",
                topic.len(),
                frame::MAX_SHORT_FIELD
            )));
        }
        if payload.len() > self.inner.payload_limit {
            return Err(RpcError::InvalidArgument(format!(
                "payload of {} bytes exceeds the {}-byte limit",
                payload.len(),
                self.inner.payload_limit
            )));
        }

        let mut saturated = false;
        for peer in self.inner.outbound.peers() {
            match self
                .inner
                .outbound
                .send(peer, Frame::publication(topic, payload.to_vec()))
            {
                Ok(()) => {}
                Err(RpcError::Backpressure) => {
                    warn!("subscriber {} queue saturated; publication delayed", peer);
                    saturated = true;
                }
                // The peer raced away between the snapshot and the send;
                // the transport retires it on its own.
                Err(_) => {}
            }
        }
        if saturated {
            Err(RpcError::Backpressure)
        } else {
            Ok(())
        }
    }

    /// Subscribers currently attached (always 1 for a UDP publisher).
    pub fn subscriber_count(&self) -> usize {
        self.inner.outbound.len()
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(driver) = self.inner.driver.lock().unwrap().take() {
            driver.abort();
        }
        self.inner.transport.lock().await.close().await?;
        self.inner.started.store(false, Ordering::SeqCst);
        debug!("publisher on {} stopped", self.inner.config.address);
        Ok(())
    }
}

/// Broadcast subscriber with prefix-filtered callbacks.
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

struct SubscriberInner {
    config: EngineConfig,
    transport: AsyncMutex<Box<dyn Transport>>,
    subscriptions: Mutex<SubscriptionTable>,
    connected: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    pub fn new(config: EngineConfig) -> Result<Subscriber> {
        if config.role != Role::Subscriber {
            return Err(RpcError::InvalidArgument(format!(
                "subscriber constructed with role {:?}",
                config.role
            )));
        }
        let boxed = transport::create(&config.address);
        Ok(Subscriber {
            inner: Arc::new(SubscriberInner {
                config,
                transport: AsyncMutex::new(boxed),
                subscriptions: Mutex::new(SubscriptionTable::new()),
                connected: AtomicBool::new(false),
                driver: Mutex::new(None),
            }),
        })
    }

    /// Bind the receive side: attach to the publisher (stream, inproc) or
    /// bind the datagram endpoint (UDP).
    pub async fn connect(&self) -> Result<()> {
        if self.inner.connected.swap(true, Ordering::SeqCst) {
            return Err(RpcError::InvalidState("subscriber already connected"));
        }
        let bring_up = async {
            let mut transport = self.inner.transport.lock().await;
            match self.inner.config.address {
                Address::Udp { .. } => transport.listen(&self.inner.config).await,
                _ => transport.connect(&self.inner.config).await,
            }
        };
        let events = match bring_up.await {
            Ok(events) => events,
            Err(e) => {
                self.inner.connected.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        debug!("subscriber connected to {}", self.inner.config.address);

        let inner = self.inner.clone();
        let driver = tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Frame(_, frame) if frame.kind == FrameKind::PubMessage => {
                        inner.deliver(&frame.topic, &frame.payload);
                    }
                    TransportEvent::Frame(peer, frame) => {
                        debug!("ignoring {:?} frame from peer {}", frame.kind, peer)
                    }
                    TransportEvent::PeerConnected(_) => {}
                    TransportEvent::PeerDisconnected(_, reason) => {
                        warn!(
                            "subscription link to {} lost: {:?}",
                            inner.config.address, reason
                        );
                    }
                }
            }
        });
        *self.inner.driver.lock().unwrap() = Some(driver);
        Ok(())
    }

    /// Register a callback for every topic starting with `prefix`. The
    /// empty prefix matches all topics.
    pub fn subscribe<F>(&self, prefix: &str, callback: F) -> Result<()>
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        if prefix.len() > frame::MAX_SHORT_FIELD {
            return Err(RpcError::InvalidArgument(format!(
                "prefix of {} bytes exceeds the {}-byte limit",
                prefix.len(),
                frame::MAX_SHORT_FIELD
            )));
        }
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .add(prefix, Arc::new(callback));
        Ok(())
    }

    /// Drop every subscription registered under exactly `prefix`; returns
    /// how many were removed.
    pub fn unsubscribe(&self, prefix: &str) -> usize {
        self.inner.subscriptions.lock().unwrap().remove(prefix)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().unwrap().len()
    }

    pub async fn disconnect(&self) -> Result<()> {
        if let Some(driver) = self.inner.driver.lock().unwrap().take() {
            driver.abort();
        }
        self.inner.transport.lock().await.close().await?;
        self.inner.connected.store(false, Ordering::SeqCst);
        debug!("subscriber detached from {}", self.inner.config.address);
        Ok(())
    }
}

impl SubscriberInner {
    /// Fire every matching callback in registration order. The
    /// subscription lock is released before any callback runs, so
    /// callbacks may subscribe and unsubscribe freely.
    fn deliver(&self, topic: &str, payload: &[u8]) {
        let matched = self.subscriptions.lock().unwrap().matching(topic);
        for callback in matched {
            callback(topic, payload);
        }
    }
}
