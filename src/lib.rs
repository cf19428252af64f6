//! # wirecall
//!
//! A single-process, event-loop-driven RPC engine. Two peer roles,
//! server and client, are bound by four interchangeable transports
//! (TCP, UDP, Unix-domain IPC, and in-process queues) and two interaction
//! patterns (request/response and publish/subscribe).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │ Client /     │───▶│    Transport     │───▶│    Specific     │
//! │ Server /     │    │      trait       │    │ implementation  │
//! │ Pub / Sub    │    │  (abstraction)   │    │ (tcp/udp/ipc/…) │
//! └──────────────┘    └──────────────────┘    └─────────────────┘
//! ```
//!
//! A caller registers named handlers on a [`Server`]; a caller issues
//! named calls on a [`Client`]; the engine routes framed binary payloads
//! between them with completion callbacks, or fire-and-forget via
//! `call_oneway`. The broadcast topology ([`Publisher`]/[`Subscriber`])
//! fans publications out to topic-prefix-filtered subscribers.
//!
//! ## Concurrency Model
//!
//! Engines are driven by tasks spawned on the caller's Tokio runtime.
//! `call`, `call_oneway`, `publish`, and `respond` are enqueue-and-return;
//! completions, handlers, and subscription callbacks are invoked only from
//! engine driver tasks, never synchronously from an API call, so
//! re-entrant use from inside a callback cannot deadlock.
//!
//! ## Backpressure
//!
//! The engine refuses work instead of dropping it: a full pending-call
//! table or a saturated per-peer outbound queue surfaces as
//! [`RpcError::Backpressure`] from the offending call. The only silent
//! loss is a datagram the OS itself loses.

pub mod address;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod pending;
pub mod pubsub;
pub mod registry;
pub mod server;
pub mod transport;

pub use address::Address;
pub use client::{Client, ConnectionState};
pub use config::{EngineConfig, PerformanceMode, Role};
pub use error::{Result, RpcError, Status};
pub use frame::{Frame, FrameKind};
pub use pubsub::{Publisher, Subscriber};
pub use server::{RequestContext, Server};
pub use transport::{PeerId, Transport};

/// The current version of the engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// Capacity of a client's pending-call table.
    pub const MAX_PENDING_CALLBACKS: usize = 64;

    /// Bound on per-peer outbound queues and accepted connections.
    pub const MAX_CONCURRENT: usize = 128;

    /// Default socket send buffer.
    pub const SEND_BUFFER_BYTES: usize = 64 * 1024;

    /// Default socket receive buffer.
    pub const RECV_BUFFER_BYTES: usize = 64 * 1024;

    /// First reconnect delay after a failed connect attempt.
    pub const RECONNECT_INITIAL_MS: u64 = 100;

    /// Cap on the doubling reconnect delay.
    pub const RECONNECT_MAX_MS: u64 = 10_000;

    /// SO_LINGER applied to stream sockets.
    pub const LINGER_MS: u64 = 1_000;

    /// Upper bound on a single frame's payload.
    pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;
}
