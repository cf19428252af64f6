//! Engine configuration.
//!
//! An [`EngineConfig`] is assembled by the caller and handed to an engine
//! constructor, which snapshots it. There is no post-construction mutation:
//! every knob an engine consults comes from the bundle it was built with.

use crate::address::Address;
use crate::defaults;

/// Which side of the protocol an engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
    Publisher,
    Subscriber,
}

/// Trade-off between per-message latency and bulk throughput.
///
/// Low-latency mode disables Nagle's algorithm on TCP links; high-throughput
/// mode leaves coalescing to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceMode {
    LowLatency,
    HighThroughput,
}

/// Immutable configuration bundle for one engine instance.
///
/// Construct with [`EngineConfig::new`] and adjust fields before passing the
/// bundle to `Client::new` / `Server::new` / `Publisher::new` /
/// `Subscriber::new`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Endpoint the engine listens on or connects to.
    pub address: Address,

    /// Role the engine plays; must match the constructor it is given to.
    pub role: Role,

    /// Capacity of the client's pending-call table. A `call` issued while
    /// this many responses are outstanding fails with `Backpressure`.
    pub max_pending_callbacks: usize,

    /// Bound on per-peer outbound queues and on concurrently accepted
    /// connections. Inproc attachment queues use this capacity too.
    pub max_concurrent: usize,

    /// Latency/throughput trade-off applied to stream sockets.
    pub performance_mode: PerformanceMode,

    /// SO_SNDBUF for sockets that support it.
    pub send_buffer_bytes: usize,

    /// SO_RCVBUF for sockets that support it. Also bounds the UDP datagram
    /// size, and with it the UDP payload limit.
    pub recv_buffer_bytes: usize,

    /// First reconnect delay after a failed client connect attempt.
    pub reconnect_initial_ms: u64,

    /// Cap on the doubling reconnect delay.
    pub reconnect_max_ms: u64,

    /// SO_LINGER applied to stream sockets; zero disables it.
    pub linger_ms: u64,

    /// Upper bound on a single frame's payload.
    pub max_payload_bytes: usize,
}

impl EngineConfig {
    /// A configuration with the crate defaults for everything but the
    /// endpoint and role.
    pub fn new(address: Address, role: Role) -> Self {
        Self {
            address,
            role,
            max_pending_callbacks: defaults::MAX_PENDING_CALLBACKS,
            max_concurrent: defaults::MAX_CONCURRENT,
            performance_mode: PerformanceMode::LowLatency,
            send_buffer_bytes: defaults::SEND_BUFFER_BYTES,
            recv_buffer_bytes: defaults::RECV_BUFFER_BYTES,
            reconnect_initial_ms: defaults::RECONNECT_INITIAL_MS,
            reconnect_max_ms: defaults::RECONNECT_MAX_MS,
            linger_ms: defaults::LINGER_MS,
            max_payload_bytes: defaults::MAX_PAYLOAD_BYTES,
        }
    }
}
