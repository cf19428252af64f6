//! Error taxonomy and wire-level status codes.
//!
//! Two layers are kept deliberately separate:
//!
//! - [`RpcError`] is what the engine's API surfaces to callers. Synchronous
//!   failures are returned from the offending call; asynchronous outcomes
//!   arrive through completions as a [`Status`].
//! - [`Status`] is the signed integer carried in the `status` field of
//!   response frames. It survives the wire, so its numeric values are fixed.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors produced by the engine.
///
/// Propagation policy: synchronous errors are returned from the offending
/// call; asynchronous errors are delivered via the completion or lifecycle
/// path. The engine never silently drops a user-initiated send except for a
/// datagram whose transmission the OS loses; every other refusal surfaces
/// [`RpcError::Backpressure`].
#[derive(Debug, Error)]
pub enum RpcError {
    /// Malformed caller input: bad address, empty method, oversized field.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not permitted in the current state, e.g. registering a
    /// handler after `start()` or calling before a connect completes.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The named method is unknown to the server.
    #[error("method not found")]
    MethodNotFound,

    /// A handler is already registered under this method name.
    #[error("already registered: {0}")]
    AlreadyExists(String),

    /// The pending table or a transport outbound queue is full. In-flight
    /// work has to drain before the engine accepts more.
    #[error("backpressure: outbound work has not drained")]
    Backpressure,

    /// The per-call deadline elapsed before a response arrived.
    #[error("deadline elapsed before a response arrived")]
    Timeout,

    /// The peer closed, or `disconnect()` was invoked locally.
    #[error("disconnected")]
    Disconnected,

    /// An inbound frame failed to decode. The offending connection is
    /// closed after this is logged.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An underlying I/O failure.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    /// A server-side handler failed.
    #[error("handler failed")]
    InternalError,
}

/// Wire-level response status, carried as a little-endian `i32` in the
/// `status` header field. `Ok` is zero; every failure kind is negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    InvalidArgument,
    InvalidState,
    MethodNotFound,
    AlreadyExists,
    Backpressure,
    Timeout,
    Disconnected,
    Protocol,
    Transport,
    InternalError,
}

impl Status {
    /// Numeric code written into the frame header.
    pub fn as_wire(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::InvalidArgument => -1,
            Status::InvalidState => -2,
            Status::MethodNotFound => -3,
            Status::AlreadyExists => -4,
            Status::Backpressure => -5,
            Status::Timeout => -6,
            Status::Disconnected => -7,
            Status::Protocol => -8,
            Status::Transport => -9,
            Status::InternalError => -10,
        }
    }

    /// Decode a wire code. Codes outside the taxonomy collapse to
    /// `InternalError`; peers speaking a newer revision still get a
    /// failure the caller can act on.
    pub fn from_wire(code: i32) -> Status {
        match code {
            0 => Status::Ok,
            -1 => Status::InvalidArgument,
            -2 => Status::InvalidState,
            -3 => Status::MethodNotFound,
            -4 => Status::AlreadyExists,
            -5 => Status::Backpressure,
            -6 => Status::Timeout,
            -7 => Status::Disconnected,
            -8 => Status::Protocol,
            -9 => Status::Transport,
            _ => Status::InternalError,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_codes_round_trip() {
        let all = [
            Status::Ok,
            Status::InvalidArgument,
            Status::InvalidState,
            Status::MethodNotFound,
            Status::AlreadyExists,
            Status::Backpressure,
            Status::Timeout,
            Status::Disconnected,
            Status::Protocol,
            Status::Transport,
            Status::InternalError,
        ];
        for status in all {
            assert_eq!(Status::from_wire(status.as_wire()), status);
        }
    }

    #[test]
    fn unknown_wire_code_maps_to_internal_error() {
        assert_eq!(Status::from_wire(-99), Status::InternalError);
        assert_eq!(Status::from_wire(7), Status::InternalError);
    }
}
