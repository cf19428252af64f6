//! Transport address parsing.
//!
//! Engines are wired to an endpoint through a URL of the shape
//! `<transport>://<location>`:
//!
//! - `tcp://<host>:<port>` and `udp://<host>:<port>`: hostname or IP
//!   literal, port in 1-65535;
//! - `ipc://<path>`: filesystem path of a Unix-domain socket;
//! - `inproc://<name>`: opaque non-empty rendezvous name, process-wide.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::RpcError;

/// A parsed transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Tcp { host: String, port: u16 },
    Udp { host: String, port: u16 },
    Ipc { path: PathBuf },
    Inproc { name: String },
}

impl Address {
    /// URL scheme for this address family.
    pub fn scheme(&self) -> &'static str {
        match self {
            Address::Tcp { .. } => "tcp",
            Address::Udp { .. } => "udp",
            Address::Ipc { .. } => "ipc",
            Address::Inproc { .. } => "inproc",
        }
    }

    /// Whether frames travel over a connected byte stream (and therefore
    /// carry a length prefix on the wire).
    pub fn is_stream(&self) -> bool {
        matches!(self, Address::Tcp { .. } | Address::Ipc { .. })
    }

    /// Whether the endpoint is a datagram socket.
    pub fn is_datagram(&self) -> bool {
        matches!(self, Address::Udp { .. })
    }
}

fn parse_host_port(scheme: &str, location: &str) -> Result<(String, u16), RpcError> {
    let (host, port) = location.rsplit_once(':').ok_or_else(|| {
        RpcError::InvalidArgument(format!("{scheme} address {location:?} is missing a port"))
    })?;
    if host.is_empty() {
        return Err(RpcError::InvalidArgument(format!(
            "{scheme} address {location:?} has an empty host"
        )));
    }
    let port: u16 = port.parse().map_err(|_| {
        RpcError::InvalidArgument(format!("{scheme} address {location:?} has an invalid port"))
    })?;
    if port == 0 {
        return Err(RpcError::InvalidArgument(format!(
            "{scheme} port must be in 1-65535"
        )));
    }
    Ok((host.to_string(), port))
}

impl FromStr for Address {
    type Err = RpcError;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        let (scheme, location) = url.split_once("://").ok_or_else(|| {
            RpcError::InvalidArgument(format!(
                "address {url:?} is not of the form <transport>://<location>"
            ))
        })?;
        match scheme {
            "tcp" => {
                let (host, port) = parse_host_port("tcp", location)?;
                Ok(Address::Tcp { host, port })
            }
            "udp" => {
                let (host, port) = parse_host_port("udp", location)?;
                Ok(Address::Udp { host, port })
            }
            "ipc" => {
                if location.is_empty() {
                    return Err(RpcError::InvalidArgument(
                        "ipc address has an empty path".to_string(),
                    ));
                }
                Ok(Address::Ipc {
                    path: PathBuf::from(location),
                })
            }
            "inproc" => {
                if location.is_empty() {
                    return Err(RpcError::InvalidArgument(
                        "inproc address has an empty name".to_string(),
                    ));
                }
                Ok(Address::Inproc {
                    name: location.to_string(),
                })
            }
            other => Err(RpcError::InvalidArgument(format!(
                "unknown transport scheme {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Address::Udp { host, port } => write!(f, "udp://{host}:{port}"),
            Address::Ipc { path } => write!(f, "ipc://{}", path.display()),
            Address::Inproc { name } => write!(f, "inproc://{name}"),
        }
    }
}
