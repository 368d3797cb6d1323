//! Framed relay protocol: wire codec, publish side, subscribe side.
//!
//! Addresses are `tcp://host:port` strings. One publisher binds an
//! address; any number of subscribers connect to it. Each subscriber
//! announces itself with a subscribe handshake and is acknowledged by
//! the publisher before any stream frame reaches it, so a late joiner
//! never loses frames to connection-timing races.

use anyhow::{bail, Result};

pub mod framing;
pub mod publisher;
pub mod subscriber;

/// Parse a `tcp://host:port` stream address into a `host:port` string
/// usable with `TcpListener`/`TcpStream`.
///
/// # Errors
///
/// Returns an error for any scheme other than `tcp`, or a missing
/// host/port part.
pub fn parse_addr(addr: &str) -> Result<String> {
    let Some(rest) = addr.strip_prefix("tcp://") else {
        bail!("Unsupported stream address '{addr}' (expected tcp://host:port)");
    };
    if rest.is_empty() || !rest.contains(':') {
        bail!("Invalid stream address '{addr}' (expected tcp://host:port)");
    }
    Ok(rest.to_string())
}
