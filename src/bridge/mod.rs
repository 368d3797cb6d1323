//! Fan-out bridge: re-publish relay streams to browser clients over
//! WebSocket.
//!
//! Each connected client selects a stream by name via a query
//! parameter. Every session gets its own subscription to the relay -
//! the bridge never buffers or coalesces across sessions, so two
//! sessions on the same stream each receive every frame independently.

mod server;
mod session;

pub use server::BridgeServer;
