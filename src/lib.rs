//! Ptycast - command output relay over a TCP pub/sub protocol.
//!
//! Runs a shell command on a pseudo-terminal, publishes its raw output as
//! discrete frames on a TCP address, and fans the stream out to any number
//! of independent subscribers. An optional WebSocket bridge re-publishes
//! named streams to browser clients.
//!
//! # Architecture
//!
//! - **Capture** - spawns the command on a PTY and yields output chunks
//! - **Relay** - wire framing plus the publish and subscribe loops
//! - **Bridge** - per-browser-session relay of a named stream over WebSocket
//!
//! Data flows one way: PTY reads become frames, frames become chunks on
//! each subscriber, and the bridge forwards chunks to its sessions. Every
//! subscriber owns its own connection and decoding state; nothing is
//! shared between them.

pub mod bridge;
pub mod capture;
pub mod config;
pub mod relay;

// Re-export commonly used types
pub use bridge::BridgeServer;
pub use capture::{Capture, CaptureEvent};
pub use config::Config;
pub use relay::framing::Frame;
pub use relay::publisher::Publisher;
pub use relay::subscriber::Subscriber;
