//! WebSocket accept loop for the bridge.
//!
//! Listens for TCP connections, performs the WebSocket handshake while
//! capturing the request's query string, and spawns one independent
//! session task per client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

use super::session;
use crate::config::Config;

/// The bridge's listening server.
#[derive(Debug)]
pub struct BridgeServer {
    local_addr: SocketAddr,
    accept_handle: JoinHandle<()>,
}

impl BridgeServer {
    /// Bind the configured listen address and start accepting sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address cannot be bound.
    pub async fn start(config: Arc<Config>) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen)
            .await
            .with_context(|| format!("Failed to bind bridge listener on {}", config.listen))?;
        let local_addr = listener.local_addr()?;
        log::info!("[bridge] Listening on ws://{local_addr}");

        let accept_handle = tokio::spawn(Self::accept_loop(listener, config));
        Ok(Self {
            local_addr,
            accept_handle,
        })
    }

    /// The bound socket address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new sessions.
    ///
    /// Running session tasks finish on their own when their clients
    /// disconnect.
    pub fn shutdown(self) {
        self.accept_handle.abort();
    }

    /// Accept loop - runs as a tokio task.
    async fn accept_loop(listener: TcpListener, config: Arc<Config>) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    log::info!("[bridge] Client connected: {peer}");
                    let config = Arc::clone(&config);
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, config).await {
                            log::warn!("[bridge] Session for {peer} ended with error: {e}");
                        }
                        log::info!("[bridge] Client disconnected: {peer}");
                    });
                }
                Err(e) => {
                    log::error!("[bridge] Accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Upgrade one connection to WebSocket and run its session.
    async fn handle_connection(stream: TcpStream, config: Arc<Config>) -> Result<()> {
        let mut query: Option<String> = None;
        let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            query = req.uri().query().map(str::to_string);
            Ok(resp)
        })
        .await
        .context("WebSocket handshake failed")?;

        let requested = query.as_deref().and_then(stream_param);
        session::run(ws, requested, config).await
    }
}

/// Extract the `stream` parameter from a raw query string.
fn stream_param(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        pair.split_once('=')
            .filter(|(key, _)| *key == "stream")
            .map(|(_, value)| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_param_extraction() {
        assert_eq!(stream_param("stream=test1"), Some("test1".to_string()));
        assert_eq!(
            stream_param("foo=bar&stream=logs&x=1"),
            Some("logs".to_string())
        );
        assert_eq!(stream_param("foo=bar"), None);
        assert_eq!(stream_param(""), None);
        // Bare key without a value
        assert_eq!(stream_param("stream"), None);
    }
}
