//! Per-session state: resolve the requested stream, subscribe, forward.
//!
//! A session owns exactly one subscription task. Client disconnect
//! aborts the task, which drops the underlying relay connection - no
//! subscription ever outlives its session.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::Config;
use crate::relay::subscriber::Subscriber;

/// Notice appended to a session's output when its stream ends.
const END_OF_STREAM_NOTICE: &str = ">>> end of stream <<<\n\n";

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Event forwarded from a session's subscription task.
enum SessionEvent {
    /// Decoded output text, ready for the browser.
    Chunk(String),
    /// The relay stream ended normally.
    End,
}

/// Run one bridged session to completion.
///
/// Unknown stream names get exactly one error notice and no
/// subscription activity. Known names get a connected notice, then
/// every decoded chunk as an `output` event, then an end-of-stream
/// notice, after which the session closes.
pub(crate) async fn run(
    ws: WebSocketStream<TcpStream>,
    requested: Option<String>,
    config: Arc<Config>,
) -> Result<()> {
    let (mut sink, mut source) = ws.split();
    let name = requested.unwrap_or_default();

    let Some(addr) = config.resolve(&name) else {
        log::info!("[bridge] Unknown stream requested: '{name}'");
        send_output(&mut sink, &format!("Error: unknown stream '{name}'\n")).await?;
        // No subscription is started; hold the socket until the client
        // goes away.
        wait_for_disconnect(&mut source).await;
        return Ok(());
    };

    send_output(&mut sink, &format!("Connected to {addr}\n")).await?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let sub_handle = tokio::spawn(forward_stream(addr.to_string(), event_tx));

    let result = loop {
        tokio::select! {
            msg = source.next() => match msg {
                None | Some(Ok(Message::Close(_))) => break Ok(()),
                Some(Err(e)) => break Err(anyhow!("WebSocket read error: {e}")),
                // Sessions are output-only; other client frames are ignored.
                Some(Ok(_)) => {}
            },
            event = event_rx.recv() => match event {
                Some(SessionEvent::Chunk(text)) => {
                    if let Err(e) = send_output(&mut sink, &text).await {
                        break Err(e);
                    }
                }
                Some(SessionEvent::End) => {
                    let _ = send_output(&mut sink, END_OF_STREAM_NOTICE).await;
                    break Ok(());
                }
                // Subscription task ended without a normal end (protocol
                // violation or connect failure, already logged).
                None => break Ok(()),
            },
        }
    };

    sub_handle.abort();
    let _ = sink.close().await;
    result
}

/// Subscription task: relay chunks from the stream address into the
/// session's event channel.
async fn forward_stream(addr: String, event_tx: UnboundedSender<SessionEvent>) {
    let mut sub = match Subscriber::connect(&addr).await {
        Ok(sub) => sub,
        Err(e) => {
            log::error!("[bridge] Subscribe to {addr} failed: {e}");
            return;
        }
    };

    loop {
        match sub.recv().await {
            Ok(Some(chunk)) => {
                // Browsers render \n fine; \r only garbles the output.
                let text = String::from_utf8_lossy(&chunk).replace('\r', "");
                if event_tx.send(SessionEvent::Chunk(text)).is_err() {
                    return; // session gone
                }
            }
            Ok(None) => {
                let _ = event_tx.send(SessionEvent::End);
                return;
            }
            Err(e) => {
                log::error!("[bridge] Subscription to {addr} violated protocol: {e}");
                return;
            }
        }
    }
}

/// Send one session-scoped output event.
async fn send_output(sink: &mut WsSink, text: &str) -> Result<()> {
    let msg = serde_json::json!({ "event": "output", "data": text });
    sink.send(Message::Text(msg.to_string()))
        .await
        .context("WebSocket send failed")
}

/// Drain client frames until the connection closes.
async fn wait_for_disconnect(source: &mut WsSource) {
    while let Some(msg) = source.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}
