//! Publish side of the relay: bind an address, admit subscribers, fan
//! the capture stream out to all of them.
//!
//! The address is bound before any chunk is consumed from the capture,
//! so early subscribers never race a not-yet-bound address. Each
//! admitted subscriber gets its own bounded outbound queue and writer
//! task; a slow subscriber fills its queue and is disconnected rather
//! than blocking the producer or the other subscribers.
//!
//! Admission ordering: the accept side only validates the handshake.
//! The publish loop performs admission itself, enqueuing the ready
//! acknowledgment and starting the writer task in the same step that
//! adds the connection to the fan-out set, and it drains pending
//! admissions before every broadcast. A subscriber that has received
//! the acknowledgment therefore receives every frame broadcast after
//! it, with no window for a frame to slip between ack and admission.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use super::framing::{Frame, FrameDecoder, OUTPUT_TOPIC};
use super::parse_addr;
use crate::capture::{Capture, CaptureEvent};

/// Default bound on frames queued per subscriber before it is dropped.
pub const DEFAULT_MAX_QUEUED_FRAMES: usize = 1024;

/// How long shutdown waits for subscriber queues to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A bound publisher: one stream address, many subscribers.
pub struct Publisher {
    local_addr: SocketAddr,
    accept_handle: JoinHandle<()>,
    subs_rx: UnboundedReceiver<PendingSubscriber>,
    conns: Vec<SubscriberConn>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("local_addr", &self.local_addr)
            .field("subscribers", &self.conns.len())
            .finish_non_exhaustive()
    }
}

/// A connection whose handshake was accepted but which the publish
/// loop has not yet admitted into the fan-out set.
///
/// Its writer task is not started until admission, so nothing can
/// reach the subscriber's socket before the connection is eligible for
/// every subsequent broadcast.
struct PendingSubscriber {
    id: String,
    frame_tx: Sender<Vec<u8>>,
    frame_rx: Receiver<Vec<u8>>,
    write_half: OwnedWriteHalf,
}

/// Publisher-side state for one admitted subscriber.
struct SubscriberConn {
    id: String,
    frame_tx: Sender<Vec<u8>>,
    write_handle: JoinHandle<()>,
}

impl Publisher {
    /// Bind a stream address and start accepting subscriber
    /// connections. Connections are admitted into the fan-out set (and
    /// acknowledged) by [`Publisher::publish`].
    ///
    /// `max_queued_frames` bounds each subscriber's outbound queue; a
    /// subscriber that falls further behind than this is disconnected
    /// with a logged warning.
    ///
    /// # Errors
    ///
    /// Returns an error for an unparseable address or if the bind
    /// fails. An address already in use is a configuration error and
    /// is never retried.
    pub async fn bind(addr: &str, max_queued_frames: usize) -> Result<Self> {
        let target = parse_addr(addr)?;
        let listener = TcpListener::bind(&target)
            .await
            .with_context(|| format!("Failed to bind stream address {addr}"))?;
        let local_addr = listener.local_addr()?;
        log::info!("[pub] Listening on tcp://{local_addr}");

        let (subs_tx, subs_rx) = mpsc::unbounded_channel();
        let accept_handle = tokio::spawn(Self::accept_loop(listener, subs_tx, max_queued_frames));

        Ok(Self {
            local_addr,
            accept_handle,
            subs_rx,
            conns: Vec::new(),
        })
    }

    /// The bound socket address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stream address string for subscribers to connect to.
    pub fn stream_addr(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }

    /// Relay the capture stream to every subscriber, then shut down.
    ///
    /// Each chunk becomes exactly one output frame, in order, with the
    /// chunk boundaries the capture produced. On capture end, exactly
    /// one end-of-stream frame is sent to every subscriber - always the
    /// last frame on this address - and the listener is released.
    ///
    /// # Errors
    ///
    /// Currently infallible after a successful bind; the `Result` keeps
    /// room for transport-level failures to surface.
    pub async fn publish(mut self, mut capture: Capture) -> Result<()> {
        loop {
            tokio::select! {
                maybe_pending = self.subs_rx.recv() => {
                    if let Some(pending) = maybe_pending {
                        self.admit_conn(pending);
                    }
                }
                event = capture.recv() => {
                    // Anyone whose handshake was acknowledged before this
                    // frame must be in the fan-out set for it.
                    self.admit_pending();
                    match event {
                        Some(CaptureEvent::Chunk(data)) => {
                            self.broadcast(&Frame::Output(data).encode());
                        }
                        Some(CaptureEvent::Eof) | None => break,
                    }
                }
            }
        }

        self.admit_pending();
        self.broadcast(&Frame::EndOfStream.encode());
        log::info!("[pub] Stream ended, closing {} subscriber(s)", self.conns.len());

        // Stop admitting, let queued frames drain, release the address.
        self.accept_handle.abort();
        for conn in self.conns.drain(..) {
            drop(conn.frame_tx);
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, conn.write_handle).await;
        }
        Ok(())
    }

    /// Move subscribers that completed their handshake into the
    /// fan-out set.
    fn admit_pending(&mut self) {
        while let Ok(pending) = self.subs_rx.try_recv() {
            self.admit_conn(pending);
        }
    }

    /// Admit one handshaken connection into the fan-out set.
    ///
    /// The ready acknowledgment is enqueued here and the writer task
    /// started here, in the same step that makes the connection a
    /// broadcast target. The queue is FIFO and nothing was written
    /// before this point, so a subscriber cannot observe the
    /// acknowledgment until it is already guaranteed every subsequent
    /// frame.
    fn admit_conn(&mut self, pending: PendingSubscriber) {
        let PendingSubscriber {
            id,
            frame_tx,
            frame_rx,
            write_half,
        } = pending;
        // The queue is empty, so the ack always has room.
        if frame_tx.try_send(Frame::Ready.encode()).is_err() {
            log::info!("[pub] Subscriber {id} left before admission");
            return;
        }
        let write_handle = tokio::spawn(write_loop(id.clone(), write_half, frame_rx));
        log::info!("[pub] Subscriber admitted: {id}");
        self.conns.push(SubscriberConn {
            id,
            frame_tx,
            write_handle,
        });
    }

    /// Queue encoded bytes on every live subscriber.
    ///
    /// A full queue means the subscriber is too slow: it is dropped and
    /// the overflow logged, leaving the producer and the remaining
    /// subscribers unaffected.
    fn broadcast(&mut self, encoded: &[u8]) {
        self.conns.retain(|conn| match conn.frame_tx.try_send(encoded.to_vec()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!(
                    "[pub] Subscriber {} queue full ({} frames), disconnecting",
                    conn.id,
                    conn.frame_tx.max_capacity()
                );
                conn.write_handle.abort();
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::info!("[pub] Subscriber {} disconnected", conn.id);
                false
            }
        });
    }

    /// Accept loop - runs as a tokio task until the publisher shuts down.
    async fn accept_loop(
        listener: TcpListener,
        subs_tx: UnboundedSender<PendingSubscriber>,
        max_queued_frames: usize,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    log::debug!("[pub] Connection from {peer}");
                    tokio::spawn(Self::admit(stream, subs_tx.clone(), max_queued_frames));
                }
                Err(e) => {
                    log::error!("[pub] Accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Read one connection's subscribe handshake and, if valid, hand it
    /// to the publish loop for admission.
    ///
    /// Nothing is written to the connection here. The ready
    /// acknowledgment comes from the publish loop once the connection
    /// is in the fan-out set, so an acknowledged subscriber is
    /// guaranteed every frame broadcast afterwards.
    async fn admit(
        stream: TcpStream,
        subs_tx: UnboundedSender<PendingSubscriber>,
        max_queued_frames: usize,
    ) {
        let id = generate_subscriber_id();
        let (read_half, write_half) = stream.into_split();

        let Some(frame) = read_handshake(read_half).await else {
            log::warn!("[pub] {id}: connection closed or garbled before handshake");
            return;
        };
        match frame {
            Frame::Subscribe(topic) if topic == OUTPUT_TOPIC => {}
            other => {
                log::warn!("[pub] {id}: rejected handshake {other:?}");
                return;
            }
        }

        let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(max_queued_frames);
        if subs_tx
            .send(PendingSubscriber {
                id,
                frame_tx,
                frame_rx,
                write_half,
            })
            .is_err()
        {
            // Publish loop already finished; the connection drops here
            // and the subscriber sees EOF.
        }
    }
}

/// Read frames from a new connection until its handshake arrives.
///
/// Returns `None` on disconnect or decode error before any frame.
async fn read_handshake(mut reader: OwnedReadHalf) -> Option<Frame> {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return None,
            Ok(n) => match decoder.feed(&buf[..n]) {
                Ok(mut frames) => {
                    if !frames.is_empty() {
                        return Some(frames.remove(0));
                    }
                }
                Err(e) => {
                    log::warn!("[pub] Handshake decode error: {e}");
                    return None;
                }
            },
            Err(e) => {
                log::warn!("[pub] Handshake read error: {e}");
                return None;
            }
        }
    }
}

/// Write loop - drains one subscriber's queue into its socket.
async fn write_loop(id: String, mut writer: OwnedWriteHalf, mut frame_rx: Receiver<Vec<u8>>) {
    while let Some(data) = frame_rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            log::info!("[pub] Write to {id} failed: {e}");
            return;
        }
    }
    // Queue closed after the end-of-stream frame: flush and close.
    let _ = writer.shutdown().await;
}

/// Generate a unique subscriber ID using a monotonic counter + random suffix.
fn generate_subscriber_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand: u16 = rand::random();
    format!("sub:{seq:x}{rand:04x}")
}
