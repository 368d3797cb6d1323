//! Subscribe side of the relay: connect, handshake, decode frames.
//!
//! A subscriber blocks on the transport - it never polls. Frames on
//! foreign topics are dropped silently so old subscribers keep working
//! if topics are multiplexed later. A message without a topic separator
//! is a protocol violation and ends this one subscription with an
//! error; the publisher and other subscribers are unaffected.
//!
//! Dropping a `Subscriber` (or aborting the task that owns it) at any
//! point closes the transport connection; no coordination with the
//! publisher is needed.

use std::collections::VecDeque;
use std::io::Write;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::framing::{Frame, FrameDecoder, OUTPUT_TOPIC};
use super::parse_addr;

/// One subscription to a published stream.
pub struct Subscriber {
    stream: TcpStream,
    decoder: FrameDecoder,
    pending: VecDeque<Frame>,
    done: bool,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    /// Connect to a stream address and establish the subscription.
    ///
    /// Sends the subscribe handshake and waits for the publisher's
    /// ready acknowledgment before returning, so every frame broadcast
    /// after this call resolves is guaranteed to arrive - the
    /// slow-joiner fix required of the protocol. The acknowledgment is
    /// sent when the publish loop admits the subscription, so this
    /// blocks until the publisher is actively relaying.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection, handshake write, or
    /// acknowledgment fails.
    pub async fn connect(addr: &str) -> Result<Self> {
        let target = parse_addr(addr)?;
        let mut stream = TcpStream::connect(&target)
            .await
            .with_context(|| format!("Failed to connect to {addr}"))?;
        stream
            .write_all(&Frame::Subscribe(OUTPUT_TOPIC.to_string()).encode())
            .await
            .context("Failed to send subscribe handshake")?;

        let mut sub = Self {
            stream,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
            done: false,
        };
        sub.wait_ready().await?;
        log::debug!("[sub] Subscription established to {addr}");
        Ok(sub)
    }

    /// Receive the next output chunk.
    ///
    /// Blocks until the publisher sends something. Returns `Ok(None)`
    /// exactly once when the end-of-stream frame arrives; afterwards
    /// every call returns `Ok(None)` without touching the transport.
    /// Frames on other topics are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error on a protocol violation (malformed message) or
    /// if the connection closes before the end-of-stream sentinel.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        loop {
            match self.next_frame().await? {
                Some(Frame::Output(data)) => return Ok(Some(data)),
                Some(Frame::EndOfStream) => {
                    self.done = true;
                    return Ok(None);
                }
                Some(other) => {
                    // Foreign or out-of-place topic: drop and continue.
                    log::debug!("[sub] Dropping frame on other topic: {other:?}");
                }
                None => bail!("Connection closed before end-of-stream"),
            }
        }
    }

    /// Wait for the publisher's ready acknowledgment.
    async fn wait_ready(&mut self) -> Result<()> {
        loop {
            match self.next_frame().await? {
                Some(Frame::Ready) => return Ok(()),
                Some(Frame::Other { .. }) => {}
                Some(other) => bail!("Expected ready acknowledgment, got {other:?}"),
                None => bail!("Connection closed before ready acknowledgment"),
            }
        }
    }

    /// Pull the next decoded frame, reading from the transport as needed.
    ///
    /// Returns `Ok(None)` on transport EOF.
    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            let mut buf = [0u8; 64 * 1024];
            let n = self
                .stream
                .read(&mut buf)
                .await
                .context("Transport read failed")?;
            if n == 0 {
                return Ok(None);
            }
            let frames = self.decoder.feed(&buf[..n])?;
            self.pending.extend(frames);
        }
    }
}

/// Subscribe to `addr` and print every chunk to stdout until
/// end-of-stream.
///
/// This is the `--sub` CLI loop: raw bytes, flushed per chunk, nothing
/// extra printed on a normal end.
///
/// # Errors
///
/// Returns an error if the subscription fails or the stream is cut off
/// before its end-of-stream frame.
pub async fn run_to_stdout(addr: &str) -> Result<()> {
    let mut sub = Subscriber::connect(addr).await?;
    let mut stdout = std::io::stdout();
    while let Some(chunk) = sub.recv().await? {
        stdout.write_all(&chunk).context("Failed to write to stdout")?;
        stdout.flush().context("Failed to flush stdout")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Minimal publisher stand-in: accepts one connection, consumes the
    /// handshake, sends the ack, then sends `messages` verbatim.
    async fn fake_publisher(messages: Vec<Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let addr = format!("tcp://{}", listener.local_addr().expect("local_addr"));
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept failed");
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 256];
            loop {
                let n = stream.read(&mut buf).await.expect("handshake read");
                assert_ne!(n, 0, "Closed before handshake");
                if !decoder.feed(&buf[..n]).expect("handshake decode").is_empty() {
                    break;
                }
            }
            stream
                .write_all(&Frame::Ready.encode())
                .await
                .expect("ack write");
            for msg in messages {
                stream.write_all(&msg).await.expect("message write");
            }
            // Keep the connection open briefly so the subscriber sees the
            // frames rather than a racing EOF.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        addr
    }

    #[tokio::test]
    async fn test_receives_chunks_then_end() {
        let addr = fake_publisher(vec![
            Frame::Output(b"one".to_vec()).encode(),
            Frame::Output(b"two".to_vec()).encode(),
            Frame::EndOfStream.encode(),
        ])
        .await;

        let mut sub = Subscriber::connect(&addr).await.expect("connect failed");
        assert_eq!(sub.recv().await.unwrap().as_deref(), Some(b"one".as_slice()));
        assert_eq!(sub.recv().await.unwrap().as_deref(), Some(b"two".as_slice()));
        assert_eq!(sub.recv().await.unwrap(), None);
        // Idempotent after the sentinel.
        assert_eq!(sub.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_foreign_topic_frames_are_dropped() {
        let addr = fake_publisher(vec![
            Frame::Other {
                topic: "X".to_string(),
                payload: b"not for us".to_vec(),
            }
            .encode(),
            Frame::Output(b"payload".to_vec()).encode(),
            Frame::EndOfStream.encode(),
        ])
        .await;

        let mut sub = Subscriber::connect(&addr).await.expect("connect failed");
        assert_eq!(sub.recv().await.unwrap().as_deref(), Some(b"payload".as_slice()));
        assert_eq!(sub.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_message_is_fatal() {
        // A delimited message with no separator byte anywhere.
        let mut malformed = Vec::new();
        malformed.extend_from_slice(&7u32.to_le_bytes());
        malformed.extend_from_slice(b"garbage");

        let addr = fake_publisher(vec![malformed]).await;
        let mut sub = Subscriber::connect(&addr).await.expect("connect failed");
        let err = sub.recv().await.expect_err("Malformed message must error");
        assert!(
            err.to_string().contains("separator"),
            "Unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn test_eof_before_sentinel_is_an_error() {
        let addr = fake_publisher(vec![Frame::Output(b"partial".to_vec()).encode()]).await;
        let mut sub = Subscriber::connect(&addr).await.expect("connect failed");
        assert_eq!(sub.recv().await.unwrap().as_deref(), Some(b"partial".as_slice()));
        // Fake publisher closes without the sentinel after its delay.
        let result = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("Timed out");
        assert!(result.is_err(), "Truncated stream should error");
    }

    #[tokio::test]
    async fn test_connect_fails_without_listener() {
        // Port 1 is essentially never listening.
        assert!(Subscriber::connect("tcp://127.0.0.1:1").await.is_err());
    }
}
