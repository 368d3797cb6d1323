//! Terminal capture: run a command on a pseudo-terminal and stream its
//! output as raw chunks.
//!
//! The command runs attached to the PTY slave side, so programs that
//! probe for a real terminal (line editors, progress bars, pagers)
//! behave as if run interactively. A dedicated OS thread blocks on the
//! master side and forwards every read into a channel; the sequence is
//! finite, non-restartable, and always ends with exactly one
//! [`CaptureEvent::Eof`] - even when the command produces no output or
//! fails to start.

use std::io::{Read, Write};
use std::thread;

use anyhow::{bail, Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtyPair, PtySize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// PTY read buffer size, matching the chunk granularity on the wire.
const READ_BUF_SIZE: usize = 8192;

/// Default PTY dimensions for captured commands.
const DEFAULT_ROWS: u16 = 24;
/// Default PTY width for captured commands.
const DEFAULT_COLS: u16 = 80;

/// One event from the capture stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// A non-empty chunk of raw PTY output, exactly one master read.
    Chunk(Vec<u8>),
    /// The stream ended: the child exited or closed the terminal.
    Eof,
}

/// A running command and its pseudo-terminal.
///
/// Owned exclusively by one consumer (the publisher). Dropping a
/// `Capture` kills the child so no process outlives its stream.
pub struct Capture {
    event_rx: UnboundedReceiver<CaptureEvent>,
    child: Option<Box<dyn Child + Send + Sync>>,
    writer: Option<Box<dyn Write + Send>>,
    // Keeps the master side open for the lifetime of the capture.
    _master: Option<Box<dyn MasterPty + Send>>,
    reader_thread: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for Capture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capture")
            .field("has_child", &self.child.is_some())
            .field("has_reader_thread", &self.reader_thread.is_some())
            .finish_non_exhaustive()
    }
}

impl Capture {
    /// Spawn `command` under `sh -c` on a new PTY and start reading its
    /// output.
    ///
    /// Shell semantics are kept so pipelines and redirects work the way
    /// they do from an interactive prompt. If the command itself cannot
    /// be spawned, the capture still yields exactly one
    /// [`CaptureEvent::Eof`]; only PTY allocation failures are errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the command string is empty or the PTY pair
    /// cannot be allocated.
    pub fn spawn(command: &str) -> Result<Self> {
        if command.trim().is_empty() {
            bail!("Empty command");
        }

        let pair = open_pty(DEFAULT_ROWS, DEFAULT_COLS)?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut cmd = CommandBuilder::new("sh");
        cmd.arg("-c");
        cmd.arg(command);

        match pair.slave.spawn_command(cmd) {
            Ok(child) => {
                log::info!("[capture] Spawned '{command}' (pid {:?})", child.process_id());
                let reader = pair
                    .master
                    .try_clone_reader()
                    .context("Failed to clone PTY reader")?;
                let writer = pair
                    .master
                    .take_writer()
                    .context("Failed to take PTY writer")?;
                // Drop the slave handle so master reads see EOF when the
                // child exits.
                drop(pair.slave);

                let reader_thread = spawn_reader_thread(reader, event_tx);

                Ok(Self {
                    event_rx,
                    child: Some(child),
                    writer: Some(writer),
                    _master: Some(pair.master),
                    reader_thread: Some(reader_thread),
                })
            }
            Err(e) => {
                // Failed start still produces a well-formed (empty) stream.
                log::error!("[capture] Failed to spawn '{command}': {e}");
                let _ = event_tx.send(CaptureEvent::Eof);
                Ok(Self {
                    event_rx,
                    child: None,
                    writer: None,
                    _master: None,
                    reader_thread: None,
                })
            }
        }
    }

    /// Receive the next capture event.
    ///
    /// Blocks until a chunk arrives. Returns `None` only after
    /// [`CaptureEvent::Eof`] has been delivered and the channel drained.
    pub async fn recv(&mut self) -> Option<CaptureEvent> {
        self.event_rx.recv().await
    }

    /// Write bytes to the child's terminal input.
    ///
    /// # Errors
    ///
    /// Returns an error if the PTY writer is gone or the write fails.
    pub fn write_input(&mut self, data: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .context("Capture has no writer (child never started)")?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
        }
    }
}

/// Open a new PTY pair with the given dimensions.
fn open_pty(rows: u16, cols: u16) -> Result<PtyPair> {
    let pty_system = native_pty_system();
    let size = PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    };
    pty_system.openpty(size).context("Failed to open PTY")
}

/// Spawn the PTY reader thread.
///
/// Reads the master side until EOF or error, forwarding each non-empty
/// read as a [`CaptureEvent::Chunk`] and finishing with exactly one
/// [`CaptureEvent::Eof`]. Chunks are forwarded as read, never split or
/// merged.
fn spawn_reader_thread(
    mut reader: Box<dyn Read + Send>,
    event_tx: UnboundedSender<CaptureEvent>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        log::debug!("[capture] Reader thread started");
        let mut buf = [0u8; READ_BUF_SIZE];

        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if event_tx.send(CaptureEvent::Chunk(buf[..n].to_vec())).is_err() {
                        // Consumer dropped the capture; stop reading.
                        log::debug!("[capture] Event channel closed, reader exiting");
                        return;
                    }
                }
                Err(e) => {
                    // Linux reports EIO on the master once the child is
                    // gone; treat any error as end of stream.
                    log::debug!("[capture] PTY read ended: {e}");
                    break;
                }
            }
        }

        let _ = event_tx.send(CaptureEvent::Eof);
        log::debug!("[capture] Reader thread exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn drain(capture: &mut Capture) -> (Vec<u8>, usize) {
        let mut output = Vec::new();
        let mut eof_count = 0;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), capture.recv())
                .await
                .expect("Timed out waiting for capture event");
            match event {
                Some(CaptureEvent::Chunk(data)) => {
                    assert!(!data.is_empty(), "Chunks must be non-empty");
                    output.extend_from_slice(&data);
                }
                Some(CaptureEvent::Eof) => eof_count += 1,
                None => break,
            }
        }
        (output, eof_count)
    }

    #[tokio::test]
    async fn test_capture_echo_output() {
        let mut capture = Capture::spawn("echo hi").expect("spawn failed");
        let (output, eof_count) = drain(&mut capture).await;
        // PTY line discipline turns \n into \r\n; the payload bytes are
        // whatever the terminal actually produced.
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("hi"), "Expected 'hi' in output: {text:?}");
        assert_eq!(eof_count, 1, "Exactly one Eof per capture");
    }

    #[tokio::test]
    async fn test_capture_silent_command_still_ends() {
        let mut capture = Capture::spawn("true").expect("spawn failed");
        let (output, eof_count) = drain(&mut capture).await;
        assert!(output.is_empty(), "No output expected: {output:?}");
        assert_eq!(eof_count, 1);
    }

    #[tokio::test]
    async fn test_capture_missing_binary_still_ends() {
        // sh starts, fails to find the binary, prints an error and exits.
        // The stream must still terminate with one Eof.
        let mut capture =
            Capture::spawn("/nonexistent/binary/definitely-not-here").expect("spawn failed");
        let (_output, eof_count) = drain(&mut capture).await;
        assert_eq!(eof_count, 1);
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(Capture::spawn("").is_err());
        assert!(Capture::spawn("   ").is_err());
    }
}
