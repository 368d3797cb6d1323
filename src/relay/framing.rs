//! Wire protocol codec for the pub/sub relay.
//!
//! Each message on the transport is length-delimited, and inside the
//! delimiter carries an ASCII topic, one separator space, and raw
//! payload bytes:
//!
//! ```text
//! [u32 LE length] [topic] [0x20] [payload: arbitrary bytes]
//! ```
//!
//! Topics:
//! - `O`: stream output. A non-empty payload is one capture chunk,
//!   relayed byte-for-byte; the reserved empty payload marks
//!   end-of-stream and is always the last frame on an address.
//! - `S`: subscribe handshake (subscriber → publisher), payload names
//!   the topic being subscribed.
//! - `A`: subscriber-ready acknowledgment (publisher → subscriber),
//!   sent once when the publisher has admitted the subscription.
//!
//! Unknown topics decode as [`Frame::Other`] and are silently dropped
//! by consumers, leaving room for multiplexed topics later. A message
//! without the separator has no topic at all and is a protocol
//! violation: decoding fails, which terminates that one subscription.

use anyhow::{anyhow, bail, Result};

/// Maximum message size (16 MB).
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Topic carrying stream output and the end-of-stream sentinel.
pub const OUTPUT_TOPIC: &str = "O";
/// Topic for the subscribe handshake.
pub const SUBSCRIBE_TOPIC: &str = "S";
/// Topic for the subscriber-ready acknowledgment.
pub const READY_TOPIC: &str = "A";

/// A decoded message from the wire protocol.
///
/// End-of-stream is an explicit variant rather than "empty payload"
/// so no consumer ever has to disambiguate a legitimately empty chunk
/// from stream completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One chunk of stream output (never empty).
    Output(Vec<u8>),

    /// End-of-stream sentinel. Always the last frame on an address.
    EndOfStream,

    /// Subscribe handshake naming the requested topic.
    Subscribe(String),

    /// Subscriber-ready acknowledgment.
    Ready,

    /// Message on an unrecognized topic. Consumers drop these.
    Other {
        /// The unrecognized topic token.
        topic: String,
        /// Raw payload bytes.
        payload: Vec<u8>,
    },
}

impl Frame {
    /// Encode this frame into a wire-format byte vector.
    ///
    /// Returns `[u32 LE length][topic][space][payload]`.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Output(data) => encode_raw(OUTPUT_TOPIC, data),
            Frame::EndOfStream => encode_raw(OUTPUT_TOPIC, &[]),
            Frame::Subscribe(topic) => encode_raw(SUBSCRIBE_TOPIC, topic.as_bytes()),
            Frame::Ready => encode_raw(READY_TOPIC, &[]),
            Frame::Other { topic, payload } => encode_raw(topic, payload),
        }
    }
}

/// Encode a raw message with topic and payload.
fn encode_raw(topic: &str, payload: &[u8]) -> Vec<u8> {
    let length = (topic.len() + 1 + payload.len()) as u32;
    let mut buf = Vec::with_capacity(4 + length as usize);
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(topic.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(payload);
    buf
}

/// Decode a single delimited message into a frame.
fn decode_message(msg: &[u8]) -> Result<Frame> {
    let sep = msg
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| anyhow!("Malformed message: missing topic separator"))?;
    let topic = std::str::from_utf8(&msg[..sep])
        .map_err(|_| anyhow!("Malformed message: topic is not ASCII"))?;
    let payload = &msg[sep + 1..];

    let frame = match topic {
        OUTPUT_TOPIC => {
            if payload.is_empty() {
                Frame::EndOfStream
            } else {
                Frame::Output(payload.to_vec())
            }
        }
        SUBSCRIBE_TOPIC => Frame::Subscribe(String::from_utf8_lossy(payload).into_owned()),
        READY_TOPIC => Frame::Ready,
        other => Frame::Other {
            topic: other.to_string(),
            payload: payload.to_vec(),
        },
    };
    Ok(frame)
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete frames.
/// Handles TCP-style byte stream reassembly.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with empty buffer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// Returns decoded frames. Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if a message is malformed or exceeds the size
    /// limit. The connection that produced the bytes should be dropped;
    /// the decoder's buffer is no longer trustworthy after an error.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            // Need at least 4 bytes for the length header
            if self.buf.len() < 4 {
                break;
            }

            let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);

            // Shortest valid message is a one-byte topic plus the separator
            if length < 2 {
                bail!("Invalid message: length {length} below minimum");
            }
            if length > MAX_FRAME_SIZE {
                bail!("Message too large: {length} bytes (max {MAX_FRAME_SIZE})");
            }

            let total = 4 + length as usize;
            if self.buf.len() < total {
                break; // Incomplete message, wait for more data
            }

            let frame = decode_message(&self.buf[4..total])?;
            frames.push(frame);

            self.buf.drain(..total);
        }

        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_round_trip() {
        let frame = Frame::Output(b"hello world".to_vec());
        let encoded = frame.encode();
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&encoded).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], frame);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_output_preserves_arbitrary_bytes() {
        // Embedded NUL, control codes, newlines, and the separator byte
        // itself must all survive byte-for-byte.
        let data = vec![0x00, b' ', 0x1b, b'[', b'3', b'1', b'm', b'\n', 0x07, 0xff];
        let frame = Frame::Output(data.clone());
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&frame.encode()).unwrap();
        assert_eq!(frames, vec![Frame::Output(data)]);
    }

    #[test]
    fn test_end_of_stream_is_empty_payload() {
        let encoded = Frame::EndOfStream.encode();
        // "O" + separator, nothing else
        assert_eq!(&encoded[4..], b"O ");
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&encoded).unwrap();
        assert_eq!(frames, vec![Frame::EndOfStream]);
    }

    #[test]
    fn test_subscribe_round_trip() {
        let frame = Frame::Subscribe(OUTPUT_TOPIC.to_string());
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&frame.encode()).unwrap();
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_ready_round_trip() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&Frame::Ready.encode()).unwrap();
        assert_eq!(frames, vec![Frame::Ready]);
    }

    #[test]
    fn test_unknown_topic_decodes_as_other() {
        let frame = Frame::Other {
            topic: "X".to_string(),
            payload: b"future use".to_vec(),
        };
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&frame.encode()).unwrap();
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_multiple_frames_in_single_feed() {
        let f1 = Frame::Output(b"first".to_vec());
        let f2 = Frame::Output(b"second".to_vec());
        let f3 = Frame::EndOfStream;

        let mut buf = Vec::new();
        buf.extend_from_slice(&f1.encode());
        buf.extend_from_slice(&f2.encode());
        buf.extend_from_slice(&f3.encode());

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&buf).unwrap();
        assert_eq!(frames, vec![f1, f2, f3]);
    }

    #[test]
    fn test_partial_frame_reassembly() {
        let frame = Frame::Output(b"split across reads".to_vec());
        let encoded = frame.encode();

        let mut decoder = FrameDecoder::new();

        let mid = encoded.len() / 2;
        let frames = decoder.feed(&encoded[..mid]).unwrap();
        assert_eq!(frames.len(), 0);
        assert!(decoder.has_partial());

        let frames = decoder.feed(&encoded[mid..]).unwrap();
        assert_eq!(frames, vec![frame]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_byte_at_a_time() {
        let frame = Frame::Output(b"x".to_vec());
        let encoded = frame.encode();

        let mut decoder = FrameDecoder::new();
        for (i, byte) in encoded.iter().enumerate() {
            let frames = decoder.feed(&[*byte]).unwrap();
            if i < encoded.len() - 1 {
                assert_eq!(frames.len(), 0);
            } else {
                assert_eq!(frames, vec![frame.clone()]);
            }
        }
    }

    #[test]
    fn test_missing_separator_rejected() {
        // A message that is all topic and no separator
        let payload = b"garbage";
        let mut buf = Vec::new();
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);

        let mut decoder = FrameDecoder::new();
        let err = decoder.feed(&buf).unwrap_err();
        assert!(
            err.to_string().contains("separator"),
            "Error should mention the separator: {err}"
        );
    }

    #[test]
    fn test_undersized_message_rejected() {
        // length = 1 cannot hold topic + separator
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.push(b'O');
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&buf).is_err());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let length = MAX_FRAME_SIZE + 1;
        let buf = length.to_le_bytes();
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&buf).is_err());
    }

    #[test]
    fn test_large_output_chunk() {
        let data = vec![0x42u8; 256 * 1024]; // 256KB
        let frame = Frame::Output(data.clone());
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&frame.encode()).unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Output(decoded) => assert_eq!(decoded, &data),
            other => panic!("Expected Output, got {other:?}"),
        }
    }
}
