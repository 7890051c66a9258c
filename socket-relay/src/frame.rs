//! Delimiter framing for the relay wire protocol.
//!
//! Every message is the compact JSON text of an object followed by `<E>`.
//! There is no length prefix, so the reader accumulates bytes until it sees
//! the delimiter. A frame that is not UTF-8 or not a JSON object is skipped
//! and the stream stays in sync because the next frame starts right after
//! the delimiter anyway.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::message::Message;

pub const DELIMITER: &[u8] = b"<E>";

const READ_CHUNK: usize = 1024;

/// Accumulates raw bytes and splits them into delimiter-terminated frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
    // Bytes before this offset are known not to start a delimiter.
    scanned: usize,
    max_frame_len: Option<usize>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_len(max_frame_len: Option<usize>) -> Self {
        Self {
            max_frame_len,
            ..Self::default()
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Splits off the next complete frame, without its delimiter.
    ///
    /// Returns `InvalidData` when a maximum frame length is configured and the
    /// undelimited residue has grown past it.
    pub fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        match find_delimiter(&self.buffer[self.scanned..]) {
            Some(offset) => {
                let end = self.scanned + offset;
                let mut frame: Vec<u8> = self.buffer.drain(..end + DELIMITER.len()).collect();
                frame.truncate(end);
                self.scanned = 0;
                Ok(Some(frame))
            }
            None => {
                self.scanned = self.buffer.len().saturating_sub(DELIMITER.len() - 1);
                match self.max_frame_len {
                    Some(max) if self.buffer.len() > max => Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "frame exceeds {max} bytes without a delimiter ({} buffered)",
                            self.buffer.len()
                        ),
                    )),
                    _ => Ok(None),
                }
            }
        }
    }
}

fn find_delimiter(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER)
}

/// Decodes one frame body, logging and discarding anything malformed.
pub fn parse_frame(frame: &[u8]) -> Option<Message> {
    let text = match std::str::from_utf8(frame) {
        Ok(text) => text,
        Err(err) => {
            debug!(error = %err, len = frame.len(), "discarding frame that is not UTF-8");
            return None;
        }
    };

    match serde_json::from_str::<Message>(text) {
        Ok(message) => Some(message),
        Err(err) => {
            debug!(error = %err, len = frame.len(), "discarding malformed frame");
            None
        }
    }
}

/// Reads framed messages from a byte stream.
///
/// `read_message` is cancel safe: bytes are only moved into the frame buffer
/// after a read completes.
pub struct FrameReader<R> {
    reader: R,
    frames: FrameBuffer,
    chunk: Box<[u8]>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_len(reader, None)
    }

    pub fn with_max_frame_len(reader: R, max_frame_len: Option<usize>) -> Self {
        Self {
            reader,
            frames: FrameBuffer::with_max_frame_len(max_frame_len),
            chunk: vec![0; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Returns the next well-formed message, or `None` once the peer closes
    /// the stream. Trailing bytes without a delimiter are dropped at EOF.
    pub async fn read_message(&mut self) -> io::Result<Option<Message>> {
        loop {
            while let Some(frame) = self.frames.next_frame()? {
                if let Some(message) = parse_frame(&frame) {
                    return Ok(Some(message));
                }
            }

            let bytes = self.reader.read(&mut self.chunk).await?;
            if bytes == 0 {
                if self.frames.pending() > 0 {
                    debug!(
                        pending = self.frames.pending(),
                        "stream closed with an unterminated frame"
                    );
                }
                return Ok(None);
            }
            self.frames.extend(&self.chunk[..bytes]);
        }
    }
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.extend_from_slice(DELIMITER);
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::from_value(json!({"type": "ping", "n": 1})).expect("object"),
            Message::from_value(json!({"type": "chat", "text": "héllo <E"})).expect("object"),
            Message::from_value(json!({"nested": {"list": [1, 2, 3], "ok": true}}))
                .expect("object"),
            Message::new(),
        ]
    }

    fn encode(messages: &[Message]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for message in messages {
            bytes.extend(serde_json::to_vec(message).expect("encode"));
            bytes.extend_from_slice(DELIMITER);
        }
        bytes
    }

    fn decode_in_chunks(bytes: &[u8], chunk_size: usize) -> Vec<Message> {
        let mut frames = FrameBuffer::new();
        let mut decoded = Vec::new();
        for chunk in bytes.chunks(chunk_size) {
            frames.extend(chunk);
            while let Some(frame) = frames.next_frame().expect("no frame limit") {
                decoded.extend(parse_frame(&frame));
            }
        }
        decoded
    }

    #[test]
    fn any_chunking_yields_the_original_messages() {
        let messages = sample_messages();
        let bytes = encode(&messages);

        for chunk_size in 1..=bytes.len() {
            assert_eq!(
                decode_in_chunks(&bytes, chunk_size),
                messages,
                "chunk size {chunk_size}"
            );
        }
    }

    #[test]
    fn malformed_frames_are_skipped_without_losing_sync() {
        let mut bytes = b"not json<E>[1,2]<E>".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe]);
        bytes.extend_from_slice(b"<E>{\"type\":\"ping\"}<E>");

        let decoded = decode_in_chunks(&bytes, 3);
        assert_eq!(
            decoded,
            vec![Message::from_value(json!({"type": "ping"})).expect("object")]
        );
    }

    #[test]
    fn residue_waits_for_the_rest_of_the_frame() {
        let mut frames = FrameBuffer::new();
        frames.extend(b"{\"a\":1}<");
        assert!(frames.next_frame().expect("frame").is_none());
        frames.extend(b"E>{\"b\"");
        assert_eq!(frames.next_frame().expect("frame"), Some(b"{\"a\":1}".to_vec()));
        assert!(frames.next_frame().expect("frame").is_none());
        assert_eq!(frames.pending(), 4);
    }

    #[test]
    fn frame_limit_rejects_oversized_residue() {
        let mut frames = FrameBuffer::with_max_frame_len(Some(8));
        frames.extend(b"{\"a\":1}<E>");
        assert!(frames.next_frame().expect("within limit").is_some());

        frames.extend(b"0123456789");
        let err = frames.next_frame().expect_err("over limit");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn reader_and_writer_share_the_wire_format() {
        let (mut writer, reader) = tokio::io::duplex(16);
        let mut reader = FrameReader::new(reader);
        let messages = sample_messages();

        let expected = messages.clone();
        let write_task = tokio::spawn(async move {
            for message in &messages {
                write_message(&mut writer, message).await.expect("write");
            }
        });

        for message in expected {
            let parsed = reader
                .read_message()
                .await
                .expect("read message")
                .expect("expected message");
            assert_eq!(parsed, message);
        }
        write_task.await.expect("writer task");

        assert!(reader.read_message().await.expect("eof").is_none());
    }

    #[tokio::test]
    async fn written_frames_end_with_the_delimiter() {
        let mut buffer = Vec::new();
        let message = Message::from_value(json!({"target": "alice", "type": "ping"}))
            .expect("object");
        write_message(&mut buffer, &message).await.expect("write");
        assert_eq!(buffer, br#"{"target":"alice","type":"ping"}<E>"#.to_vec());
    }
}
