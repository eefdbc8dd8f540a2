// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for worker pipes.
//!
//! Each direction of the worker channel carries a stream of JSON objects,
//! each one terminated by the ASCII delimiter [`DELIMITER`]:
//!
//! ```text
//! {"id":1,"params":{"a":"b"}}littledrizzle{"id":2,"params":{}}littledrizzle
//! ```
//!
//! The format is not self-describing. The delimiter must never occur inside a
//! serialized message, so [`encode`] refuses such payloads instead of
//! producing a stream the reader would split in the wrong place.

use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Frame terminator written after every JSON message.
pub const DELIMITER: &[u8] = b"littledrizzle";

/// Initial read buffer capacity.
const READ_CHUNK: usize = 8 * 1024;

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload contains the frame delimiter")]
    DelimiterInPayload,

    #[error("write failed: {0}")]
    WriteFailed(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// Serialize a message and append the delimiter.
pub fn encode<M: Serialize>(msg: &M) -> Result<Bytes, FrameError> {
    let mut payload = serde_json::to_vec(msg)?;
    if find_delimiter(&payload).is_some() {
        return Err(FrameError::DelimiterInPayload);
    }
    payload.extend_from_slice(DELIMITER);
    Ok(Bytes::from(payload))
}

/// Write a single message to an async writer.
///
/// Any IO failure, including a short write, is reported as
/// [`FrameError::WriteFailed`].
pub async fn write_frame<W, M>(writer: &mut W, msg: &M) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let encoded = encode(msg)?;
    writer
        .write_all(&encoded)
        .await
        .map_err(FrameError::WriteFailed)?;
    writer.flush().await.map_err(FrameError::WriteFailed)?;
    Ok(())
}

fn find_delimiter(haystack: &[u8]) -> Option<usize> {
    if haystack.len() < DELIMITER.len() {
        return None;
    }
    haystack
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER)
}

/// Incremental reader that splits a byte stream into delimited JSON frames.
///
/// A terminated segment that fails to parse is logged and dropped. The
/// unterminated tail is kept as a partial frame until more bytes arrive,
/// unless it already parses as a complete message, in which case it is
/// returned right away and the delimiter that follows is skipped.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
    parse_failures: u64,
}

impl<R> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
            parse_failures: 0,
        }
    }

    /// Number of terminated segments dropped because they were not valid JSON.
    pub fn parse_failures(&self) -> u64 {
        self.parse_failures
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Pop the next complete frame from the buffer, if any.
    fn next_buffered<M: DeserializeOwned>(&mut self) -> Option<M> {
        while let Some(pos) = find_delimiter(&self.buf) {
            let segment = self.buf.split_to(pos);
            self.buf.advance(DELIMITER.len());
            if segment.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<M>(&segment) {
                Ok(msg) => return Some(msg),
                Err(e) => {
                    self.parse_failures += 1;
                    warn!(
                        error = %e,
                        segment_len = segment.len(),
                        "Dropping unparsable frame"
                    );
                }
            }
        }

        // Final segment: only consumed when it is already a full message.
        if self.buf.is_empty() || self.buf.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        match serde_json::from_slice::<M>(&self.buf) {
            Ok(msg) => {
                self.buf.clear();
                Some(msg)
            }
            Err(_) => None,
        }
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Read the next frame, waiting for more bytes as needed.
    ///
    /// Returns [`FrameError::ConnectionClosed`] once the writer side is closed
    /// and no complete frame remains.
    pub async fn read_frame<M: DeserializeOwned>(&mut self) -> Result<M, FrameError> {
        loop {
            if let Some(msg) = self.next_buffered() {
                return Ok(msg);
            }
            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(FrameError::ConnectionClosed);
            }
        }
    }
}

/// Writer half that encodes messages onto the wrapped stream.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Write a message to the stream
    pub async fn write_frame<M: Serialize>(&mut self, msg: &M) -> Result<(), FrameError> {
        write_frame(&mut self.writer, msg).await
    }

    /// Flush and close the underlying stream.
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn test_encode_appends_delimiter() {
        let encoded = encode(&json!({"id": 1})).unwrap();
        assert!(encoded.ends_with(DELIMITER));
        assert_eq!(&encoded[..encoded.len() - DELIMITER.len()], br#"{"id":1}"#);
    }

    #[test]
    fn test_encode_rejects_delimiter_in_payload() {
        let err = encode(&json!({"text": "a littledrizzle b"})).unwrap_err();
        assert!(matches!(err, FrameError::DelimiterInPayload));
    }

    #[test]
    fn test_find_delimiter() {
        assert_eq!(find_delimiter(b"abclittledrizzle"), Some(3));
        assert_eq!(find_delimiter(b"littledrizzl"), None);
        assert_eq!(find_delimiter(b""), None);
    }

    #[tokio::test]
    async fn test_read_multiple_frames_from_one_chunk() {
        let data = b"{\"id\":1}littledrizzle{\"id\":2}littledrizzle".to_vec();
        let mut reader = FrameReader::new(&data[..]);
        let first: Value = reader.read_frame().await.unwrap();
        let second: Value = reader.read_frame().await.unwrap();
        assert_eq!(first, json!({"id": 1}));
        assert_eq!(second, json!({"id": 2}));
        assert!(matches!(
            reader.read_frame::<Value>().await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_partial_frame_carried_over() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(rx);

        let handle = tokio::spawn(async move {
            tx.write_all(b"{\"id\":7,\"par").await.unwrap();
            tokio::task::yield_now().await;
            tx.write_all(b"ams\":{}}littledrizzle").await.unwrap();
        });

        let frame: Value = reader.read_frame().await.unwrap();
        assert_eq!(frame, json!({"id": 7, "params": {}}));
        handle.await.unwrap();
        assert_eq!(reader.parse_failures(), 0);
    }

    #[tokio::test]
    async fn test_bad_segment_dropped_and_counted() {
        let data = b"not jsonlittledrizzle{\"id\":3}littledrizzle".to_vec();
        let mut reader = FrameReader::new(&data[..]);
        let frame: Value = reader.read_frame().await.unwrap();
        assert_eq!(frame, json!({"id": 3}));
        assert_eq!(reader.parse_failures(), 1);
    }

    #[tokio::test]
    async fn test_complete_tail_returned_before_delimiter() {
        let data = b"{\"id\":4}".to_vec();
        let mut reader = FrameReader::new(&data[..]);
        let frame: Value = reader.read_frame().await.unwrap();
        assert_eq!(frame, json!({"id": 4}));
        assert_eq!(reader.pending(), 0);
    }

    #[tokio::test]
    async fn test_late_delimiter_after_complete_tail_is_skipped() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(rx);

        tx.write_all(b"{\"id\":5}").await.unwrap();
        let first: Value = reader.read_frame().await.unwrap();
        assert_eq!(first, json!({"id": 5}));

        tx.write_all(b"littledrizzle{\"id\":6}littledrizzle")
            .await
            .unwrap();
        let second: Value = reader.read_frame().await.unwrap();
        assert_eq!(second, json!({"id": 6}));
        assert_eq!(reader.parse_failures(), 0);
    }

    #[tokio::test]
    async fn test_writer_then_reader() {
        let (tx, rx) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(tx);
        let mut reader = FrameReader::new(rx);

        let msg = json!({"id": 9, "params": {"nested": [1, 2, {"k": "v"}]}});
        writer.write_frame(&msg).await.unwrap();
        let decoded: Value = reader.read_frame().await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_frame_error_display() {
        assert!(
            FrameError::DelimiterInPayload
                .to_string()
                .contains("delimiter")
        );
        assert_eq!(
            FrameError::ConnectionClosed.to_string(),
            "connection closed"
        );
        let err = FrameError::WriteFailed(std::io::Error::other("pipe"));
        assert!(err.to_string().contains("write failed"));
    }
}
