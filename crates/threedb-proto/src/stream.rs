// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Async length-prefixed framing over a live socket, layered on [`wire`]'s
//! synchronous codec so the scheduler and worker can read/write frames
//! directly off a connection instead of an in-memory byte slice.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::{self, Packet, TensorHeader, DONE};
use crate::Envelope;

/// Errors raised while reading or writing framed messages over a connection.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The underlying transport failed.
    #[error("transport IO error: {0}")]
    Io(#[from] io::Error),
    /// A frame's CBOR body failed to decode.
    #[error("frame decode error: {0}")]
    Decode(#[from] serde_cbor::Error),
    /// The peer closed the connection with a partial frame pending.
    #[error("peer closed the connection mid-frame")]
    TruncatedFrame,
    /// A tensor frame arrived where the `"done"` marker was expected.
    #[error("expected the done marker, got a data frame")]
    ExpectedDone,
}

const READ_CHUNK: usize = 16 * 1024;

/// Accumulates bytes off an [`AsyncRead`] and hands back one length-prefixed
/// frame at a time, mirroring the accumulation-buffer loop the hub's
/// connection handler runs for its own frame kind.
pub struct FrameReader<R> {
    reader: R,
    acc: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wraps `reader` with an empty accumulation buffer.
    #[must_use]
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            acc: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Reads the next length-prefixed frame's body, or `Ok(None)` on a clean
    /// EOF between frames (no partial frame pending).
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        loop {
            if let Ok((body, consumed)) = wire::decode_frame(&self.acc) {
                let body = body.to_vec();
                self.acc.drain(..consumed);
                return Ok(Some(body));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return if self.acc.is_empty() {
                    Ok(None)
                } else {
                    Err(StreamError::TruncatedFrame)
                };
            }
            self.acc.extend_from_slice(&chunk[..n]);
        }
    }

    /// Reads the next frame and decodes it as an [`Envelope`].
    pub async fn next_envelope(&mut self) -> Result<Option<Envelope>, StreamError> {
        let Some(body) = self.next_frame().await? else {
            return Ok(None);
        };
        Ok(Some(wire::from_cbor(&body)?))
    }

    /// Reads the next frame and decodes it as a [`TensorHeader`].
    pub async fn next_tensor_header(&mut self) -> Result<TensorHeader, StreamError> {
        let body = self.next_frame().await?.ok_or(StreamError::TruncatedFrame)?;
        Ok(serde_cbor::from_slice(&body)?)
    }

    /// Reads the next frame as raw tensor bytes.
    pub async fn next_tensor_data(&mut self) -> Result<Vec<u8>, StreamError> {
        self.next_frame().await?.ok_or(StreamError::TruncatedFrame)
    }

    /// Reads the next frame and asserts it is the `"done"` marker closing a
    /// `push`'s run of tensor frames.
    pub async fn expect_done(&mut self) -> Result<(), StreamError> {
        let body = self.next_frame().await?.ok_or(StreamError::TruncatedFrame)?;
        if body == DONE.as_bytes() {
            Ok(())
        } else {
            Err(StreamError::ExpectedDone)
        }
    }
}

/// Writes `env` as one length-prefixed CBOR frame.
pub async fn write_envelope<W: AsyncWrite + Unpin>(writer: &mut W, env: &Envelope) -> Result<(), StreamError> {
    let bytes = Packet::encode(env)?;
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Writes an already-framed (length-prefixed) payload verbatim: a tensor
/// header, tensor data, or the `"done"` marker.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, framed: &[u8]) -> Result<(), StreamError> {
    writer.write_all(framed).await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{ChannelSchema, ElementType};

    #[tokio::test]
    async fn frame_reader_reassembles_frames_split_across_reads() {
        let mut wire_bytes = Vec::new();
        wire_bytes.extend(Packet::encode(&Envelope::Ack).expect("encode"));
        wire_bytes.extend(wire::encode_tensor_data(b"hello"));
        wire_bytes.extend(wire::encode_done());

        // A reader that yields a handful of bytes per poll, forcing the
        // accumulation loop to run more than once per frame.
        let (client, mut server) = tokio::io::duplex(4);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt as _;
            server.write_all(&wire_bytes).await.expect("write");
        });

        let mut reader = FrameReader::new(client);
        let env = reader.next_envelope().await.expect("envelope").expect("some");
        assert_eq!(env, Envelope::Ack);
        let data = reader.next_tensor_data().await.expect("tensor data");
        assert_eq!(data, b"hello");
        reader.expect_done().await.expect("done marker");
    }

    #[tokio::test]
    async fn expect_done_rejects_a_non_done_frame() {
        let (client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt as _;
            server.write_all(&wire::encode_tensor_data(b"nope")).await.expect("write");
        });
        let mut reader = FrameReader::new(client);
        assert!(matches!(reader.expect_done().await, Err(StreamError::ExpectedDone)));
    }

    #[tokio::test]
    async fn next_frame_returns_none_on_clean_eof() {
        let (client, server) = tokio::io::duplex(4);
        drop(server);
        let mut reader = FrameReader::new(client);
        assert!(reader.next_frame().await.expect("clean eof").is_none());
    }

    #[test]
    fn tensor_header_decodes_through_the_async_path_helper() {
        let header = TensorHeader {
            channel: "rgb".into(),
            schema: ChannelSchema {
                shape: vec![3, 2, 2],
                dtype: ElementType::U8,
            },
        };
        let encoded = header.encode().expect("encode");
        let (decoded, _) = TensorHeader::decode(&encoded).expect("decode");
        assert_eq!(decoded, header);
    }
}
