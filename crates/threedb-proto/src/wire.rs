// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! CBOR framing helpers for the scheduler/worker protocol.
//!
//! Every frame on the wire - an [`Envelope`], a tensor header, a raw tensor
//! payload, or the terminating `"done"` marker - is a 4-byte big-endian
//! length prefix followed by that many bytes. `push` results are a short
//! run of these frames: one [`Envelope`], then per declared channel one
//! [`TensorHeader`] frame and one raw-bytes frame, closed by [`DONE`].

use crate::{ChannelSchema, Envelope};
use serde::{de::Error as DeError, Deserialize, Serialize};

/// Literal marker closing a `push` result's run of tensor frames.
pub const DONE: &str = "done";

/// Prefix `body` with its length (u32, big-endian) to form one wire frame.
#[must_use]
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Split the next length-prefixed frame off `stream`.
///
/// Returns the frame's body and the total number of bytes (header
/// included) consumed from `stream`. Callers keep decoding frames from the
/// same accumulation buffer until it is exhausted, same as the hub's
/// connection loop does for a single message type.
pub fn decode_frame(stream: &[u8]) -> Result<(&[u8], usize), serde_cbor::Error> {
    if stream.len() < 4 {
        return Err(<serde_cbor::Error as DeError>::custom("incomplete length"));
    }
    let len = u32::from_be_bytes([stream[0], stream[1], stream[2], stream[3]]) as usize;
    if stream.len() < 4 + len {
        return Err(<serde_cbor::Error as DeError>::custom("incomplete frame"));
    }
    Ok((&stream[4..4 + len], 4 + len))
}

/// Serialize an [`Envelope`] to CBOR bytes.
pub fn to_cbor(msg: &Envelope) -> Result<Vec<u8>, serde_cbor::Error> {
    serde_cbor::to_vec(msg)
}

/// Deserialize an [`Envelope`] from CBOR bytes.
pub fn from_cbor(bytes: &[u8]) -> Result<Envelope, serde_cbor::Error> {
    serde_cbor::from_slice(bytes)
}

/// A framed envelope: length prefix plus CBOR-encoded [`Envelope`] body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    /// Raw CBOR payload.
    pub bytes: Vec<u8>,
}

impl Packet {
    /// Encode an [`Envelope`] into a length-prefixed CBOR frame.
    pub fn encode(msg: &Envelope) -> Result<Vec<u8>, serde_cbor::Error> {
        Ok(encode_frame(&to_cbor(msg)?))
    }

    /// Decode one envelope frame from the head of `stream`.
    ///
    /// Returns the decoded envelope and the number of bytes consumed.
    pub fn decode(stream: &[u8]) -> Result<(Envelope, usize), serde_cbor::Error> {
        let (body, consumed) = decode_frame(stream)?;
        Ok((from_cbor(body)?, consumed))
    }
}

/// Header frame preceding one channel's raw tensor bytes in a `push`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorHeader {
    /// Channel this tensor belongs to, matching a `result_keys` entry.
    pub channel: String,
    /// Shape and element type of the payload that follows.
    pub schema: ChannelSchema,
}

impl TensorHeader {
    /// Encode this header as a length-prefixed CBOR frame.
    pub fn encode(&self) -> Result<Vec<u8>, serde_cbor::Error> {
        Ok(encode_frame(&serde_cbor::to_vec(self)?))
    }

    /// Decode a header frame from the head of `stream`.
    pub fn decode(stream: &[u8]) -> Result<(Self, usize), serde_cbor::Error> {
        let (body, consumed) = decode_frame(stream)?;
        Ok((serde_cbor::from_slice(body)?, consumed))
    }
}

/// Encode `bytes` as a raw tensor-data frame (no CBOR wrapping).
#[must_use]
pub fn encode_tensor_data(bytes: &[u8]) -> Vec<u8> {
    encode_frame(bytes)
}

/// Decode a raw tensor-data frame, returning its bytes and frame length.
pub fn decode_tensor_data(stream: &[u8]) -> Result<(&[u8], usize), serde_cbor::Error> {
    decode_frame(stream)
}

/// Encode the `"done"` marker that closes a `push` result's tensor frames.
#[must_use]
pub fn encode_done() -> Vec<u8> {
    encode_frame(DONE.as_bytes())
}

/// `true` if the next frame in `stream` is the `"done"` marker; returns the
/// number of bytes consumed either way so the caller can keep scanning.
pub fn decode_done(stream: &[u8]) -> Result<(bool, usize), serde_cbor::Error> {
    let (body, consumed) = decode_frame(stream)?;
    Ok((body == DONE.as_bytes(), consumed))
}
