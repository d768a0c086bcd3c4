/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Wire protocol for UPM frame encoding.
//!
//! Every envelope travels as one length-prefixed frame. The flags byte tells
//! the receiver whether a file descriptor was transferred alongside the frame.
//!
//! # Wire Format
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ Frame Length (4 bytes, big-endian u32, excludes header)       │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Protocol Version (1 byte, currently 0x01)                     │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Flags (1 byte)                                                │
//! │   0x01 = a port was transferred with this frame               │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Payload (JSON-encoded Envelope)                               │
//! └───────────────────────────────────────────────────────────────┘
//! ```

use crate::common::UpmError;
use crate::message::Envelope;

/// Protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Flag: a port accompanies this frame.
pub const FLAG_CARRIES_PORT: u8 = 0x01;

/// Frame header size: 4 bytes length + 1 byte version + 1 byte flags.
pub const HEADER_SIZE: usize = 6;

/// Maximum frame size (16 MiB hard limit).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A decoded but not yet deserialized frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Flags byte from the header.
    pub flags: u8,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Returns `true` if a port was transferred with this frame.
    #[must_use]
    pub const fn carries_port(&self) -> bool {
        self.flags & FLAG_CARRIES_PORT != 0
    }

    /// Deserialize the payload as an [`Envelope`].
    pub fn envelope(&self) -> Result<Envelope, UpmError> {
        serde_json::from_slice(&self.payload).map_err(UpmError::from)
    }
}

/// Serialize an envelope into a complete frame.
pub fn encode_frame(
    envelope: &Envelope,
    carries_port: bool,
    max_size: usize,
) -> Result<Vec<u8>, UpmError> {
    let payload = serde_json::to_vec(envelope)?;
    let limit = max_size.min(MAX_FRAME_SIZE);

    if payload.len() > limit {
        return Err(UpmError::ProtocolError(format!(
            "Frame size {} exceeds maximum {limit}",
            payload.len()
        )));
    }

    #[allow(clippy::cast_possible_truncation)] // Bounded by MAX_FRAME_SIZE
    let length = payload.len() as u32;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(PROTOCOL_VERSION);
    frame.push(if carries_port { FLAG_CARRIES_PORT } else { 0 });
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Incremental frame decoder.
///
/// Bytes are fed in whatever chunks the socket yields; complete frames are
/// pulled out with [`FrameDecoder::next_frame`]. Errors are fatal for the
/// stream since the decoder cannot resynchronize after a bad header.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_size: usize,
}

impl FrameDecoder {
    /// Create a decoder that rejects payloads larger than `max_size`.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_size: max_size.min(MAX_FRAME_SIZE),
        }
    }

    /// Append received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, UpmError> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        let version = self.buffer[4];
        let flags = self.buffer[5];

        if version != PROTOCOL_VERSION {
            return Err(UpmError::ProtocolError(format!(
                "Unsupported protocol version: {version}, expected {PROTOCOL_VERSION}"
            )));
        }

        if length > self.max_size {
            return Err(UpmError::ProtocolError(format!(
                "Frame size {length} exceeds maximum {}",
                self.max_size
            )));
        }

        if self.buffer.len() < HEADER_SIZE + length {
            return Ok(None);
        }

        let payload = self.buffer[HEADER_SIZE..HEADER_SIZE + length].to_vec();
        self.buffer.drain(..HEADER_SIZE + length);
        Ok(Some(Frame { flags, payload }))
    }
}
