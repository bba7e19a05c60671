use std::collections::BTreeMap;

use tracing::trace;

use crate::crc::crc24q;

/// Leading byte of every RTCM3 frame.
pub const SYNC_MARKER: u8 = 0xD3;

/// Bytes of unsynced garbage tolerated before the buffer is cleared.
const DEFAULT_GARBAGE_CAP: usize = 1024;

/// What to do with the 3-byte frame trailer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderPolicy {
    /// Verify the trailer as CRC-24Q; resynchronize byte-by-byte on
    /// mismatch. A corrupted length field then costs one frame, not a
    /// stretch of subsequent valid data.
    ValidateCrc,
    /// Trust the declared length and never look at the trailer. Matches
    /// receivers that accept the stream unchecked.
    TrustLength,
}

/// One complete RTCM3 frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Message number from the first 12 payload bits. `None` when the
    /// payload is shorter than 2 bytes or the number is 0; such frames
    /// are counted but not attributed to a type.
    pub message_type: Option<u16>,
    /// Declared payload length (10-bit field).
    pub payload_len: u16,
    /// The whole frame: marker, length header, payload, trailer.
    pub bytes: Vec<u8>,
}

/// Stateful decoder; feed it arbitrary chunks of a single byte stream.
///
/// One decoder per ingress stream. Never fails: malformed input only
/// resynchronizes.
pub struct FrameDecoder {
    buf: Vec<u8>,
    policy: DecoderPolicy,
    garbage_cap: usize,
    frames_decoded: u64,
    crc_failures: u64,
    type_counts: BTreeMap<u16, u64>,
}

impl FrameDecoder {
    /// Decoder with CRC validation and the default garbage cap.
    pub fn new() -> Self {
        Self::with_policy(DecoderPolicy::ValidateCrc)
    }

    pub fn with_policy(policy: DecoderPolicy) -> Self {
        Self {
            buf: Vec::new(),
            policy,
            garbage_cap: DEFAULT_GARBAGE_CAP,
            frames_decoded: 0,
            crc_failures: 0,
            type_counts: BTreeMap::new(),
        }
    }

    pub fn with_garbage_cap(mut self, cap: usize) -> Self {
        self.garbage_cap = cap;
        self
    }

    /// Append `bytes` and extract every complete frame now available.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            let Some(sync) = self.buf.iter().position(|&b| b == SYNC_MARKER) else {
                // No marker anywhere: everything buffered is garbage.
                if self.buf.len() > self.garbage_cap {
                    trace!(len = self.buf.len(), "garbage cap exceeded, clearing buffer");
                    self.buf.clear();
                }
                break;
            };
            if sync > 0 {
                self.buf.drain(..sync);
            }

            // Need the 2-byte length header.
            if self.buf.len() < 3 {
                break;
            }
            let declared = (((self.buf[1] & 0x03) as usize) << 8) | self.buf[2] as usize;
            let total = 3 + declared + 3;
            if self.buf.len() < total {
                break;
            }

            if self.policy == DecoderPolicy::ValidateCrc {
                let trailer = ((self.buf[total - 3] as u32) << 16)
                    | ((self.buf[total - 2] as u32) << 8)
                    | self.buf[total - 1] as u32;
                if crc24q(&self.buf[..total - 3]) != trailer {
                    self.crc_failures += 1;
                    trace!(declared, "trailer checksum mismatch, resynchronizing");
                    // Step past the false marker and search again.
                    self.buf.drain(..1);
                    continue;
                }
            }

            let frame_bytes: Vec<u8> = self.buf.drain(..total).collect();
            let payload = &frame_bytes[3..total - 3];
            let message_type = if payload.len() >= 2 {
                let t = (((payload[0] as u16) << 4) | ((payload[1] as u16) >> 4)) & 0x0FFF;
                (t > 0).then_some(t)
            } else {
                None
            };

            self.frames_decoded += 1;
            if let Some(t) = message_type {
                *self.type_counts.entry(t).or_insert(0) += 1;
            }
            frames.push(Frame {
                message_type,
                payload_len: declared as u16,
                bytes: frame_bytes,
            });
        }

        frames
    }

    /// Total frames emitted since construction.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Candidate frames rejected by trailer validation.
    pub fn crc_failures(&self) -> u64 {
        self.crc_failures
    }

    /// Distinct message types seen, ascending.
    pub fn message_types(&self) -> Vec<u16> {
        self.type_counts.keys().copied().collect()
    }

    /// Per-type frame counts.
    pub fn type_counts(&self) -> &BTreeMap<u16, u64> {
        &self.type_counts
    }

    /// Bytes currently buffered awaiting a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
