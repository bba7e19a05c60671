//! Incremental RTCM3 frame decoder.
//!
//! Consumes an append-only byte stream and extracts complete frames,
//! resynchronizing on corruption instead of failing: this is a live,
//! lossy telemetry stream, not a file to be rejected. Feed it bytes in
//! any chunking; the same overall sequence yields the same frames.

mod crc;
mod decoder;

pub use crc::crc24q;
pub use decoder::{DecoderPolicy, Frame, FrameDecoder, SYNC_MARKER};
