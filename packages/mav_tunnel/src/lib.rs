//! Byte-stream tunnel over MAVLink SERIAL_CONTROL.
//!
//! Telemetry radios carry a generic serial-passthrough message whose data
//! field is fixed at 70 bytes. This crate splits an arbitrary payload into
//! paced, zero-padded chunks on the way out, polls the autopilot for
//! buffered receiver output on the way in, and reassembles the inbound
//! chunks into an ordered byte stream. The tunnel is usually the single
//! onward path to a physical receiver, so link failures here are fatal to
//! the owning relay rather than locally recoverable.

mod tunnel;
pub mod wire;

pub use tunnel::{SerialTunnel, TunnelConfig, TunnelEndpoint, TunnelError, split_chunks};
pub use wire::{CHUNK_SIZE, MavCodec, MavParser, SerialControl, flags};
