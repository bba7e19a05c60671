//! NTRIP caster handshake client.
//!
//! Casters speak an HTTP-like protocol with notoriously loose response
//! framing: some terminate the header with a blank line, some start
//! streaming RTCM right after the status line, some stall after the
//! status line entirely. [`handshake`] copes with all three and hands
//! back whatever payload bytes arrived bundled with the header.

mod error;
mod handshake;

pub use error::HandshakeError;
pub use handshake::{
    CasterConfig, NtripSession, build_request, connect, handshake, split_response,
};
