//! Transport endpoint abstraction.
//!
//! The relay moves bytes between TCP sockets, serial ports, and tunnel
//! channels interchangeably. Everything above this crate depends only on
//! the [`Endpoint`] trait: blocking-style read, write-all, and an
//! idempotent close that releases the underlying OS resource exactly once.

mod endpoint;
mod error;
mod serial;
mod tcp;

pub use endpoint::Endpoint;
pub use error::EndpointError;
pub use serial::SerialEndpoint;
pub use tcp::{TcpEndpoint, TcpSink};
