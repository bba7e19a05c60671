use std::io;

/// Errors surfaced by endpoint I/O.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("endpoint is closed")]
    Closed,
}

impl EndpointError {
    /// Whether the error means the peer is gone for good (as opposed to a
    /// timeout that a caller may choose to ride out).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EndpointError::Timeout)
    }
}
