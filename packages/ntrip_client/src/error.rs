use relay_io::EndpointError;

/// Handshake failures, classified so callers can present a specific
/// remediation. None of these are retried here; retry policy belongs to
/// the caller.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("authentication failed (401/403), check username/password")]
    AuthFailed,

    #[error("mountpoint not found (404), check mountpoint name")]
    MountpointNotFound,

    #[error("caster internal error (500)")]
    ServerError,

    #[error("unexpected caster response: {0}")]
    UnexpectedStatus(String),

    #[error("timed out waiting for caster response header")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(#[from] EndpointError),
}
