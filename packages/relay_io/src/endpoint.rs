use async_trait::async_trait;

use crate::error::EndpointError;

/// A readable/writable transport with single-owner close semantics.
///
/// Implementations wrap one OS resource (socket, serial port, tunnel
/// channel). `close` is idempotent; `read`/`write_all` fail with
/// [`EndpointError::Closed`] once the endpoint has been closed.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Read up to `buf.len()` bytes. `Ok(0)` means end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, EndpointError>;

    /// Write the whole buffer or fail.
    async fn write_all(&mut self, data: &[u8]) -> Result<(), EndpointError>;

    /// Release the underlying resource. Safe to call more than once.
    async fn close(&mut self);

    /// Short human-readable identity for log lines.
    fn label(&self) -> &str;
}

#[async_trait]
impl Endpoint for Box<dyn Endpoint> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, EndpointError> {
        (**self).read(buf).await
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), EndpointError> {
        (**self).write_all(data).await
    }

    async fn close(&mut self) {
        (**self).close().await
    }

    fn label(&self) -> &str {
        (**self).label()
    }
}
