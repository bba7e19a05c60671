use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::EndpointError;

/// A full-duplex TCP endpoint.
pub struct TcpEndpoint {
    stream: Option<TcpStream>,
    label: String,
}

impl TcpEndpoint {
    /// Connect to `host:port` with a connect timeout.
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, EndpointError> {
        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| EndpointError::Timeout)??;
        stream.set_nodelay(true)?;
        debug!("connected to {}", addr);
        Ok(Self {
            stream: Some(stream),
            label: addr,
        })
    }

    /// Wrap an already-accepted stream.
    pub fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            stream: Some(stream),
            label: peer.to_string(),
        }
    }
}

#[async_trait]
impl Endpoint for TcpEndpoint {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, EndpointError> {
        let stream = self.stream.as_mut().ok_or(EndpointError::Closed)?;
        Ok(stream.read(buf).await?)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), EndpointError> {
        let stream = self.stream.as_mut().ok_or(EndpointError::Closed)?;
        Ok(stream.write_all(data).await?)
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("closed {}", self.label);
        }
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Write-only endpoint over the write half of an accepted connection.
///
/// The read half stays with the per-connection keep-alive loop; reading
/// here reports end of stream.
pub struct TcpSink {
    half: Option<OwnedWriteHalf>,
    label: String,
}

impl TcpSink {
    pub fn new(half: OwnedWriteHalf, peer: SocketAddr) -> Self {
        Self {
            half: Some(half),
            label: peer.to_string(),
        }
    }
}

#[async_trait]
impl Endpoint for TcpSink {
    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, EndpointError> {
        Ok(0)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), EndpointError> {
        let half = self.half.as_mut().ok_or(EndpointError::Closed)?;
        Ok(half.write_all(data).await?)
    }

    async fn close(&mut self) {
        if let Some(mut half) = self.half.take() {
            let _ = half.shutdown().await;
            debug!("closed sink {}", self.label);
        }
    }

    fn label(&self) -> &str {
        &self.label
    }
}
