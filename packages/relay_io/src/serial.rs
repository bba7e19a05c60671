use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::info;

use crate::endpoint::Endpoint;
use crate::error::EndpointError;

/// A serial-port endpoint (8N1, no flow control).
pub struct SerialEndpoint {
    port: Option<SerialStream>,
    label: String,
}

impl SerialEndpoint {
    /// Open `path` (e.g. `/dev/ttyUSB0` or `COM3`) at `baud`.
    pub fn open(path: &str, baud: u32) -> Result<Self, EndpointError> {
        let port = tokio_serial::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| EndpointError::Io(io::Error::other(e)))?;

        info!("opened serial port {} at {} baud", path, baud);
        Ok(Self {
            port: Some(port),
            label: format!("{}@{}", path, baud),
        })
    }
}

#[async_trait]
impl Endpoint for SerialEndpoint {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, EndpointError> {
        let port = self.port.as_mut().ok_or(EndpointError::Closed)?;
        Ok(port.read(buf).await?)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), EndpointError> {
        let port = self.port.as_mut().ok_or(EndpointError::Closed)?;
        port.write_all(data).await?;
        Ok(port.flush().await?)
    }

    async fn close(&mut self) {
        // Dropping the stream closes the file descriptor.
        self.port.take();
    }

    fn label(&self) -> &str {
        &self.label
    }
}
