//! Serial port plumbing for UART-attached receivers.
//!
//! Any `AsyncRead + AsyncWrite` stream can stand in for the port, so tests drive
//! sources over `tokio::io::duplex`.
//!
//! Opening a real port requires the `serial` feature.

use crate::error::AppResult;
#[cfg(not(feature = "serial"))]
use crate::error::GatewayError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Async serial I/O.
///
/// Implemented for `tokio_serial::SerialStream`, `tokio::io::DuplexStream` and
/// anything else that is `AsyncRead + AsyncWrite + Unpin + Send`.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Opens serial ports for a source.
#[async_trait]
pub trait SerialConnector: Send + Sync {
    /// Open the port at `baud`.
    async fn open(&self, baud: u32) -> AppResult<DynSerial>;

    /// Endpoint for logs.
    fn describe(&self) -> String;
}

/// Opens a device node such as `/dev/ttymxc1`.
#[derive(Debug, Clone)]
pub struct DevicePortConnector {
    path: String,
}

impl DevicePortConnector {
    /// Connector for the port at `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SerialConnector for DevicePortConnector {
    async fn open(&self, baud: u32) -> AppResult<DynSerial> {
        let port = open_serial_async(&self.path, baud).await?;
        Ok(port)
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

/// Open a serial port on the blocking pool with 8N1 and no flow control.
#[cfg(feature = "serial")]
pub async fn open_serial_async(path: &str, baud_rate: u32) -> AppResult<DynSerial> {
    use crate::error::GatewayError;
    use tokio_serial::SerialPortBuilderExt;

    let owned = path.to_string();
    let port = tokio::task::spawn_blocking(move || {
        tokio_serial::new(&owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
    })
    .await?
    .map_err(|e| GatewayError::transport(format!("failed to open serial port {path}: {e}")))?;
    Ok(Box::new(port))
}

/// Open a serial port. Always fails without the `serial` feature.
#[cfg(not(feature = "serial"))]
pub async fn open_serial_async(_path: &str, _baud_rate: u32) -> AppResult<DynSerial> {
    Err(GatewayError::FeatureNotEnabled("serial".to_string()))
}

/// Read and discard whatever arrives within `timeout`.
///
/// Returns the number of bytes thrown away.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + timeout;
    let mut total = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }
    total
}
