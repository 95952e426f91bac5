//! CAN transports and the CAN source.
//!
//! A [`CanConnector`] opens a [`CanTransport`]; the source and the command sink
//! both go through this pair, so they work the same over SocketCAN or over the
//! TCP bridge.
//!
//! The bridge is a remote process that connects to the gateway and streams frames
//! as JSON lines (`{"id": "0x003B", "data": [...]}`) or 21-byte binary records.
//! One bridge peer is served at a time.

use super::SignalSource;
use crate::clock;
use crate::config::WireFormat;
use crate::error::{AppResult, GatewayError};
use crate::network::wire::{self, RecordFramer};
use crate::types::{CanFrame, SignalFrame, SourceKind};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::info;

/// An open CAN connection.
#[async_trait]
pub trait CanTransport: Send {
    /// Wait up to `timeout` for the next frame.
    async fn recv(&mut self, timeout: Duration) -> AppResult<Option<CanFrame>>;

    /// Transmit one frame.
    async fn send(&mut self, frame: &CanFrame) -> AppResult<()>;
}

/// Opens [`CanTransport`]s.
#[async_trait]
pub trait CanConnector: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> AppResult<Box<dyn CanTransport>>;

    /// Endpoint for logs.
    fn describe(&self) -> String;
}

// =============================================================================
// Stream transport (TCP bridge, tests)
// =============================================================================

/// CAN frames carried over a byte stream.
pub struct StreamTransport<S> {
    stream: S,
    framer: RecordFramer,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap `stream` using `format` framing.
    pub fn new(stream: S, format: WireFormat) -> Self {
        Self {
            stream,
            framer: RecordFramer::new(format),
        }
    }

    fn parse(&self, record: &[u8]) -> AppResult<CanFrame> {
        match self.framer.format() {
            WireFormat::Json => wire::parse_json_frame(record),
            WireFormat::Binary => wire::decode_can_record(record).map(|(frame, _)| frame),
        }
    }
}

#[async_trait]
impl<S> CanTransport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self, timeout: Duration) -> AppResult<Option<CanFrame>> {
        let record = match tokio::time::timeout(timeout, self.framer.read_record(&mut self.stream))
            .await
        {
            Err(_) => return Ok(None),
            Ok(result) => result?,
        };
        match record {
            Some(record) => self.parse(&record).map(Some),
            None => Err(GatewayError::ConnectionClosed),
        }
    }

    async fn send(&mut self, frame: &CanFrame) -> AppResult<()> {
        match self.framer.format() {
            WireFormat::Json => {
                let line = wire::encode_json_frame(frame)?;
                self.stream.write_all(&line).await?;
            }
            WireFormat::Binary => {
                let record = wire::encode_can_record(frame, clock::now_ns());
                self.stream.write_all(&record).await?;
            }
        }
        self.stream.flush().await?;
        Ok(())
    }
}

/// Accepts one bridge peer per `connect` on an already-bound listener.
pub struct TcpBridgeConnector {
    listener: TcpListener,
    format: WireFormat,
}

impl TcpBridgeConnector {
    /// Serve bridge peers on `listener`.
    pub fn new(listener: TcpListener, format: WireFormat) -> Self {
        Self { listener, format }
    }

    /// Bound address.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl CanConnector for TcpBridgeConnector {
    async fn connect(&self) -> AppResult<Box<dyn CanTransport>> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        info!(%peer, format = ?self.format, "CAN bridge connected");
        Ok(Box::new(StreamTransport::new(stream, self.format)))
    }

    fn describe(&self) -> String {
        match self.listener.local_addr() {
            Ok(addr) => format!("tcp-bridge://{addr}"),
            Err(_) => "tcp-bridge".to_string(),
        }
    }
}

// =============================================================================
// SocketCAN
// =============================================================================

/// Opens a raw SocketCAN socket on a named interface.
#[derive(Debug, Clone)]
pub struct SocketCanConnector {
    interface: String,
}

impl SocketCanConnector {
    /// Connector for `interface` (`can0`, `vcan0`).
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }
}

#[cfg(feature = "socketcan")]
mod socketcan_impl {
    use super::*;
    use socketcan::{
        CanFrame as BusFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Id, Socket,
        StandardId,
    };
    use tokio::sync::Mutex;
    use tracing::debug;

    pub(super) struct SocketCanTransport {
        socket: Arc<Mutex<CanSocket>>,
        read_timeout: Option<Duration>,
    }

    impl SocketCanTransport {
        pub(super) async fn open(interface: &str) -> AppResult<Self> {
            let name = interface.to_string();
            let socket = tokio::task::spawn_blocking(move || CanSocket::open(&name))
                .await?
                .map_err(|e| GatewayError::transport(format!("open {interface}: {e}")))?;
            Ok(Self {
                socket: Arc::new(Mutex::new(socket)),
                read_timeout: None,
            })
        }
    }

    fn to_bus_frame(frame: &CanFrame) -> AppResult<BusFrame> {
        let id = if frame.is_extended() {
            ExtendedId::new(frame.arbitration_id()).map(Id::Extended)
        } else {
            u16::try_from(frame.arbitration_id())
                .ok()
                .and_then(StandardId::new)
                .map(Id::Standard)
        }
        .ok_or_else(|| GatewayError::malformed(format!("invalid CAN id {frame}")))?;
        BusFrame::new(id, frame.data())
            .ok_or_else(|| GatewayError::malformed(format!("cannot build bus frame {frame}")))
    }

    #[async_trait]
    impl CanTransport for SocketCanTransport {
        async fn recv(&mut self, timeout: Duration) -> AppResult<Option<CanFrame>> {
            let socket = self.socket.clone();
            let set_timeout = (self.read_timeout != Some(timeout)).then_some(timeout);
            let received = tokio::task::spawn_blocking(move || {
                let socket = socket.blocking_lock();
                if let Some(timeout) = set_timeout {
                    socket.set_read_timeout(timeout)?;
                }
                socket.read_frame()
            })
            .await?;
            self.read_timeout = Some(timeout);

            match received {
                Ok(BusFrame::Data(frame)) => {
                    CanFrame::new(frame.raw_id(), frame.data(), frame.is_extended()).map(Some)
                }
                Ok(_) => {
                    debug!("ignoring remote or error frame");
                    Ok(None)
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            }
        }

        async fn send(&mut self, frame: &CanFrame) -> AppResult<()> {
            let bus_frame = to_bus_frame(frame)?;
            let socket = self.socket.clone();
            tokio::task::spawn_blocking(move || socket.blocking_lock().write_frame(&bus_frame))
                .await??;
            Ok(())
        }
    }
}

#[async_trait]
impl CanConnector for SocketCanConnector {
    #[cfg(feature = "socketcan")]
    async fn connect(&self) -> AppResult<Box<dyn CanTransport>> {
        let transport = socketcan_impl::SocketCanTransport::open(&self.interface).await?;
        info!(interface = %self.interface, "SocketCAN opened");
        Ok(Box::new(transport))
    }

    #[cfg(not(feature = "socketcan"))]
    async fn connect(&self) -> AppResult<Box<dyn CanTransport>> {
        Err(GatewayError::FeatureNotEnabled("socketcan".to_string()))
    }

    fn describe(&self) -> String {
        format!("socketcan://{}", self.interface)
    }
}

// =============================================================================
// Source
// =============================================================================

/// Reads CAN frames through a [`CanConnector`].
pub struct CanSource {
    connector: Arc<dyn CanConnector>,
    transport: Option<Box<dyn CanTransport>>,
    recv_timeout: Duration,
}

impl CanSource {
    /// Source reading through `connector`, waiting at most `recv_timeout` per read.
    pub fn new(connector: Arc<dyn CanConnector>, recv_timeout: Duration) -> Self {
        Self {
            connector,
            transport: None,
            recv_timeout,
        }
    }
}

#[async_trait]
impl SignalSource for CanSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Can
    }

    fn describe(&self) -> String {
        self.connector.describe()
    }

    async fn connect(&mut self) -> AppResult<()> {
        self.transport = Some(self.connector.connect().await?);
        Ok(())
    }

    async fn read(&mut self) -> AppResult<Option<SignalFrame>> {
        let transport = self.transport.as_mut().ok_or(GatewayError::NotConnected)?;
        let frame = transport.recv(self.recv_timeout).await?;
        Ok(frame.map(|frame| SignalFrame::can(frame, clock::now_ns())))
    }

    fn disconnect(&mut self) {
        self.transport = None;
    }
}
