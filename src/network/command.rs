//! Inbound command port.
//!
//! Each client gets its own task that splits the stream into records, parses each
//! into a [`Command`](crate::types::Command) and hands it to the [`CanSink`]. Bad
//! records and failed sends are logged and skipped; the client stays connected.

use crate::config::WireFormat;
use crate::error::AppResult;
use crate::network::sink::CanSink;
use crate::network::wire::{self, RecordFramer};
use crate::shutdown::ShutdownSignal;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Accept loop for command clients.
pub struct CommandChannel {
    listener: TcpListener,
    sink: Arc<CanSink>,
    format: WireFormat,
}

/// Counters for one client session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Commands put on the bus.
    pub sent: usize,
    /// Records that failed to parse or to send.
    pub rejected: usize,
}

impl CommandChannel {
    /// Serve `listener`, forwarding to `sink`.
    pub fn new(listener: TcpListener, sink: Arc<CanSink>, format: WireFormat) -> Self {
        Self {
            listener,
            sink,
            format,
        }
    }

    /// Bound address.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until `shutdown`, then wait for their tasks.
    pub async fn run(self, shutdown: ShutdownSignal) -> AppResult<()> {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, format = ?self.format, "command channel listening");
        }
        let mut clients = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "command client connected");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, error = %e, "set_nodelay failed");
                        }
                        let sink = self.sink.clone();
                        let shutdown = shutdown.clone();
                        let format = self.format;
                        clients.spawn(async move {
                            let stats = serve_client(stream, sink, format, shutdown).await;
                            info!(%peer, sent = stats.sent, rejected = stats.rejected, "command client disconnected");
                        });
                    }
                    Err(e) => error!(error = %e, "command accept failed"),
                },
                Some(joined) = clients.join_next(), if !clients.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "command client task failed");
                    }
                }
            }
        }

        while clients.join_next().await.is_some() {}
        info!("command channel stopped");
        Ok(())
    }
}

/// Serve one client until EOF, a read error or shutdown.
pub async fn serve_client<R>(
    mut stream: R,
    sink: Arc<CanSink>,
    format: WireFormat,
    shutdown: ShutdownSignal,
) -> ClientStats
where
    R: AsyncRead + Unpin + Send,
{
    let mut framer = RecordFramer::new(format);
    let mut stats = ClientStats::default();

    loop {
        let record = tokio::select! {
            _ = shutdown.cancelled() => break,
            record = framer.read_record(&mut stream) => record,
        };
        let record = match record {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(e) if e.class() == crate::error::ErrorClass::MalformedFrame => {
                warn!(error = %e, "invalid command record");
                stats.rejected += 1;
                continue;
            }
            Err(e) => {
                debug!(error = %e, "command stream read failed");
                break;
            }
        };

        let parsed = match format {
            WireFormat::Json => wire::parse_json_command(&record),
            WireFormat::Binary => wire::parse_binary_command(&record),
        };
        let command = match parsed {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "invalid CAN TX request");
                stats.rejected += 1;
                continue;
            }
        };

        match sink.send(&command).await {
            Ok(()) => stats.sent += 1,
            Err(e) => {
                warn!(
                    can_id = %wire::format_can_id(command.target_arbitration_id),
                    error = %e,
                    "CAN TX failed"
                );
                stats.rejected += 1;
            }
        }
    }
    stats
}
