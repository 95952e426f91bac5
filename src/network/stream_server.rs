//! Broadcast stream listener.
//!
//! Every accepted connection becomes a broadcaster subscriber served by its own
//! writer task. The task exits when the peer closes, a write fails, the
//! broadcaster drops the subscriber, or shutdown is requested; the subscriber is
//! removed in every case.

use crate::config::WireFormat;
use crate::error::AppResult;
use crate::network::broadcaster::{Broadcaster, WireSubscription};
use crate::shutdown::ShutdownSignal;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// TCP listener feeding a [`Broadcaster`].
pub struct StreamServer {
    name: &'static str,
    listener: TcpListener,
    broadcaster: Arc<Broadcaster>,
    format: WireFormat,
}

impl StreamServer {
    /// Serve `broadcaster` on `listener`. `name` labels log lines.
    pub fn new(
        name: &'static str,
        listener: TcpListener,
        broadcaster: Arc<Broadcaster>,
        format: WireFormat,
    ) -> Self {
        Self {
            name,
            listener,
            broadcaster,
            format,
        }
    }

    /// Bound address.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept consumers until `shutdown`, then wait for the writer tasks.
    pub async fn run(self, shutdown: ShutdownSignal) -> AppResult<()> {
        let stream = self.name;
        if let Ok(addr) = self.listener.local_addr() {
            info!(stream, %addr, format = ?self.format, "stream available");
        }
        let mut writers = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        if let Err(e) = socket.set_nodelay(true) {
                            debug!(stream, %peer, error = %e, "set_nodelay failed");
                        }
                        let subscription = self.broadcaster.subscribe(self.format, Some(peer));
                        info!(stream, %peer, subscriber = subscription.id, "telemetry client connected");
                        let broadcaster = self.broadcaster.clone();
                        let shutdown = shutdown.clone();
                        writers.spawn(async move {
                            let (reader, writer) = socket.into_split();
                            let id = subscription.id;
                            let sent = serve_subscriber(reader, writer, subscription, shutdown).await;
                            broadcaster.unsubscribe(id);
                            info!(stream, %peer, records = sent, "telemetry client disconnected");
                        });
                    }
                    Err(e) => error!(stream, error = %e, "accept failed"),
                },
                Some(joined) = writers.join_next(), if !writers.is_empty() => {
                    if let Err(e) = joined {
                        warn!(stream, error = %e, "writer task failed");
                    }
                }
            }
        }

        while writers.join_next().await.is_some() {}
        info!(stream, "stream stopped");
        Ok(())
    }
}

/// Copy records from `subscription` to `writer` until either side goes away.
/// Returns the number of records written.
pub async fn serve_subscriber<R, W>(
    mut reader: R,
    mut writer: W,
    mut subscription: WireSubscription,
    shutdown: ShutdownSignal,
) -> usize
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut sent = 0usize;
    let mut discard = [0u8; 256];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            record = subscription.recv() => match record {
                Some(bytes) => {
                    // A peer that stops reading must not hold up shutdown
                    let written = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        written = writer.write_all(&bytes) => written,
                    };
                    if let Err(e) = written {
                        debug!(error = %e, "write to subscriber failed");
                        break;
                    }
                    sent += 1;
                }
                // Dropped by the broadcaster
                None => break,
            },
            read = reader.read(&mut discard) => match read {
                Ok(0) | Err(_) => break,
                // Consumers have nothing to say; ignore
                Ok(_) => {}
            },
        }
    }
    let _ = writer.shutdown().await;
    sent
}
