//! Outbound CAN.
//!
//! The sink owns the only transmit connection. Every send takes the lock, connects
//! if needed, transmits once, and on failure drops the connection so the next
//! caller reconnects. Failures are returned, never retried here.

use crate::error::{AppResult, GatewayError};
use crate::hardware::can::{CanConnector, CanTransport};
use crate::types::Command;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Serialized access to the transmit connection.
pub struct CanSink {
    connector: Arc<dyn CanConnector>,
    transport: Mutex<Option<Box<dyn CanTransport>>>,
}

impl CanSink {
    /// Sink that opens connections through `connector` on demand.
    pub fn new(connector: Arc<dyn CanConnector>) -> Self {
        Self {
            connector,
            transport: Mutex::new(None),
        }
    }

    /// Validate `command` and put it on the bus.
    pub async fn send(&self, command: &Command) -> AppResult<()> {
        let frame = command.to_can_frame()?;

        let mut guard = self.transport.lock().await;
        if guard.is_none() {
            let transport = self.connector.connect().await?;
            info!(endpoint = %self.connector.describe(), "CAN transmit connected");
            *guard = Some(transport);
        }
        let transport = guard.as_mut().ok_or(GatewayError::NotConnected)?;

        let result = transport.send(&frame).await;
        match &result {
            Ok(()) => debug!(%frame, "command sent"),
            Err(e) => {
                warn!(%frame, error = %e, "CAN transmit failed, dropping connection");
                *guard = None;
            }
        }
        result
    }

    /// Whether a transmit connection is currently open.
    pub async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_some()
    }

    /// Close the transmit connection.
    pub async fn disconnect(&self) {
        self.transport.lock().await.take();
    }
}

impl std::fmt::Debug for CanSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanSink")
            .field("endpoint", &self.connector.describe())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::CanFrame;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records every transmitted frame; fails the sends listed in `fail_on`.
    #[derive(Default)]
    pub(crate) struct RecordingConnector {
        pub connects: AtomicUsize,
        pub sent: Arc<SyncMutex<Vec<CanFrame>>>,
        pub fail_on: SyncMutex<Vec<usize>>,
        pub attempts: Arc<AtomicUsize>,
        pub send_delay: Duration,
    }

    struct RecordingTransport {
        sent: Arc<SyncMutex<Vec<CanFrame>>>,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl CanTransport for RecordingTransport {
        async fn recv(&mut self, _timeout: Duration) -> AppResult<Option<CanFrame>> {
            Ok(None)
        }

        async fn send(&mut self, frame: &CanFrame) -> AppResult<()> {
            if self.fail {
                return Err(GatewayError::ConnectionClosed);
            }
            // Split the write in two so interleaving would be visible
            self.sent.lock().push(*frame);
            tokio::time::sleep(self.delay).await;
            let mut sent = self.sent.lock();
            let last = sent.len() - 1;
            assert_eq!(sent[last], *frame, "another send interleaved");
            sent.push(*frame);
            Ok(())
        }
    }

    #[async_trait]
    impl CanConnector for RecordingConnector {
        async fn connect(&self) -> AppResult<Box<dyn CanTransport>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(RecordingTransport {
                sent: self.sent.clone(),
                fail: self.fail_on.lock().contains(&attempt),
                delay: self.send_delay,
            }))
        }

        fn describe(&self) -> String {
            "recording".to_string()
        }
    }

    fn command(id: u32) -> Command {
        Command {
            target_arbitration_id: id,
            payload: vec![1, 2],
            extended: false,
        }
    }

    #[tokio::test]
    async fn connects_lazily_and_reuses_connection() {
        let connector = Arc::new(RecordingConnector::default());
        let sink = CanSink::new(connector.clone());
        assert!(!sink.is_connected().await);

        sink.send(&command(0x10)).await.unwrap();
        sink.send(&command(0x11)).await.unwrap();
        assert!(sink.is_connected().await);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(connector.sent.lock().len(), 4);
    }

    #[tokio::test]
    async fn failure_tears_down_and_next_send_reconnects() {
        let connector = Arc::new(RecordingConnector::default());
        connector.fail_on.lock().push(0);
        let sink = CanSink::new(connector.clone());

        assert!(sink.send(&command(0x10)).await.is_err());
        assert!(!sink.is_connected().await);

        sink.send(&command(0x10)).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_command_never_reaches_the_bus() {
        let connector = Arc::new(RecordingConnector::default());
        let sink = CanSink::new(connector.clone());
        let bad = Command {
            target_arbitration_id: 0x800,
            payload: vec![],
            extended: false,
        };
        let err = sink.send(&bad).await.unwrap_err();
        assert!(matches!(err, GatewayError::MalformedFrame(_)));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_senders_do_not_interleave() {
        let connector = Arc::new(RecordingConnector {
            send_delay: Duration::from_millis(2),
            ..Default::default()
        });
        let sink = Arc::new(CanSink::new(connector.clone()));

        let tasks: Vec<_> = (0..8u32)
            .map(|i| {
                let sink = sink.clone();
                tokio::spawn(async move {
                    for j in 0..5u32 {
                        sink.send(&command(i * 16 + j)).await.unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let sent = connector.sent.lock();
        assert_eq!(sent.len(), 80);
        for pair in sent.chunks(2) {
            assert_eq!(pair[0], pair[1]);
        }
    }
}
