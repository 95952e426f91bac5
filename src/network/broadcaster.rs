//! Fan-out hub.
//!
//! Producers call [`Broadcaster::publish`] directly from their own task. Every
//! subscriber owns a bounded queue; publishing is one `try_send` per subscriber, so
//! a slow or dead consumer never holds up a producer. A subscriber whose queue is
//! full or closed is removed inside the same critical section that found it.
//!
//! Two kinds of subscriber exist: wire subscribers receive pre-encoded bytes (the
//! TCP writer tasks), local subscribers receive the message itself (fusion,
//! decimation).

use crate::config::WireFormat;
use crate::error::GatewayError;
use crate::network::wire;
use crate::types::TelemetryMessage;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Identifier handed out by `subscribe`.
pub type SubscriberId = u64;

enum Outlet {
    Wire {
        format: WireFormat,
        tx: mpsc::Sender<Bytes>,
    },
    Local(mpsc::Sender<Arc<TelemetryMessage>>),
}

struct Subscriber {
    outlet: Outlet,
    peer: Option<SocketAddr>,
}

/// Outcome of one publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers that accepted the message.
    pub delivered: usize,
    /// Subscribers removed during this call.
    pub dropped: usize,
}

/// Receiving end of a wire subscription.
#[derive(Debug)]
pub struct WireSubscription {
    /// Handle for [`Broadcaster::unsubscribe`].
    pub id: SubscriberId,
    rx: mpsc::Receiver<Bytes>,
}

impl WireSubscription {
    /// Next encoded record; `None` once the broadcaster dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Receiving end of an in-process subscription.
#[derive(Debug)]
pub struct LocalSubscription {
    /// Handle for [`Broadcaster::unsubscribe`].
    pub id: SubscriberId,
    rx: mpsc::Receiver<Arc<TelemetryMessage>>,
}

impl LocalSubscription {
    /// Next message; `None` once the broadcaster dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Arc<TelemetryMessage>> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Arc<TelemetryMessage>> {
        self.rx.try_recv().ok()
    }
}

/// Thread-safe subscriber set.
pub struct Broadcaster {
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Broadcaster {
    /// Broadcaster whose wire subscribers buffer up to `queue_capacity` records.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    fn insert(&self, outlet: Outlet, peer: Option<SocketAddr>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, Subscriber { outlet, peer });
        id
    }

    /// Register a network consumer. Only messages published after this call
    /// are delivered.
    pub fn subscribe(&self, format: WireFormat, peer: Option<SocketAddr>) -> WireSubscription {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.insert(Outlet::Wire { format, tx }, peer);
        debug!(subscriber = id, ?peer, ?format, "subscriber added");
        WireSubscription { id, rx }
    }

    /// Register an in-process consumer with its own queue depth.
    pub fn subscribe_local(&self, capacity: usize) -> LocalSubscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.insert(Outlet::Local(tx), None);
        debug!(subscriber = id, capacity, "local subscriber added");
        LocalSubscription { id, rx }
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.lock().remove(&id).is_some();
        if removed {
            debug!(subscriber = id, "subscriber removed");
        }
        removed
    }

    /// Current number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver `message` to every subscriber without waiting on any of them.
    pub fn publish(&self, message: TelemetryMessage) -> PublishReport {
        let message = Arc::new(message);
        // Encode once per format, outside the lock
        let json = match wire::encode_json(&message) {
            Ok(line) => Some(line),
            Err(e) => {
                warn!(error = %e, "failed to encode message");
                None
            }
        };
        let binary = wire::encode_binary(&message);

        let mut report = PublishReport::default();
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, subscriber| {
            let outcome = match &subscriber.outlet {
                Outlet::Wire { format, tx } => {
                    let record = match format {
                        WireFormat::Json => json.as_ref(),
                        WireFormat::Binary => binary.as_ref(),
                    };
                    match record {
                        Some(bytes) => tx.try_send(bytes.clone()).map_err(classify),
                        None => return true,
                    }
                }
                Outlet::Local(tx) => tx.try_send(Arc::clone(&message)).map_err(classify),
            };
            match outcome {
                Ok(()) => {
                    report.delivered += 1;
                    true
                }
                Err(reason) => {
                    let gone = GatewayError::SubscriberGone(*id);
                    debug!(peer = ?subscriber.peer, reason, class = ?gone.class(), "{gone}");
                    report.dropped += 1;
                    false
                }
            }
        });
        report
    }
}

fn classify<T>(err: TrySendError<T>) -> &'static str {
    match err {
        TrySendError::Full(_) => "queue full",
        TrySendError::Closed(_) => "connection closed",
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("subscribers", &self.subscriber_count())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}
