//! Signal sources and their shared acquisition loop.
//!
//! Every source follows the same state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected --(I/O error)--> Disconnected
//! ```
//!
//! [`run_source`] drives any [`SignalSource`]: it connects, reads until a transport
//! error, tears the connection down, waits out the reconnect delay and starts
//! again. Malformed frames are dropped without leaving `Connected`. A source's
//! errors never leave its own task.

pub mod can;
pub mod gnss;
pub mod imu;
pub mod serial;
pub mod ubx;

use crate::config::ReconnectConfig;
use crate::error::{AppResult, ErrorClass};
use crate::router::FrameRouter;
use crate::shutdown::ShutdownSignal;
use crate::types::{SignalFrame, SourceKind};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Connection state of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Waiting to retry.
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Reading frames.
    Connected,
    /// Loop exited after shutdown.
    Stopped,
}

/// Delay between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay after the first failure.
    pub delay: Duration,
    /// Growth per consecutive failure.
    pub multiplier: f64,
    /// Cap on the delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            delay: Duration::from_millis(config.delay_ms),
            multiplier: config.backoff_multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl ReconnectPolicy {
    /// Fixed delay, no growth.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            multiplier: 1.0,
            max_delay: delay,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay.max(self.delay);
        }
        Duration::from_secs_f64(secs)
    }
}

/// A hardware transport producing [`SignalFrame`]s.
///
/// `read` waits at most the source's own timeout; `Ok(None)` means nothing
/// arrived in that window.
#[async_trait]
pub trait SignalSource: Send {
    /// Which stream this source feeds.
    fn kind(&self) -> SourceKind;

    /// Human-readable endpoint for logs.
    fn describe(&self) -> String;

    /// Open and initialise the transport.
    async fn connect(&mut self) -> AppResult<()>;

    /// Next frame, if any arrived before the read timeout.
    async fn read(&mut self) -> AppResult<Option<SignalFrame>>;

    /// Drop the transport.
    fn disconnect(&mut self);
}

/// Run `source` until `shutdown` fires.
///
/// State transitions are published on `state` for observers.
pub async fn run_source<S>(
    mut source: S,
    router: Arc<FrameRouter>,
    policy: ReconnectPolicy,
    shutdown: ShutdownSignal,
    state: watch::Sender<SourceState>,
) where
    S: SignalSource,
{
    let kind = source.kind();
    let endpoint = source.describe();
    let mut failures: u32 = 0;

    'outer: while !shutdown.is_cancelled() {
        state.send_replace(SourceState::Connecting);
        debug!(source = %kind, %endpoint, "connecting");

        let connected = tokio::select! {
            _ = shutdown.cancelled() => break 'outer,
            result = source.connect() => result,
        };

        match connected {
            Ok(()) => {
                failures = 0;
                state.send_replace(SourceState::Connected);
                info!(source = %kind, %endpoint, "connected");

                loop {
                    let read = tokio::select! {
                        _ = shutdown.cancelled() => {
                            source.disconnect();
                            break 'outer;
                        }
                        result = source.read() => result,
                    };
                    match read {
                        Ok(Some(frame)) => {
                            router.route(frame);
                        }
                        Ok(None) => {}
                        Err(e) if e.class() == ErrorClass::MalformedFrame => {
                            debug!(source = %kind, error = %e, "dropping malformed frame");
                        }
                        Err(e) => {
                            warn!(source = %kind, %endpoint, error = %e, "transport failed, reconnecting");
                            break;
                        }
                    }
                }
                source.disconnect();
            }
            Err(e) => {
                warn!(source = %kind, %endpoint, error = %e, "connect failed");
                source.disconnect();
            }
        }

        state.send_replace(SourceState::Disconnected);
        failures = failures.saturating_add(1);
        let delay = policy.delay_for(failures);
        debug!(source = %kind, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    state.send_replace(SourceState::Stopped);
    info!(source = %kind, "source stopped");
}
