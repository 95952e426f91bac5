//! Process wiring.
//!
//! [`Gateway::start`] binds every listener first, so an unavailable port fails
//! startup before any task runs. It then spawns one task per source, per
//! listener and per derived stream, all sharing one shutdown signal.
//! [`Gateway::shutdown`] fires the signal and joins every task within the
//! configured timeout.

use crate::config::{CanInput, GatewayConfig};
use crate::data::DecimatorStage;
use crate::decoder::DecoderRegistry;
use crate::error::{AppResult, GatewayError};
use crate::fusion::FusionStage;
use crate::hardware::can::{CanConnector, CanSource, SocketCanConnector, TcpBridgeConnector};
use crate::hardware::gnss::{GnssSettings, GnssSource};
use crate::hardware::imu::{BusOpener, I2cDevOpener, ImuSource};
use crate::hardware::serial::{DevicePortConnector, SerialConnector};
use crate::hardware::{run_source, ReconnectPolicy, SignalSource, SourceState};
use crate::network::{Broadcaster, CanSink, CommandChannel, StreamServer};
use crate::router::FrameRouter;
use crate::shutdown::{self, ShutdownTrigger};
use crate::types::SourceKind;
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Hardware endpoints. Anything left `None` is built from the configuration.
#[derive(Default)]
pub struct Hardware {
    /// Transmit side of the CAN bus, used by the command sink.
    pub can_tx: Option<Arc<dyn CanConnector>>,
    /// IMU register bus.
    pub imu: Option<Arc<dyn BusOpener>>,
    /// GNSS serial port.
    pub gnss: Option<Arc<dyn SerialConnector>>,
}

/// Addresses the listeners actually bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundAddrs {
    /// Raw telemetry stream.
    pub rx: SocketAddr,
    /// Command port.
    pub tx: SocketAddr,
    /// CAN bridge listener, in `tcp_bridge` mode.
    pub can_bridge: Option<SocketAddr>,
    /// Decimated stream, when enabled.
    pub decimated: Option<SocketAddr>,
}

/// A running gateway.
pub struct Gateway {
    addrs: BoundAddrs,
    broadcaster: Arc<Broadcaster>,
    decimated: Option<Arc<Broadcaster>>,
    sink: Arc<CanSink>,
    trigger: ShutdownTrigger,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    sources: Vec<(SourceKind, watch::Receiver<SourceState>)>,
    shutdown_timeout: Duration,
}

async fn bind(addr: SocketAddr) -> AppResult<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| GatewayError::Bind { addr, source })
}

fn require_feature(enabled: bool, feature: &str, what: &str) -> AppResult<()> {
    if enabled {
        return Ok(());
    }
    error!(feature, "{what} is enabled but the binary was built without it");
    Err(GatewayError::FeatureNotEnabled(feature.to_string()))
}

impl Gateway {
    /// Start with hardware built from `config`.
    pub async fn start(config: GatewayConfig) -> AppResult<Self> {
        Self::start_with(config, Hardware::default()).await
    }

    /// Start with some hardware endpoints supplied by the caller.
    pub async fn start_with(config: GatewayConfig, hardware: Hardware) -> AppResult<Self> {
        config.validate().map_err(GatewayError::Configuration)?;

        if config.can.enabled && config.can.input == CanInput::Socketcan {
            require_feature(cfg!(feature = "socketcan"), "socketcan", "SocketCAN input")?;
        }
        if config.imu.enabled && hardware.imu.is_none() {
            require_feature(cfg!(feature = "i2c"), "i2c", "IMU")?;
        }
        if config.gnss.enabled && hardware.gnss.is_none() {
            require_feature(cfg!(feature = "serial"), "serial", "GNSS")?;
        }

        let rx_listener = bind(config.rx_addr()?).await?;
        let tx_listener = bind(config.tx_addr()?).await?;
        let bridge_listener = if config.can.enabled && config.can.input == CanInput::TcpBridge {
            let addr = config.bridge_addr().map_err(GatewayError::Configuration)?;
            Some(bind(addr).await?)
        } else {
            None
        };
        let decimator_listener = if config.decimator.enabled {
            Some(bind(config.decimator_addr()?).await?)
        } else {
            None
        };

        let addrs = BoundAddrs {
            rx: rx_listener.local_addr()?,
            tx: tx_listener.local_addr()?,
            can_bridge: bridge_listener
                .as_ref()
                .map(TcpListener::local_addr)
                .transpose()?,
            decimated: decimator_listener
                .as_ref()
                .map(TcpListener::local_addr)
                .transpose()?,
        };

        let queue = config.network.subscriber_queue;
        let broadcaster = Arc::new(Broadcaster::new(queue));
        let registry = Arc::new(DecoderRegistry::with_defaults());
        let router = Arc::new(FrameRouter::new(
            registry.clone(),
            broadcaster.clone(),
            config.can.forward_undecoded,
        ));
        let policy = ReconnectPolicy::from(&config.reconnect);
        let (trigger, signal) = shutdown::channel();

        let mut gateway = Self {
            addrs,
            broadcaster: broadcaster.clone(),
            decimated: None,
            sink: Arc::new(CanSink::new(hardware.can_tx.unwrap_or_else(|| {
                Arc::new(SocketCanConnector::new(config.can.interface.clone()))
            }))),
            trigger,
            tasks: Vec::new(),
            sources: Vec::new(),
            shutdown_timeout: config.shutdown_timeout(),
        };

        // Sources
        if config.can.enabled {
            let connector: Arc<dyn CanConnector> = match bridge_listener {
                Some(listener) => Arc::new(TcpBridgeConnector::new(listener, config.can.bridge_format)),
                None => Arc::new(SocketCanConnector::new(config.can.interface.clone())),
            };
            let recv_timeout = Duration::from_millis(config.can.recv_timeout_ms);
            gateway.spawn_source(CanSource::new(connector, recv_timeout), &router, policy);
        }
        if config.imu.enabled {
            let opener = hardware
                .imu
                .unwrap_or_else(|| Arc::new(I2cDevOpener::from(&config.imu)));
            gateway.spawn_source(ImuSource::new(opener, config.imu.rate_hz), &router, policy);
        }
        if config.gnss.enabled {
            let connector = hardware
                .gnss
                .unwrap_or_else(|| Arc::new(DevicePortConnector::new(config.gnss.port.clone())));
            let settings = GnssSettings::from(&config.gnss);
            gateway.spawn_source(GnssSource::new(connector, settings), &router, policy);
        }

        // Listeners
        let rx = StreamServer::new("rx", rx_listener, broadcaster.clone(), config.network.wire_format);
        gateway.spawn("rx stream", {
            let signal = signal.clone();
            async move { rx.run(signal).await }
        });
        let commands = CommandChannel::new(
            tx_listener,
            gateway.sink.clone(),
            config.network.command_format,
        );
        gateway.spawn("command channel", {
            let signal = signal.clone();
            async move { commands.run(signal).await }
        });

        // Derived streams
        if config.fusion.enabled {
            let stage = FusionStage::new(&config.fusion, broadcaster.clone(), queue);
            let signal = signal.clone();
            gateway.spawn("fusion", async move {
                stage.run(signal).await;
                Ok(())
            });
        }
        if let Some(listener) = decimator_listener {
            let output = Arc::new(Broadcaster::new(queue));
            let stage =
                DecimatorStage::new(&config.decimator, broadcaster.clone(), output.clone(), queue);
            let server = StreamServer::new(
                "decimated",
                listener,
                output.clone(),
                config.network.wire_format,
            );
            {
                let signal = signal.clone();
                gateway.spawn("decimator", async move {
                    stage.run(signal).await;
                    Ok(())
                });
            }
            let signal = signal.clone();
            gateway.spawn("decimated stream", async move { server.run(signal).await });
            gateway.decimated = Some(output);
        }

        info!(
            rx = %addrs.rx,
            tx = %addrs.tx,
            can_bridge = ?addrs.can_bridge,
            decimated = ?addrs.decimated,
            decoders = registry.len(),
            "gateway started"
        );
        Ok(gateway)
    }

    fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: std::future::Future<Output = AppResult<()>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "task failed");
            }
        });
        self.tasks.push((name, handle));
    }

    fn spawn_source<S>(&mut self, source: S, router: &Arc<FrameRouter>, policy: ReconnectPolicy)
    where
        S: SignalSource + 'static,
    {
        let kind = source.kind();
        let (state_tx, state_rx) = watch::channel(SourceState::Disconnected);
        let router = router.clone();
        let signal = self.trigger.signal();
        self.sources.push((kind, state_rx));
        self.spawn(kind.wire_name(), async move {
            run_source(source, router, policy, signal, state_tx).await;
            Ok(())
        });
    }

    /// Bound listener addresses.
    pub fn addrs(&self) -> BoundAddrs {
        self.addrs
    }

    /// The raw telemetry hub.
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// The decimated hub, when enabled.
    pub fn decimated(&self) -> Option<&Arc<Broadcaster>> {
        self.decimated.as_ref()
    }

    /// The CAN transmit sink.
    pub fn sink(&self) -> &Arc<CanSink> {
        &self.sink
    }

    /// Current state of a source, if it is running.
    pub fn source_state(&self, kind: SourceKind) -> Option<SourceState> {
        self.sources
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, rx)| *rx.borrow())
    }

    /// Wait until `kind` reports `state`.
    pub async fn wait_for_source(&self, kind: SourceKind, state: SourceState) -> AppResult<()> {
        let mut rx = self
            .sources
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, rx)| rx.clone())
            .ok_or(GatewayError::NotConnected)?;
        rx.wait_for(|s| *s == state)
            .await
            .map_err(|_| GatewayError::NotConnected)?;
        Ok(())
    }

    /// Stop every task and wait for them to finish.
    pub async fn shutdown(self) -> AppResult<()> {
        info!(tasks = self.tasks.len(), "shutting down");
        self.trigger.trigger();

        let (names, handles): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        match tokio::time::timeout(self.shutdown_timeout, join_all(handles)).await {
            Ok(results) => {
                let failures: Vec<GatewayError> = names
                    .iter()
                    .zip(results)
                    .filter_map(|(name, result)| {
                        result.err().map(|e| {
                            warn!(task = *name, error = %e, "task panicked");
                            GatewayError::Join(e)
                        })
                    })
                    .collect();
                self.sink.disconnect().await;
                if failures.is_empty() {
                    info!("shutdown complete");
                    Ok(())
                } else {
                    Err(GatewayError::ShutdownFailed(failures))
                }
            }
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                warn!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "tasks did not stop in time, aborted"
                );
                Err(GatewayError::ShutdownFailed(vec![GatewayError::transport(
                    "shutdown timed out",
                )]))
            }
        }
    }
}
