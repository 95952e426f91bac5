//! u-blox GNSS receiver on a UART.

use super::serial::{drain_serial_buffer, DynSerial, SerialConnector};
use super::ubx::{self, UbxFramer};
use super::SignalSource;
use crate::clock;
use crate::config::GnssConfig;
use crate::error::{AppResult, GatewayError};
use crate::types::{SignalFrame, SourceKind};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, trace};

/// Time the receiver needs to apply a CFG-PRT baud change.
const BAUD_SWITCH_SETTLE: Duration = Duration::from_millis(200);

/// Window for discarding output queued before configuration.
const DRAIN_WINDOW: Duration = Duration::from_millis(50);

/// Connection settings for [`GnssSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct GnssSettings {
    /// Working baud rate.
    pub baud: u32,
    /// Baud rate the receiver boots with.
    pub initial_baud: u32,
    /// Send the UBX configuration on connect.
    pub configure: bool,
    /// Requested solution rate.
    pub nav_rate_hz: u16,
    /// Save the configuration to the receiver's flash.
    pub persist: bool,
    /// Bounded wait per port read.
    pub read_timeout: Duration,
}

impl From<&GnssConfig> for GnssSettings {
    fn from(config: &GnssConfig) -> Self {
        Self {
            baud: config.baud,
            initial_baud: config.initial_baud,
            configure: config.configure,
            nav_rate_hz: config.nav_rate_hz,
            persist: config.persist,
            read_timeout: Duration::from_millis(config.read_timeout_ms),
        }
    }
}

/// Open the port at the factory baud rate and move the receiver to `settings.baud`.
async fn switch_baud(connector: &dyn SerialConnector, settings: &GnssSettings) -> AppResult<()> {
    let mut port = connector.open(settings.initial_baud).await?;
    port.write_all(&ubx::cfg_prt_uart1(settings.baud)).await?;
    port.flush().await?;
    tokio::time::sleep(BAUD_SWITCH_SETTLE).await;
    debug!(
        from = settings.initial_baud,
        to = settings.baud,
        "GNSS baud rate switched"
    );
    Ok(())
}

/// Emits one [`SignalFrame`] per NAV-PVT solution.
pub struct GnssSource {
    connector: Arc<dyn SerialConnector>,
    settings: GnssSettings,
    port: Option<DynSerial>,
    framer: UbxFramer,
}

impl GnssSource {
    /// Source opening its port through `connector`.
    pub fn new(connector: Arc<dyn SerialConnector>, settings: GnssSettings) -> Self {
        Self {
            connector,
            settings,
            port: None,
            framer: UbxFramer::new(),
        }
    }
}

#[async_trait]
impl SignalSource for GnssSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Gnss
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.connector.describe(), self.settings.baud)
    }

    async fn connect(&mut self) -> AppResult<()> {
        if self.settings.configure && self.settings.initial_baud != self.settings.baud {
            switch_baud(self.connector.as_ref(), &self.settings).await?;
        }

        let mut port = self.connector.open(self.settings.baud).await?;
        if self.settings.configure {
            let sequence =
                ubx::configuration_sequence(self.settings.nav_rate_hz, self.settings.persist);
            for message in sequence {
                port.write_all(&message).await?;
            }
            port.flush().await?;
            info!(rate_hz = self.settings.nav_rate_hz, "GNSS configured for NAV-PVT");
        }
        let stale = drain_serial_buffer(&mut port, DRAIN_WINDOW).await;
        if stale > 0 {
            debug!(bytes = stale, "discarded stale GNSS output");
        }

        self.framer.clear();
        self.port = Some(port);
        Ok(())
    }

    async fn read(&mut self) -> AppResult<Option<SignalFrame>> {
        let mut chunk = [0u8; 1024];
        loop {
            while let Some(message) = self.framer.next_message() {
                if message.is_nav_pvt() {
                    let fix = ubx::parse_nav_pvt(&message.payload)?;
                    return Ok(Some(SignalFrame::gnss(fix, clock::now_ns())));
                }
                trace!(class = message.class, id = message.id, "ignoring UBX message");
            }

            let port = self.port.as_mut().ok_or(GatewayError::NotConnected)?;
            match tokio::time::timeout(self.settings.read_timeout, port.read(&mut chunk)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => return Err(GatewayError::ConnectionClosed),
                Ok(Ok(n)) => self.framer.extend(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    fn disconnect(&mut self) {
        self.port = None;
        self.framer.clear();
    }
}
