//! End-to-end tests over loopback TCP with ephemeral ports.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use telemetry_gateway::config::{CanInput, GatewayConfig};
use telemetry_gateway::error::AppResult;
use telemetry_gateway::hardware::can::{CanConnector, CanTransport};
use telemetry_gateway::hardware::imu::{reg, BusOpener, RegisterBus};
use telemetry_gateway::hardware::SourceState;
use telemetry_gateway::types::{CanFrame, SourceKind};
use telemetry_gateway::{Gateway, Hardware};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn loopback_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.network.bind_host = "127.0.0.1".to_string();
    config.network.rx_port = 0;
    config.network.tx_port = 0;
    config.can.input = CanInput::TcpBridge;
    config.can.bridge_bind = "127.0.0.1:0".to_string();
    config.fusion.enabled = false;
    config.shutdown.timeout_ms = 2000;
    config
}

struct JsonClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    // Held so the server does not see a closed peer
    _write: OwnedWriteHalf,
}

async fn json_client(addr: std::net::SocketAddr) -> JsonClient {
    let stream = TcpStream::connect(addr).await.expect("connect to rx stream");
    let (read, write) = stream.into_split();
    JsonClient {
        lines: BufReader::new(read).lines(),
        _write: write,
    }
}

async fn next_json(client: &mut JsonClient) -> Value {
    let line = timeout(WAIT, client.lines.next_line())
        .await
        .expect("record within timeout")
        .expect("read line")
        .expect("stream still open");
    serde_json::from_str(&line).expect("valid JSON record")
}

async fn wait_for_subscribers(gateway: &Gateway, count: usize) {
    timeout(WAIT, async {
        while gateway.broadcaster().subscriber_count() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscribers registered");
}

#[tokio::test]
async fn bridge_frame_reaches_every_client() {
    let gateway = Gateway::start(loopback_config()).await.expect("gateway starts");
    let addrs = gateway.addrs();

    let mut first = json_client(addrs.rx).await;
    let mut second = json_client(addrs.rx).await;
    wait_for_subscribers(&gateway, 2).await;

    let mut bridge = TcpStream::connect(addrs.can_bridge.expect("bridge listener"))
        .await
        .expect("connect bridge");
    timeout(WAIT, gateway.wait_for_source(SourceKind::Can, SourceState::Connected))
        .await
        .expect("bridge accepted")
        .expect("source running");

    bridge
        .write_all(b"{\"can_id\":\"0x3B\",\"data\":[255,156,1,0]}\n")
        .await
        .expect("write frame");

    for client in [&mut first, &mut second] {
        let record = next_json(client).await;
        assert_eq!(record["source"], "can");
        assert_eq!(record["can_id"], "0x3b");
        let signals = record["signals"].as_array().expect("signals array");
        assert_eq!(signals[0]["name"], "/BMS1/pack_current");
        assert!((signals[0]["value"].as_f64().unwrap() + 10.0).abs() < 1e-9);
        assert_eq!(signals[1]["name"], "/BMS1/pack_voltage");
    }

    gateway.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn unknown_ids_are_not_forwarded_by_default() {
    let gateway = Gateway::start(loopback_config()).await.expect("gateway starts");
    let addrs = gateway.addrs();
    let mut client = json_client(addrs.rx).await;
    wait_for_subscribers(&gateway, 1).await;

    let mut bridge = TcpStream::connect(addrs.can_bridge.expect("bridge listener"))
        .await
        .expect("connect bridge");
    timeout(WAIT, gateway.wait_for_source(SourceKind::Can, SourceState::Connected))
        .await
        .expect("bridge accepted")
        .expect("source running");

    bridge
        .write_all(b"{\"can_id\":\"0x123\",\"data\":[1]}\nnot json\n{\"can_id\":\"0x586\",\"data\":[234,96]}\n")
        .await
        .expect("write frames");

    let record = next_json(&mut client).await;
    assert_eq!(record["can_id"], "0x586");
    assert_eq!(record["signals"][0]["name"], "/Wheel/RPM_R");
    assert_eq!(record["signals"][0]["value"], 60000.0);

    gateway.shutdown().await.expect("clean shutdown");
}

#[derive(Default)]
struct CaptureConnector {
    sent: Arc<Mutex<Vec<CanFrame>>>,
}

struct CaptureTransport {
    sent: Arc<Mutex<Vec<CanFrame>>>,
}

#[async_trait]
impl CanTransport for CaptureTransport {
    async fn recv(&mut self, timeout: Duration) -> AppResult<Option<CanFrame>> {
        tokio::time::sleep(timeout).await;
        Ok(None)
    }

    async fn send(&mut self, frame: &CanFrame) -> AppResult<()> {
        self.sent.lock().push(*frame);
        Ok(())
    }
}

#[async_trait]
impl CanConnector for CaptureConnector {
    async fn connect(&self) -> AppResult<Box<dyn CanTransport>> {
        Ok(Box::new(CaptureTransport {
            sent: self.sent.clone(),
        }))
    }

    fn describe(&self) -> String {
        "capture".to_string()
    }
}

#[tokio::test]
async fn commands_are_written_to_the_bus() {
    let connector = Arc::new(CaptureConnector::default());
    let sent = connector.sent.clone();
    let mut config = loopback_config();
    config.can.enabled = false;

    let hardware = Hardware {
        can_tx: Some(connector),
        ..Hardware::default()
    };
    let gateway = Gateway::start_with(config, hardware)
        .await
        .expect("gateway starts");

    let mut client = TcpStream::connect(gateway.addrs().tx)
        .await
        .expect("connect command port");
    client
        .write_all(
            b"{\"can_id\":\"0x123\",\"data\":[1,2,3]}\n{\"can_id\":\"0x124\",\"data\":[1,2,3,4,5,6,7,8,9]}\n{\"can_id\":\"456\",\"data\":[]}\n",
        )
        .await
        .expect("write commands");

    timeout(WAIT, async {
        while sent.lock().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("commands transmitted");

    {
        let frames = sent.lock();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].arbitration_id(), 0x123);
        assert_eq!(frames[0].data(), &[1, 2, 3]);
        assert_eq!(frames[1].arbitration_id(), 0x456);
        assert_eq!(frames[1].dlc(), 0);
    }

    gateway.shutdown().await.expect("clean shutdown");
}

/// Register bus answering with a constant forward acceleration of 1 m/s².
struct ConstantImu;

impl RegisterBus for ConstantImu {
    fn write_register(&mut self, _register: u8, _value: u8) -> AppResult<()> {
        Ok(())
    }

    fn read_registers(&mut self, register: u8, buf: &mut [u8]) -> AppResult<()> {
        buf.fill(0);
        if register == reg::LINEAR_ACCEL_DATA {
            buf[0] = 100;
        }
        if register == reg::CALIB_STAT {
            buf[0] = 0xFF;
        }
        Ok(())
    }
}

impl BusOpener for ConstantImu {
    fn open(&self) -> AppResult<Box<dyn RegisterBus>> {
        Ok(Box::new(ConstantImu))
    }

    fn describe(&self) -> String {
        "constant".to_string()
    }
}

#[tokio::test]
async fn imu_samples_feed_fusion() {
    let mut config = loopback_config();
    config.can.enabled = false;
    config.imu.enabled = true;
    config.imu.rate_hz = 50.0;
    config.fusion.enabled = true;

    let hardware = Hardware {
        imu: Some(Arc::new(ConstantImu)),
        ..Hardware::default()
    };
    let gateway = Gateway::start_with(config, hardware)
        .await
        .expect("gateway starts");
    let mut client = json_client(gateway.addrs().rx).await;

    let mut saw_imu = false;
    let mut saw_fusion = false;
    while !(saw_imu && saw_fusion) {
        let record = next_json(&mut client).await;
        let signals = record["signals"].as_array().expect("signals array");
        match record["source"].as_str() {
            Some("imu") => {
                let accel = signals
                    .iter()
                    .find(|s| s["name"] == "/IMU/accel_x")
                    .expect("accel_x present");
                assert_eq!(accel["value"], 1.0);
                assert_eq!(accel["unit"], "m/s^2");
                assert!(signals.iter().any(|s| s["name"] == "/IMU/calib_sys"));
                saw_imu = true;
            }
            Some("fusion") => {
                assert_eq!(signals[0]["name"], "/Fusion/velocity");
                assert!(signals[0]["value"].as_f64().unwrap() >= 0.0);
                saw_fusion = true;
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    assert_eq!(
        gateway.source_state(SourceKind::Imu),
        Some(SourceState::Connected)
    );
    gateway.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn decimated_stream_is_served_separately() {
    let mut config = loopback_config();
    config.can.enabled = false;
    config.imu.enabled = true;
    config.imu.rate_hz = 100.0;
    config.decimator.enabled = true;
    config.decimator.port = 0;
    config.decimator.factor = 5;

    let hardware = Hardware {
        imu: Some(Arc::new(ConstantImu)),
        ..Hardware::default()
    };
    let gateway = Gateway::start_with(config, hardware)
        .await
        .expect("gateway starts");
    let decimated = gateway.addrs().decimated.expect("decimated listener");
    assert_ne!(decimated, gateway.addrs().rx);

    let mut client = json_client(decimated).await;
    let record = next_json(&mut client).await;
    assert_eq!(record["source"], "imu");
    let accel = record["signals"]
        .as_array()
        .expect("signals array")
        .iter()
        .find(|s| s["name"] == "/IMU/accel_x")
        .cloned()
        .expect("accel_x present");
    // Seeded at the first sample, so a constant input stays constant
    assert!((accel["value"].as_f64().unwrap() - 1.0).abs() < 1e-9);

    gateway.shutdown().await.expect("clean shutdown");
}
