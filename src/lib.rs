//! # Telemetry Gateway Library
//!
//! This crate is the core of the `telemetry_gateway` service. It acquires signals from a
//! vehicle CAN bus, a BNO055 inertial measurement unit and a u-blox GNSS receiver, decodes
//! them into named engineering values, and fans them out to any number of TCP consumers. A
//! command port accepts CAN frames from remote clients and writes them to the bus.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-layered configuration (defaults, TOML, environment).
//! - **`error`**: The `GatewayError` enum and the propagation class of each failure.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`types`**: Frames, decoded signals and telemetry messages shared by every stage.
//! - **`decoder`**: The CAN arbitration-ID to decode-function registry.
//! - **`hardware`**: Signal sources (CAN, IMU, GNSS) and the reconnect supervisor.
//! - **`router`**: Turns raw source frames into telemetry messages and publishes them.
//! - **`network`**: Wire codecs, the broadcaster, the stream server, the command channel and
//!   the CAN transmit sink.
//! - **`fusion`**: Kalman velocity estimation from IMU acceleration and GNSS speed.
//! - **`data`**: The decimated visualization stream.
//! - **`gateway`**: Startup, task wiring and orderly shutdown.
//! - **`shutdown`** and **`clock`**: Cancellation signal and monotonic timestamps.

pub mod clock;
pub mod config;
pub mod data;
pub mod decoder;
pub mod error;
pub mod fusion;
pub mod gateway;
pub mod hardware;
pub mod logging;
pub mod network;
pub mod router;
pub mod shutdown;
pub mod types;

pub use error::{AppResult, GatewayError};
pub use gateway::{BoundAddrs, Gateway, Hardware};
