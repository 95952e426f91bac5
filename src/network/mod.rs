//! TCP surfaces: telemetry broadcast streams, the command port, and the CAN
//! transmit sink behind it.

pub mod broadcaster;
pub mod command;
pub mod sink;
pub mod stream_server;
pub mod wire;

pub use broadcaster::{Broadcaster, PublishReport, SubscriberId};
pub use command::CommandChannel;
pub use sink::CanSink;
pub use stream_server::StreamServer;
