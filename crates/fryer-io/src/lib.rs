pub mod bridge;
pub mod metrics;
pub mod protocol;
pub mod serial;

pub use bridge::{run_bridge, BridgeConfig};
pub use metrics::{init_metrics, serve_metrics, MetricsCursor};
pub use protocol::{IncomingMessage, ProtocolError, ProtocolVersion, StatusMsg};
pub use serial::{LineIo, SerialPortOpener};
