//! WebSocket session manager: per-connection `SafeConn`, the per-trip
//! registry used for event fan-out, and the inbound message dispatcher.

pub mod config;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod session;
pub mod transport;

pub use config::SessionConfig;
pub use messages::{dispatch_inbound, CONNECTED_FRAME};
pub use metrics::SessionMetrics;
pub use registry::{BroadcastReport, SessionRegistry};
pub use session::{CloseReason, SafeConn};
pub use transport::{ActixSink, ActixSource, FrameSink, FrameSource};
