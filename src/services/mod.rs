pub mod daemon;
pub mod detector;
pub mod ipc;

pub use daemon::{DaemonSettings, EventDaemon};
pub use detector::{DetectRequest, DetectionService, LaunchSpec};
pub use ipc::{SwayConnector, WmConnector};
