//! Fan-out of one Redis MONITOR connection per instance to many observers.

pub mod directory;
pub mod error;
pub mod event;
pub mod hub;
pub mod observer;
pub mod registry;
pub mod source;
pub mod tcp;

pub use directory::HubDirectory;
pub use error::{ConnectError, PushError, RegistryError, StreamError};
pub use event::{HubEvent, MonitorEvent, parse_monitor_line};
pub use hub::{HubStatus, MonitorHub};
pub use observer::{ChannelObserver, Observer, ObserverReceiver};
pub use registry::{ObserverRegistry, ObserverSlot};
pub use source::{MonitorConnector, RawLineStream, SourceEvent, UpstreamMonitorSource};
pub use tcp::TcpMonitorConnector;
