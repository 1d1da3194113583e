//! DNP3 (IEEE 1815) communication stack: link-layer framing with CRC,
//! transport segmentation, application fragments and the object library,
//! plus the connection manager that maps remote peers onto associations
//! over TCP, UDP, or serial.

pub mod app;
pub mod association;
pub mod config;
pub mod connection;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod link;
pub mod manager;
pub mod objects;
pub mod trace;
pub mod transaction;
pub mod transport;

pub use app::{AppControl, ApplicationLayer, ConfirmMonitor, Fragment, FunctionCode, Iin};
pub use association::Association;
pub use config::{
    load_config, ConfigOverrides, EndpointConfig, FileConfig, StackConfig, StationRole,
    DEFAULT_PORT, MAX_FRAGMENT_SIZE,
};
pub use connection::{Connection, TransportKind};
pub use device::LogicalDevice;
pub use endpoint::RemoteEndpoint;
pub use error::{Error, ProtocolError, Result, TimeoutKind};
pub use link::{DataLinkLayer, Frame, FrameCodec, LinkFunction};
pub use manager::{
    AssociationListener, ConnectionListener, ConnectionManager, FragmentListener,
};
pub use objects::{Item, ObjectInstance, PointType, PointValue, Variation};
pub use trace::{TraceBuffer, TraceDirection, TraceRecord};
pub use transaction::{ReadPoint, ReadTransaction, Response, WriteCommand, WriteTransaction};
pub use transport::TransportFunction;
