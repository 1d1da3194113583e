use std::time::Duration;

use thiserror::Error;

/// Wire-level and fragment-level violations of the DNP3 layer rules.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid start field 0x{0:04X}")]
    InvalidStartField(u16),
    #[error("invalid frame length byte {0}")]
    InvalidFrameLength(u8),
    #[error("frame CRC mismatch")]
    BadCrc,
    #[error("DIR bit does not match the sender role")]
    InvertedDirBit,
    #[error("unexpected frame data (control 0x{0:02X})")]
    UnexpectedFrameData(u8),
    #[error("unknown function code 0x{0:02X}")]
    UnknownFunctionCode(u8),
    #[error("user data frame carries no data")]
    MissingFrameData,
    #[error("segment buffer overflow")]
    SegmentBufferOverflow,
    #[error("application header incomplete")]
    ApplicationHeaderIncomplete,
    #[error("unexpected fragment")]
    UnexpectedFragment,
    #[error("peer reported OBJECT_UNKNOWN")]
    ObjectUnknown,
    #[error("peer reported PARAMETER_ERROR")]
    ParameterError,
}

/// Which bounded wait ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Connect,
    LinkStatus,
    Confirm,
    Response,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TimeoutKind::Connect => "connect",
            TimeoutKind::LinkStatus => "link status",
            TimeoutKind::Confirm => "confirm",
            TimeoutKind::Response => "response",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} wait timed out after {1:?}")]
    Timeout(TimeoutKind, Duration),
    #[error("config: {0}")]
    Config(String),
    #[error("channel closed")]
    ClosedChannel,
    #[error("service not available: {0}")]
    ServiceNotAvailable(String),
}

impl Error {
    /// Timeouts are returned, not raised across layers; callers use this to
    /// decide whether a retry makes sense.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(..))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
