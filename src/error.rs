use core::fmt;

use crate::{DrtError, FrameError, LinkError, OpenError, ResponseError};

/// Errors surfaced by the bus, drivers and the DMA engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    Open(OpenError),
    Link(LinkError),
    Frame(FrameError),
    /// The device answered something else than the command sent.
    Protocol(ResponseError),
    /// Fewer bytes moved than the command asked for.
    Incomplete { transferred: usize, expected: usize },
    /// Driver used before being bound to a device.
    DeviceNotSet,
    DeviceNotFound,
    Drt(DrtError),
    /// Only block slots 0 and 1 exist.
    InvalidSlot(usize),
    /// A 32-bit port has pins 0 to 31.
    InvalidPin(u8),
    /// DMA used before `setup_read`/`setup_write`, or in the other direction.
    NotConfigured,
    BufferTooSmall { needed: usize, got: usize },
}

impl Error {
    /// Whether the link must be flushed before it can be trusted again.
    pub fn is_desync(&self) -> bool {
        matches!(self, Error::Link(LinkError::Desync { .. }))
    }
}

impl From<OpenError> for Error {
    fn from(v: OpenError) -> Self {
        Self::Open(v)
    }
}

impl From<LinkError> for Error {
    fn from(v: LinkError) -> Self {
        match v {
            LinkError::Frame(frame) => Self::Frame(frame),
            other => Self::Link(other),
        }
    }
}

impl From<FrameError> for Error {
    fn from(v: FrameError) -> Self {
        Self::Frame(v)
    }
}

impl From<ResponseError> for Error {
    fn from(v: ResponseError) -> Self {
        Self::Protocol(v)
    }
}

impl From<DrtError> for Error {
    fn from(v: DrtError) -> Self {
        Self::Drt(v)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Open(OpenError::DeviceNotFound) => write!(f, "bridge not found"),
            Error::Open(OpenError::AlreadyOpen) => write!(f, "link already open"),
            Error::Open(OpenError::TransportConfigFailed(err)) => write!(f, "bridge configuration failed: {:?}", err),
            Error::Link(LinkError::Timeout { transferred }) => write!(f, "timed out after {} bytes", transferred),
            Error::Link(LinkError::Desync { found }) => write!(f, "link desync, response marker {:02x}", found),
            Error::Link(err) => write!(f, "link error: {:?}", err),
            Error::Frame(err) => write!(f, "bad frame: {:?}", err),
            Error::Protocol(ResponseError::StatusMismatch { expected, found }) => {
                write!(f, "response status {:02x}, expected {:02x}", found, expected)
            }
            Error::Protocol(err) => write!(f, "protocol error: {:?}", err),
            Error::Incomplete { transferred, expected } => {
                write!(f, "moved {} of {} bytes", transferred, expected)
            }
            Error::DeviceNotSet => write!(f, "device id not set"),
            Error::DeviceNotFound => write!(f, "device not found"),
            Error::Drt(err) => write!(f, "failed to read DRT: {:?}", err),
            Error::InvalidSlot(slot) => write!(f, "no DMA block {}", slot),
            Error::InvalidPin(pin) => write!(f, "no GPIO pin {}", pin),
            Error::NotConfigured => write!(f, "DMA not set up for this direction"),
            Error::BufferTooSmall { needed, got } => write!(f, "buffer of {} bytes, need {}", got, needed),
        }
    }
}

impl std::error::Error for Error {}
