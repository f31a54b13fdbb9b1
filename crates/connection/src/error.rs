//! Connection error types

use crate::identity::DeviceIdentity;
use thiserror::Error;

/// Errors reported by the platform USB layer
///
/// Maps to libusb error codes. See rusb::Error for details.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// Transfer timed out
    #[error("transfer timed out")]
    Timeout,
    /// Endpoint stalled
    #[error("endpoint stalled")]
    Pipe,
    /// Device was disconnected
    #[error("device disconnected")]
    NoDevice,
    /// Device, interface or endpoint not found
    #[error("entity not found")]
    NotFound,
    /// Resource is busy
    #[error("resource busy")]
    Busy,
    /// Buffer overflow
    #[error("buffer overflow")]
    Overflow,
    /// I/O error
    #[error("input/output error")]
    Io,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParam,
    /// Access denied (permissions)
    #[error("access denied")]
    Access,
    /// Other error with message
    #[error("{message}")]
    Other { message: String },
}

impl From<rusb::Error> for PlatformError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => PlatformError::Timeout,
            rusb::Error::Pipe => PlatformError::Pipe,
            rusb::Error::NoDevice => PlatformError::NoDevice,
            rusb::Error::NotFound => PlatformError::NotFound,
            rusb::Error::Busy => PlatformError::Busy,
            rusb::Error::Overflow => PlatformError::Overflow,
            rusb::Error::Io => PlatformError::Io,
            rusb::Error::InvalidParam => PlatformError::InvalidParam,
            rusb::Error::Access => PlatformError::Access,
            _ => PlatformError::Other {
                message: err.to_string(),
            },
        }
    }
}

/// Errors raised by the connection client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// No device with the requested ids is attached
    #[error("device {identity} not found")]
    Discovery { identity: DeviceIdentity },

    /// The interface could not be claimed
    #[error("failed to claim interface {interface}: {source}")]
    Claim {
        interface: u8,
        #[source]
        source: PlatformError,
    },

    /// `connect` was called without a claimed interface
    #[error("interface has to be claimed before attempting connection")]
    NotClaimed,

    /// The device left the bus; the claimed handle is no longer usable
    #[error("device {identity} was detached")]
    Detached { identity: DeviceIdentity },

    /// I/O attempted while not connected
    #[error("printer is not connected")]
    NotConnected,

    /// Pipe open/close/transfer failed
    #[error("pipe {endpoint:#04x} {operation} failed: {source}")]
    Pipe {
        endpoint: u8,
        operation: PipeOperation,
        #[source]
        source: PlatformError,
    },

    /// The platform layer failed outside of a pipe operation
    #[error("USB platform error: {0}")]
    Platform(#[from] PlatformError),

    /// The client has been shut down
    #[error("client has been shut down")]
    ShutDown,
}

impl ConnectionError {
    pub(crate) fn pipe(endpoint: u8, operation: PipeOperation, source: PlatformError) -> Self {
        ConnectionError::Pipe {
            endpoint,
            operation,
            source,
        }
    }

    /// Whether the error is a caller contract violation rather than a USB fault
    ///
    /// Contract violations are always returned to the caller regardless of
    /// the configured [`ErrorPolicy`](crate::config::ErrorPolicy).
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            ConnectionError::NotClaimed | ConnectionError::NotConnected | ConnectionError::ShutDown
        )
    }
}

/// Pipe operation that produced a [`ConnectionError::Pipe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeOperation {
    Resolve,
    Open,
    Close,
    Transfer,
    Event,
}

impl std::fmt::Display for PipeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipeOperation::Resolve => "resolve",
            PipeOperation::Open => "open",
            PipeOperation::Close => "close",
            PipeOperation::Transfer => "transfer",
            PipeOperation::Event => "event",
        };
        f.write_str(name)
    }
}

/// Type alias for connection results
pub type Result<T> = std::result::Result<T, ConnectionError>;
