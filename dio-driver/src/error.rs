use thiserror::Error;

/// Errors raised synchronously to callers of device operations.
///
/// Recurring tasks (polling, pulse, gesture timers) never surface these; they
/// log and keep going.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Device [{0}] is not connected")]
    NotConnected(String),
    #[error("Device [{0}] has been disposed")]
    Disposed(String),
}

pub type DeviceResult<T> = Result<T, DeviceError>;
