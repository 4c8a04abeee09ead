//! Error taxonomy shared by every layer of the flipper backend.
//!
//! Each variant corresponds to one failure class of the control system:
//!
//! - **`InvalidSpec`**: waveform or parameter values that cannot produce a valid output buffer.
//!   The offending operation is rejected and prior state is left intact.
//! - **`TaskLifecycle`**: misuse of a [`DeviceTask`](crate::task::DeviceTask), such as starting a
//!   task that has already been cleared.
//! - **`DeviceIo`**: the Device I/O port (driver or hardware) reported a failure.
//! - **`Connection`**: a malformed or disconnect-signalling packet on the remote-control channel.
//! - **`FileLoad`**: the waveform source file is missing or unreadable. Callers fall back to the
//!   analytic waveform model.
//! - **`Config`**: a configuration file failed to parse or validate.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias for results using the backend error type.
pub type FlipperResult<T> = std::result::Result<T, FlipperError>;

#[derive(Error, Debug)]
pub enum FlipperError {
    #[error("Invalid waveform spec: {0}")]
    InvalidSpec(String),

    #[error("Task lifecycle error: {0}")]
    TaskLifecycle(String),

    #[error("Device I/O error: {0}")]
    DeviceIo(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Failed to load waveform file {path:?}: {reason}")]
    FileLoad { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for FlipperError {
    fn from(value: toml::de::Error) -> Self {
        FlipperError::Config(value.to_string())
    }
}

impl From<toml::ser::Error> for FlipperError {
    fn from(value: toml::ser::Error) -> Self {
        FlipperError::Config(value.to_string())
    }
}
