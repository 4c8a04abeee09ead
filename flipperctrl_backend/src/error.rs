use thiserror::Error;

use flipper_backend::FlipperError;

pub type CtrlResult<T> = std::result::Result<T, CtrlError>;

#[derive(Error, Debug)]
pub enum CtrlError {
    #[error(transparent)]
    Flipper(#[from] FlipperError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("NI-DAQmx support not enabled. Rebuild with --features nidaqmx or run with --simulate")]
    HardwareNotEnabled,
}
