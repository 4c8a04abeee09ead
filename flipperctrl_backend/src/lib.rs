#[cfg(feature = "python")]
use pyo3::prelude::*;

pub mod console;
pub mod error;
#[cfg(feature = "nidaqmx")]
pub mod nidaqmx;
#[cfg(feature = "python")]
pub mod python;
pub mod remote;
pub mod service;
pub mod signal;

pub use crate::console::*;
pub use crate::error::*;
pub use crate::remote::*;
pub use crate::service::*;
pub use crate::signal::*;

#[cfg(feature = "python")]
#[pymodule]
fn flipperctrl_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<python::Flipper>()?;
    Ok(())
}
