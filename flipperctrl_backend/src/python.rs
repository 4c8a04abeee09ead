//! Python operator surface.
//!
//! ```python
//! from flipperctrl_backend import Flipper
//!
//! flipper = Flipper("flipper.toml", simulate=True)
//! flipper.set_amplitude(2.5)
//! flipper.on()
//! plot(flipper.waveform())
//! flipper.shutdown()
//! ```

use std::path::PathBuf;

use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use flipper_backend::{synthesize, FlipperConfig, FlipperError};

use crate::service::{build_port, FlipperService};

fn to_py_err<E: std::fmt::Display>(err: E) -> PyErr {
    PyRuntimeError::new_err(err.to_string())
}

/// A running flipper: controller, readback and beam supervisor.
#[pyclass]
pub struct Flipper {
    service: Option<FlipperService>,
}

impl Flipper {
    fn service(&self) -> PyResult<&FlipperService> {
        self.service
            .as_ref()
            .ok_or_else(|| PyRuntimeError::new_err("flipper has been shut down"))
    }

    fn call<F>(&self, op: F) -> PyResult<()>
    where
        F: FnOnce(&FlipperService) -> Result<(), FlipperError>,
    {
        op(self.service()?).map_err(to_py_err)
    }
}

#[pymethods]
impl Flipper {
    #[new]
    #[pyo3(signature = (config_path=None, simulate=false))]
    pub fn new(config_path: Option<PathBuf>, simulate: bool) -> PyResult<Self> {
        let config = match config_path {
            Some(path) => FlipperConfig::load(&path).map_err(to_py_err)?,
            None => FlipperConfig::default(),
        };
        let setup = build_port(&config, simulate).map_err(to_py_err)?;
        let service = FlipperService::start(&config, setup).map_err(to_py_err)?;
        Ok(Self {
            service: Some(service),
        })
    }

    pub fn on(&self) -> PyResult<()> {
        self.call(|svc| svc.controller().on())
    }

    pub fn off(&self) -> PyResult<()> {
        self.call(|svc| svc.controller().off())
    }

    /// Returns whether the flipper is running afterwards
    pub fn toggle(&self) -> PyResult<bool> {
        self.service()?.controller().toggle().map_err(to_py_err)
    }

    pub fn set_amplitude(&self, value: f64) -> PyResult<()> {
        self.call(|svc| svc.controller().set_amplitude(value))
    }

    pub fn set_decay_constant(&self, value: f64) -> PyResult<()> {
        self.call(|svc| svc.controller().set_decay_constant(value))
    }

    pub fn set_compensation(&self, value: f64) -> PyResult<()> {
        self.call(|svc| svc.controller().set_compensation(value))
    }

    #[pyo3(signature = (path=None))]
    pub fn set_waveform_file(&self, path: Option<PathBuf>) -> PyResult<()> {
        self.call(|svc| svc.controller().set_waveform_file(path))
    }

    pub fn is_running(&self) -> PyResult<bool> {
        Ok(self.service()?.controller().is_running())
    }

    /// The buffer currently streamed, or the one the next `on()` would stream
    pub fn waveform(&self, py: Python) -> PyResult<PyObject> {
        let ctrl = self.service()?.controller();
        let buffer = match ctrl.waveform() {
            Some(buffer) => buffer,
            None => synthesize(&ctrl.waveform_spec()).map_err(to_py_err)?,
        };
        Ok(numpy::PyArray::from_array(py, &buffer.view()).to_object(py))
    }

    pub fn status(&self, py: Python) -> PyResult<PyObject> {
        let status = self.service()?.controller().status();
        let dict = PyDict::new(py);
        dict.set_item("running", status.running)?;
        dict.set_item("interrupted_by_beam_loss", status.interrupted_by_beam_loss)?;
        dict.set_item("max_amplitude", status.max_amplitude)?;
        dict.set_item("decay_constant", status.decay_constant)?;
        dict.set_item("compensation", status.compensation)?;
        dict.set_item(
            "waveform_file",
            status.waveform_file.map(|path| path.display().to_string()),
        )?;
        dict.set_item("current_freq", status.current_freq)?;
        dict.set_item("missed_count", status.missed_count)?;
        dict.set_item("since_last_pulse", status.since_last_pulse)?;
        Ok(dict.to_object(py))
    }

    /// Clears every task and zeroes the outputs. The object is unusable afterwards.
    pub fn shutdown(&mut self) -> PyResult<()> {
        match self.service.take() {
            Some(service) => service.stop().map_err(to_py_err),
            None => Ok(()),
        }
    }
}
