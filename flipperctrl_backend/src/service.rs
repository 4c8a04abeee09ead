//! Process-level assembly: Device I/O port, controller, readback and beam supervisor.
//!
//! [`FlipperService::stop`] (or dropping the service) is the normal shutdown path: the supervisor
//! is stopped first so it cannot restart the flipper, then every task is cleared and all outputs
//! are zeroed regardless of whether the flipper was running.

use std::sync::Arc;

use tracing::{error, info};

use flipper_backend::sim::{SimPort, SimTriggerSource};
use flipper_backend::{
    BeamSupervisor, DevicePort, FlipperConfig, FlipperController, SupervisorHandle,
};

use crate::error::CtrlResult;

/// A Device I/O port, plus the simulated timing signal when running without hardware
pub struct PortSetup {
    pub port: Arc<dyn DevicePort>,
    pub trigger: Option<SimTriggerSource>,
}

pub fn build_port(config: &FlipperConfig, simulate: bool) -> CtrlResult<PortSetup> {
    if simulate {
        let port = SimPort::new();
        let trigger = port.spawn_trigger_source(config.timing.expected_freq)?;
        info!(
            "Running on the simulated port with a {} Hz timing signal",
            config.timing.expected_freq
        );
        return Ok(PortSetup {
            port: Arc::new(port),
            trigger: Some(trigger),
        });
    }
    hardware_port(config)
}

#[cfg(feature = "nidaqmx")]
fn hardware_port(config: &FlipperConfig) -> CtrlResult<PortSetup> {
    Ok(PortSetup {
        port: Arc::new(crate::nidaqmx::NiPort::new(&config.hardware)),
        trigger: None,
    })
}

#[cfg(not(feature = "nidaqmx"))]
fn hardware_port(_config: &FlipperConfig) -> CtrlResult<PortSetup> {
    Err(crate::error::CtrlError::HardwareNotEnabled)
}

pub struct FlipperService {
    ctrl: Arc<FlipperController>,
    supervisor: Option<SupervisorHandle>,
    trigger: Option<SimTriggerSource>,
}

impl FlipperService {
    /// Builds the controller on `setup.port`, arms the readback task and starts the supervisor.
    pub fn start(config: &FlipperConfig, setup: PortSetup) -> CtrlResult<Self> {
        let ctrl = Arc::new(FlipperController::new(setup.port, config)?);
        ctrl.start_readback()?;
        let supervisor = BeamSupervisor::new(ctrl.clone(), &config.supervisor).spawn()?;
        Ok(Self {
            ctrl,
            supervisor: Some(supervisor),
            trigger: setup.trigger,
        })
    }

    pub fn controller(&self) -> &Arc<FlipperController> {
        &self.ctrl
    }

    pub fn stop(mut self) -> CtrlResult<()> {
        self.halt()
    }

    fn halt(&mut self) -> CtrlResult<()> {
        let Some(supervisor) = self.supervisor.take() else {
            return Ok(());
        };
        supervisor.stop();
        let result = self.ctrl.shutdown();
        if let Some(trigger) = self.trigger.take() {
            trigger.stop();
        }
        Ok(result?)
    }
}

impl Drop for FlipperService {
    fn drop(&mut self) {
        if let Err(err) = self.halt() {
            error!("Shutdown incomplete: {}", err);
        }
    }
}
