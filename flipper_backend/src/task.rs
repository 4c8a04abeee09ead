//! Role-parameterized device tasks.
//!
//! A [`DeviceTask`] owns one [`PortTask`] together with the [`ChannelConfig`] it was built from
//! and, for output roles, the [`SampleBuffer`] it streams. Construction performs the full
//! driver configuration sequence for the role, so a task that exists is ready to start:
//!
//! 1. **FlipOutput**: output channel, finite sample clock over the buffer length, regeneration
//!    on, retriggerable digital start trigger from the readback start trigger, buffer write.
//! 2. **CompOutput**: output channel, finite sample clock, constant buffer write.
//! 3. **Readback**: input channel, finite sample clock, every-N-samples callback, retriggerable
//!    analog edge start trigger on the external timing terminal.
//!
//! Lifecycle is `Created -> Started -> Cleared`. A cleared task is dead: starting it again is a
//! [`FlipperError::TaskLifecycle`] error and a fresh task must be constructed instead.
//! Tasks dropped before being cleared release their hardware in `Drop`.

use tracing::{debug, warn};

use crate::channel::{ChannelConfig, GroupingMode, TaskRole};
use crate::error::{FlipperError, FlipperResult};
use crate::port::{BatchCallback, DevicePort, PortTask};
use crate::waveform::SampleBuffer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Started,
    Cleared,
}

pub struct DeviceTask {
    config: ChannelConfig,
    state: TaskState,
    buffer: Option<SampleBuffer>,
    port_task: Box<dyn PortTask>,
}

impl DeviceTask {
    /// Builds the regenerated flip-coil task streaming `buffer` on every trigger.
    ///
    /// # Parameters
    ///
    /// * `port`: Device I/O port the task is opened on.
    /// * `config`: a [`TaskRole::FlipOutput`] config, usually from [`ChannelConfig::flip`].
    /// * `buffer`: samples replayed on every start trigger.
    ///
    /// # Behavior
    ///
    /// Configures, in order: the output channel, a finite sample clock over `buffer.len()`
    /// samples, regeneration, the retriggerable digital start trigger, and the buffer write.
    /// The returned task is configured but not started. If any step fails the partially
    /// configured task is released before the error is returned.
    pub fn flip_output(
        port: &dyn DevicePort,
        config: ChannelConfig,
        buffer: SampleBuffer,
    ) -> FlipperResult<Self> {
        expect_role(&config, TaskRole::FlipOutput)?;
        if buffer.len() != config.samp_count {
            return Err(FlipperError::InvalidSpec(format!(
                "flip buffer holds {} samples but the clock is set for {}",
                buffer.len(),
                config.samp_count
            )));
        }
        Self::build(port, config, Some(buffer), |cfg, task, buffer| {
            task.configure_output_channel(&cfg.physical_channel, cfg.voltage_range)?;
            task.configure_clock(cfg.clock_rate, cfg.clock_edge, cfg.clock_mode, cfg.samp_count)?;
            task.set_regen_mode(cfg.regenerate)?;
            if let Some(source) = &cfg.trigger_source {
                task.arm_retrigger(source, cfg.trigger_edge, cfg.trigger_level)?;
            }
            if let Some(buffer) = buffer {
                task.write_samples(buffer, GroupingMode::ByChannel)?;
            }
            Ok(())
        })
    }

    /// Builds the one-shot compensation task holding `value` for `config.samp_count` samples.
    pub fn comp_output(
        port: &dyn DevicePort,
        config: ChannelConfig,
        value: f64,
    ) -> FlipperResult<Self> {
        expect_role(&config, TaskRole::CompOutput)?;
        let buffer = SampleBuffer::constant(value, config.samp_count);
        Self::build(port, config, Some(buffer), |cfg, task, buffer| {
            task.configure_output_channel(&cfg.physical_channel, cfg.voltage_range)?;
            task.configure_clock(cfg.clock_rate, cfg.clock_edge, cfg.clock_mode, cfg.samp_count)?;
            if let Some(buffer) = buffer {
                task.write_samples(buffer, GroupingMode::ByChannel)?;
            }
            Ok(())
        })
    }

    /// Builds the retriggered readback task; `on_batch` fires after every full acquisition.
    pub fn readback(
        port: &dyn DevicePort,
        config: ChannelConfig,
        on_batch: BatchCallback,
    ) -> FlipperResult<Self> {
        expect_role(&config, TaskRole::Readback)?;
        let mut on_batch = Some(on_batch);
        Self::build(port, config, None, move |cfg, task, _| {
            task.configure_input_channel(&cfg.physical_channel, cfg.voltage_range)?;
            task.configure_clock(cfg.clock_rate, cfg.clock_edge, cfg.clock_mode, cfg.samp_count)?;
            if let Some(callback) = on_batch.take() {
                task.register_batch_callback(cfg.samp_count, callback)?;
            }
            if let Some(source) = &cfg.trigger_source {
                task.arm_retrigger(source, cfg.trigger_edge, cfg.trigger_level)?;
            }
            Ok(())
        })
    }

    // Opens a port task and runs the role-specific configuration. On failure the half-built
    // port task is cleared before the error is returned.
    fn build<F>(
        port: &dyn DevicePort,
        config: ChannelConfig,
        buffer: Option<SampleBuffer>,
        mut configure: F,
    ) -> FlipperResult<Self>
    where
        F: FnMut(&ChannelConfig, &mut dyn PortTask, Option<&SampleBuffer>) -> FlipperResult<()>,
    {
        config.validate()?;
        let mut port_task = port.open_task(config.role)?;
        if let Err(err) = configure(&config, port_task.as_mut(), buffer.as_ref()) {
            if let Err(clear_err) = port_task.clear() {
                warn!("Failed to release partially configured {} task: {}", config.role, clear_err);
            }
            return Err(err);
        }
        debug!("{} task configured on {}", config.role, config.physical_channel);
        Ok(Self {
            config,
            state: TaskState::Created,
            buffer,
            port_task,
        })
    }

    pub fn start(&mut self) -> FlipperResult<()> {
        match self.state {
            TaskState::Created => {
                self.port_task.start()?;
                self.state = TaskState::Started;
                Ok(())
            }
            TaskState::Started => Err(FlipperError::TaskLifecycle(format!(
                "{} task is already started",
                self.role()
            ))),
            TaskState::Cleared => Err(FlipperError::TaskLifecycle(format!(
                "{} task was cleared and cannot be restarted",
                self.role()
            ))),
        }
    }

    /// Releases the hardware. Clearing an already cleared task does nothing.
    ///
    /// The task counts as cleared even if the driver reports an error, so it is never
    /// released twice.
    pub fn clear(&mut self) -> FlipperResult<()> {
        if self.state == TaskState::Cleared {
            return Ok(());
        }
        self.state = TaskState::Cleared;
        self.port_task.clear()
    }

    pub fn role(&self) -> TaskRole {
        self.config.role
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.state == TaskState::Started
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn buffer(&self) -> Option<&SampleBuffer> {
        self.buffer.as_ref()
    }
}

impl Drop for DeviceTask {
    fn drop(&mut self) {
        if self.state != TaskState::Cleared {
            if let Err(err) = self.clear() {
                warn!("Failed to clear {} task on drop: {}", self.role(), err);
            }
        }
    }
}

/// Sets the compensation coil: builds, starts and immediately clears a one-shot task.
pub fn fire_compensation(
    port: &dyn DevicePort,
    config: ChannelConfig,
    value: f64,
) -> FlipperResult<()> {
    let mut task = DeviceTask::comp_output(port, config, value)?;
    task.start()?;
    task.clear()
}

fn expect_role(config: &ChannelConfig, role: TaskRole) -> FlipperResult<()> {
    if config.role != role {
        return Err(FlipperError::TaskLifecycle(format!(
            "cannot build a {} task from a {} config",
            role, config.role
        )));
    }
    Ok(())
}
