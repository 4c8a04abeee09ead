//! The Device I/O port: the only way the backend touches DAQ hardware.
//!
//! [`DevicePort`] hands out [`PortTask`]s, one per hardware task, and owns the card-wide
//! `zero_all_outputs` procedure. A `PortTask` mirrors the handful of driver calls the flipper
//! needs (channel creation, sample clock, start trigger, regeneration, buffer write,
//! every-N-samples callback, start and clear).
//!
//! Implementations:
//! - `flipperctrl_backend::nidaqmx::NiPort` drives NI-DAQmx;
//! - [`SimPort`](crate::sim::SimPort) journals calls in memory for tests and hardware-less runs.

use crate::channel::{ClockMode, GroupingMode, TaskRole, TriggerEdge};
use crate::error::FlipperResult;
use crate::waveform::SampleBuffer;

/// Invoked by the port once per completed acquisition with the wall-clock time of completion.
///
/// Runs on the driver's callback thread; it must only touch in-memory state and return quickly.
pub type BatchCallback = Box<dyn FnMut(f64) + Send + 'static>;

pub trait DevicePort: Send + Sync {
    /// Creates an empty hardware task. `role` is informational (task naming, journaling).
    fn open_task(&self, role: TaskRole) -> FlipperResult<Box<dyn PortTask>>;

    /// Writes a short finite 0 V sequence to every output channel, then releases it.
    fn zero_all_outputs(&self) -> FlipperResult<()>;
}

pub trait PortTask: Send {
    fn configure_output_channel(&mut self, id: &str, range: (f64, f64)) -> FlipperResult<()>;

    fn configure_input_channel(&mut self, id: &str, range: (f64, f64)) -> FlipperResult<()>;

    fn configure_clock(
        &mut self,
        rate: f64,
        edge: TriggerEdge,
        mode: ClockMode,
        samp_count: usize,
    ) -> FlipperResult<()>;

    /// Returns the number of samples per channel accepted by the driver
    fn write_samples(&mut self, buffer: &SampleBuffer, grouping: GroupingMode)
        -> FlipperResult<usize>;

    /// Configures a retriggerable start trigger. `level` selects an analog edge trigger.
    fn arm_retrigger(
        &mut self,
        source: &str,
        edge: TriggerEdge,
        level: Option<f64>,
    ) -> FlipperResult<()>;

    fn set_regen_mode(&mut self, enabled: bool) -> FlipperResult<()>;

    /// Registers `callback` to fire every `samp_count` acquired samples
    fn register_batch_callback(
        &mut self,
        samp_count: usize,
        callback: BatchCallback,
    ) -> FlipperResult<()>;

    fn start(&mut self) -> FlipperResult<()>;

    /// Releases the hardware task. Called at most once per task.
    fn clear(&mut self) -> FlipperResult<()>;
}
