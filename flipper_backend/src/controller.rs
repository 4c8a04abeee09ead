//! The flipper state machine.
//!
//! [`FlipperController`] owns the flip and readback [`DeviceTask`]s and every flag describing
//! them. All of it lives behind a single mutex, so operator commands, remote commands and the
//! beam supervisor are serialized against each other:
//!
//! ```text
//!            on() / toggle()                   suspend_for_beam_loss()
//!   Off ──────────────────────────> On ─────────────────────────────> Off (interrupted)
//!    ^ <──────────────────────────     <─────────────────────────────
//!            off() / toggle()                  resume_after_beam_loss()
//! ```
//!
//! `running` is true exactly when a started flip task exists. Parameter changes while running
//! are applied by a full `Off` / `On` cycle, since the regeneration and retrigger wiring of a
//! flip task is fixed when the task is created.
//!
//! The readback task is independent of `running`: once armed it keeps timing the facility
//! pulses so the supervisor can tell when the beam comes back.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::channel::{check_channel_map, ChannelConfig};
use crate::config::{in_range, FlipperConfig, HardwareConfig, TimingConfig};
use crate::error::{FlipperError, FlipperResult};
use crate::monitor::PulseTimingMonitor;
use crate::port::DevicePort;
use crate::task::{fire_compensation, DeviceTask};
use crate::utils::{wall_clock_secs, TickTimer};
use crate::waveform::{synthesize, SampleBuffer, WaveformSpec};

struct ControllerState {
    running: bool,
    interrupted: bool,
    waveform: WaveformSpec,
    compensation: f64,
    flip_task: Option<DeviceTask>,
    readback_task: Option<DeviceTask>,
    last_waveform: Option<SampleBuffer>,
}

/// Point-in-time view of the controller, for display and remote status queries.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FlipperStatus {
    pub running: bool,
    pub interrupted_by_beam_loss: bool,
    pub max_amplitude: f64,
    pub decay_constant: f64,
    pub compensation: f64,
    pub waveform_file: Option<PathBuf>,
    pub current_freq: f64,
    pub missed_count: u64,
    pub since_last_pulse: f64,
}

pub struct FlipperController {
    port: Arc<dyn DevicePort>,
    hw: HardwareConfig,
    timing: TimingConfig,
    monitor: Arc<Mutex<PulseTimingMonitor>>,
    state: Mutex<ControllerState>,
}

impl FlipperController {
    pub fn new(port: Arc<dyn DevicePort>, config: &FlipperConfig) -> FlipperResult<Self> {
        config.validate()?;
        let hw = config.hardware.clone();
        check_channel_map(
            &ChannelConfig::flip(&hw, &config.waveform, config.waveform.padded_len()),
            &ChannelConfig::compensation(&hw),
            &ChannelConfig::readback(&hw),
            &hw.readback_start_trigger,
        )?;
        let monitor = PulseTimingMonitor::new(config.timing.clone(), wall_clock_secs());
        Ok(Self {
            port,
            hw,
            timing: config.timing.clone(),
            monitor: Arc::new(Mutex::new(monitor)),
            state: Mutex::new(ControllerState {
                running: false,
                interrupted: false,
                waveform: config.waveform.clone(),
                compensation: config.compensation.amplitude,
                flip_task: None,
                readback_task: None,
                last_waveform: None,
            }),
        })
    }

    /// Arms the readback task if it is not already acquiring.
    pub fn start_readback(&self) -> FlipperResult<()> {
        let mut state = self.state.lock();
        self.ensure_readback(&mut state)
    }

    /// Switches the flipper on.
    ///
    /// # Behavior
    ///
    /// Does nothing if the flipper is already running. Otherwise, under the controller lock:
    ///
    /// 1. fires the one-shot compensation task at the current compensation level;
    /// 2. synthesizes the flip waveform from the current [`WaveformSpec`];
    /// 3. builds and starts the regenerating flip task, retriggered from the readback start
    ///    trigger;
    /// 4. arms the readback task if it is not acquiring yet.
    ///
    /// A pending beam-loss suspension is cancelled: an operator `on` takes precedence over the
    /// supervisor.
    ///
    /// # Errors
    ///
    /// Any Device I/O failure aborts the sequence. The flip task is released, all outputs are
    /// zeroed and the flipper stays off.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use flipper_backend::sim::SimPort;
    /// use flipper_backend::{FlipperConfig, FlipperController};
    ///
    /// let ctrl = FlipperController::new(Arc::new(SimPort::new()), &FlipperConfig::default()).unwrap();
    /// ctrl.on().unwrap();
    /// assert!(ctrl.is_running());
    /// assert_eq!(ctrl.waveform().unwrap().max(), 5.0);
    /// ```
    pub fn on(&self) -> FlipperResult<()> {
        let mut state = self.state.lock();
        state.interrupted = false;
        self.on_locked(&mut state)
    }

    /// Switches the flipper off: clears the flip task, then zeroes every output channel.
    ///
    /// Issues no Device I/O call when already off. The readback task keeps running. If either
    /// step fails the flipper is still reported off and the first error is returned.
    pub fn off(&self) -> FlipperResult<()> {
        let mut state = self.state.lock();
        state.interrupted = false;
        self.off_locked(&mut state)
    }

    /// Returns whether the flipper is running afterwards.
    pub fn toggle(&self) -> FlipperResult<bool> {
        let mut state = self.state.lock();
        state.interrupted = false;
        if state.running {
            self.off_locked(&mut state)?;
        } else {
            self.on_locked(&mut state)?;
        }
        Ok(state.running)
    }

    /// Sets the clip level of the flip waveform, in volts.
    ///
    /// # Parameters
    ///
    /// * `value`: new maximum amplitude, within `hardware.output_range`.
    ///
    /// # Behavior
    ///
    /// The candidate spec is validated first; an invalid value is rejected with
    /// [`FlipperError::InvalidSpec`] and nothing changes. While running, the change takes effect
    /// through a full `off` / `on` cycle under a single lock acquisition. While off it is only
    /// stored. The same holds for [`set_decay_constant`](Self::set_decay_constant),
    /// [`set_compensation`](Self::set_compensation) and
    /// [`set_waveform_file`](Self::set_waveform_file).
    pub fn set_amplitude(&self, value: f64) -> FlipperResult<()> {
        if !in_range(value, self.hw.output_range) {
            return Err(FlipperError::InvalidSpec(format!(
                "amplitude {} outside output range {:?}",
                value, self.hw.output_range
            )));
        }
        self.update_waveform(|spec| spec.max_amplitude = value)
    }

    pub fn set_decay_constant(&self, value: f64) -> FlipperResult<()> {
        self.update_waveform(|spec| spec.decay_constant = value)
    }

    pub fn set_compensation(&self, value: f64) -> FlipperResult<()> {
        if !in_range(value, self.hw.output_range) {
            return Err(FlipperError::InvalidSpec(format!(
                "compensation {} outside output range {:?}",
                value, self.hw.output_range
            )));
        }
        let mut state = self.state.lock();
        self.restart_with(&mut state, |state| state.compensation = value)
    }

    /// `None` returns to the analytic waveform.
    pub fn set_waveform_file(&self, path: Option<PathBuf>) -> FlipperResult<()> {
        self.update_waveform(|spec| spec.source_file = path)
    }

    // Edit, validation and restart happen under one guard, so concurrent setters never write
    // back a stale copy of the spec
    fn update_waveform<F>(&self, edit: F) -> FlipperResult<()>
    where
        F: FnOnce(&mut WaveformSpec),
    {
        let mut state = self.state.lock();
        let mut candidate = state.waveform.clone();
        edit(&mut candidate);
        candidate.validate()?;
        self.restart_with(&mut state, move |state| state.waveform = candidate)
    }

    fn restart_with<F>(&self, state: &mut ControllerState, update: F) -> FlipperResult<()>
    where
        F: FnOnce(&mut ControllerState),
    {
        if state.running {
            self.off_locked(state)?;
            update(state);
            self.on_locked(state)
        } else {
            update(state);
            Ok(())
        }
    }

    /// Automatic stop after the beam disappeared. Returns `false` if the flipper was not running.
    ///
    /// The flipper is marked as interrupted even if clearing the hardware fails, so the
    /// supervisor still brings it back once the beam returns.
    pub fn suspend_for_beam_loss(&self) -> FlipperResult<bool> {
        let mut state = self.state.lock();
        if !state.running {
            return Ok(false);
        }
        state.interrupted = true;
        info!("Beam lost, suspending flipper");
        self.off_locked(&mut state)?;
        Ok(true)
    }

    /// Automatic restart once the beam is back. Returns `false` unless a beam-loss suspension is
    /// pending. On failure the suspension stays pending, so the next poll retries.
    pub fn resume_after_beam_loss(&self) -> FlipperResult<bool> {
        let mut state = self.state.lock();
        if state.running || !state.interrupted {
            return Ok(false);
        }
        info!("Beam back, resuming flipper");
        self.on_locked(&mut state)?;
        state.interrupted = false;
        Ok(true)
    }

    /// Releases every task and zeroes the outputs, whatever the current state.
    pub fn shutdown(&self) -> FlipperResult<()> {
        let mut state = self.state.lock();
        let mut result = Ok(());
        for mut task in [state.flip_task.take(), state.readback_task.take()]
            .into_iter()
            .flatten()
        {
            if let Err(err) = task.clear() {
                error!("Failed to clear {} task at shutdown: {}", task.role(), err);
                result = result.and(Err(err));
            }
        }
        state.running = false;
        state.interrupted = false;
        if let Err(err) = self.port.zero_all_outputs() {
            error!("Failed to zero outputs at shutdown: {}", err);
            result = result.and(Err(err));
        }
        info!("Flipper shut down, outputs zeroed");
        result
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.lock().interrupted
    }

    pub fn amplitude(&self) -> f64 {
        self.state.lock().waveform.max_amplitude
    }

    pub fn decay_constant(&self) -> f64 {
        self.state.lock().waveform.decay_constant
    }

    pub fn compensation(&self) -> f64 {
        self.state.lock().compensation
    }

    pub fn waveform_file(&self) -> Option<PathBuf> {
        self.state.lock().waveform.source_file.clone()
    }

    pub fn waveform_spec(&self) -> WaveformSpec {
        self.state.lock().waveform.clone()
    }

    /// The buffer written by the most recent successful `On`
    pub fn waveform(&self) -> Option<SampleBuffer> {
        self.state.lock().last_waveform.clone()
    }

    pub fn hardware(&self) -> &HardwareConfig {
        &self.hw
    }

    pub fn since_last_pulse(&self, now: f64) -> f64 {
        self.monitor.lock().since_last(now)
    }

    pub fn pulse_monitor(&self) -> PulseTimingMonitor {
        self.monitor.lock().clone()
    }

    pub fn status(&self) -> FlipperStatus {
        let (running, interrupted, waveform, compensation) = {
            let state = self.state.lock();
            (
                state.running,
                state.interrupted,
                state.waveform.clone(),
                state.compensation,
            )
        };
        let monitor = self.pulse_monitor();
        FlipperStatus {
            running,
            interrupted_by_beam_loss: interrupted,
            max_amplitude: waveform.max_amplitude,
            decay_constant: waveform.decay_constant,
            compensation,
            waveform_file: waveform.source_file,
            current_freq: monitor.current_freq(),
            missed_count: monitor.missed_count(),
            since_last_pulse: monitor.since_last(wall_clock_secs()),
        }
    }

    fn on_locked(&self, state: &mut ControllerState) -> FlipperResult<()> {
        if state.running {
            return Ok(());
        }
        let mut timer = TickTimer::new();
        match self.bring_up(state, &mut timer) {
            Ok(()) => {
                state.running = true;
                info!(
                    "Flipper on (amplitude {} V, decay constant {}, compensation {} V)",
                    state.waveform.max_amplitude, state.waveform.decay_constant, state.compensation
                );
                Ok(())
            }
            Err(err) => {
                error!("Failed to switch flipper on: {}", err);
                // Dropping the task clears it
                drop(state.flip_task.take());
                if let Err(zero_err) = self.port.zero_all_outputs() {
                    warn!("Failed to zero outputs after aborted start: {}", zero_err);
                }
                state.running = false;
                Err(err)
            }
        }
    }

    fn bring_up(&self, state: &mut ControllerState, timer: &mut TickTimer) -> FlipperResult<()> {
        fire_compensation(
            self.port.as_ref(),
            ChannelConfig::compensation(&self.hw),
            state.compensation,
        )?;
        timer.tick_log("compensation written");

        let buffer = synthesize(&state.waveform)?;
        timer.tick_log("waveform synthesized");

        let config = ChannelConfig::flip(&self.hw, &state.waveform, buffer.len());
        let mut flip = DeviceTask::flip_output(self.port.as_ref(), config, buffer.clone())?;
        flip.start()?;
        state.flip_task = Some(flip);
        timer.tick_log("flip task started");

        self.ensure_readback(state)?;
        state.last_waveform = Some(buffer);
        Ok(())
    }

    fn ensure_readback(&self, state: &mut ControllerState) -> FlipperResult<()> {
        if state.readback_task.as_ref().is_some_and(|task| task.is_started()) {
            return Ok(());
        }
        drop(state.readback_task.take());

        *self.monitor.lock() = PulseTimingMonitor::new(self.timing.clone(), wall_clock_secs());
        let monitor = self.monitor.clone();
        let mut task = DeviceTask::readback(
            self.port.as_ref(),
            ChannelConfig::readback(&self.hw),
            Box::new(move |t| {
                monitor.lock().on_timestamp(t);
            }),
        )?;
        task.start()?;
        state.readback_task = Some(task);
        debug!("Readback armed on {}", self.hw.readback_channel);
        Ok(())
    }

    fn off_locked(&self, state: &mut ControllerState) -> FlipperResult<()> {
        if !state.running {
            return Ok(());
        }
        let clear_result = match state.flip_task.take() {
            Some(mut task) => task.clear(),
            None => Ok(()),
        };
        state.running = false;
        let zero_result = self.port.zero_all_outputs();
        info!("Flipper off");
        clear_result.and(zero_result)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::TaskRole;
    use crate::sim::{PortCall, SimOp, SimPort};

    fn controller() -> (SimPort, FlipperController) {
        let port = SimPort::new();
        let mut config = FlipperConfig::default();
        config.waveform.duration_samples = 1_000;
        let ctrl = FlipperController::new(Arc::new(port.clone()), &config).unwrap();
        (port, ctrl)
    }

    #[test]
    fn on_builds_all_tasks() {
        let (port, ctrl) = controller();
        ctrl.on().unwrap();
        assert!(ctrl.is_running());
        assert_eq!(port.live_tasks(TaskRole::FlipOutput), 1);
        assert_eq!(port.live_tasks(TaskRole::Readback), 1);
        // Compensation is one-shot
        assert_eq!(port.live_tasks(TaskRole::CompOutput), 0);
        assert_eq!(port.peak_live_tasks(TaskRole::CompOutput), 1);
        assert_eq!(ctrl.waveform().unwrap().len(), 1_001);
    }

    #[test]
    fn on_and_off_are_idempotent() {
        let (port, ctrl) = controller();
        ctrl.on().unwrap();
        let n_calls = port.journal().len();
        ctrl.on().unwrap();
        assert_eq!(port.journal().len(), n_calls);
        assert_eq!(port.live_tasks(TaskRole::FlipOutput), 1);

        ctrl.off().unwrap();
        assert_eq!(port.count(|call| matches!(call, PortCall::ZeroAllOutputs)), 1);
        let n_calls = port.journal().len();
        ctrl.off().unwrap();
        assert_eq!(port.journal().len(), n_calls);
    }

    #[test]
    fn off_keeps_readback() {
        let (port, ctrl) = controller();
        ctrl.on().unwrap();
        ctrl.off().unwrap();
        assert_eq!(port.live_tasks(TaskRole::FlipOutput), 0);
        assert_eq!(port.live_tasks(TaskRole::Readback), 1);

        // Turning on again does not re-arm the readback task
        ctrl.on().unwrap();
        assert_eq!(
            port.count(|call| matches!(call, PortCall::OpenTask { role: TaskRole::Readback, .. })),
            1
        );
    }

    #[test]
    fn toggle_flips_state() {
        let (_port, ctrl) = controller();
        assert!(ctrl.toggle().unwrap());
        assert!(!ctrl.toggle().unwrap());
        assert!(!ctrl.is_running());
    }

    #[test]
    fn set_amplitude_restarts_with_new_clip() {
        let (port, ctrl) = controller();
        ctrl.on().unwrap();
        ctrl.set_amplitude(2.5).unwrap();
        assert!(ctrl.is_running());
        assert_eq!(ctrl.waveform().unwrap().max(), 2.5);
        assert_eq!(port.count(|call| matches!(call, PortCall::ZeroAllOutputs)), 1);
        assert_eq!(port.peak_live_tasks(TaskRole::FlipOutput), 1);
    }

    #[test]
    fn set_while_off_only_stores() {
        let (port, ctrl) = controller();
        ctrl.set_compensation(1.5).unwrap();
        ctrl.set_decay_constant(2e-3).unwrap();
        assert!(port.journal().is_empty());
        assert_eq!(ctrl.compensation(), 1.5);
        assert_eq!(ctrl.decay_constant(), 2e-3);

        ctrl.on().unwrap();
        assert!(port.journal().iter().any(|call| matches!(
            call,
            PortCall::WriteSamples { len: 100, max, .. } if *max == 1.5
        )));
    }

    #[test]
    fn invalid_parameters_leave_state_intact() {
        let (port, ctrl) = controller();
        ctrl.on().unwrap();
        let n_calls = port.journal().len();

        assert!(matches!(ctrl.set_amplitude(-1.0), Err(FlipperError::InvalidSpec(_))));
        assert!(matches!(ctrl.set_amplitude(20.0), Err(FlipperError::InvalidSpec(_))));
        assert!(matches!(ctrl.set_decay_constant(f64::NAN), Err(FlipperError::InvalidSpec(_))));
        assert!(matches!(ctrl.set_compensation(11.0), Err(FlipperError::InvalidSpec(_))));

        assert!(ctrl.is_running());
        assert_eq!(ctrl.amplitude(), 5.0);
        assert_eq!(port.journal().len(), n_calls);
    }

    #[test]
    fn failed_on_rolls_back() {
        let (port, ctrl) = controller();
        port.fail_next(SimOp::Start, Some(TaskRole::Readback));
        assert!(matches!(ctrl.on(), Err(FlipperError::DeviceIo(_))));
        assert!(!ctrl.is_running());
        assert_eq!(port.live_tasks(TaskRole::FlipOutput), 0);
        assert_eq!(port.live_tasks(TaskRole::Readback), 0);
        assert_eq!(port.count(|call| matches!(call, PortCall::ZeroAllOutputs)), 1);

        // The next attempt succeeds from scratch
        ctrl.on().unwrap();
        assert_eq!(port.live_tasks(TaskRole::FlipOutput), 1);
    }

    #[test]
    fn concurrent_setters_keep_each_others_values() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::thread;

        let (_port, ctrl) = controller();
        let ctrl = Arc::new(ctrl);
        let done = Arc::new(AtomicBool::new(false));

        let decay_setter = {
            let ctrl = ctrl.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut k = 0u64;
                while !done.load(Ordering::Relaxed) {
                    let value = if k % 2 == 0 { 1e-3 } else { 2e-3 };
                    ctrl.set_decay_constant(value).unwrap();
                    k += 1;
                }
            })
        };

        let mut reverted = 0;
        for k in 0..20_000 {
            let value = 1.0 + (k % 9) as f64;
            ctrl.set_amplitude(value).unwrap();
            if ctrl.amplitude() != value {
                reverted += 1;
            }
        }
        done.store(true, Ordering::Relaxed);
        decay_setter.join().unwrap();

        assert_eq!(reverted, 0);
        assert_eq!(ctrl.amplitude(), 1.0 + (19_999 % 9) as f64);
    }

    #[test]
    fn failed_clear_on_off_still_stops() {
        let (port, ctrl) = controller();
        ctrl.on().unwrap();
        port.fail_next(SimOp::Clear, Some(TaskRole::FlipOutput));
        assert!(matches!(ctrl.off(), Err(FlipperError::DeviceIo(_))));
        assert!(!ctrl.is_running());
        assert_eq!(port.live_tasks(TaskRole::FlipOutput), 0);
        // Outputs are zeroed even though the clear failed
        assert_eq!(port.count(|call| matches!(call, PortCall::ZeroAllOutputs)), 1);

        ctrl.on().unwrap();
        assert!(ctrl.is_running());
        assert_eq!(port.live_tasks(TaskRole::FlipOutput), 1);
    }

    #[test]
    fn failed_zero_on_off_still_stops() {
        let (port, ctrl) = controller();
        ctrl.on().unwrap();
        port.fail_next(SimOp::Zero, None);
        assert!(matches!(ctrl.off(), Err(FlipperError::DeviceIo(_))));
        assert!(!ctrl.is_running());
        assert_eq!(port.live_tasks(TaskRole::FlipOutput), 0);

        ctrl.on().unwrap();
        assert!(ctrl.is_running());
        assert_eq!(port.live_tasks(TaskRole::FlipOutput), 1);
    }

    #[test]
    fn failed_off_during_restart_keeps_old_parameter() {
        let (port, ctrl) = controller();
        ctrl.on().unwrap();
        port.fail_next(SimOp::Zero, None);
        assert!(ctrl.set_amplitude(2.5).is_err());
        assert_eq!(ctrl.amplitude(), 5.0);
        assert!(!ctrl.is_running());
    }

    #[test]
    fn waveform_file_round_trip() {
        let (_port, ctrl) = controller();
        ctrl.set_waveform_file(Some(PathBuf::from("pulse.txt"))).unwrap();
        assert_eq!(ctrl.waveform_file(), Some(PathBuf::from("pulse.txt")));
        // Missing file falls back to the analytic buffer
        ctrl.on().unwrap();
        assert_eq!(ctrl.waveform().unwrap().len(), 1_001);
        ctrl.set_waveform_file(None).unwrap();
        assert_eq!(ctrl.waveform_file(), None);
    }

    #[test]
    fn readback_feeds_monitor() {
        let (port, ctrl) = controller();
        ctrl.start_readback().unwrap();
        for k in 0..10 {
            port.fire_batch(1000.0 + k as f64 * 0.1);
        }
        let status = ctrl.status();
        assert!((status.current_freq - 10.0).abs() < 1e-6);
        assert_eq!(status.missed_count, 0);
        assert!((ctrl.since_last_pulse(1001.9) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn beam_loss_entry_points() {
        let (port, ctrl) = controller();
        assert!(!ctrl.suspend_for_beam_loss().unwrap());
        assert!(!ctrl.resume_after_beam_loss().unwrap());

        ctrl.on().unwrap();
        assert!(ctrl.suspend_for_beam_loss().unwrap());
        assert!(ctrl.is_interrupted());
        assert!(!ctrl.suspend_for_beam_loss().unwrap());

        port.fail_next(SimOp::Start, Some(TaskRole::FlipOutput));
        assert!(ctrl.resume_after_beam_loss().is_err());
        assert!(ctrl.is_interrupted());

        assert!(ctrl.resume_after_beam_loss().unwrap());
        assert!(ctrl.is_running());
        assert!(!ctrl.is_interrupted());
    }

    #[test]
    fn operator_off_cancels_pending_resume() {
        let (_port, ctrl) = controller();
        ctrl.on().unwrap();
        ctrl.suspend_for_beam_loss().unwrap();
        ctrl.off().unwrap();
        assert!(!ctrl.is_interrupted());
        assert!(!ctrl.resume_after_beam_loss().unwrap());
    }

    #[test]
    fn shutdown_zeroes_even_when_off() {
        let (port, ctrl) = controller();
        ctrl.start_readback().unwrap();
        ctrl.shutdown().unwrap();
        assert_eq!(port.live_tasks(TaskRole::Readback), 0);
        assert_eq!(port.count(|call| matches!(call, PortCall::ZeroAllOutputs)), 1);
    }
}
