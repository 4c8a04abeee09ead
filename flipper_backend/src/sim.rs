//! In-memory Device I/O port.
//!
//! [`SimPort`] accepts every call a real card would, records it in a journal, and keeps enough
//! bookkeeping to check orchestration invariants from tests:
//! - which tasks are live (opened and not yet cleared) per role, and the peak number that were
//!   ever live at the same time;
//! - injected failures, consumed by the next matching call ([`SimPort::fail_next`]);
//! - batch callbacks of started readback tasks, fired on demand with [`SimPort::fire_batch`] or
//!   periodically by a [`SimTriggerSource`] thread.
//!
//! Clones share state, so a test can keep one handle while the controller owns another.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::channel::{ClockMode, GroupingMode, TaskRole, TriggerEdge};
use crate::error::{FlipperError, FlipperResult};
use crate::port::{BatchCallback, DevicePort, PortTask};
use crate::utils::wall_clock_secs;
use crate::waveform::SampleBuffer;

pub type TaskId = u64;

#[derive(Clone, Debug, PartialEq)]
pub enum PortCall {
    OpenTask { task: TaskId, role: TaskRole },
    ConfigureOutput { task: TaskId, channel: String, range: (f64, f64) },
    ConfigureInput { task: TaskId, channel: String, range: (f64, f64) },
    ConfigureClock { task: TaskId, rate: f64, mode: ClockMode, samp_count: usize },
    WriteSamples { task: TaskId, len: usize, max: f64, buffer: SampleBuffer },
    ArmRetrigger { task: TaskId, source: String, edge: TriggerEdge, level: Option<f64> },
    SetRegen { task: TaskId, enabled: bool },
    RegisterCallback { task: TaskId, samp_count: usize },
    Start { task: TaskId },
    Clear { task: TaskId },
    ZeroAllOutputs,
}

/// Port operations a failure can be injected into
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimOp {
    Open,
    ConfigureChannel,
    ConfigureClock,
    Write,
    ArmRetrigger,
    SetRegen,
    RegisterCallback,
    Start,
    Clear,
    Zero,
}

struct SimTaskRecord {
    role: TaskRole,
    started: bool,
    released: bool,
}

#[derive(Default)]
struct SimState {
    next_id: TaskId,
    journal: Vec<PortCall>,
    tasks: IndexMap<TaskId, SimTaskRecord>,
    live: HashMap<TaskRole, usize>,
    peak_live: HashMap<TaskRole, usize>,
    failures: Vec<(SimOp, Option<TaskRole>)>,
}

impl SimState {
    // Consumes the first pending failure matching `op` (and `role`, unless the failure was
    // registered for any role)
    fn take_failure(&mut self, op: SimOp, role: Option<TaskRole>) -> FlipperResult<()> {
        let hit = self
            .failures
            .iter()
            .position(|(fail_op, fail_role)| {
                *fail_op == op && (fail_role.is_none() || *fail_role == role)
            });
        match hit {
            Some(idx) => {
                self.failures.remove(idx);
                Err(FlipperError::DeviceIo(format!("simulated {:?} failure", op)))
            }
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct SimShared {
    state: Mutex<SimState>,
    callbacks: Mutex<IndexMap<TaskId, BatchCallback>>,
}

impl SimShared {
    fn release(&self, id: TaskId) {
        {
            let mut state = self.state.lock();
            let role = match state.tasks.get_mut(&id) {
                Some(record) if !record.released => {
                    record.released = true;
                    record.role
                }
                _ => return,
            };
            if let Some(live) = state.live.get_mut(&role) {
                *live = live.saturating_sub(1);
            }
        }
        self.callbacks.lock().shift_remove(&id);
    }
}

#[derive(Clone, Default)]
pub struct SimPort {
    shared: Arc<SimShared>,
}

impl SimPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn journal(&self) -> Vec<PortCall> {
        self.shared.state.lock().journal.clone()
    }

    pub fn count<F: Fn(&PortCall) -> bool>(&self, pred: F) -> usize {
        self.shared.state.lock().journal.iter().filter(|call| pred(call)).count()
    }

    pub fn clear_journal(&self) {
        self.shared.state.lock().journal.clear();
    }

    /// Tasks of `role` opened and not yet cleared
    pub fn live_tasks(&self, role: TaskRole) -> usize {
        self.shared.state.lock().live.get(&role).copied().unwrap_or(0)
    }

    /// Largest number of simultaneously live tasks of `role` seen so far
    pub fn peak_live_tasks(&self, role: TaskRole) -> usize {
        self.shared.state.lock().peak_live.get(&role).copied().unwrap_or(0)
    }

    /// Makes the next `op` call fail with a `DeviceIo` error. `role: None` matches any task.
    pub fn fail_next(&self, op: SimOp, role: Option<TaskRole>) {
        self.shared.state.lock().failures.push((op, role));
    }

    /// Delivers one completed acquisition at time `t` to every started readback task.
    /// Returns the number of callbacks invoked.
    pub fn fire_batch(&self, t: f64) -> usize {
        let armed: Vec<TaskId> = {
            let state = self.shared.state.lock();
            state
                .tasks
                .iter()
                .filter(|(_, record)| record.started && !record.released)
                .map(|(id, _)| *id)
                .collect()
        };
        let mut callbacks = self.shared.callbacks.lock();
        let mut fired = 0;
        for id in armed {
            if let Some(callback) = callbacks.get_mut(&id) {
                callback(t);
                fired += 1;
            }
        }
        fired
    }

    /// Fires batches at `rate_hz` with wall-clock timestamps until the source is stopped.
    pub fn spawn_trigger_source(&self, rate_hz: f64) -> FlipperResult<SimTriggerSource> {
        if !(rate_hz.is_finite() && rate_hz > 0.0) {
            return Err(FlipperError::Config(format!("trigger rate {} must be positive", rate_hz)));
        }
        let port = self.clone();
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let ticker = channel::tick(Duration::from_secs_f64(1.0 / rate_hz));
        let join = thread::Builder::new()
            .name("sim-trigger".to_string())
            .spawn(move || loop {
                crossbeam::select! {
                    recv(ticker) -> _ => {
                        port.fire_batch(wall_clock_secs());
                    }
                    recv(stop_rx) -> _ => break,
                }
            })?;
        debug!("Simulated timing signal running at {} Hz", rate_hz);
        Ok(SimTriggerSource {
            stop_tx: Some(stop_tx),
            join: Some(join),
        })
    }
}

impl DevicePort for SimPort {
    fn open_task(&self, role: TaskRole) -> FlipperResult<Box<dyn PortTask>> {
        let mut state = self.shared.state.lock();
        state.take_failure(SimOp::Open, Some(role))?;
        let id = state.next_id;
        state.next_id += 1;
        state.tasks.insert(
            id,
            SimTaskRecord {
                role,
                started: false,
                released: false,
            },
        );
        let live = {
            let live = state.live.entry(role).or_insert(0);
            *live += 1;
            *live
        };
        let peak = state.peak_live.entry(role).or_insert(0);
        *peak = (*peak).max(live);
        state.journal.push(PortCall::OpenTask { task: id, role });
        Ok(Box::new(SimTask {
            id,
            role,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn zero_all_outputs(&self) -> FlipperResult<()> {
        let mut state = self.shared.state.lock();
        state.take_failure(SimOp::Zero, None)?;
        state.journal.push(PortCall::ZeroAllOutputs);
        Ok(())
    }
}

struct SimTask {
    id: TaskId,
    role: TaskRole,
    shared: Arc<SimShared>,
}

impl SimTask {
    fn record(&self, op: SimOp, call: PortCall) -> FlipperResult<()> {
        let mut state = self.shared.state.lock();
        state.take_failure(op, Some(self.role))?;
        state.journal.push(call);
        Ok(())
    }
}

impl PortTask for SimTask {
    fn configure_output_channel(&mut self, id: &str, range: (f64, f64)) -> FlipperResult<()> {
        self.record(
            SimOp::ConfigureChannel,
            PortCall::ConfigureOutput {
                task: self.id,
                channel: id.to_string(),
                range,
            },
        )
    }

    fn configure_input_channel(&mut self, id: &str, range: (f64, f64)) -> FlipperResult<()> {
        self.record(
            SimOp::ConfigureChannel,
            PortCall::ConfigureInput {
                task: self.id,
                channel: id.to_string(),
                range,
            },
        )
    }

    fn configure_clock(
        &mut self,
        rate: f64,
        _edge: TriggerEdge,
        mode: ClockMode,
        samp_count: usize,
    ) -> FlipperResult<()> {
        self.record(
            SimOp::ConfigureClock,
            PortCall::ConfigureClock {
                task: self.id,
                rate,
                mode,
                samp_count,
            },
        )
    }

    fn write_samples(
        &mut self,
        buffer: &SampleBuffer,
        _grouping: GroupingMode,
    ) -> FlipperResult<usize> {
        self.record(
            SimOp::Write,
            PortCall::WriteSamples {
                task: self.id,
                len: buffer.len(),
                max: buffer.max(),
                buffer: buffer.clone(),
            },
        )?;
        Ok(buffer.len())
    }

    fn arm_retrigger(
        &mut self,
        source: &str,
        edge: TriggerEdge,
        level: Option<f64>,
    ) -> FlipperResult<()> {
        self.record(
            SimOp::ArmRetrigger,
            PortCall::ArmRetrigger {
                task: self.id,
                source: source.to_string(),
                edge,
                level,
            },
        )
    }

    fn set_regen_mode(&mut self, enabled: bool) -> FlipperResult<()> {
        self.record(
            SimOp::SetRegen,
            PortCall::SetRegen {
                task: self.id,
                enabled,
            },
        )
    }

    fn register_batch_callback(
        &mut self,
        samp_count: usize,
        callback: BatchCallback,
    ) -> FlipperResult<()> {
        self.record(
            SimOp::RegisterCallback,
            PortCall::RegisterCallback {
                task: self.id,
                samp_count,
            },
        )?;
        self.shared.callbacks.lock().insert(self.id, callback);
        Ok(())
    }

    fn start(&mut self) -> FlipperResult<()> {
        let mut state = self.shared.state.lock();
        state.take_failure(SimOp::Start, Some(self.role))?;
        if let Some(record) = state.tasks.get_mut(&self.id) {
            record.started = true;
        }
        state.journal.push(PortCall::Start { task: self.id });
        Ok(())
    }

    fn clear(&mut self) -> FlipperResult<()> {
        // The task is released even when the clear reports an error
        let result = {
            let mut state = self.shared.state.lock();
            state.journal.push(PortCall::Clear { task: self.id });
            state.take_failure(SimOp::Clear, Some(self.role))
        };
        self.shared.release(self.id);
        result
    }
}

impl Drop for SimTask {
    fn drop(&mut self) {
        self.shared.release(self.id);
    }
}

/// Background thread standing in for the facility timing signal
pub struct SimTriggerSource {
    stop_tx: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl SimTriggerSource {
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        // Dropping the sender disconnects the stop channel and ends the loop
        self.stop_tx.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for SimTriggerSource {
    fn drop(&mut self) {
        self.halt();
    }
}
