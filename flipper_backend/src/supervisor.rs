//! Automatic suspend/resume of the flipper on beam loss.
//!
//! The supervisor is a level-triggered poll: every tick compares the time since the last
//! readback callback against the beam-loss timeout and asks the controller to suspend or
//! resume. Redundant polls are harmless, the controller's `running` and `interrupted` flags
//! gate both transitions.
//!
//! Errors from the controller are logged and reported as [`SupervisorAction::Failed`]; they
//! never stop the poll loop, and a failed transition is attempted again on the next tick.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use tracing::{debug, warn};

use crate::config::SupervisorConfig;
use crate::controller::FlipperController;
use crate::error::FlipperResult;
use crate::utils::wall_clock_secs;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BeamState {
    Normal,
    Suspended,
}

/// Outcome of one poll
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorAction {
    Idle,
    Suspended,
    Resumed,
    Failed,
}

pub struct BeamSupervisor {
    controller: Arc<FlipperController>,
    cfg: SupervisorConfig,
}

impl BeamSupervisor {
    pub fn new(controller: Arc<FlipperController>, cfg: &SupervisorConfig) -> Self {
        Self {
            controller,
            cfg: cfg.clone(),
        }
    }

    /// `Suspended` while a beam-loss stop is waiting for the beam to come back
    pub fn state(&self) -> BeamState {
        if self.controller.is_interrupted() {
            BeamState::Suspended
        } else {
            BeamState::Normal
        }
    }

    pub fn poll(&self) -> SupervisorAction {
        self.poll_at(wall_clock_secs())
    }

    pub fn poll_at(&self, now: f64) -> SupervisorAction {
        let gap = self.controller.since_last_pulse(now);
        let timeout = self.cfg.beam_loss_timeout;

        let result = if gap > timeout {
            self.controller
                .suspend_for_beam_loss()
                .map(|acted| acted.then_some(SupervisorAction::Suspended))
        } else if gap < timeout {
            self.controller
                .resume_after_beam_loss()
                .map(|acted| acted.then_some(SupervisorAction::Resumed))
        } else {
            Ok(None)
        };

        match result {
            Ok(Some(action)) => {
                debug!("Supervisor {:?} after {:.2} s without pulses", action, gap);
                action
            }
            Ok(None) => SupervisorAction::Idle,
            Err(err) => {
                warn!("Automatic beam-loss transition failed, retrying next poll: {}", err);
                SupervisorAction::Failed
            }
        }
    }

    /// Polls every `poll_interval` on a dedicated thread until the handle is stopped or dropped.
    pub fn spawn(self) -> FlipperResult<SupervisorHandle> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let ticker = channel::tick(self.cfg.poll_duration());
        let join = thread::Builder::new()
            .name("beam-supervisor".to_string())
            .spawn(move || loop {
                crossbeam::select! {
                    recv(ticker) -> _ => {
                        self.poll();
                    }
                    recv(stop_rx) -> _ => break,
                }
            })?;
        Ok(SupervisorHandle {
            stop_tx: Some(stop_tx),
            join: Some(join),
        })
    }
}

pub struct SupervisorHandle {
    stop_tx: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        // Dropping the sender disconnects the channel and wakes the select
        drop(self.stop_tx.take());
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("Beam supervisor thread panicked");
            }
        }
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.halt();
    }
}
