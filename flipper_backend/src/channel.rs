//! Channel configurations for the three device task roles.
//!
//! A [`ChannelConfig`] carries everything the Device I/O port needs to set up one task:
//! physical channel, voltage range, sample clock, start trigger and regeneration behaviour.
//! The role constructors derive them from [`HardwareConfig`]:
//!
//! | Role        | Channel      | Trigger                         | Regenerate | Retrigger |
//! |-------------|--------------|---------------------------------|------------|-----------|
//! | FlipOutput  | `ao1`        | readback start trigger (digital)| yes        | yes       |
//! | CompOutput  | `ao0`        | none                            | no         | no        |
//! | Readback    | `ai0`        | external terminal (analog edge) | n/a        | yes       |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::HardwareConfig;
use crate::error::{FlipperError, FlipperResult};
use crate::waveform::WaveformSpec;

/// Finite-sample clocking rejects single-sample buffers
pub const MIN_FINITE_SAMPS: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskRole {
    FlipOutput,
    CompOutput,
    Readback,
}

impl TaskRole {
    pub fn is_output(&self) -> bool {
        !matches!(self, TaskRole::Readback)
    }
}

impl fmt::Display for TaskRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                TaskRole::FlipOutput => "FlipOutput",
                TaskRole::CompOutput => "CompOutput",
                TaskRole::Readback => "Readback",
            }
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerEdge {
    Rising,
    Falling,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockMode {
    FiniteSamps,
    ContSamps,
}

/// Sample layout of multi-channel writes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupingMode {
    ByChannel,
    ByScanNumber,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelConfig {
    pub role: TaskRole,
    pub physical_channel: String,
    pub voltage_range: (f64, f64),
    pub clock_rate: f64,
    pub clock_edge: TriggerEdge,
    pub clock_mode: ClockMode,
    pub samp_count: usize,
    pub trigger_source: Option<String>,
    pub trigger_edge: TriggerEdge,
    /// Analog edge threshold. `None` selects a digital edge trigger.
    pub trigger_level: Option<f64>,
    pub regenerate: bool,
    pub retriggerable: bool,
}

impl ChannelConfig {
    /// Regenerated, retriggered flip output started by the readback start trigger.
    /// `samp_count` is the length of the buffer that will be written.
    pub fn flip(hw: &HardwareConfig, spec: &WaveformSpec, samp_count: usize) -> Self {
        Self {
            role: TaskRole::FlipOutput,
            physical_channel: hw.flip_channel.clone(),
            voltage_range: hw.output_range,
            clock_rate: spec.samp_rate,
            clock_edge: TriggerEdge::Rising,
            clock_mode: ClockMode::FiniteSamps,
            samp_count,
            trigger_source: Some(hw.readback_start_trigger.clone()),
            trigger_edge: TriggerEdge::Rising,
            trigger_level: None,
            regenerate: true,
            retriggerable: true,
        }
    }

    /// One-shot constant write on the compensation coil
    pub fn compensation(hw: &HardwareConfig) -> Self {
        Self {
            role: TaskRole::CompOutput,
            physical_channel: hw.comp_channel.clone(),
            voltage_range: hw.output_range,
            clock_rate: hw.samp_rate,
            clock_edge: TriggerEdge::Rising,
            clock_mode: ClockMode::FiniteSamps,
            samp_count: hw.comp_samples.max(MIN_FINITE_SAMPS),
            trigger_source: None,
            trigger_edge: TriggerEdge::Rising,
            trigger_level: None,
            regenerate: false,
            retriggerable: false,
        }
    }

    /// Finite acquisition re-armed on every edge of the external timing signal
    pub fn readback(hw: &HardwareConfig) -> Self {
        Self {
            role: TaskRole::Readback,
            physical_channel: hw.readback_channel.clone(),
            voltage_range: hw.input_range,
            clock_rate: hw.samp_rate,
            clock_edge: TriggerEdge::Rising,
            clock_mode: ClockMode::FiniteSamps,
            samp_count: hw.readback_samples.max(MIN_FINITE_SAMPS),
            trigger_source: Some(hw.trigger_terminal.clone()),
            trigger_edge: hw.trigger_edge,
            trigger_level: Some(hw.trigger_level),
            regenerate: false,
            retriggerable: true,
        }
    }

    pub fn validate(&self) -> FlipperResult<()> {
        if self.physical_channel.trim().is_empty() {
            return Err(FlipperError::InvalidSpec(format!(
                "{} task has no physical channel",
                self.role
            )));
        }
        if !(self.clock_rate.is_finite() && self.clock_rate > 0.0) {
            return Err(FlipperError::InvalidSpec(format!(
                "{} clock rate {} must be positive",
                self.role, self.clock_rate
            )));
        }
        if self.clock_mode == ClockMode::FiniteSamps && self.samp_count < MIN_FINITE_SAMPS {
            return Err(FlipperError::InvalidSpec(format!(
                "{} needs at least {} samples, got {}",
                self.role, MIN_FINITE_SAMPS, self.samp_count
            )));
        }
        if !(self.voltage_range.0 < self.voltage_range.1) {
            return Err(FlipperError::InvalidSpec(format!(
                "{} voltage range {:?} is empty",
                self.role, self.voltage_range
            )));
        }
        if self.retriggerable && self.trigger_source.is_none() {
            return Err(FlipperError::InvalidSpec(format!(
                "{} is retriggerable but has no trigger source",
                self.role
            )));
        }
        Ok(())
    }
}

/// Checks the wiring invariants between the three role configurations:
/// 1. each role owns a distinct physical channel;
/// 2. the flip output is triggered by the readback start trigger, never directly by the
///    external terminal the readback task has reserved.
pub fn check_channel_map(
    flip: &ChannelConfig,
    comp: &ChannelConfig,
    readback: &ChannelConfig,
    readback_start_trigger: &str,
) -> FlipperResult<()> {
    let roles = [
        (TaskRole::FlipOutput, flip),
        (TaskRole::CompOutput, comp),
        (TaskRole::Readback, readback),
    ];
    for (expected, cfg) in roles.iter() {
        if cfg.role != *expected {
            return Err(FlipperError::Config(format!(
                "expected a {} config, got {}",
                expected, cfg.role
            )));
        }
        cfg.validate()
            .map_err(|e| FlipperError::Config(e.to_string()))?;
    }
    for (i, (role_a, a)) in roles.iter().enumerate() {
        for (role_b, b) in roles.iter().skip(i + 1) {
            if a.physical_channel == b.physical_channel {
                return Err(FlipperError::Config(format!(
                    "{} and {} both map to {}",
                    role_a, role_b, a.physical_channel
                )));
            }
        }
    }
    if flip.trigger_source.as_deref() != Some(readback_start_trigger) {
        return Err(FlipperError::Config(format!(
            "flip output must be triggered by {}, found {:?}",
            readback_start_trigger, flip.trigger_source
        )));
    }
    if readback.trigger_source.as_deref() == Some(readback_start_trigger) {
        return Err(FlipperError::Config(
            "readback task cannot trigger on its own start trigger".to_string(),
        ));
    }
    Ok(())
}
