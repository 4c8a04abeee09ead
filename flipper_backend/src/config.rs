//! Runtime configuration of the flipper, loaded from TOML.
//!
//! Every field has a default matching the reference installation, so an empty file (or no file
//! at all) yields a working configuration:
//!
//! ```toml
//! [hardware]
//! flip_channel = "Dev1/ao1"
//! comp_channel = "Dev1/ao0"
//! readback_channel = "Dev1/ai0"
//! trigger_terminal = "APFI0"
//!
//! [waveform]
//! decay_constant = 1e-3
//! max_amplitude = 5.0
//!
//! [supervisor]
//! beam_loss_timeout = 5.0
//!
//! [remote]
//! port = 80
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::TriggerEdge;
use crate::error::{FlipperError, FlipperResult};
use crate::waveform::{WaveformSpec, DEFAULT_SAMP_RATE};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlipperConfig {
    pub hardware: HardwareConfig,
    pub waveform: WaveformSpec,
    pub compensation: CompensationConfig,
    pub timing: TimingConfig,
    pub supervisor: SupervisorConfig,
    pub remote: RemoteConfig,
    pub logging: LoggingConfig,
}

/// Physical wiring of the DAQ card.
///
/// The flip output is started from the readback task's own start trigger
/// (`readback_start_trigger`), while the readback task listens on the external timing terminal.
/// Two tasks cannot both reserve the external terminal, and deriving the flip trigger from the
/// readback start keeps the two in lockstep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub flip_channel: String,
    pub comp_channel: String,
    pub readback_channel: String,
    /// External timing input the readback task triggers on
    pub trigger_terminal: String,
    /// Analog trigger threshold on `trigger_terminal`, in volts
    pub trigger_level: f64,
    pub trigger_edge: TriggerEdge,
    /// Start-trigger output of the readback task, used as the flip output's trigger source
    pub readback_start_trigger: String,
    pub output_range: (f64, f64),
    pub input_range: (f64, f64),
    /// Sample clock of the compensation and readback tasks
    pub samp_rate: f64,
    pub comp_samples: usize,
    /// Samples acquired per trigger by the readback task
    pub readback_samples: usize,
    pub zero_samples: usize,
    pub zero_rate: f64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            flip_channel: "Dev1/ao1".to_string(),
            comp_channel: "Dev1/ao0".to_string(),
            readback_channel: "Dev1/ai0".to_string(),
            trigger_terminal: "APFI0".to_string(),
            trigger_level: 0.5,
            trigger_edge: TriggerEdge::Rising,
            readback_start_trigger: "ai/StartTrigger".to_string(),
            output_range: (0.0, 10.0),
            input_range: (0.0, 1.0),
            samp_rate: DEFAULT_SAMP_RATE,
            comp_samples: 100,
            readback_samples: 1_000,
            zero_samples: 2,
            zero_rate: 5e4,
        }
    }
}

impl HardwareConfig {
    /// Output channels, compensation first
    pub fn output_channels(&self) -> [&str; 2] {
        [&self.comp_channel, &self.flip_channel]
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompensationConfig {
    /// Constant compensation coil drive, in volts
    pub amplitude: f64,
}

impl Default for CompensationConfig {
    fn default() -> Self {
        Self { amplitude: 0.0 }
    }
}

/// Pulse frequency measurement. See [`PulseTimingMonitor`](crate::monitor::PulseTimingMonitor).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Callbacks per frequency measurement (K)
    pub window: usize,
    pub expected_freq: f64,
    /// Allowed deviation as a fraction of `expected_freq`
    pub tolerance: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            window: 10,
            expected_freq: 10.0,
            tolerance: 0.1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Seconds without a readback callback before the beam is considered lost
    pub beam_loss_timeout: f64,
    /// Seconds between supervisor polls
    pub poll_interval: f64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            beam_loss_timeout: 5.0,
            poll_interval: 1.0,
        }
    }
}

impl SupervisorConfig {
    pub fn poll_duration(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    /// Seconds a connection may stay silent before it is closed
    pub idle_timeout: f64,
    /// Bytes read per packet
    pub max_packet: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 80,
            idle_timeout: 60.0,
            max_packet: 1024,
        }
    }
}

impl RemoteConfig {
    pub fn idle_duration(&self) -> Duration {
        Duration::from_secs_f64(self.idle_timeout)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl FlipperConfig {
    pub fn load(path: &Path) -> FlipperResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| FlipperError::Config(format!("cannot read {:?}: {}", path, e)))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> FlipperResult<Self> {
        let config: FlipperConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> FlipperResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> FlipperResult<()> {
        let hw = &self.hardware;
        let channels = [&hw.flip_channel, &hw.comp_channel, &hw.readback_channel];
        if channels.iter().any(|chan| chan.trim().is_empty()) {
            return config_err("physical channel names must not be empty");
        }
        if channels.iter().collect::<HashSet<_>>().len() != channels.len() {
            return config_err("flip, compensation and readback must use distinct physical channels");
        }
        if hw.trigger_terminal.trim().is_empty() || hw.readback_start_trigger.trim().is_empty() {
            return config_err("trigger terminals must not be empty");
        }
        if hw.trigger_terminal == hw.readback_start_trigger {
            return config_err("readback start trigger must differ from the external trigger terminal");
        }
        for (name, range) in [("output_range", hw.output_range), ("input_range", hw.input_range)] {
            if !(range.0 < range.1) {
                return config_err(&format!("{} must satisfy min < max, got {:?}", name, range));
            }
        }
        for (name, rate) in [("samp_rate", hw.samp_rate), ("zero_rate", hw.zero_rate)] {
            if !(rate.is_finite() && rate > 0.0) {
                return config_err(&format!("{} must be positive, got {}", name, rate));
            }
        }
        if hw.comp_samples < 2 || hw.zero_samples < 2 || hw.readback_samples < 2 {
            return config_err("finite-sample tasks need at least 2 samples");
        }

        self.waveform
            .validate()
            .map_err(|e| FlipperError::Config(e.to_string()))?;
        if !in_range(self.compensation.amplitude, hw.output_range) {
            return config_err(&format!(
                "compensation amplitude {} outside output range {:?}",
                self.compensation.amplitude, hw.output_range
            ));
        }

        let timing = &self.timing;
        if timing.window == 0 {
            return config_err("timing window must be at least 1");
        }
        if !(timing.expected_freq > 0.0) || !(timing.tolerance >= 0.0) {
            return config_err("expected_freq must be positive and tolerance non-negative");
        }
        if !(self.supervisor.beam_loss_timeout > 0.0) || !(self.supervisor.poll_interval > 0.0) {
            return config_err("beam_loss_timeout and poll_interval must be positive");
        }
        if !(self.remote.idle_timeout > 0.0) || self.remote.max_packet == 0 {
            return config_err("idle_timeout and max_packet must be positive");
        }
        Ok(())
    }
}

pub(crate) fn in_range(value: f64, range: (f64, f64)) -> bool {
    value.is_finite() && value >= range.0 && value <= range.1
}

fn config_err(msg: &str) -> FlipperResult<()> {
    Err(FlipperError::Config(msg.to_string()))
}
