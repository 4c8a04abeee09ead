//! Synthesis of the flip-coil current waveform.
//!
//! ## Analytic model
//!
//! The flip coil is driven with an inverse-time decay clipped to a maximum amplitude:
//!
//! ```text
//! t_k = t_min + k / samp_rate,       k in [0, duration_samples)
//! v_k = min(decay_constant / t_k, max_amplitude)
//! ```
//!
//! followed by `pad_samples` samples held at `max_amplitude`. The output task regenerates the
//! buffer on every trigger, so the last sample written is the level the coil sits at between
//! triggers. Ending on the same value the next cycle starts on avoids a step at the loop
//! wraparound.
//!
//! ## File override
//!
//! If [`WaveformSpec::source_file`] names a readable file of samples, that buffer is used
//! verbatim (no clipping). Any failure to load it falls back to the analytic model with a
//! warning.
//!
//! Samples are written as UTF-8 text separated by whitespace and/or commas; `#` starts a
//! comment running to the end of the line.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FlipperError, FlipperResult};

/// 1 sample = 1 microsecond
pub const DEFAULT_SAMP_RATE: f64 = 1e6;

/// Parameters of the flip-coil waveform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveformSpec {
    /// Numerator of the `decay_constant / t` model, in volt-seconds
    pub decay_constant: f64,
    /// Clip level, in volts
    pub max_amplitude: f64,
    pub samp_rate: f64,
    pub duration_samples: usize,
    /// First sample time, in seconds. Must be strictly positive.
    pub t_min: f64,
    /// Trailing samples held at `max_amplitude`
    pub pad_samples: usize,
    pub source_file: Option<PathBuf>,
}

impl Default for WaveformSpec {
    fn default() -> Self {
        Self {
            decay_constant: 1e-3,
            max_amplitude: 5.0,
            samp_rate: DEFAULT_SAMP_RATE,
            duration_samples: 50_000,
            t_min: 1e-6,
            pad_samples: 1,
            source_file: None,
        }
    }
}

impl WaveformSpec {
    /// Checks the analytic model parameters. The source file is not inspected here since a
    /// missing file is not an error (see [`synthesize`]).
    pub fn validate(&self) -> FlipperResult<()> {
        let invalid = |msg: String| Err(FlipperError::InvalidSpec(msg));
        if self.duration_samples == 0 {
            return invalid("duration_samples must be positive".to_string());
        }
        if !(self.samp_rate.is_finite() && self.samp_rate > 0.0) {
            return invalid(format!("samp_rate {} must be positive", self.samp_rate));
        }
        if !(self.t_min.is_finite() && self.t_min > 0.0) {
            return invalid(format!("t_min {} must be strictly positive", self.t_min));
        }
        if !(self.max_amplitude.is_finite() && self.max_amplitude >= 0.0) {
            return invalid(format!("max_amplitude {} must be non-negative", self.max_amplitude));
        }
        if !(self.decay_constant.is_finite() && self.decay_constant >= 0.0) {
            return invalid(format!("decay_constant {} must be non-negative", self.decay_constant));
        }
        Ok(())
    }

    /// Length of the analytic buffer including the trailing pad
    pub fn padded_len(&self) -> usize {
        self.duration_samples + self.pad_samples
    }
}

/// Immutable sample sequence handed to an output task.
///
/// Cloning shares the underlying storage; there is no way to mutate the samples once built.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleBuffer {
    samps: Arc<[f64]>,
}

impl SampleBuffer {
    pub fn from_vec(samps: Vec<f64>) -> Self {
        Self {
            samps: samps.into(),
        }
    }

    /// `n` copies of `value`
    pub fn constant(value: f64, n: usize) -> Self {
        Self::from_vec(vec![value; n])
    }

    pub fn len(&self) -> usize {
        self.samps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samps.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.samps
    }

    pub fn view(&self) -> ArrayView1<'_, f64> {
        ArrayView1::from(&self.samps[..])
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.samps.to_vec()
    }

    pub fn max(&self) -> f64 {
        self.samps.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn min(&self) -> f64 {
        self.samps.iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// `(sample index, value)` pairs for plotting
    pub fn points(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.samps.iter().copied().enumerate()
    }
}

impl From<Array1<f64>> for SampleBuffer {
    fn from(value: Array1<f64>) -> Self {
        Self::from_vec(value.into_raw_vec())
    }
}

/// Produces the flip-coil buffer for `spec`.
///
/// # Parameters
///
/// * `spec`: analytic model parameters and optional source file.
///
/// # Behavior
///
/// If `spec.source_file` is set and loads, its samples are returned verbatim (no clipping).
/// Otherwise the clipped inverse-time decay of [`analytic_waveform`] is returned: every sample
/// lies in `[0, max_amplitude]`, the last `pad_samples` equal `max_amplitude`, and the length is
/// `duration_samples + pad_samples`. A source file that cannot be loaded is logged and ignored.
///
/// # Errors
///
/// [`FlipperError::InvalidSpec`] if the analytic parameters are invalid, even when a source file
/// would have been used.
///
/// # Examples
///
/// ```
/// use flipper_backend::{synthesize, WaveformSpec};
///
/// let spec = WaveformSpec {
///     duration_samples: 100,
///     max_amplitude: 2.0,
///     ..WaveformSpec::default()
/// };
/// let buf = synthesize(&spec).unwrap();
/// assert_eq!(buf.len(), 101);
/// assert_eq!(buf.max(), 2.0);
/// ```
pub fn synthesize(spec: &WaveformSpec) -> FlipperResult<SampleBuffer> {
    spec.validate()?;
    if let Some(path) = &spec.source_file {
        match load_waveform_file(path) {
            Ok(buffer) => {
                debug!("Loaded {} waveform samples from {:?}", buffer.len(), path);
                return Ok(buffer);
            }
            Err(err) => warn!("{}; using analytic waveform", err),
        }
    }
    Ok(analytic_waveform(spec))
}

/// Clipped inverse-time decay plus the trailing pad. Assumes `spec` has been validated.
pub fn analytic_waveform(spec: &WaveformSpec) -> SampleBuffer {
    let dt = 1.0 / spec.samp_rate;
    let t_arr = Array1::from_shape_fn(spec.duration_samples, |k| spec.t_min + k as f64 * dt);
    let mut samps = t_arr
        .mapv(|t| (spec.decay_constant / t).min(spec.max_amplitude))
        .into_raw_vec();
    samps.extend(std::iter::repeat(spec.max_amplitude).take(spec.pad_samples));
    SampleBuffer::from_vec(samps)
}

/// Reads a sample file. See the module docs for the format.
pub fn load_waveform_file(path: &Path) -> FlipperResult<SampleBuffer> {
    let file_err = |reason: String| FlipperError::FileLoad {
        path: path.to_path_buf(),
        reason,
    };
    let text = fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;

    let mut samps = Vec::new();
    for (line_num, line) in text.lines().enumerate() {
        let content = line.split('#').next().unwrap_or("");
        for token in content
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty())
        {
            let value = token
                .parse::<f64>()
                .map_err(|_| file_err(format!("line {}: cannot parse {:?}", line_num + 1, token)))?;
            samps.push(value);
        }
    }
    if samps.is_empty() {
        return Err(file_err("file contains no samples".to_string()));
    }
    Ok(SampleBuffer::from_vec(samps))
}
