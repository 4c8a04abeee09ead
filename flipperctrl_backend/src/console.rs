//! Line-oriented operator console.
//!
//! Every line is handled like a remote packet (see [`crate::remote`]); in addition `status`
//! prints a snapshot of the controller and `quit` ends the session. Unlike a remote client, an
//! operator typing an unknown command is told so instead of being disconnected.

use std::io::{BufRead, Write};

use flipper_backend::{FlipperController, FlipperStatus};

use crate::error::CtrlResult;
use crate::remote::{apply, parse_packet};

/// Reads commands from `input` until `quit` or end of input.
///
/// The caller is responsible for shutting the controller down afterwards.
pub fn run_console<R: BufRead, W: Write>(
    ctrl: &FlipperController,
    input: R,
    mut output: W,
) -> CtrlResult<()> {
    for line in input.lines() {
        let line = line?;
        let line = line.trim();
        match line {
            "" => continue,
            "quit" => break,
            "status" => writeln!(output, "{}", format_status(&ctrl.status()))?,
            _ => match parse_packet(line) {
                Ok(commands) if commands.is_empty() => {
                    writeln!(output, "unknown command {:?}", line)?
                }
                Ok(commands) => {
                    for cmd in commands.iter() {
                        match apply(ctrl, cmd) {
                            Ok(Some(reply)) => writeln!(output, "{}", reply)?,
                            Ok(None) => {}
                            Err(err) => writeln!(output, "error: {}", err)?,
                        }
                    }
                }
                Err(err) => writeln!(output, "error: {}", err)?,
            },
        }
        output.flush()?;
    }
    Ok(())
}

pub fn format_status(status: &FlipperStatus) -> String {
    format!(
        "running={} interrupted={} amp={} const={} comp={} file={} freq={:.2} Hz missed={} last pulse {:.1} s ago",
        status.running,
        status.interrupted_by_beam_loss,
        status.max_amplitude,
        status.decay_constant,
        status.compensation,
        status
            .waveform_file
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "-".to_string()),
        status.current_freq,
        status.missed_count,
        status.since_last_pulse,
    )
}
