//! OpenGENIE remote control over TCP.
//!
//! ## Protocol
//!
//! Each packet (one `recv` of at most `max_packet` bytes) is scanned for keywords. Matching is by
//! substring, case-sensitive and order-independent, so one packet may carry several commands:
//!
//! | Packet         | Effect                                   | Reply          |
//! |----------------|------------------------------------------|----------------|
//! | `comp<float>`  | set compensation amplitude               |                |
//! | `amp<float>`   | set maximum flip amplitude               |                |
//! | `const<float>` | set decay constant                       |                |
//! | `file<path>`   | set waveform file (whitespace stripped)  |                |
//! | `comp?` etc.   | query                                    | current value  |
//! | `toggle1`      | on                                       |                |
//! | `toggle0`      | off                                      |                |
//! | `toggle`       | toggle                                   |                |
//!
//! The numeric argument is the first decimal literal anywhere in the packet. A packet without
//! any keyword is the client's disconnect signal and closes the connection, as does a keyword
//! missing its number, end of stream, or `idle_timeout` seconds of silence.
//!
//! Every connection is served on its own thread and owns its receive buffer. Commands reach the
//! controller through its public operations, which serialize them against the beam supervisor.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use regex::Regex;
use tracing::{debug, info, warn};

use flipper_backend::{FlipperController, FlipperError, FlipperResult, RemoteConfig};

/// How often the accept loop checks for a stop request
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToggleMode {
    On,
    Off,
    Flip,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RemoteCommand {
    SetCompensation(f64),
    QueryCompensation,
    SetAmplitude(f64),
    QueryAmplitude,
    SetDecayConstant(f64),
    QueryDecayConstant,
    /// Empty clears the file and returns to the analytic waveform
    SetWaveformFile(String),
    QueryWaveformFile,
    Toggle(ToggleMode),
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[-+]?(?:\d*\.\d+|\d+)").expect("hard-coded regex"))
}

fn first_number(packet: &str, keyword: &str) -> FlipperResult<f64> {
    number_re()
        .find(packet)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .ok_or_else(|| {
            FlipperError::Connection(format!("'{}' without a numeric argument", keyword))
        })
}

/// Decodes one packet into the commands it carries, in keyword order.
///
/// # Behavior
///
/// Keywords are checked in the order `comp`, `amp`, `const`, `file`, `toggle`. A `?` anywhere
/// turns every keyword into a query. Setters take the first decimal literal of the packet.
/// An empty list means the packet carried no keyword.
///
/// # Errors
///
/// [`FlipperError::Connection`] if a setter keyword has no number to go with it.
///
/// # Examples
///
/// ```
/// use flipperctrl_backend::{parse_packet, RemoteCommand};
///
/// assert_eq!(parse_packet("amp2.5").unwrap(), vec![RemoteCommand::SetAmplitude(2.5)]);
/// assert!(parse_packet("bye").unwrap().is_empty());
/// ```
pub fn parse_packet(packet: &str) -> FlipperResult<Vec<RemoteCommand>> {
    let query = packet.contains('?');
    let mut commands = Vec::new();

    if packet.contains("comp") {
        commands.push(if query {
            RemoteCommand::QueryCompensation
        } else {
            RemoteCommand::SetCompensation(first_number(packet, "comp")?)
        });
    }
    if packet.contains("amp") {
        commands.push(if query {
            RemoteCommand::QueryAmplitude
        } else {
            RemoteCommand::SetAmplitude(first_number(packet, "amp")?)
        });
    }
    if packet.contains("const") {
        commands.push(if query {
            RemoteCommand::QueryDecayConstant
        } else {
            RemoteCommand::SetDecayConstant(first_number(packet, "const")?)
        });
    }
    if packet.contains("file") {
        commands.push(if query {
            RemoteCommand::QueryWaveformFile
        } else {
            let path: String = packet.chars().filter(|c| !c.is_whitespace()).collect();
            RemoteCommand::SetWaveformFile(path.replace("file", ""))
        });
    }
    if packet.contains("toggle") {
        let mode = if packet.contains('1') {
            ToggleMode::On
        } else if packet.contains('0') {
            ToggleMode::Off
        } else {
            ToggleMode::Flip
        };
        commands.push(RemoteCommand::Toggle(mode));
    }
    Ok(commands)
}

/// Runs one command against the controller. Queries return the reply to send back.
pub fn apply(ctrl: &FlipperController, cmd: &RemoteCommand) -> FlipperResult<Option<String>> {
    match cmd {
        RemoteCommand::SetCompensation(v) => ctrl.set_compensation(*v)?,
        RemoteCommand::SetAmplitude(v) => ctrl.set_amplitude(*v)?,
        RemoteCommand::SetDecayConstant(v) => ctrl.set_decay_constant(*v)?,
        RemoteCommand::SetWaveformFile(path) => {
            let path = (!path.is_empty()).then(|| PathBuf::from(path));
            ctrl.set_waveform_file(path)?
        }
        RemoteCommand::QueryCompensation => return Ok(Some(format!("{:?}", ctrl.compensation()))),
        RemoteCommand::QueryAmplitude => return Ok(Some(format!("{:?}", ctrl.amplitude()))),
        RemoteCommand::QueryDecayConstant => {
            return Ok(Some(format!("{:?}", ctrl.decay_constant())))
        }
        RemoteCommand::QueryWaveformFile => {
            let name = ctrl
                .waveform_file()
                .map(|path| path.display().to_string())
                .unwrap_or_default();
            return Ok(Some(name));
        }
        RemoteCommand::Toggle(ToggleMode::On) => ctrl.on()?,
        RemoteCommand::Toggle(ToggleMode::Off) => ctrl.off()?,
        RemoteCommand::Toggle(ToggleMode::Flip) => {
            ctrl.toggle()?;
        }
    }
    Ok(None)
}

/// Serves one client until it disconnects, goes silent, or sends an unrecognised packet.
///
/// Controller errors are logged and the connection stays open; only protocol and socket errors
/// end it.
pub fn handle_connection(
    mut stream: TcpStream,
    ctrl: &FlipperController,
    cfg: &RemoteConfig,
) -> FlipperResult<()> {
    stream.set_read_timeout(Some(cfg.idle_duration()))?;
    let mut buf = vec![0u8; cfg.max_packet];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                debug!("Remote client idle for {} s, closing", cfg.idle_timeout);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let packet = String::from_utf8_lossy(&buf[..n]);
        debug!("Remote packet {:?}", packet);
        let commands = parse_packet(&packet)?;
        if commands.is_empty() {
            return Err(FlipperError::Connection(format!(
                "unrecognised packet {:?}",
                packet.trim()
            )));
        }
        for cmd in commands.iter() {
            match apply(ctrl, cmd) {
                Ok(Some(reply)) => stream.write_all(reply.as_bytes())?,
                Ok(None) => {}
                Err(err) => warn!("Remote command {:?} failed: {}", cmd, err),
            }
        }
    }
}

pub struct RemoteServer {
    listener: TcpListener,
    ctrl: Arc<FlipperController>,
    cfg: RemoteConfig,
}

impl RemoteServer {
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        ctrl: Arc<FlipperController>,
        cfg: &RemoteConfig,
    ) -> FlipperResult<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            ctrl,
            cfg: cfg.clone(),
        })
    }

    pub fn local_addr(&self) -> FlipperResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections on a background thread until the handle is stopped or dropped.
    pub fn spawn(self) -> FlipperResult<RemoteHandle> {
        let addr = self.local_addr()?;
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let join = thread::Builder::new()
            .name("remote-accept".to_string())
            .spawn(move || loop {
                crossbeam::select! {
                    recv(stop_rx) -> _ => break,
                    default(ACCEPT_POLL) => self.accept_pending(),
                }
            })?;
        info!("Remote control listening on {}", addr);
        Ok(RemoteHandle {
            addr,
            stop_tx: Some(stop_tx),
            join: Some(join),
        })
    }

    fn accept_pending(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = self.serve(stream, peer) {
                        warn!("Could not serve {}: {}", peer, err);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!("Accept failed: {}", err);
                    return;
                }
            }
        }
    }

    fn serve(&self, stream: TcpStream, peer: SocketAddr) -> FlipperResult<()> {
        stream.set_nonblocking(false)?;
        let ctrl = self.ctrl.clone();
        let cfg = self.cfg.clone();
        thread::Builder::new()
            .name(format!("remote-{}", peer))
            .spawn(move || {
                debug!("Remote client {} connected", peer);
                match handle_connection(stream, &ctrl, &cfg) {
                    Ok(()) => debug!("Remote client {} disconnected", peer),
                    Err(err) => debug!("Closed connection to {}: {}", peer, err),
                }
            })?;
        Ok(())
    }
}

pub struct RemoteHandle {
    addr: SocketAddr,
    stop_tx: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl RemoteHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting. Connections already being served run until they close.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        drop(self.stop_tx.take());
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("Remote accept thread panicked");
            }
        }
    }
}

impl Drop for RemoteHandle {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_setters() {
        assert_eq!(parse_packet("amp2.5").unwrap(), vec![RemoteCommand::SetAmplitude(2.5)]);
        assert_eq!(parse_packet("comp 3").unwrap(), vec![RemoteCommand::SetCompensation(3.0)]);
        assert_eq!(
            parse_packet("const.002\n").unwrap(),
            vec![RemoteCommand::SetDecayConstant(0.002)]
        );
    }

    #[test]
    fn parses_queries() {
        assert_eq!(parse_packet("comp?").unwrap(), vec![RemoteCommand::QueryCompensation]);
        assert_eq!(parse_packet("amp?").unwrap(), vec![RemoteCommand::QueryAmplitude]);
        assert_eq!(parse_packet("const?").unwrap(), vec![RemoteCommand::QueryDecayConstant]);
        assert_eq!(parse_packet("file?").unwrap(), vec![RemoteCommand::QueryWaveformFile]);
    }

    #[test]
    fn parses_toggle_modes() {
        assert_eq!(parse_packet("toggle1").unwrap(), vec![RemoteCommand::Toggle(ToggleMode::On)]);
        assert_eq!(parse_packet("toggle0").unwrap(), vec![RemoteCommand::Toggle(ToggleMode::Off)]);
        assert_eq!(parse_packet("toggle").unwrap(), vec![RemoteCommand::Toggle(ToggleMode::Flip)]);
    }

    #[test]
    fn file_path_strips_whitespace() {
        assert_eq!(
            parse_packet("file C:/pulses/ fast.dat\r\n").unwrap(),
            vec![RemoteCommand::SetWaveformFile("C:/pulses/fast.dat".to_string())]
        );
        assert_eq!(
            parse_packet("file").unwrap(),
            vec![RemoteCommand::SetWaveformFile(String::new())]
        );
    }

    #[test]
    fn matching_is_permissive() {
        // Both keywords are substrings of the packet, so both fire
        assert_eq!(
            parse_packet("amp1.5 const0.5").unwrap(),
            vec![RemoteCommand::SetAmplitude(1.5), RemoteCommand::SetDecayConstant(1.5)]
        );
        assert!(parse_packet("AMP2").unwrap().is_empty());
    }

    #[test]
    fn disconnect_signals() {
        assert!(parse_packet("bye").unwrap().is_empty());
        assert!(parse_packet("").unwrap().is_empty());
        assert!(matches!(parse_packet("amp"), Err(FlipperError::Connection(_))));
    }
}
