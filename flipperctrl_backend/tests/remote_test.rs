use std::io::{Cursor, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flipper_backend::sim::{PortCall, SimPort};
use flipper_backend::{FlipperConfig, FlipperController, RemoteConfig, TaskRole};
use flipperctrl_backend::{run_console, RemoteHandle, RemoteServer};

fn controller() -> (SimPort, Arc<FlipperController>) {
    let port = SimPort::new();
    let mut config = FlipperConfig::default();
    config.waveform.duration_samples = 1_000;
    let ctrl = FlipperController::new(Arc::new(port.clone()), &config).unwrap();
    (port, Arc::new(ctrl))
}

fn serve(ctrl: &Arc<FlipperController>, cfg: RemoteConfig) -> RemoteHandle {
    RemoteServer::bind("127.0.0.1:0", ctrl.clone(), &cfg)
        .unwrap()
        .spawn()
        .unwrap()
}

fn connect(handle: &RemoteHandle) -> TcpStream {
    let stream = TcpStream::connect(handle.local_addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

// Each packet is its own recv on the server side
fn send(stream: &mut TcpStream, packet: &str) {
    stream.write_all(packet.as_bytes()).unwrap();
    thread::sleep(Duration::from_millis(100));
}

fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn reply(stream: &mut TcpStream) -> String {
    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).unwrap();
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

#[test]
fn amp_packet_restarts_with_new_amplitude() {
    let (port, ctrl) = controller();
    ctrl.on().unwrap();
    let server = serve(&ctrl, RemoteConfig::default());

    let mut stream = connect(&server);
    send(&mut stream, "amp2.5");
    assert!(wait_for(|| ctrl.amplitude() == 2.5));
    assert!(wait_for(|| ctrl.waveform().map(|buf| buf.max()) == Some(2.5)));
    assert!(ctrl.is_running());

    // Off then On: one zeroing, two flip tasks, never both alive
    assert_eq!(port.count(|call| matches!(call, PortCall::ZeroAllOutputs)), 1);
    assert_eq!(
        port.count(|call| matches!(call, PortCall::OpenTask { role: TaskRole::FlipOutput, .. })),
        2
    );
    assert_eq!(port.peak_live_tasks(TaskRole::FlipOutput), 1);
    server.stop();
}

#[test]
fn queries_reply_on_the_connection() {
    let (_port, ctrl) = controller();
    let server = serve(&ctrl, RemoteConfig::default());
    let mut stream = connect(&server);

    send(&mut stream, "comp1.5");
    send(&mut stream, "comp?");
    assert_eq!(reply(&mut stream), "1.5");
    send(&mut stream, "amp?");
    assert_eq!(reply(&mut stream), "5.0");
    send(&mut stream, "file?");
    send(&mut stream, "const?");
    // Empty file name, then the decay constant
    assert_eq!(reply(&mut stream), "0.001");
}

#[test]
fn rejected_value_keeps_connection() {
    let (_port, ctrl) = controller();
    let server = serve(&ctrl, RemoteConfig::default());
    let mut stream = connect(&server);

    send(&mut stream, "amp20");
    send(&mut stream, "amp?");
    assert_eq!(reply(&mut stream), "5.0");
}

#[test]
fn toggle_packets() {
    let (_port, ctrl) = controller();
    let server = serve(&ctrl, RemoteConfig::default());
    let mut stream = connect(&server);

    send(&mut stream, "toggle1");
    assert!(wait_for(|| ctrl.is_running()));
    send(&mut stream, "toggle");
    assert!(wait_for(|| !ctrl.is_running()));
    send(&mut stream, "toggle0");
    send(&mut stream, "toggle");
    assert!(wait_for(|| ctrl.is_running()));
}

#[test]
fn unknown_packet_closes_connection() {
    let (_port, ctrl) = controller();
    let server = serve(&ctrl, RemoteConfig::default());
    let mut stream = connect(&server);

    send(&mut stream, "goodbye");
    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);

    // The server keeps accepting other clients
    let mut other = connect(&server);
    send(&mut other, "amp?");
    assert_eq!(reply(&mut other), "5.0");
}

#[test]
fn idle_connection_times_out() {
    let (_port, ctrl) = controller();
    let cfg = RemoteConfig {
        idle_timeout: 0.2,
        ..RemoteConfig::default()
    };
    let server = serve(&ctrl, cfg);
    let mut stream = connect(&server);

    let started = Instant::now();
    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn console_session() {
    let (port, ctrl) = controller();
    let input = Cursor::new("amp?\namp3\n\ntoggle1\nstatus\nbogus\nconst\nquit\namp4\n");
    let mut output = Vec::new();
    run_console(&ctrl, input, &mut output).unwrap();

    let text = String::from_utf8(output).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "5.0");
    assert!(lines[1].starts_with("running=true"));
    assert!(lines[1].contains("amp=3"));
    assert!(lines[2].starts_with("unknown command"));
    assert!(lines[3].starts_with("error:"));
    assert_eq!(lines.len(), 4);

    // Nothing after quit is executed
    assert_eq!(ctrl.amplitude(), 3.0);
    assert_eq!(port.live_tasks(TaskRole::FlipOutput), 1);
}
