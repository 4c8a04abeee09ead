// Signal handlers are process-wide, so these tests live in their own binary.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use flipper_backend::sim::{PortCall, SimPort};
use flipper_backend::{FlipperConfig, TaskRole};
use flipperctrl_backend::{watch_shutdown_signals, FlipperService, PortSetup};

#[test]
fn sigterm_leads_to_zeroed_outputs() {
    let port = SimPort::new();
    let mut config = FlipperConfig::default();
    config.waveform.duration_samples = 1_000;
    let service = FlipperService::start(
        &config,
        PortSetup {
            port: Arc::new(port.clone()),
            trigger: None,
        },
    )
    .unwrap();
    service.controller().on().unwrap();

    let signals = watch_shutdown_signals().unwrap();
    unsafe {
        libc::raise(libc::SIGTERM);
    }
    // The handler swallows the signal and reports it instead of killing the process
    let name = signals.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(name, "SIGTERM");

    port.clear_journal();
    service.stop().unwrap();
    assert_eq!(port.live_tasks(TaskRole::FlipOutput), 0);
    assert_eq!(port.count(|call| matches!(call, PortCall::ZeroAllOutputs)), 1);
}
