use std::fs;
use std::sync::Arc;
use std::thread;

use flipper_backend::sim::{PortCall, SimOp, SimPort};
use flipper_backend::*;

fn controller_with(config: &FlipperConfig) -> (SimPort, Arc<FlipperController>) {
    let port = SimPort::new();
    let ctrl = FlipperController::new(Arc::new(port.clone()), config).unwrap();
    (port, Arc::new(ctrl))
}

fn small_config() -> FlipperConfig {
    let mut config = FlipperConfig::default();
    config.waveform.duration_samples = 2_000;
    config
}

fn zero_count(port: &SimPort) -> usize {
    port.count(|call| matches!(call, PortCall::ZeroAllOutputs))
}

#[test]
fn on_twice_equals_on_once() {
    let (port, ctrl) = controller_with(&small_config());
    ctrl.on().unwrap();
    let journal = port.journal();
    ctrl.on().unwrap();
    assert_eq!(port.journal(), journal);
    assert_eq!(port.live_tasks(TaskRole::FlipOutput), 1);
}

#[test]
fn off_when_off_touches_nothing() {
    let (port, ctrl) = controller_with(&small_config());
    ctrl.off().unwrap();
    assert!(port.journal().is_empty());
}

#[test]
fn flip_and_readback_are_phase_locked() {
    let (port, ctrl) = controller_with(&small_config());
    ctrl.on().unwrap();
    let hw = ctrl.hardware().clone();
    let journal = port.journal();

    let task_of = |role: TaskRole| {
        journal.iter().find_map(|call| match call {
            PortCall::OpenTask { task, role: r } if *r == role => Some(*task),
            _ => None,
        })
    };
    let flip = task_of(TaskRole::FlipOutput).unwrap();
    let readback = task_of(TaskRole::Readback).unwrap();

    let trigger_of = |id: u64| {
        journal.iter().find_map(|call| match call {
            PortCall::ArmRetrigger { task, source, .. } if *task == id => Some(source.clone()),
            _ => None,
        })
    };
    assert_eq!(trigger_of(flip), Some(hw.readback_start_trigger.clone()));
    assert_eq!(trigger_of(readback), Some(hw.trigger_terminal.clone()));
    assert!(journal.contains(&PortCall::SetRegen { task: flip, enabled: true }));
}

#[test]
fn waveform_sits_inside_clip_and_ends_on_pad() {
    let (_port, ctrl) = controller_with(&small_config());
    ctrl.on().unwrap();
    let buffer = ctrl.waveform().unwrap();
    let spec = ctrl.waveform_spec();
    assert_eq!(buffer.len(), spec.duration_samples + spec.pad_samples);
    assert!(buffer.as_slice().iter().all(|v| (0.0..=spec.max_amplitude).contains(v)));
    assert_eq!(*buffer.as_slice().last().unwrap(), spec.max_amplitude);
}

#[test]
fn beam_loss_cycle() {
    let (port, ctrl) = controller_with(&small_config());
    let supervisor = BeamSupervisor::new(ctrl.clone(), &SupervisorConfig::default());
    ctrl.on().unwrap();
    let t0 = 1_000.0;
    port.fire_batch(t0);

    let zeros_before = zero_count(&port);
    assert_eq!(supervisor.poll_at(t0 + 6.0), SupervisorAction::Suspended);
    assert_eq!(supervisor.poll_at(t0 + 7.0), SupervisorAction::Idle);
    assert_eq!(zero_count(&port), zeros_before + 1);
    assert!(ctrl.status().interrupted_by_beam_loss);

    let flips_before =
        port.count(|call| matches!(call, PortCall::OpenTask { role: TaskRole::FlipOutput, .. }));
    port.fire_batch(t0 + 9.0);
    assert_eq!(supervisor.poll_at(t0 + 10.0), SupervisorAction::Resumed);
    assert_eq!(supervisor.poll_at(t0 + 10.5), SupervisorAction::Idle);
    let flips_after =
        port.count(|call| matches!(call, PortCall::OpenTask { role: TaskRole::FlipOutput, .. }));
    assert_eq!(flips_after, flips_before + 1);
    assert!(ctrl.is_running());
    assert!(!ctrl.is_interrupted());
}

#[test]
fn set_amplitude_round_trip_while_running() {
    let (port, ctrl) = controller_with(&small_config());
    ctrl.on().unwrap();
    ctrl.set_amplitude(2.5).unwrap();

    let last_flip_write = port
        .journal()
        .into_iter()
        .rev()
        .find_map(|call| match call {
            PortCall::WriteSamples { len, buffer, .. } if len > 100 => Some(buffer),
            _ => None,
        })
        .unwrap();
    assert_eq!(last_flip_write.max(), 2.5);
    assert_eq!(ctrl.waveform().unwrap(), last_flip_write);
}

#[test]
fn waveform_file_overrides_model() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pulse.txt");
    fs::write(&path, "# custom pulse\n0.0, 1.0, 7.5\n3.0\n").unwrap();

    let (_port, ctrl) = controller_with(&small_config());
    ctrl.on().unwrap();
    ctrl.set_waveform_file(Some(path)).unwrap();
    // File samples bypass clipping
    assert_eq!(ctrl.waveform().unwrap().to_vec(), vec![0.0, 1.0, 7.5, 3.0]);

    ctrl.set_waveform_file(None).unwrap();
    assert_eq!(ctrl.waveform().unwrap().len(), 2_001);
}

#[test]
fn failure_mid_start_leaks_nothing() {
    let (port, ctrl) = controller_with(&small_config());
    for op in [SimOp::ConfigureClock, SimOp::SetRegen, SimOp::Write, SimOp::Start] {
        port.fail_next(op, Some(TaskRole::FlipOutput));
        assert!(ctrl.on().is_err(), "{:?} failure not surfaced", op);
        assert!(!ctrl.is_running());
        assert_eq!(port.live_tasks(TaskRole::FlipOutput), 0);
        assert_eq!(port.live_tasks(TaskRole::CompOutput), 0);
    }
    ctrl.on().unwrap();
    assert!(ctrl.is_running());
}

#[test]
fn concurrent_on_off_keeps_one_flip_task() {
    let (port, ctrl) = controller_with(&small_config());
    let supervisor = BeamSupervisor::new(ctrl.clone(), &SupervisorConfig::default());

    let poll_domain = {
        let ctrl = ctrl.clone();
        thread::spawn(move || {
            for k in 0..25 {
                if k % 2 == 0 {
                    ctrl.on().unwrap();
                } else {
                    ctrl.off().unwrap();
                }
                supervisor.poll();
            }
        })
    };
    let remote_domain = {
        let ctrl = ctrl.clone();
        thread::spawn(move || {
            for k in 0..25 {
                if k % 3 == 0 {
                    ctrl.toggle().unwrap();
                } else if k % 3 == 1 {
                    ctrl.on().unwrap();
                } else {
                    ctrl.off().unwrap();
                }
            }
        })
    };
    poll_domain.join().unwrap();
    remote_domain.join().unwrap();

    assert_eq!(port.peak_live_tasks(TaskRole::FlipOutput), 1);
    assert_eq!(
        port.live_tasks(TaskRole::FlipOutput),
        if ctrl.is_running() { 1 } else { 0 }
    );
}

#[test]
fn trigger_source_drives_monitor() {
    let mut config = small_config();
    config.timing.window = 1;
    let (port, ctrl) = controller_with(&config);
    ctrl.start_readback().unwrap();

    let source = port.spawn_trigger_source(200.0).unwrap();
    thread::sleep(std::time::Duration::from_millis(100));
    source.stop();

    let monitor = ctrl.pulse_monitor();
    assert!(monitor.callback_count() >= 2);
    assert!(monitor.current_freq() > 0.0);
    assert!(ctrl.since_last_pulse(wall_clock_secs()) < 1.0);
}

#[test]
fn shutdown_always_zeroes() {
    let (port, ctrl) = controller_with(&small_config());
    ctrl.on().unwrap();
    ctrl.shutdown().unwrap();
    assert!(!ctrl.is_running());
    assert_eq!(port.live_tasks(TaskRole::FlipOutput), 0);
    assert_eq!(port.live_tasks(TaskRole::Readback), 0);
    assert_eq!(zero_count(&port), 1);

    ctrl.shutdown().unwrap();
    assert_eq!(zero_count(&port), 2);
}
