use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::fakes::{Behavior, FakeBridge, FakeLauncher};
use super::*;
use crate::config::Timing;
use crate::diagnostics::SharedBuffer;
use crate::qemu::message::{FRAME_LOG, FRAME_RESULT};
use crate::qemu::Response;

fn fast_timing() -> Timing {
    Timing {
        adbd_connect_tries: 100,
        root_tries: 3,
        forward_release_tries: 100,
        bridge_backoff: Duration::from_millis(10),
        control_open_tries: 100,
        control_open_backoff: Duration::from_millis(10),
        quit_grace: Duration::from_millis(100),
        bridge_command_timeout: Duration::from_secs(10),
        wait_for_device_timeout: Duration::from_secs(10),
        ..Timing::default()
    }
}

/// A port with (probably) a free neighbour above it.
fn free_base_port() -> u16 {
    loop {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        if port < u16::MAX - 64 {
            return port;
        }
    }
}

fn config(android: bool) -> Config {
    Config {
        android: android.then(|| PathBuf::from("/nonexistent/android")),
        linux: android.then(|| PathBuf::from("/nonexistent/linux")),
        atf: std::env::temp_dir(),
        qemu: PathBuf::from("qemu-system-fake"),
        // No device tree on x86_64, so nothing external is invoked.
        arch: Some("x86_64".into()),
        ..Config::default()
    }
}

fn options() -> RunOptions {
    RunOptions {
        rpmb: false,
        test_timeout: Duration::from_secs(20),
        handshake_timeout: Duration::from_secs(20),
        adb_base_port: free_base_port(),
        timing: fast_timing(),
        ..RunOptions::default()
    }
}

struct Harness {
    runner: Runner,
    launcher: Arc<FakeLauncher>,
    bridge: Arc<FakeBridge>,
    diagnostics: SharedBuffer,
    guest_log: SharedBuffer,
}

fn harness(config: Config, options: RunOptions, behavior: Behavior) -> Harness {
    harness_with_bridge(config, options, behavior, FakeBridge::default())
}

fn harness_with_bridge(
    config: Config,
    options: RunOptions,
    behavior: Behavior,
    bridge: FakeBridge,
) -> Harness {
    let launcher = Arc::new(FakeLauncher::new(behavior));
    let bridge = Arc::new(bridge);
    let (sink, diagnostics) = DiagnosticSink::buffer();
    let guest_log = SharedBuffer::default();
    let runner = Runner::new(config, options)
        .unwrap()
        .launcher(launcher.clone())
        .bridge_tool(bridge.clone())
        .diagnostics(sink)
        .guest_log(Box::new(guest_log.clone()));
    Harness {
        runner,
        launcher,
        bridge,
        diagnostics,
        guest_log,
    }
}

fn shell_options(tests: &[&str]) -> RunOptions {
    RunOptions {
        shell_tests: tests.iter().map(|t| t.to_string()).collect(),
        ..options()
    }
}

fn agent() -> Behavior {
    Behavior {
        connect_agent: true,
        ..Behavior::default()
    }
}

fn shell_run(tests: &[&str]) -> Harness {
    harness(config(true), shell_options(tests), agent())
}

fn boot_run(frames: Vec<u8>, exit_after_frames: bool) -> Harness {
    let options = RunOptions {
        boot_tests: vec!["com.android.trusty.hwcrypto".into()],
        ..options()
    };
    let behavior = Behavior {
        connect_agent: true,
        frames,
        exit_after_frames,
        ..Behavior::default()
    };
    harness(config(false), options, behavior)
}

#[test]
fn test_passing_shell_test() {
    let mut h = shell_run(&["true"]);
    let outcome = h.runner.run();

    assert_eq!(outcome.as_ref().unwrap(), &vec![0]);
    assert_eq!(overall_exit_code(&outcome), 0);
    assert_eq!(h.runner.state(), RunState::Done);

    let emulator = h.launcher.last();
    assert!(emulator.has_exited());
    assert_eq!(emulator.quits.load(Ordering::SeqCst), 1);
    assert_eq!(emulator.kills.load(Ordering::SeqCst), 0);
    assert_eq!(
        emulator.agent_command.lock().unwrap().as_deref(),
        Some("Boot Secondary OS")
    );

    let calls = h.bridge.calls();
    assert!(calls.iter().any(|c| c == "-t 3 shell true"));
    assert!(calls.iter().any(|c| c.starts_with("-t 3 disconnect localhost:")));
}

#[test]
fn test_failing_shell_test_stops_iteration() {
    let mut h = shell_run(&["false", "true"]);
    let outcome = h.runner.run();

    assert_eq!(outcome.as_ref().unwrap(), &vec![1]);
    assert_eq!(overall_exit_code(&outcome), 1);
    let calls = h.bridge.calls();
    assert!(calls.iter().any(|c| c == "-t 3 shell false"));
    assert!(!calls.iter().any(|c| c == "-t 3 shell true"));

    // A failed test triggers the register dump before quit.
    let emulator = h.launcher.last();
    let commands = emulator.commands.lock().unwrap().clone();
    let dump = commands.iter().position(|c| c == "human-monitor-command");
    let quit = commands.iter().position(|c| c == "quit");
    assert!(dump.unwrap() < quit.unwrap());
    assert!(h.diagnostics.contents().contains("QEMU register dump:"));
}

#[test]
fn test_unlisted_device_is_still_disconnected() {
    let bridge = FakeBridge {
        unlisted: true,
        ..FakeBridge::default()
    };
    let mut h = harness_with_bridge(config(true), shell_options(&["true"]), agent(), bridge);
    let outcome = h.runner.run();
    assert_eq!(outcome.as_ref().unwrap(), &vec![0]);

    let calls = h.bridge.calls();
    assert!(calls.iter().any(|c| c == "shell true"));
    let connect = calls.iter().position(|c| c.starts_with("connect localhost:")).unwrap();
    let disconnect = calls
        .iter()
        .position(|c| c.starts_with("disconnect localhost:"))
        .unwrap();
    assert!(connect < disconnect);
}

#[test]
fn test_shell_timeout_dumps_registers_once() {
    let options = RunOptions {
        test_timeout: Duration::from_millis(300),
        ..shell_options(&["hang", "true"])
    };
    let mut h = harness(config(true), options, agent());
    let outcome = h.runner.run();

    match &outcome {
        Err(Error::Timeout { step, .. }) => assert_eq!(step, "adb shell hang"),
        other => panic!("expected shell timeout, got {:?}", other),
    }
    assert!(!h.bridge.calls().iter().any(|c| c == "-t 3 shell true"));

    let emulator = h.launcher.last();
    let commands = emulator.commands.lock().unwrap().clone();
    let dumps = commands.iter().filter(|c| *c == "human-monitor-command").count();
    assert_eq!(dumps, 1);
    assert_eq!(commands.last().map(String::as_str), Some("quit"));
    assert_eq!(h.diagnostics.contents().matches("QEMU register dump:").count(), 1);
}

#[test]
fn test_launch_line_routes_serial_and_forwards_ports() {
    let mut h = shell_run(&[]);
    h.runner.run().unwrap();

    let emulator = h.launcher.last();
    let args = emulator.args.lock().unwrap().clone();
    assert_eq!(args[..4], ["-serial", "mon:stdio", "-machine", "q35"]);
    assert!(args.iter().any(|a| a.starts_with("pipe,id=command0,path=")));
    let netdev = args.iter().find(|a| a.starts_with("user,id=adbnet0,")).unwrap();
    assert!(netdev.contains("-:5554,hostfwd=tcp::"));
    assert!(netdev.ends_with("-:5555"));
}

#[test]
fn test_handshake_timeout_kills_emulator_once() {
    let options = RunOptions {
        shell_tests: vec!["true".into()],
        handshake_timeout: Duration::from_millis(200),
        ..options()
    };
    let behavior = Behavior {
        connect_agent: false,
        ignore_quit: true,
        ..Behavior::default()
    };
    let mut h = harness(config(true), options, behavior);
    let outcome = h.runner.run();

    match &outcome {
        Err(Error::Timeout { step, bound }) => {
            assert_eq!(step, "Wait for handshake");
            assert_eq!(*bound, Duration::from_millis(200));
        }
        other => panic!("expected handshake timeout, got {:?}", other),
    }
    assert_eq!(overall_exit_code(&outcome), 2);

    let emulator = h.launcher.last();
    assert!(emulator.has_exited());
    assert_eq!(emulator.kills.load(Ordering::SeqCst), 1);
    assert!(emulator.quits.load(Ordering::SeqCst) >= 1);
    assert!(h.diagnostics.contents().contains("System log:"));
}

#[test]
fn test_control_channel_after_exit_is_soft() {
    let launcher = FakeLauncher::new(Behavior::default());
    let pipes = ControlPipes::create().unwrap();
    let mut handle = launcher
        .launch(
            &PathBuf::from("qemu-system-fake"),
            &pipes.qemu_args(),
            &std::env::temp_dir(),
            StdinMode::Null,
            &OutputCapture::Inherit,
        )
        .unwrap();
    let (sink, _) = DiagnosticSink::buffer();
    let mut channel = ControlChannel::new(pipes, sink);
    channel.open(100, Duration::from_millis(10)).unwrap();

    assert!(handle.force_kill().unwrap());
    assert_eq!(channel.execute("query-status", None), Response::NoResponse);
    assert_eq!(channel.execute("quit", None), Response::NoResponse);
    channel.close().unwrap();
}

#[test]
fn test_boot_test_reports_result_frame() {
    let mut frames = vec![FRAME_LOG, 6];
    frames.extend_from_slice(b"hello\n");
    frames.extend_from_slice(&[FRAME_LOG, 3]);
    frames.extend_from_slice(b"ok!");
    frames.extend_from_slice(&[FRAME_RESULT, 1, 0]);
    let mut h = boot_run(frames, true);

    let outcome = h.runner.run();
    assert_eq!(outcome.as_ref().unwrap(), &vec![0]);
    assert_eq!(overall_exit_code(&outcome), 0);
    assert_eq!(h.guest_log.contents(), "hello\nok!");

    let emulator = h.launcher.last();
    assert_eq!(
        emulator.agent_command.lock().unwrap().as_deref(),
        Some("boottest com.android.trusty.hwcrypto")
    );
    let args = emulator.args.lock().unwrap().clone();
    assert_eq!(args[..4], ["-serial", "null", "-monitor", "none"]);
    assert!(!args.iter().any(|a| a.starts_with("user,id=adbnet0")));
    assert_eq!(emulator.kills.load(Ordering::SeqCst), 0);
}

#[test]
fn test_boot_test_failure_code_is_a_result() {
    let mut h = boot_run(vec![FRAME_RESULT, 1, 3], true);
    let outcome = h.runner.run();
    assert_eq!(outcome.as_ref().unwrap(), &vec![3]);
    assert_eq!(overall_exit_code(&outcome), 1);
}

#[test]
fn test_guest_disconnect_is_generic_failure() {
    let mut frames = vec![FRAME_LOG, 4];
    frames.extend_from_slice(b"boot");
    let mut h = boot_run(frames, true);

    let outcome = h.runner.run();
    assert_eq!(outcome.as_ref().unwrap(), &vec![2]);
    assert_eq!(overall_exit_code(&outcome), 1);
    assert!(h.diagnostics.contents().contains("System log:"));
}

#[test]
fn test_unknown_frame_type_is_protocol_violation() {
    let mut h = boot_run(vec![2, 1, b'x'], false);
    let outcome = h.runner.run();

    assert!(matches!(outcome, Err(Error::ProtocolViolation(_))));
    assert_eq!(overall_exit_code(&outcome), 2);
    let emulator = h.launcher.last();
    assert!(emulator.has_exited());
    assert_eq!(emulator.kills.load(Ordering::SeqCst), 0);
}

#[test]
fn test_boot_test_timeout() {
    let options = RunOptions {
        boot_tests: vec!["port".into()],
        test_timeout: Duration::from_millis(200),
        ..options()
    };
    let behavior = Behavior {
        connect_agent: true,
        ..Behavior::default()
    };
    let mut h = harness(config(false), options, behavior);
    let outcome = h.runner.run();

    match outcome {
        Err(Error::Timeout { step, .. }) => assert_eq!(step, "Wait for boottest to complete"),
        other => panic!("expected boot test timeout, got {:?}", other),
    }
    assert!(h.launcher.last().has_exited());
}

#[test]
fn test_exclusive_test_kinds_rejected_before_allocation() {
    let options = RunOptions {
        boot_tests: vec!["port".into()],
        shell_tests: vec!["true".into()],
        ..options()
    };
    let mut h = harness(config(true), options, Behavior::default());
    let outcome = h.runner.run();

    assert!(matches!(outcome, Err(Error::Config(_))));
    assert_eq!(overall_exit_code(&outcome), 2);
    assert_eq!(h.runner.state(), RunState::Idle);
    assert_eq!(h.launcher.launch_count(), 0);
}

#[test]
fn test_shell_tests_without_kernel_rejected() {
    let options = RunOptions {
        shell_tests: vec!["true".into()],
        ..options()
    };
    let config = Config {
        linux: None,
        android: None,
        ..config(false)
    };
    let mut h = harness(config, options, Behavior::default());
    assert!(matches!(h.runner.run(), Err(Error::Config(_))));
    assert_eq!(h.launcher.launch_count(), 0);
}

#[test]
fn test_unknown_arch_rejected_at_construction() {
    let config = Config {
        arch: Some("sparc".into()),
        ..config(false)
    };
    assert!(matches!(
        Runner::new(config, options()),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_unset_arch_rejected_at_construction() {
    let config = Config {
        arch: None,
        ..config(false)
    };
    assert!(matches!(
        Runner::new(config, options()),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_runner_runs_once() {
    let mut h = shell_run(&[]);
    h.runner.run().unwrap();
    assert!(h.runner.run().is_err());
    assert_eq!(h.launcher.launch_count(), 1);
}
