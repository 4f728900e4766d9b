//! In-process stand-ins for QEMU and adb.
//!
//! `FakeLauncher` reads the launch line the runner built and plays the
//! emulator's side of it: it answers QMP on the command FIFOs, connects to the
//! message socket as the guest agent, and holds the forwarded host ports open
//! until it "exits".

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;

use crate::bridge::BridgeTool;
use crate::error::Result;
use crate::qemu::supervisor::{ExitedProcess, KillSwitch};
use crate::qemu::{EmulatorHandle, Launcher, OutputCapture, Process, StdinMode};

/// How the fake emulator behaves.
#[derive(Clone, Default)]
pub struct Behavior {
    /// Connect to the message socket as the guest agent.
    pub connect_agent: bool,
    /// Bytes the agent sends after reading its command.
    pub frames: Vec<u8>,
    /// Exit right after sending `frames`, as a guest that powers off does.
    pub exit_after_frames: bool,
    /// Answer `quit` but keep running.
    pub ignore_quit: bool,
}

/// Observable state of one fake emulator.
#[derive(Default)]
pub struct FakeState {
    exit_code: Mutex<Option<i32>>,
    exited: Condvar,
    pub kills: AtomicUsize,
    pub quits: AtomicUsize,
    pub commands: Mutex<Vec<String>>,
    pub agent_command: Mutex<Option<String>>,
    pub args: Mutex<Vec<String>>,
    listeners: Mutex<Vec<TcpListener>>,
    agent: Mutex<Option<UnixStream>>,
    request_pipe: Mutex<Option<File>>,
    stopping: AtomicBool,
}

impl FakeState {
    fn exit(&self, code: i32) {
        {
            let mut exit_code = self.exit_code.lock().unwrap();
            if exit_code.is_some() {
                return;
            }
            *exit_code = Some(code);
        }
        self.stopping.store(true, Ordering::SeqCst);
        self.listeners.lock().unwrap().clear();
        if let Some(agent) = self.agent.lock().unwrap().take() {
            let _ = agent.shutdown(Shutdown::Both);
        }
        // Wake the QMP loop so it drops both FIFO ends.
        if let Some(mut pipe) = self.request_pipe.lock().unwrap().take() {
            let _ = pipe.write_all(b"{\"execute\": \"fake-exit\"}\n");
        }
        self.exited.notify_all();
    }

    pub fn has_exited(&self) -> bool {
        self.exit_code.lock().unwrap().is_some()
    }
}

struct FakeProcess {
    state: Arc<FakeState>,
}

impl Process for FakeProcess {
    fn id(&self) -> u32 {
        4242
    }

    fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(*self.state.exit_code.lock().unwrap())
    }

    fn wait(&mut self) -> std::io::Result<i32> {
        let mut code = self.state.exit_code.lock().unwrap();
        loop {
            if let Some(code) = *code {
                return Ok(code);
            }
            code = self.state.exited.wait(code).unwrap();
        }
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.state.kills.fetch_add(1, Ordering::SeqCst);
        self.state.exit(-libc::SIGKILL);
        Ok(())
    }

    fn kill_switch(&self) -> KillSwitch {
        let state = Arc::clone(&self.state);
        Arc::new(move || state.exit(-libc::SIGKILL))
    }
}

fn arg_value<'a>(args: &'a [String], prefix: &str) -> Option<&'a str> {
    args.iter().find_map(|a| a.strip_prefix(prefix))
}

fn forwarded_ports(args: &[String]) -> Vec<u16> {
    let Some(netdev) = arg_value(args, "user,id=adbnet0,") else {
        return Vec::new();
    };
    netdev
        .split(',')
        .filter_map(|fwd| fwd.strip_prefix("hostfwd=tcp::"))
        .filter_map(|fwd| fwd.split('-').next())
        .filter_map(|port| port.parse().ok())
        .collect()
}

fn serve_qmp(state: Arc<FakeState>, requests: File, mut responses: File, ignore_quit: bool) {
    let _ = writeln!(responses, r#"{{"QMP": {{"version": {{}}, "capabilities": []}}}}"#);
    for line in BufReader::new(requests).lines() {
        let Ok(line) = line else { break };
        if state.stopping.load(Ordering::SeqCst) {
            break;
        }
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let command = request["execute"].as_str().unwrap_or_default().to_string();
        state.commands.lock().unwrap().push(command.clone());
        let _ = writeln!(responses, r#"{{"return": {{}}}}"#);
        if command == "quit" {
            state.quits.fetch_add(1, Ordering::SeqCst);
            if !ignore_quit {
                state.exit(0);
                break;
            }
        }
    }
}

fn run_agent(state: Arc<FakeState>, socket: PathBuf, behavior: Behavior) {
    let mut stream = None;
    for _ in 0..100 {
        if let Ok(s) = UnixStream::connect(&socket) {
            stream = Some(s);
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let Some(mut stream) = stream else { return };
    if let Ok(clone) = stream.try_clone() {
        *state.agent.lock().unwrap() = Some(clone);
    }

    let mut buf = [0u8; 256];
    if let Ok(n) = stream.read(&mut buf) {
        *state.agent_command.lock().unwrap() = Some(String::from_utf8_lossy(&buf[..n]).into_owned());
    }
    let _ = stream.write_all(&behavior.frames);
    if behavior.exit_after_frames {
        drop(stream);
        state.exit(0);
    }
}

/// Launches [`FakeProcess`]es and remembers their state.
#[derive(Default)]
pub struct FakeLauncher {
    pub behavior: Behavior,
    pub launches: Mutex<Vec<Arc<FakeState>>>,
}

impl FakeLauncher {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    /// State of the most recent launch.
    pub fn last(&self) -> Arc<FakeState> {
        Arc::clone(self.launches.lock().unwrap().last().expect("nothing launched"))
    }
}

impl Launcher for FakeLauncher {
    fn launch(
        &self,
        _program: &Path,
        args: &[String],
        _working_dir: &Path,
        _stdin: StdinMode,
        _output: &OutputCapture,
    ) -> Result<EmulatorHandle> {
        let state = Arc::new(FakeState::default());
        *state.args.lock().unwrap() = args.to_vec();

        for port in forwarded_ports(args) {
            if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)) {
                state.listeners.lock().unwrap().push(listener);
            }
        }

        // QEMU opens both FIFOs read-write, so neither open blocks.
        if let Some(base) = arg_value(args, "pipe,id=command0,path=") {
            let open = |suffix: &str| {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(format!("{}.{}", base, suffix))
            };
            let requests = open("in")?;
            let responses = open("out")?;
            *state.request_pipe.lock().unwrap() = Some(requests.try_clone()?);
            let s = Arc::clone(&state);
            let ignore_quit = self.behavior.ignore_quit;
            thread::spawn(move || serve_qmp(s, requests, responses, ignore_quit));
        }

        if self.behavior.connect_agent {
            if let Some(socket) = arg_value(args, "socket,id=testrunner0,path=") {
                let s = Arc::clone(&state);
                let socket = PathBuf::from(socket);
                let behavior = self.behavior.clone();
                thread::spawn(move || run_agent(s, socket, behavior));
            }
        }

        self.launches.lock().unwrap().push(Arc::clone(&state));
        Ok(EmulatorHandle::new(Box::new(FakeProcess { state })))
    }
}

/// Scripted adb that tracks connect/disconnect for `devices -l`.
/// `shell hang` never exits on its own.
#[derive(Default)]
pub struct FakeBridge {
    pub(crate) connected: Mutex<Option<String>>,
    pub calls: Mutex<Vec<String>>,
    /// Leave the device out of `devices -l` even while connected.
    pub unlisted: bool,
}

impl FakeBridge {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl BridgeTool for FakeBridge {
    fn spawn(&self, args: &[String], _force_output: bool) -> Result<Box<dyn Process>> {
        self.calls.lock().unwrap().push(args.join(" "));
        let sub: Vec<&str> = match args.first().map(String::as_str) {
            Some("-t") => args[2..].iter().map(String::as_str).collect(),
            _ => args.iter().map(String::as_str).collect(),
        };
        let code = match sub.as_slice() {
            ["connect", target] => {
                *self.connected.lock().unwrap() = Some(target.to_string());
                0
            }
            ["disconnect", ..] => {
                *self.connected.lock().unwrap() = None;
                0
            }
            ["shell", "false"] => 1,
            ["shell", "hang"] => return Ok(Box::new(Command::new("sleep").arg("30").spawn()?)),
            _ => 0,
        };
        Ok(Box::new(ExitedProcess(code)))
    }

    fn capture(&self, args: &[String]) -> Result<String> {
        self.calls.lock().unwrap().push(args.join(" "));
        Ok(match self.connected.lock().unwrap().as_ref() {
            Some(target) if !self.unlisted => format!(
                "List of devices attached\n{} device product:trusty transport_id:3\n",
                target
            ),
            _ => "List of devices attached\n".into(),
        })
    }
}
