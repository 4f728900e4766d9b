//! The running emulator together with its control channel.
//!
//! Both the main run flow and timeout callbacks need to stop the emulator,
//! so the session is shared behind an `Arc`. Locks are always taken in the
//! same order (emulator, then control) and shutdown is idempotent: whoever
//! gets there first does the work, later callers find the process exited.

use std::io::{self, BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::qmp::{ControlChannel, Response};
use super::supervisor::{EmulatorHandle, KillSwitch};
use crate::diagnostics::DiagnosticSink;
use crate::error::{Error, Result};
use crate::timeout::TimeoutCoordinator;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

const EXIT_POLL: Duration = Duration::from_millis(20);

pub struct EmulatorSession {
    emulator: Mutex<Option<EmulatorHandle>>,
    control: Mutex<Option<ControlChannel>>,
    sink: DiagnosticSink,
    debug_on_error: bool,
    quit_grace: Duration,
    reply_timeout: Duration,
    /// Kills QEMU if it stops answering monitor commands during shutdown.
    watchdog: TimeoutCoordinator,
    operator: Mutex<Box<dyn BufRead + Send>>,
    unclean: AtomicBool,
    /// Registers were already dumped; a second dump would only repeat them.
    diagnosed: AtomicBool,
}

impl EmulatorSession {
    pub fn new(sink: DiagnosticSink, quit_grace: Duration, reply_timeout: Duration) -> Self {
        Self {
            emulator: Mutex::new(None),
            control: Mutex::new(None),
            sink,
            debug_on_error: false,
            quit_grace,
            reply_timeout,
            watchdog: TimeoutCoordinator::threaded(),
            operator: Mutex::new(Box::new(BufReader::new(io::stdin()))),
            unclean: AtomicBool::new(false),
            diagnosed: AtomicBool::new(false),
        }
    }

    /// On error, start a gdb server and wait for the operator before quitting.
    pub fn debug_on_error(mut self, enabled: bool) -> Self {
        self.debug_on_error = enabled;
        self
    }

    /// Where the operator's "done debugging" Enter is read from.
    pub fn operator_input(self, input: Box<dyn BufRead + Send>) -> Self {
        *lock(&self.operator) = input;
        self
    }

    pub fn attach(&self, handle: EmulatorHandle) {
        *lock(&self.emulator) = Some(handle);
    }

    pub fn attach_control(&self, channel: ControlChannel) {
        *lock(&self.control) = Some(channel);
    }

    pub fn has_control(&self) -> bool {
        lock(&self.control).is_some()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.emulator)
            .as_mut()
            .is_some_and(|handle| handle.is_running())
    }

    /// Kill switch for the current emulator, valid until shutdown reaps it.
    pub fn kill_switch(&self) -> Option<KillSwitch> {
        lock(&self.emulator).as_ref().map(|h| h.kill_switch())
    }

    /// True once shutdown had to force-kill the emulator.
    pub fn was_unclean(&self) -> bool {
        self.unclean.load(Ordering::Acquire)
    }

    /// Issue a command on the control channel; no channel means no response.
    pub fn execute(&self, command: &str) -> Response {
        match lock(&self.control).as_mut() {
            Some(channel) => channel.execute(command, None),
            None => Response::NoResponse,
        }
    }

    /// Dump registers, and optionally hand the guest to a debugger.
    /// Only the first capture in a session does anything.
    pub fn capture_diagnostics(&self) {
        let emulator = lock(&self.emulator);
        let mut control = lock(&self.control);
        if let (Some(handle), Some(channel)) = (emulator.as_ref(), control.as_mut()) {
            self.diagnose(handle, channel);
        }
    }

    fn diagnose(&self, handle: &EmulatorHandle, channel: &mut ControlChannel) {
        if self.diagnosed.swap(true, Ordering::AcqRel) {
            debug!("diagnostics already captured");
            return;
        }
        self.sink.write_str("QEMU register dump:\n");
        self.bounded(handle, || channel.run_diagnostic_command("info registers -a"));
        self.sink.write_str("\n");

        if self.debug_on_error {
            self.bounded(handle, || channel.run_diagnostic_command("gdbserver"));
            println!("Connect gdb, press enter when done ");
            let mut line = String::new();
            if let Err(e) = lock(&self.operator).read_line(&mut line) {
                warn!(error = %e, "could not read from operator");
            }
        }
    }

    /// Run a monitor exchange, killing QEMU if it does not answer in time.
    fn bounded<T>(&self, handle: &EmulatorHandle, exchange: impl FnOnce() -> T) -> T {
        let kill = handle.kill_switch();
        let watchdog = self.watchdog.arm(self.reply_timeout, move || {
            warn!("QEMU stopped answering the monitor");
            kill();
        });
        let result = exchange();
        watchdog.cancel();
        result
    }

    fn exited_within(handle: &mut EmulatorHandle, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while handle.is_running() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(EXIT_POLL);
        }
        true
    }

    /// Make sure the emulator is gone and release the control channel.
    ///
    /// With a control channel QEMU is asked to `quit` (after a diagnostic dump
    /// if `has_error`), given the grace period, then killed. Without one QEMU
    /// should already have exited; if it has not it is killed. Either kill
    /// marks the session unclean.
    pub fn shutdown(&self, has_error: bool) -> Result<()> {
        let mut emulator = lock(&self.emulator);
        let mut control = lock(&self.control);

        if let Some(handle) = emulator.as_mut() {
            match control.as_mut() {
                Some(channel) if handle.is_running() => {
                    if has_error {
                        self.diagnose(handle, channel);
                    }
                    let reply = self.bounded(handle, || channel.execute("quit", None));
                    debug!(?reply, "quit sent");
                    if !Self::exited_within(handle, self.quit_grace) {
                        println!("QEMU refused quit");
                        self.force_kill(handle)?;
                    }
                }
                Some(_) => {}
                None if handle.is_running() => {
                    println!("QEMU still running with no command channel");
                    self.force_kill(handle)?;
                }
                None => {}
            }
            let code = handle.wait()?;
            info!(code, "emulator stopped");
        }

        match control.as_mut() {
            Some(channel) => channel.close(),
            None => Ok(()),
        }
    }

    fn force_kill(&self, handle: &mut EmulatorHandle) -> Result<()> {
        if handle.force_kill()? {
            self.unclean.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Block until the operator quits an interactive emulator.
    pub fn wait_for_exit(&self) -> Result<Option<i32>> {
        match lock(&self.emulator).as_mut() {
            Some(handle) => Ok(Some(handle.wait()?)),
            None => Ok(None),
        }
    }

    /// UncleanExit if shutdown had to kill the emulator.
    pub fn exit_status(&self) -> Result<()> {
        if self.was_unclean() {
            return Err(Error::UncleanExit);
        }
        Ok(())
    }
}
