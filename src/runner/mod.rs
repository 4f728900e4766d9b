//! Run coordination: startup, test execution, teardown.
//!
//! ```text
//! Idle -> LaunchingAux -> LaunchingEmulator -> AwaitingHandshake
//!      -> Executing(BootTest | ShellTests) -> TearingDown -> Done
//! ```
//!
//! Configuration errors leave the runner in `Idle` with nothing allocated.
//! From any later state the run goes through the same teardown exactly once.

mod context;

#[cfg(test)]
mod fakes;
#[cfg(test)]
mod tests;

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use colored::Colorize;
use tracing::{debug, info, warn};

use crate::arch::{Arch, ArchOptions};
use crate::bridge::{AdbClient, BridgeTool, DeviceBridge, OnTimeout};
use crate::config::{check_compatibility, Config, RunOptions};
use crate::diagnostics::DiagnosticSink;
use crate::error::{Error, Result};
use crate::ports::{PortBroker, ADB_PORT_WIDTH};
use crate::qemu::message::{DISCONNECTED_RESULT, VIOLATION_RESULT};
use crate::qemu::{
    BootOutcome, ControlChannel, ControlPipes, EmulatorSession, LaunchBuilder, Launcher,
    MessageAbort, MessageChannel, OutputCapture, ProcessSupervisor, RpmbDaemon, StdinMode,
};
use crate::timeout::TimeoutCoordinator;

use context::RunContext;

/// Command that tells the guest agent to boot the secondary OS instead of running a boot test.
const BOOT_SECONDARY: &str = "Boot Secondary OS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    /// Reported by the guest agent over the message channel.
    BootTest,
    /// Run through adb once the secondary OS is up.
    ShellTests,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    LaunchingAux,
    LaunchingEmulator,
    AwaitingHandshake,
    Executing(TestMode),
    TearingDown,
    Done,
}

/// Process exit code for a finished run: 0 all passed, 1 a test failed, 2 the runner failed.
pub fn overall_exit_code(outcome: &Result<Vec<i32>>) -> i32 {
    match outcome {
        Ok(results) if results.iter().all(|&code| code == 0) => 0,
        Ok(_) => 1,
        Err(e) => e.exit_code(),
    }
}

/// Timer callback: unblock the message channel, then stop the emulator.
fn abort_run(abort: MessageAbort, session: Arc<EmulatorSession>) -> impl FnOnce() + Send + 'static {
    move || {
        abort.abort();
        if let Err(e) = session.shutdown(true) {
            warn!(error = %e, "shutdown after timeout failed");
        }
    }
}

pub struct Runner {
    config: Config,
    options: RunOptions,
    arch: Box<dyn ArchOptions>,
    launcher: Arc<dyn Launcher>,
    bridge_tool: Option<Arc<dyn BridgeTool>>,
    timeouts: Arc<TimeoutCoordinator>,
    sink: DiagnosticSink,
    guest_log: Box<dyn Write + Send>,
    operator_input: Option<Box<dyn BufRead + Send>>,
    state: RunState,
}

impl Runner {
    /// Fails with a configuration error if the config names an unknown architecture.
    pub fn new(config: Config, options: RunOptions) -> Result<Self> {
        let arch = Arch::from_config(&config)?;
        // A debugging session may sit at a breakpoint indefinitely.
        let timeouts = if options.debug {
            TimeoutCoordinator::disabled()
        } else {
            TimeoutCoordinator::threaded()
        };
        Ok(Self {
            arch: arch.options(&config),
            config,
            options,
            launcher: Arc::new(ProcessSupervisor),
            bridge_tool: None,
            timeouts: Arc::new(timeouts),
            sink: DiagnosticSink::stderr(),
            guest_log: Box::new(io::stdout()),
            operator_input: None,
            state: RunState::Idle,
        })
    }

    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Bridge client to use instead of the Android tree's `adb`.
    pub fn bridge_tool(mut self, tool: Arc<dyn BridgeTool>) -> Self {
        self.bridge_tool = Some(tool);
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutCoordinator) -> Self {
        self.timeouts = Arc::new(timeouts);
        self
    }

    pub fn diagnostics(mut self, sink: DiagnosticSink) -> Self {
        self.sink = sink;
        self
    }

    /// Where guest log frames are echoed.
    pub fn guest_log(mut self, log: Box<dyn Write + Send>) -> Self {
        self.guest_log = log;
        self
    }

    /// Where debug-on-error reads the operator's Enter from.
    pub fn operator_input(mut self, input: Box<dyn BufRead + Send>) -> Self {
        self.operator_input = Some(input);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn mode(&self) -> TestMode {
        if self.options.boot_tests.is_empty() {
            TestMode::ShellTests
        } else {
            TestMode::BootTest
        }
    }

    /// Launch the emulator, run the requested tests, tear down.
    ///
    /// Returns one exit code per executed test. Test failures are results;
    /// only runner failures are errors. Teardown always runs once startup has
    /// begun, and a startup or test error takes precedence over teardown errors.
    pub fn run(&mut self) -> Result<Vec<i32>> {
        if self.state != RunState::Idle {
            return Err(Error::Generic("a runner can only run once".into()));
        }
        check_compatibility(&self.config, &self.options)?;

        let output = if self.options.verbose || self.options.interactive {
            OutputCapture::Inherit
        } else {
            OutputCapture::capture()?
        };
        let timing = &self.options.timing;
        let mut session = EmulatorSession::new(
            self.sink.clone(),
            timing.quit_grace,
            timing.control_reply_timeout,
        )
        .debug_on_error(self.options.debug_on_error);
        if let Some(input) = self.operator_input.take() {
            session = session.operator_input(input);
        }
        let mut ctx = RunContext::new(Arc::new(session), output);

        let outcome = self.execute(&mut ctx);
        if let Err(e) = &outcome {
            warn!(error = %e, state = ?self.state, "run failed");
            ctx.has_error = true;
        }

        self.state = RunState::TearingDown;
        let teardown = ctx.teardown(&self.timeouts, &self.sink);
        self.state = RunState::Done;

        match (outcome, teardown) {
            (Err(e), Err(later)) => {
                warn!(error = %later, "teardown also failed");
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(std::mem::take(&mut ctx.results)),
        }
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        self.state = RunState::LaunchingAux;
        let mode = self.mode();
        let timing = self.options.timing.clone();

        let mut builder = LaunchBuilder::new()
            .basic(self.arch.basic_options())
            .bios(self.arch.bios_options());
        if self.config.linux.is_some() {
            builder = builder.linux(self.arch.linux_options()?);
        }
        if self.config.android.is_some() {
            builder = builder.drives(self.arch.android_drives_args()?);
        }
        builder = builder.extra(&self.config.extra_qemu_flags);

        if self.options.rpmb {
            let rpmbd = self
                .config
                .rpmbd
                .as_deref()
                .ok_or_else(|| Error::Config("no rpmbd configured".into()))?;
            let daemon = RpmbDaemon::start(
                rpmbd,
                &self.arch.rpmb_data_path(),
                timing.rpmb_tries,
                timing.rpmb_backoff,
            )?;
            builder = builder.rpmb(self.arch.rpmb_options(daemon.socket_path()));
            ctx.rpmb = Some(daemon);
        }

        if self.config.linux.is_some() {
            let dtb = ctx.temp_file()?;
            let dtb_args = self.arch.gen_dtb(&builder.hardware_args(), &dtb)?;
            builder = builder.dtb(dtb_args);
        }

        builder = builder
            .machine(self.arch.machine_options())
            .debug(self.options.debug);

        let message = MessageChannel::listen()?;
        builder = builder.message_channel(message.qemu_args());
        let abort = message.abort_handle();
        ctx.message = Some(message);

        // Non-interactive runs need QMP to tell QEMU to quit.
        let pipes = match mode {
            TestMode::BootTest => Some(ControlPipes::create()?),
            TestMode::ShellTests if !self.options.interactive => Some(ControlPipes::create()?),
            TestMode::ShellTests => None,
        };
        if let Some(pipes) = &pipes {
            builder = builder.control_channel(pipes.qemu_args());
        }
        builder = builder.serial(self.serial_args(mode));

        if mode == TestMode::ShellTests {
            let lease = PortBroker::new(self.options.adb_base_port).allocate(ADB_PORT_WIDTH)?;
            println!("DEVICE_SERIAL: emulator-{}", lease.console());
            builder = builder.forwarding(lease.forwarding_args());
            ctx.lease = Some(lease);
        }

        let spec = builder.build(&self.config.qemu);
        debug!(command = %spec, "launch line");

        self.state = RunState::LaunchingEmulator;
        let stdin = if self.options.interactive {
            StdinMode::Inherit
        } else {
            StdinMode::Null
        };
        let handle = self.launcher.launch(
            spec.program(),
            spec.args(),
            &self.config.atf,
            stdin,
            &ctx.output,
        )?;
        info!(pid = handle.id(), ?mode, "emulator launched");
        ctx.session.attach(handle);

        if let Some(pipes) = pipes {
            let mut channel = ControlChannel::new(pipes, self.sink.clone());
            let kill = ctx.session.kill_switch();
            self.timeouts.guard(
                "Wait for control channel",
                self.options.handshake_timeout,
                move || {
                    if let Some(kill) = kill {
                        kill();
                    }
                },
                || channel.open(timing.control_open_tries, timing.control_open_backoff),
            )?;
            ctx.session.attach_control(channel);
        }

        self.state = RunState::AwaitingHandshake;
        let message = ctx.message.as_mut().ok_or_else(|| Error::ChannelInit {
            channel: "message",
            detail: "listener missing".into(),
        })?;
        self.timeouts.guard(
            "Wait for handshake",
            self.options.handshake_timeout,
            abort_run(abort.clone(), Arc::clone(&ctx.session)),
            || message.accept_once(),
        )?;

        if self.options.debug {
            println!("{}", "Run gdb and \"target remote :1234\" to debug".yellow());
        }

        self.state = RunState::Executing(mode);
        match mode {
            TestMode::BootTest => self.run_boot_test(ctx, abort),
            TestMode::ShellTests => {
                let result = self.run_shell_tests(ctx);
                if self.options.interactive {
                    // The operator quits QEMU; keep the console until then.
                    if let Err(e) = ctx.session.wait_for_exit() {
                        warn!(error = %e, "waiting for interactive emulator failed");
                    }
                }
                result
            }
        }
    }

    fn serial_args(&self, mode: TestMode) -> Vec<String> {
        let tokens: &[&str] = match mode {
            // First serial port, so it cannot collide with rpmb0.
            TestMode::ShellTests => &["-serial", "mon:stdio"],
            TestMode::BootTest if self.options.verbose => &["-serial", "stdio", "-monitor", "none"],
            TestMode::BootTest => &["-serial", "null", "-monitor", "none"],
        };
        tokens.iter().map(|s| s.to_string()).collect()
    }

    fn run_boot_test(&mut self, ctx: &mut RunContext, abort: MessageAbort) -> Result<()> {
        if self.options.debug {
            println!(
                "{}",
                "Boot test selection is not read under the debugger".yellow()
            );
        }
        let command = format!("boottest {}", self.options.boot_tests.join(""));
        let message = ctx.message.as_mut().ok_or_else(|| Error::ChannelInit {
            channel: "message",
            detail: "channel closed before the boot test".into(),
        })?;
        message.send(&command)?;
        debug!(%command, "boot test requested");

        let log = &mut self.guest_log;
        let outcome = self.timeouts.guard(
            "Wait for boottest to complete",
            self.options.test_timeout,
            abort_run(abort, Arc::clone(&ctx.session)),
            || message.run_until_result(&mut **log),
        );

        match outcome {
            Ok(BootOutcome::Completed(code)) => {
                info!(code, "boot test finished");
                ctx.results.push(code.into());
                Ok(())
            }
            Ok(BootOutcome::Disconnected) => {
                warn!("guest disconnected without reporting a result");
                ctx.has_error = true;
                ctx.results.push(DISCONNECTED_RESULT.into());
                Ok(())
            }
            Err(e @ Error::ProtocolViolation(_)) => {
                ctx.has_error = true;
                ctx.results.push(VIOLATION_RESULT.into());
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn run_shell_tests(&mut self, ctx: &mut RunContext) -> Result<()> {
        let message = ctx.message.as_mut().ok_or_else(|| Error::ChannelInit {
            channel: "message",
            detail: "channel closed before boot".into(),
        })?;
        message.send(BOOT_SECONDARY)?;

        // Without an Android tree there is no adb and nothing to run.
        let (Some(android), Some(lease)) = (self.config.android.as_deref(), ctx.lease.as_ref())
        else {
            return Ok(());
        };
        let port = lease.adb();

        let tool = match &self.bridge_tool {
            Some(tool) => Arc::clone(tool),
            None => Arc::new(AdbClient::from_android_tree(android, ctx.output.try_clone()?)),
        };
        let mut bridge = DeviceBridge::new(tool, self.options.timing.clone(), Arc::clone(&self.timeouts));
        let user_data = self.arch.android_user_data()?;
        let up = bridge.bring_up(port, &user_data);
        // Teardown disconnects whatever bring-up managed to connect.
        ctx.bridge = Some(bridge);
        up?;

        let Some(bridge) = ctx.bridge.as_ref() else {
            return Ok(());
        };
        let session = Arc::clone(&ctx.session);
        let on_timeout: OnTimeout = Arc::new(move || session.capture_diagnostics());
        for test in &self.options.shell_tests {
            println!("{} {}", "Running".bold(), test);
            let code = bridge.run_shell(test, self.options.test_timeout, Some(Arc::clone(&on_timeout)))?;
            ctx.results.push(code);
            if code != 0 {
                println!("{} {} ({})", "FAILED".red().bold(), test, code);
                ctx.has_error = true;
                break;
            }
            println!("{} {}", "PASSED".green().bold(), test);
        }
        Ok(())
    }
}
