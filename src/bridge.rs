//! Device bridge: sequences `adb` invocations against the emulated device.
//!
//! Every step funnels through [`DeviceBridge::check`], which turns a nonzero
//! exit into [`Error::Bridge`]. Probes that expect failure (waiting for root,
//! waiting for the forward to disappear) call [`DeviceBridge::run`] and look
//! at the code themselves.

use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::Timing;
use crate::error::{Error, Result};
use crate::ports::port_accepts;
use crate::qemu::supervisor::{OutputCapture, Process};
use crate::timeout::TimeoutCoordinator;

/// Exits nonzero unless adbd runs as root.
const ROOT_CHECK: &str = "if [[ $(id -u) -ne 0 ]] ; then exit 1; fi";

/// Diagnostic hook run when a bridge command overstays its bound.
pub type OnTimeout = Arc<dyn Fn() + Send + Sync>;

/// The external bridge client.
pub trait BridgeTool: Send + Sync {
    /// Start the tool with `args`. With `force_output` its output goes to the
    /// terminal whatever the run's capture settings are.
    fn spawn(&self, args: &[String], force_output: bool) -> Result<Box<dyn Process>>;

    /// Run the tool to completion and return its stdout.
    fn capture(&self, args: &[String]) -> Result<String>;
}

/// `adb` from a built Android tree.
pub struct AdbClient {
    adb: PathBuf,
    output: OutputCapture,
}

impl AdbClient {
    pub fn new(adb: PathBuf, output: OutputCapture) -> Self {
        Self { adb, output }
    }

    /// Host `adb` shipped in an Android build.
    pub fn from_android_tree(android: &Path, output: OutputCapture) -> Self {
        Self::new(android.join("out/host/linux-x86/bin/adb"), output)
    }

    fn launch_error(&self, source: std::io::Error) -> Error {
        Error::Launch {
            program: self.adb.display().to_string(),
            source,
        }
    }
}

impl BridgeTool for AdbClient {
    fn spawn(&self, args: &[String], force_output: bool) -> Result<Box<dyn Process>> {
        let (stdout, stderr) = if force_output {
            (Stdio::inherit(), Stdio::inherit())
        } else {
            (self.output.stdout()?, self.output.stderr()?)
        };
        let child = Command::new(&self.adb)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| self.launch_error(e))?;
        Ok(Box::new(child))
    }

    fn capture(&self, args: &[String]) -> Result<String> {
        let output = Command::new(&self.adb)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|e| self.launch_error(e))?;
        if !output.status.success() {
            return Err(Error::Bridge {
                args: args.to_vec(),
                code: output.status.code().unwrap_or(-1),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Session with one emulated device, addressed by its forwarded adbd port.
pub struct DeviceBridge {
    tool: Arc<dyn BridgeTool>,
    timing: Timing,
    timeouts: Arc<TimeoutCoordinator>,
    /// Set once the device shows up in `adb devices -l`; pins every later command to it.
    transport: Option<u32>,
    /// `adb connect` succeeded, with or without a transport id.
    connected: bool,
}

impl DeviceBridge {
    pub fn new(tool: Arc<dyn BridgeTool>, timing: Timing, timeouts: Arc<TimeoutCoordinator>) -> Self {
        Self {
            tool,
            timing,
            timeouts,
            transport: None,
            connected: false,
        }
    }

    pub fn transport(&self) -> Option<u32> {
        self.transport
    }

    /// True once `adb connect` succeeded and teardown must disconnect.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn command_args(&self, args: &[String]) -> Vec<String> {
        match self.transport {
            Some(id) => {
                let mut full = vec!["-t".to_string(), id.to_string()];
                full.extend_from_slice(args);
                full
            }
            None => args.to_vec(),
        }
    }

    /// Run one command under `timeout` and return its exit code.
    ///
    /// When the bound expires `on_timeout` runs first, then the tool is
    /// killed, and the call fails with [`Error::Timeout`].
    pub fn run(
        &self,
        args: &[String],
        timeout: Duration,
        on_timeout: Option<OnTimeout>,
        force_output: bool,
    ) -> Result<i32> {
        let full = self.command_args(args);
        debug!(args = ?full, "adb");
        let mut process = self.tool.spawn(&full, force_output)?;
        let kill = process.kill_switch();
        let step = format!("adb {}", args.join(" "));
        let bound_secs = timeout.as_secs();
        let log_step = step.clone();
        self.timeouts.guard(
            &step,
            timeout,
            move || {
                warn!(step = %log_step, bound_secs, "Timed out");
                if let Some(hook) = on_timeout {
                    hook();
                }
                kill();
            },
            || Ok(process.wait()?),
        )
    }

    /// Like [`run`](Self::run) with the default bound, but a nonzero exit is an error.
    pub fn check(&self, args: &[String]) -> Result<()> {
        self.check_within(args, self.timing.bridge_command_timeout)
    }

    fn check_within(&self, args: &[String], timeout: Duration) -> Result<()> {
        let code = self.run(args, timeout, None, false)?;
        if code != 0 {
            return Err(Error::Bridge {
                args: args.to_vec(),
                code,
            });
        }
        Ok(())
    }

    /// Find the transport id `adb devices -l` lists for `localhost:<port>`.
    /// `None` is a normal answer: the device is not (or no longer) listed.
    pub fn scan_transport(&self, port: u16) -> Result<Option<u32>> {
        let listing = self.tool.capture(&to_args(&["devices", "-l"]))?;
        let pattern = Regex::new(&format!(r"localhost:{}\b.*transport_id:(\d+)", port))
            .map_err(|e| Error::Generic(format!("bad transport pattern: {}", e)))?;
        Ok(pattern
            .captures(&listing)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok()))
    }

    /// Connect to adbd on `port`, become root and push the userdata payload.
    pub fn bring_up(&mut self, port: u16, user_data: &Path) -> Result<()> {
        self.wait_for_socket(port)?;
        let target = format!("localhost:{}", port);
        self.check(&to_args(&["connect", &target]))?;
        self.connected = true;

        self.transport = self.scan_transport(port)?;
        match self.transport {
            Some(id) => info!(port, transport = id, "adb connected"),
            None => warn!(port, "Failed to find transport for port"),
        }

        self.check_within(
            &to_args(&["wait-for-device"]),
            self.timing.wait_for_device_timeout,
        )?;
        self.root()?;

        // `make dist` leaves /data out of userdata.img; push it by hand.
        self.check(&[
            "push".to_string(),
            user_data.display().to_string(),
            "/".to_string(),
        ])
    }

    fn wait_for_socket(&self, port: u16) -> Result<()> {
        let tries = self.timing.adbd_connect_tries;
        let backoff = self.timing.bridge_backoff;
        let mut attempt = 0;
        loop {
            match TcpStream::connect(("localhost", port)) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= tries {
                        return Err(Error::timeout("Wait for adbd socket", backoff * tries));
                    }
                    debug!(port, attempt, error = %e, "adbd not reachable yet");
                    thread::sleep(backoff);
                }
            }
        }
    }

    /// Restart adbd as root and wait until it is back with root privileges.
    pub fn root(&self) -> Result<()> {
        self.check(&to_args(&["root"]))?;
        let timeout = self.timing.bridge_command_timeout;
        let mut attempt = 0;
        loop {
            // adbd may still be on its way down.
            self.run(&to_args(&["wait-for-device"]), timeout, None, false)?;
            let code = self.run(&to_args(&["shell", ROOT_CHECK]), timeout, None, false)?;
            if code == 0 {
                return Ok(());
            }
            attempt += 1;
            if attempt >= self.timing.root_tries {
                return Err(Error::Bridge {
                    args: to_args(&["root"]),
                    code,
                });
            }
            thread::sleep(self.timing.bridge_backoff);
        }
    }

    /// Run one shell test with its output shown to the operator.
    pub fn run_shell(&self, command: &str, timeout: Duration, on_timeout: Option<OnTimeout>) -> Result<i32> {
        self.run(&to_args(&["shell", command]), timeout, on_timeout, true)
    }

    /// Disconnect and wait until the emulator's forward of `port` is gone.
    pub fn bring_down(&mut self, port: u16) -> Result<()> {
        let target = format!("localhost:{}", port);
        self.check(&to_args(&["disconnect", &target]))?;
        self.connected = false;

        let tries = self.timing.forward_release_tries;
        let backoff = self.timing.bridge_backoff;
        let mut attempt = 0;
        loop {
            self.transport = self.scan_transport(port)?;
            if self.transport.is_none() && !port_accepts(port) {
                debug!(port, "port forward released");
                return Ok(());
            }
            attempt += 1;
            if attempt >= tries {
                return Err(Error::timeout(
                    "Wait for port forward to go away",
                    backoff * tries,
                ));
            }
            thread::sleep(backoff);
        }
    }
}
