//! Runner configuration.
//!
//! `Config` describes where the build artifacts live and is loaded from a
//! TOML file. `RunOptions` describes what one run should do with them.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// ADB expects its first console on 5554 and control on 5555.
pub const ADB_BASE_PORT: u16 = 5554;

/// Default bound for a single test (10 minutes).
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(60 * 10);

/// Artifact locations for one emulator configuration.
///
/// Setting `android` or `linux` to `None` starts QEMU without those components.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Built Android tree or prebuilt.
    #[serde(default)]
    pub android: Option<PathBuf>,
    /// Built Linux kernel tree or prebuilt.
    #[serde(default)]
    pub linux: Option<PathBuf>,
    /// Architecture directory name inside the kernel tree (`arch/<linux_arch>`).
    #[serde(default)]
    pub linux_arch: Option<String>,
    /// ATF build directory; also the emulator's working directory.
    #[serde(default = "default_atf")]
    pub atf: PathBuf,
    /// Emulator binary.
    #[serde(default = "default_qemu")]
    pub qemu: PathBuf,
    /// RPMB daemon binary.
    #[serde(default)]
    pub rpmbd: Option<PathBuf>,
    /// Architecture tag, e.g. "arm64" or "x86_64".
    #[serde(default)]
    pub arch: Option<String>,
    /// Extra flags appended after the drive mappings.
    #[serde(default)]
    pub extra_qemu_flags: Vec<String>,
}

fn default_atf() -> PathBuf {
    PathBuf::from(".")
}

fn default_qemu() -> PathBuf {
    PathBuf::from("qemu-system-aarch64")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            android: None,
            linux: None,
            linux_arch: None,
            atf: default_atf(),
            qemu: default_qemu(),
            rpmbd: None,
            arch: None,
            extra_qemu_flags: Vec::new(),
        }
    }
}

impl Config {
    /// Load a config file. Relative paths are resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&text, base)
    }

    /// Parse config text, resolving relative paths against `base`.
    pub fn parse(text: &str, base: &Path) -> Result<Self> {
        let mut config: Config =
            toml::from_str(text).map_err(|e| Error::Config(format!("bad config file: {}", e)))?;
        config.resolve_relative(base);
        Ok(config)
    }

    fn resolve_relative(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(p) = self.android.as_mut() {
            resolve(p);
        }
        if let Some(p) = self.linux.as_mut() {
            resolve(p);
        }
        if let Some(p) = self.rpmbd.as_mut() {
            resolve(p);
        }
        resolve(&mut self.atf);
        // A bare program name is looked up on PATH; only paths get rebased.
        if self.qemu.components().count() > 1 {
            resolve(&mut self.qemu);
        }
    }
}

/// Retry counts and backoffs for every bounded polling loop in a run.
#[derive(Debug, Clone)]
pub struct Timing {
    /// Attempts to reach adbd through the forwarded port.
    pub adbd_connect_tries: u32,
    /// Attempts to confirm adbd restarted as root.
    pub root_tries: u32,
    /// Attempts to see the forwarded port disappear after disconnect.
    pub forward_release_tries: u32,
    /// Pause between bridge retries.
    pub bridge_backoff: Duration,
    /// Attempts to open the control FIFOs once QEMU is spawned.
    pub control_open_tries: u32,
    pub control_open_backoff: Duration,
    /// Attempts to connect to the RPMB daemon socket.
    pub rpmb_tries: u32,
    pub rpmb_backoff: Duration,
    /// How long QEMU gets to honour `quit` before it is killed.
    pub quit_grace: Duration,
    /// Bound for QEMU to answer a monitor command during shutdown.
    pub control_reply_timeout: Duration,
    /// Default bound for a bridge command.
    pub bridge_command_timeout: Duration,
    /// Bound for `wait-for-device` during bring-up.
    pub wait_for_device_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            adbd_connect_tries: 15,
            root_tries: 10,
            forward_release_tries: 120,
            bridge_backoff: Duration::from_secs(1),
            control_open_tries: 50,
            control_open_backoff: Duration::from_millis(100),
            rpmb_tries: 10,
            rpmb_backoff: Duration::from_secs(1),
            quit_grace: Duration::from_secs(1),
            control_reply_timeout: Duration::from_secs(10),
            bridge_command_timeout: Duration::from_secs(60),
            wait_for_device_timeout: Duration::from_secs(120),
        }
    }
}

/// What one run should do.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Boot tests run by the guest test agent; reported over the message channel.
    pub boot_tests: Vec<String>,
    /// Shell tests run through the device bridge.
    pub shell_tests: Vec<String>,
    /// Leave the serial console/monitor attached to the terminal.
    pub interactive: bool,
    /// Show emulator and bridge output instead of capturing it.
    pub verbose: bool,
    /// Start the RPMB daemon.
    pub rpmb: bool,
    /// Start paused with a gdb server (`-s -S`); disables all timers.
    pub debug: bool,
    /// On error, attach a debugger and wait for the operator.
    pub debug_on_error: bool,
    /// Bound for a boot test or a single shell test.
    pub test_timeout: Duration,
    /// Bound for the guest agent to connect to the message channel.
    pub handshake_timeout: Duration,
    /// First port probed when reserving the ADB port pair.
    pub adb_base_port: u16,
    pub timing: Timing,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            boot_tests: Vec::new(),
            shell_tests: Vec::new(),
            interactive: false,
            verbose: false,
            rpmb: true,
            debug: false,
            debug_on_error: false,
            test_timeout: DEFAULT_TEST_TIMEOUT,
            handshake_timeout: DEFAULT_TEST_TIMEOUT,
            adb_base_port: ADB_BASE_PORT,
            timing: Timing::default(),
        }
    }
}

/// Check that the config and run options can be used together.
pub fn check_compatibility(config: &Config, options: &RunOptions) -> Result<()> {
    if !options.shell_tests.is_empty() {
        if config.linux.is_none() {
            return Err(Error::Config("Need Linux to run android tests".into()));
        }
        if config.android.is_none() {
            return Err(Error::Config("Need Android to run android tests".into()));
        }
    }

    // The guest agent reports boot test results by terminating the emulator,
    // so it cannot also host shell tests.
    if !options.shell_tests.is_empty() && !options.boot_tests.is_empty() {
        return Err(Error::Config(
            "Cannot run Android tests and boot tests from same runner".into(),
        ));
    }

    if !options.boot_tests.is_empty() && options.interactive {
        return Err(Error::Config("Cannot run boot tests interactively".into()));
    }

    if config.android.is_some() && config.linux.is_none() {
        return Err(Error::Config("Cannot run Android without Linux".into()));
    }

    if options.rpmb && config.rpmbd.is_none() {
        return Err(Error::Config(
            "RPMB enabled but no rpmbd configured (use --disable-rpmb)".into(),
        ));
    }

    Ok(())
}
