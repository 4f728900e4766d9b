//! QEMU launch line assembly.
//!
//! Sections are collected separately and concatenated in a fixed order by
//! [`LaunchBuilder::build`]. Order matters: serial routing must come first so
//! the console is the first serial port, and drive mappings decide which
//! image becomes `/dev/vda`.

use std::fmt;
use std::path::{Path, PathBuf};

/// Builder for the emulator command line.
#[derive(Default)]
pub struct LaunchBuilder {
    serial: Vec<String>,
    machine: Vec<String>,
    basic: Vec<String>,
    bios: Vec<String>,
    linux: Vec<String>,
    drives: Vec<String>,
    extra: Vec<String>,
    rpmb: Vec<String>,
    dtb: Vec<String>,
    debug: bool,
    message: Vec<String>,
    control: Vec<String>,
    forwarding: Vec<String>,
}

impl LaunchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serial console and monitor routing (prepended).
    pub fn serial(mut self, args: Vec<String>) -> Self {
        self.serial = args;
        self
    }

    pub fn machine(mut self, args: Vec<String>) -> Self {
        self.machine = args;
        self
    }

    /// CPU, memory and display options.
    pub fn basic(mut self, args: Vec<String>) -> Self {
        self.basic = args;
        self
    }

    pub fn bios(mut self, args: Vec<String>) -> Self {
        self.bios = args;
        self
    }

    /// Kernel image and command line.
    pub fn linux(mut self, args: Vec<String>) -> Self {
        self.linux = args;
        self
    }

    pub fn drives(mut self, args: Vec<String>) -> Self {
        self.drives = args;
        self
    }

    /// Caller-supplied flags, placed after the drive mappings.
    pub fn extra(mut self, args: &[String]) -> Self {
        self.extra = args.to_vec();
        self
    }

    pub fn rpmb(mut self, args: Vec<String>) -> Self {
        self.rpmb = args;
        self
    }

    pub fn dtb(mut self, args: Vec<String>) -> Self {
        self.dtb = args;
        self
    }

    /// Start paused with a gdb server on :1234.
    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    /// Message channel chardev.
    pub fn message_channel(mut self, args: Vec<String>) -> Self {
        self.message = args;
        self
    }

    /// QMP monitor chardev.
    pub fn control_channel(mut self, args: Vec<String>) -> Self {
        self.control = args;
        self
    }

    /// User-net port forwarding.
    pub fn forwarding(mut self, args: Vec<String>) -> Self {
        self.forwarding = args;
        self
    }

    /// The hardware description without `-machine`, as device-tree dumping needs it.
    pub fn hardware_args(&self) -> Vec<String> {
        [
            &self.basic,
            &self.bios,
            &self.linux,
            &self.drives,
            &self.extra,
            &self.rpmb,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }

    pub fn build(self, program: &Path) -> LaunchSpec {
        let mut args = self.serial.clone();
        args.extend(self.machine.iter().cloned());
        args.extend(self.hardware_args());
        args.extend(self.dtb);
        if self.debug {
            args.extend(["-s".to_string(), "-S".to_string()]);
        }
        args.extend(self.message);
        args.extend(self.control);
        args.extend(self.forwarding);
        LaunchSpec {
            program: program.to_path_buf(),
            args,
        }
    }
}

/// Complete, immutable emulator command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    program: PathBuf,
    args: Vec<String>,
}

impl LaunchSpec {
    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}
