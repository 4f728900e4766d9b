//! Test runner for a secure OS booted under QEMU.
//!
//! A run launches the emulator with a control channel (QMP) and a message
//! channel to the guest test agent, runs either boot tests (reported by the
//! agent) or shell tests (through adb), and tears every resource down in a
//! fixed order however the run ends.

pub mod arch;
pub mod bridge;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod logging;
pub mod ports;
pub mod qemu;
pub mod runner;
pub mod timeout;

pub use arch::{Arch, ArchOptions};
pub use bridge::{AdbClient, BridgeTool, DeviceBridge};
pub use config::{check_compatibility, Config, RunOptions, Timing};
pub use diagnostics::DiagnosticSink;
pub use error::{Error, Result};
pub use ports::{PortBroker, PortLease};
pub use runner::{overall_exit_code, RunState, Runner, TestMode};
pub use timeout::{Clock, ManualClock, ThreadClock, TimeoutCoordinator, TimeoutHandle};
