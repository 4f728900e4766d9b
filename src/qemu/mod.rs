//! Everything that talks to the emulator process.
//!
//! The supervisor owns the process; the emulator is reached through two
//! independent channels: QMP over a FIFO pair for control, and a framed Unix
//! socket to the guest test agent for test selection and results.

pub mod builder;
pub mod message;
pub mod qmp;
pub mod rpmb;
pub mod session;
pub mod supervisor;

pub use builder::{LaunchBuilder, LaunchSpec};
pub use message::{BootOutcome, Frame, MessageAbort, MessageChannel, MessageState};
pub use qmp::{ChannelState, ControlChannel, ControlPipes, QmpError, Response};
pub use rpmb::RpmbDaemon;
pub use session::EmulatorSession;
pub use supervisor::{
    EmulatorHandle, KillSwitch, Launcher, Liveness, OutputCapture, Process, ProcessSupervisor,
    StdinMode,
};
