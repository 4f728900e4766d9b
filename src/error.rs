//! Error taxonomy for a runner invocation.
//!
//! Test failures are not errors: a shell test that exits nonzero is recorded
//! in the result list. Everything here means the runner itself could not do
//! its job, and maps to process exit code 2.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Incompatible or incomplete configuration. Raised before anything is allocated.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The emulator or an auxiliary daemon could not be started.
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    /// A channel to the emulator could not be established.
    #[error("failed to open {channel} channel: {detail}")]
    ChannelInit { channel: &'static str, detail: String },

    /// The peer sent something the framing rules do not allow.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A device-bridge invocation returned nonzero.
    #[error("'adb {}' failed with {code}", .args.join(" "))]
    Bridge { args: Vec<String>, code: i32 },

    /// A bounded wait ran out.
    #[error("{step} timed out ({} s)", .bound.as_secs())]
    Timeout { step: String, bound: Duration },

    /// The emulator ignored the quit request and had to be killed.
    #[error("QEMU did not exit cleanly")]
    UncleanExit,

    /// A run-owned resource could not be removed during teardown.
    #[error("failed to clean up {}: {source}", .path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A host-side step (device tree generation, external tool) failed.
    #[error("runner failed: {0}")]
    Generic(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn timeout(step: impl Into<String>, bound: Duration) -> Self {
        Error::Timeout {
            step: step.into(),
            bound,
        }
    }

    /// Exit code reported by the binary when a run ends with this error.
    pub fn exit_code(&self) -> i32 {
        2
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
