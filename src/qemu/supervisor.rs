//! Emulator process ownership.
//!
//! The run owns exactly one [`EmulatorHandle`]. Asking QEMU to quit goes
//! through the control channel; the only direct signal sent through the
//! handle is the forced kill.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};

/// Kills a process from another thread while its owner is blocked waiting on it.
pub type KillSwitch = Arc<dyn Fn() + Send + Sync>;

/// A spawned OS process, or a stand-in for one.
pub trait Process: Send {
    fn id(&self) -> u32;
    /// Exit code if the process has finished. Death by signal N reports -N.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;
    fn wait(&mut self) -> io::Result<i32>;
    fn kill(&mut self) -> io::Result<()>;
    fn kill_switch(&self) -> KillSwitch;
}

pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| -s))
        .unwrap_or(-1)
}

impl Process for Child {
    fn id(&self) -> u32 {
        Child::id(self)
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(Child::try_wait(self)?.map(exit_code))
    }

    fn wait(&mut self) -> io::Result<i32> {
        Child::wait(self).map(exit_code)
    }

    fn kill(&mut self) -> io::Result<()> {
        Child::kill(self)
    }

    fn kill_switch(&self) -> KillSwitch {
        // The pid stays ours until the owner reaps it, so it cannot be recycled
        // under us while the owner is still blocked in wait().
        let pid = Child::id(self) as libc::pid_t;
        Arc::new(move || {
            // SAFETY: plain kill(2) on a pid we spawned and have not reaped.
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        })
    }
}

/// Clear `O_NONBLOCK` on `fd`. QEMU sets it on descriptors it shares with us.
pub fn set_blocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl(2) only reads and updates the descriptor's status flags.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if flags & libc::O_NONBLOCK != 0 && libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Where a spawned process's output goes.
#[derive(Debug)]
pub enum OutputCapture {
    /// Straight to the operator's terminal.
    Inherit,
    /// Into an anonymous temp file, dumped only if the run fails.
    File(File),
}

impl OutputCapture {
    pub fn capture() -> Result<Self> {
        Ok(Self::File(tempfile::tempfile()?))
    }

    pub fn stdout(&self) -> Result<Stdio> {
        Ok(match self {
            Self::Inherit => Stdio::inherit(),
            Self::File(f) => Stdio::from(f.try_clone()?),
        })
    }

    pub fn stderr(&self) -> Result<Stdio> {
        self.stdout()
    }

    /// Another handle onto the same destination.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(match self {
            Self::Inherit => Self::Inherit,
            Self::File(f) => Self::File(f.try_clone()?),
        })
    }

    pub fn is_captured(&self) -> bool {
        matches!(self, Self::File(_))
    }

    /// Copy everything captured so far to `out`. No-op when inheriting.
    pub fn dump_to(&self, out: &mut dyn Write) -> io::Result<()> {
        let Self::File(f) = self else {
            return Ok(());
        };
        let mut f = f.try_clone()?;
        f.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        out.write_all(b"System log:\n")?;
        out.write_all(&buf)?;
        out.flush()
    }
}

/// Stdio routing for the emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinMode {
    /// Interactive: the operator types into the serial console.
    Inherit,
    Null,
}

impl StdinMode {
    pub fn stdio(self) -> Stdio {
        match self {
            Self::Inherit => Stdio::inherit(),
            Self::Null => Stdio::null(),
        }
    }
}

/// Last known state of the emulator process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Exited(i32),
}

/// The run's emulator process.
pub struct EmulatorHandle {
    process: Box<dyn Process>,
    liveness: Liveness,
}

impl EmulatorHandle {
    pub fn new(process: Box<dyn Process>) -> Self {
        Self {
            process,
            liveness: Liveness::Running,
        }
    }

    pub fn id(&self) -> u32 {
        self.process.id()
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    /// Valid until the handle reaps the process.
    pub fn kill_switch(&self) -> KillSwitch {
        self.process.kill_switch()
    }

    pub fn is_running(&mut self) -> bool {
        if let Liveness::Exited(_) = self.liveness {
            return false;
        }
        match self.process.try_wait() {
            Ok(Some(code)) => {
                self.liveness = Liveness::Exited(code);
                false
            }
            Ok(None) => true,
            // Cannot tell; assume it is still there so teardown keeps trying.
            Err(_) => true,
        }
    }

    /// Kill the process if it is still running. Safe to call repeatedly.
    /// Returns whether a kill was actually sent.
    pub fn force_kill(&mut self) -> Result<bool> {
        if !self.is_running() {
            return Ok(false);
        }
        info!(pid = self.id(), "killing emulator");
        match self.process.kill() {
            Ok(()) => {}
            // Lost a race with a natural exit.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e.into()),
        }
        self.wait()?;
        Ok(true)
    }

    /// Block until the process exits and return its exit code.
    pub fn wait(&mut self) -> Result<i32> {
        if let Liveness::Exited(code) = self.liveness {
            return Ok(code);
        }
        let code = self.process.wait()?;
        self.liveness = Liveness::Exited(code);
        debug!(pid = self.id(), code, "emulator exited");
        Ok(code)
    }
}

/// Starts processes for the run.
pub trait Launcher: Send + Sync {
    fn launch(
        &self,
        program: &Path,
        args: &[String],
        working_dir: &Path,
        stdin: StdinMode,
        output: &OutputCapture,
    ) -> Result<EmulatorHandle>;
}

/// Spawns real OS processes.
#[derive(Debug, Default)]
pub struct ProcessSupervisor;

impl Launcher for ProcessSupervisor {
    fn launch(
        &self,
        program: &Path,
        args: &[String],
        working_dir: &Path,
        stdin: StdinMode,
        output: &OutputCapture,
    ) -> Result<EmulatorHandle> {
        debug!(program = %program.display(), ?args, "launching emulator");
        let child = Command::new(program)
            .args(args)
            .current_dir(working_dir)
            .stdin(stdin.stdio())
            .stdout(output.stdout()?)
            .stderr(output.stderr()?)
            .spawn()
            .map_err(|source| Error::Launch {
                program: program.display().to_string(),
                source,
            })?;
        info!(pid = child.id(), "emulator started");
        Ok(EmulatorHandle::new(Box::new(child)))
    }
}

/// A process that has already exited with a fixed code.
#[cfg(test)]
pub(crate) struct ExitedProcess(pub i32);

#[cfg(test)]
impl Process for ExitedProcess {
    fn id(&self) -> u32 {
        0
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(Some(self.0))
    }

    fn wait(&mut self) -> io::Result<i32> {
        Ok(self.0)
    }

    fn kill(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn kill_switch(&self) -> KillSwitch {
        Arc::new(|| {})
    }
}
