//! RPMB daemon lifecycle.
//!
//! The daemon serves the secure OS's replay-protected storage over a Unix
//! socket that QEMU forwards into the guest as a virtio serial port. It must
//! be accepting before QEMU starts, or QEMU fails to open the chardev.

use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub struct RpmbDaemon {
    child: Option<Child>,
    dir: Option<TempDir>,
    socket: PathBuf,
}

impl RpmbDaemon {
    /// Start `rpmbd` on `data` and wait until its socket accepts connections.
    pub fn start(rpmbd: &Path, data: &Path, tries: u32, backoff: Duration) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("rpmb").tempdir()?;
        let socket = dir.path().join("rpmb");

        let child = Command::new(rpmbd)
            .arg("-d")
            .arg(data)
            .arg("--sock")
            .arg(&socket)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| Error::Launch {
                program: rpmbd.display().to_string(),
                source,
            })?;
        info!(pid = child.id(), socket = %socket.display(), "rpmb daemon started");

        let mut daemon = Self {
            child: Some(child),
            dir: Some(dir),
            socket,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match UnixStream::connect(&daemon.socket) {
                Ok(_) => break,
                Err(e) if attempt < tries => {
                    debug!(attempt, error = %e, "rpmb socket not ready");
                    thread::sleep(backoff);
                }
                Err(source) => {
                    let _ = daemon.stop();
                    return Err(Error::Launch {
                        program: rpmbd.display().to_string(),
                        source: io::Error::new(
                            source.kind(),
                            format!("socket never came up after {} attempts: {}", attempt, source),
                        ),
                    });
                }
            }
        }
        Ok(daemon)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    /// Kill the daemon and remove its socket directory.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!(error = %e, "rpmb daemon already gone");
            }
            let _ = child.wait();
        }
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        let path = dir.path().to_path_buf();
        match dir.close() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => {
                warn!(path = %path.display(), error = %source, "failed to remove rpmb socket dir");
                Err(Error::Cleanup { path, source })
            }
        }
    }
}

impl Drop for RpmbDaemon {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
