//! Resources owned by one run, and the fixed-order teardown that releases them.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::bridge::DeviceBridge;
use crate::diagnostics::DiagnosticSink;
use crate::error::{Error, Result};
use crate::ports::PortLease;
use crate::qemu::supervisor::set_blocking;
use crate::qemu::{EmulatorSession, MessageChannel, OutputCapture, RpmbDaemon};
use crate::timeout::TimeoutCoordinator;

/// Everything a run allocates. Fields are filled in as startup progresses, so
/// teardown only releases what actually exists.
pub(crate) struct RunContext {
    pub session: Arc<EmulatorSession>,
    pub message: Option<MessageChannel>,
    pub rpmb: Option<RpmbDaemon>,
    pub bridge: Option<DeviceBridge>,
    pub lease: Option<PortLease>,
    /// Generated launch inputs (device trees) that live until QEMU exits.
    pub temp_files: Vec<NamedTempFile>,
    pub output: OutputCapture,
    pub results: Vec<i32>,
    pub has_error: bool,
    torn_down: bool,
}

impl RunContext {
    pub fn new(session: Arc<EmulatorSession>, output: OutputCapture) -> Self {
        Self {
            session,
            message: None,
            rpmb: None,
            bridge: None,
            lease: None,
            temp_files: Vec::new(),
            output,
            results: Vec::new(),
            has_error: false,
            torn_down: false,
        }
    }

    /// A temp file removed during teardown.
    pub fn temp_file(&mut self) -> Result<PathBuf> {
        let file = tempfile::Builder::new().prefix("qemu-arg").tempfile()?;
        let path = file.path().to_path_buf();
        self.temp_files.push(file);
        Ok(path)
    }

    /// Release everything, in order: timers, message channel, emulator and
    /// control channel, auxiliary daemons and the bridge, temp files.
    ///
    /// Every step runs even if an earlier one failed. The first failure is
    /// returned and the rest are logged. Runs once; later calls are no-ops.
    pub fn teardown(&mut self, timeouts: &TimeoutCoordinator, sink: &DiagnosticSink) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        let mut errors = Vec::new();

        timeouts.cancel_all();

        if let Some(mut message) = self.message.take() {
            errors.extend(message.close().err());
        }

        errors.extend(self.session.shutdown(self.has_error).err());

        // QEMU shared our terminal and may have left stdin non-blocking.
        if let Err(e) = set_blocking(libc::STDIN_FILENO) {
            debug!(error = %e, "could not restore blocking stdin");
        }

        if let Some(mut rpmb) = self.rpmb.take() {
            errors.extend(rpmb.stop().err());
        }

        if let (Some(bridge), Some(lease)) = (self.bridge.as_mut(), self.lease.as_ref()) {
            if bridge.is_connected() {
                errors.extend(bridge.bring_down(lease.adb()).err());
            }
        }
        self.bridge = None;

        for file in self.temp_files.drain(..) {
            let path = file.path().to_path_buf();
            match file.close() {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => errors.push(Error::Cleanup { path, source }),
            }
        }

        errors.extend(self.session.exit_status().err());

        if self.has_error || !errors.is_empty() {
            let mut sink = sink.clone();
            if let Err(e) = self.output.dump_to(&mut sink) {
                warn!(error = %e, "could not dump emulator output");
            }
        }

        let mut errors = errors.into_iter();
        let first = errors.next();
        for later in errors {
            warn!(error = %later, "teardown step failed");
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
