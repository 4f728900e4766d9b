//! QMP client over a pair of named pipes.
//!
//! QEMU's `pipe` chardev reads commands from `<path>.in` and writes replies
//! to `<path>.out`. The protocol is strictly one request in flight: write a
//! command, then read lines until a `return` or `error` line arrives.
//! Greeting (`QMP`) and `event` lines in between are informational.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::diagnostics::DiagnosticSink;
use crate::qemu::supervisor::set_blocking;
use crate::error::{Error, Result};

/// QMP error payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QmpError {
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub desc: String,
}

/// QMP command structure.
#[derive(Debug, Serialize)]
struct QmpCommand<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
}

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Return(Value),
    Error(QmpError),
    /// The pipe is gone (QEMU already exited). Only ever seen during teardown.
    NoResponse,
}

impl Response {
    pub fn is_return(&self) -> bool {
        matches!(self, Response::Return(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    Negotiated,
    Closed,
}

/// Rendezvous directory holding the `com.in`/`com.out` FIFOs.
pub struct ControlPipes {
    dir: TempDir,
}

impl ControlPipes {
    pub fn create() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("qemu-command").tempdir()?;
        mkfifo(&dir.path().join("com.in"))?;
        mkfifo(&dir.path().join("com.out"))?;
        Ok(Self { dir })
    }

    /// Arguments that attach the pipes to QEMU as a QMP monitor.
    pub fn qemu_args(&self) -> Vec<String> {
        vec![
            "-chardev".into(),
            format!("pipe,id=command0,path={}", self.base().display()),
            "-mon".into(),
            "chardev=command0,mode=control".into(),
        ]
    }

    pub fn base(&self) -> PathBuf {
        self.dir.path().join("com")
    }

    pub fn request_path(&self) -> PathBuf {
        self.dir.path().join("com.in")
    }

    pub fn response_path(&self) -> PathBuf {
        self.dir.path().join("com.out")
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

fn mkfifo(path: &Path) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| Error::Generic(format!("bad fifo path: {}", e)))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// Structured command/response link to QEMU's monitor.
pub struct ControlChannel {
    pipes: Option<ControlPipes>,
    writer: Option<Box<dyn Write + Send>>,
    reader: Option<Box<dyn BufRead + Send>>,
    state: ChannelState,
    sink: DiagnosticSink,
}

impl ControlChannel {
    /// A channel over `pipes`, not yet opened.
    pub fn new(pipes: ControlPipes, sink: DiagnosticSink) -> Self {
        Self {
            pipes: Some(pipes),
            writer: None,
            reader: None,
            state: ChannelState::Uninitialized,
            sink,
        }
    }

    /// A channel over already-connected streams (no rendezvous directory).
    pub fn from_streams<W, R>(writer: W, reader: R, sink: DiagnosticSink) -> Self
    where
        W: Write + Send + 'static,
        R: io::Read + Send + 'static,
    {
        Self {
            pipes: None,
            writer: Some(Box::new(writer)),
            reader: Some(Box::new(BufReader::new(reader))),
            state: ChannelState::Uninitialized,
            sink,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Connect to the pipes once QEMU has opened them, then negotiate capabilities.
    ///
    /// Opening the request pipe for writing fails with ENXIO until QEMU holds
    /// the read end, so it is polled `tries` times with `backoff` in between.
    pub fn open(&mut self, tries: u32, backoff: Duration) -> Result<()> {
        if self.writer.is_none() {
            let pipes = self.pipes.as_ref().ok_or(Error::ChannelInit {
                channel: "control",
                detail: "no pipes to open".into(),
            })?;
            let request = Self::open_request_pipe(&pipes.request_path(), tries, backoff)?;
            let response = File::open(pipes.response_path())?;
            self.writer = Some(Box::new(request));
            self.reader = Some(Box::new(BufReader::new(response)));
        }
        self.negotiate()
    }

    fn open_request_pipe(path: &Path, tries: u32, backoff: Duration) -> Result<File> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
            {
                Ok(file) => {
                    set_blocking(file.as_raw_fd())?;
                    return Ok(file);
                }
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) && attempt < tries => {
                    thread::sleep(backoff);
                }
                Err(e) => {
                    return Err(Error::ChannelInit {
                        channel: "control",
                        detail: format!("{} after {} attempts: {}", path.display(), attempt, e),
                    });
                }
            }
        }
    }

    fn negotiate(&mut self) -> Result<()> {
        match self.execute("qmp_capabilities", None) {
            Response::Return(_) => {
                self.state = ChannelState::Negotiated;
                debug!("QMP capabilities negotiated");
                Ok(())
            }
            Response::Error(e) => Err(Error::ChannelInit {
                channel: "control",
                detail: format!("qmp_capabilities rejected: {}", e.desc),
            }),
            Response::NoResponse => Err(Error::ChannelInit {
                channel: "control",
                detail: "no reply to qmp_capabilities".into(),
            }),
        }
    }

    /// Send one command and wait for its reply.
    ///
    /// Never fails on a dead pipe: QEMU may already have exited when this is
    /// called from teardown, which yields [`Response::NoResponse`].
    pub fn execute(&mut self, command: &str, arguments: Option<Value>) -> Response {
        let cmd = QmpCommand {
            execute: command,
            arguments,
        };
        let Ok(cmd_json) = serde_json::to_string(&cmd) else {
            return Response::NoResponse;
        };

        let Some(writer) = self.writer.as_mut() else {
            return Response::NoResponse;
        };
        if let Err(e) = writeln!(writer, "{}", cmd_json).and_then(|_| writer.flush()) {
            debug!(command, error = %e, "qmp write failed; channel already gone");
            return Response::NoResponse;
        }

        let Some(reader) = self.reader.as_mut() else {
            return Response::NoResponse;
        };
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => return Response::NoResponse,
                Ok(_) => {}
                Err(e) => {
                    debug!(command, error = %e, "qmp read failed; channel already gone");
                    return Response::NoResponse;
                }
            }

            let value: Value = match serde_json::from_str(line.trim()) {
                Ok(v) => v,
                Err(_) => {
                    self.sink.write_str(&format!("ignored:{}", line));
                    continue;
                }
            };

            if let Some(error) = value.get("error") {
                let error: QmpError = serde_json::from_value(error.clone()).unwrap_or(QmpError {
                    class: String::new(),
                    desc: error.to_string(),
                });
                self.sink
                    .write_str(&format!("Command {} failed: {}\n", cmd_json, error.desc));
                return Response::Error(error);
            }

            if let Some(ret) = value.get("return") {
                return Response::Return(ret.clone());
            }

            if value.get("QMP").is_none() && value.get("event").is_none() {
                self.sink.write_str(&format!("ignored:{}", line));
            }
        }
    }

    /// Run a human monitor command, copying its text output to the diagnostic sink.
    pub fn run_diagnostic_command(&mut self, command_line: &str) -> String {
        match self.execute(
            "human-monitor-command",
            Some(json!({ "command-line": command_line })),
        ) {
            Response::Return(Value::String(text)) => {
                self.sink.write_str(&text);
                text
            }
            _ => String::new(),
        }
    }

    /// Release both pipes and remove the rendezvous directory.
    ///
    /// A directory that is already gone is fine; any other removal error is not.
    pub fn close(&mut self) -> Result<()> {
        self.writer = None;
        self.reader = None;
        self.state = ChannelState::Closed;
        let Some(pipes) = self.pipes.take() else {
            return Ok(());
        };
        let path = pipes.dir().to_path_buf();
        match pipes.dir.close() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => {
                warn!(path = %path.display(), error = %source, "failed to remove command pipes");
                Err(Error::Cleanup { path, source })
            }
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if self.state != ChannelState::Closed {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    use crate::diagnostics::SharedBuffer;

    /// Emulator side of a QMP conversation: replies to each request line in order.
    fn serve(mut peer: UnixStream, replies: Vec<&'static str>) -> thread::JoinHandle<Vec<String>> {
        thread::spawn(move || {
            let mut reader = BufReader::new(peer.try_clone().unwrap());
            let mut requests = Vec::new();
            for reply in replies {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    break;
                }
                requests.push(line.trim().to_string());
                peer.write_all(reply.as_bytes()).unwrap();
            }
            requests
        })
    }

    fn channel() -> (ControlChannel, UnixStream, SharedBuffer) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let (sink, buf) = DiagnosticSink::buffer();
        let channel = ControlChannel::from_streams(ours.try_clone().unwrap(), ours, sink);
        (channel, theirs, buf)
    }

    #[test]
    fn test_open_negotiates_after_greeting() {
        let (mut channel, peer, _) = channel();
        let server = serve(
            peer,
            vec![concat!(
                "{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n",
                "{\"return\": {}}\n"
            )],
        );
        channel.open(1, Duration::ZERO).unwrap();
        assert_eq!(channel.state(), ChannelState::Negotiated);
        assert_eq!(server.join().unwrap(), vec!["{\"execute\":\"qmp_capabilities\"}"]);
    }

    #[test]
    fn test_events_skipped_and_noise_reported() {
        let (mut channel, peer, buf) = channel();
        let _server = serve(
            peer,
            vec![concat!(
                "{\"event\": \"STOP\"}\n",
                "garbage\n",
                "{\"unexpected\": 1}\n",
                "{\"return\": \"ok\"}\n"
            )],
        );
        let response = channel.execute("stop", None);
        assert_eq!(response, Response::Return(Value::String("ok".into())));
        let diag = buf.contents();
        assert!(diag.contains("ignored:garbage"));
        assert!(diag.contains("ignored:{\"unexpected\": 1}"));
        assert!(!diag.contains("STOP"));
    }

    #[test]
    fn test_error_reply_is_returned_not_raised() {
        let (mut channel, peer, buf) = channel();
        let _server = serve(
            peer,
            vec!["{\"error\": {\"class\": \"GenericError\", \"desc\": \"nope\"}}\n"],
        );
        match channel.execute("bogus", None) {
            Response::Error(e) => {
                assert_eq!(e.class, "GenericError");
                assert_eq!(e.desc, "nope");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(buf.contents().contains("failed: nope"));
    }

    #[test]
    fn test_execute_after_emulator_exit_is_soft() {
        let (mut channel, peer, _) = channel();
        drop(peer);
        assert_eq!(channel.execute("quit", None), Response::NoResponse);
        assert_eq!(channel.execute("quit", None), Response::NoResponse);
    }

    #[test]
    fn test_diagnostic_command_output_goes_to_sink() {
        let (mut channel, peer, buf) = channel();
        let server = serve(peer, vec!["{\"return\": \"X0=0000\\n\"}\n"]);
        let text = channel.run_diagnostic_command("info registers -a");
        assert_eq!(text, "X0=0000\n");
        assert_eq!(buf.contents(), "X0=0000\n");
        let requests = server.join().unwrap();
        assert!(requests[0].contains("human-monitor-command"));
        assert!(requests[0].contains("info registers -a"));
    }

    #[test]
    fn test_open_without_reader_fails_within_bound() {
        let pipes = ControlPipes::create().unwrap();
        let mut channel = ControlChannel::new(pipes, DiagnosticSink::buffer().0);
        let err = channel.open(3, Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, Error::ChannelInit { .. }));
    }

    #[test]
    fn test_fifo_round_trip_and_cleanup() {
        let pipes = ControlPipes::create().unwrap();
        let dir = pipes.dir().to_path_buf();
        let request = pipes.request_path();
        let response = pipes.response_path();
        assert!(pipes.qemu_args()[1].ends_with("/com"));

        // Emulator side opens both ends read-write, as QEMU's pipe chardev does.
        let emulator = thread::spawn(move || {
            let mut input = OpenOptions::new().read(true).write(true).open(request).unwrap();
            let mut output = OpenOptions::new().read(true).write(true).open(response).unwrap();
            let mut buf = [0u8; 256];
            let n = input.read(&mut buf).unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).contains("qmp_capabilities"));
            output.write_all(b"{\"return\": {}}\n").unwrap();
        });

        let mut channel = ControlChannel::new(pipes, DiagnosticSink::buffer().0);
        channel.open(200, Duration::from_millis(10)).unwrap();
        emulator.join().unwrap();

        channel.close().unwrap();
        assert!(!dir.exists());
        assert_eq!(channel.state(), ChannelState::Closed);
        channel.close().unwrap();
    }

    #[test]
    fn test_close_tolerates_missing_directory() {
        let pipes = ControlPipes::create().unwrap();
        std::fs::remove_dir_all(pipes.dir()).unwrap();
        let mut channel = ControlChannel::new(pipes, DiagnosticSink::buffer().0);
        channel.close().unwrap();
    }
}
