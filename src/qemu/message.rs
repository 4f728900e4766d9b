//! Message channel to the guest test agent.
//!
//! QEMU exposes a virtio serial port named `testrunner0` backed by a Unix
//! socket we listen on. The agent connects once, reads a single command
//! string (`boottest <port>` or anything else to boot the secondary OS), and
//! then streams frames back:
//!
//! ```text
//! [type: u8][len: u8][payload: len bytes]
//! type 0: log text, echoed verbatim
//! type 1: test finished, payload[0] is the result code
//! ```

use std::io::{self, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const FRAME_LOG: u8 = 0;
pub const FRAME_RESULT: u8 = 1;

/// Result recorded when the agent disappears without reporting one.
pub const DISCONNECTED_RESULT: u8 = 2;

/// Result recorded when the agent breaks the framing rules.
pub const VIOLATION_RESULT: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Log(Vec<u8>),
    Result(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Listening,
    Connected,
    /// A result frame arrived; the connection stays open until closed.
    Finished,
    Closed,
}

/// How a boot test's frame stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    Completed(u8),
    /// Zero-length read: the peer went away (QEMU crashed, or the channel was aborted).
    Disconnected,
}

impl BootOutcome {
    pub fn result_code(self) -> u8 {
        match self {
            Self::Completed(code) => code,
            Self::Disconnected => DISCONNECTED_RESULT,
        }
    }
}

#[derive(Default)]
struct AbortState {
    aborted: AtomicBool,
    listener: Mutex<Option<UnixListener>>,
    conn: Mutex<Option<UnixStream>>,
    path: Mutex<Option<PathBuf>>,
}

/// Unblocks whatever the channel owner is waiting on, from any thread.
#[derive(Clone)]
pub struct MessageAbort {
    state: Arc<AbortState>,
}

impl MessageAbort {
    pub fn abort(&self) {
        if self.state.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("aborting message channel");
        if let Some(listener) = self.state.listener.lock().unwrap_or_else(|e| e.into_inner()).take() {
            // SAFETY: shutdown(2) on a descriptor we own; wakes a blocked accept().
            unsafe {
                libc::shutdown(listener.as_raw_fd(), libc::SHUT_RDWR);
            }
            // Wakes accept() on kernels where shutdown(2) does not.
            if let Some(path) = self.state.path.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                let _ = UnixStream::connect(path);
            }
        }
        if let Some(conn) = self.state.conn.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = conn.shutdown(Shutdown::Both);
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(Ordering::Acquire)
    }
}

pub struct MessageChannel {
    dir: Option<TempDir>,
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    conn: Option<UnixStream>,
    state: MessageState,
    abort: MessageAbort,
}

impl MessageChannel {
    /// Bind the rendezvous socket in a fresh temp directory and start listening.
    pub fn listen() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("qemu-msg").tempdir()?;
        let socket_path = dir.path().join("msg");
        let listener = UnixListener::bind(&socket_path)?;

        let abort = MessageAbort {
            state: Arc::new(AbortState::default()),
        };
        *abort.state.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener.try_clone()?);
        *abort.state.path.lock().unwrap_or_else(|e| e.into_inner()) = Some(socket_path.clone());

        Ok(Self {
            dir: Some(dir),
            socket_path,
            listener: Some(listener),
            conn: None,
            state: MessageState::Listening,
            abort,
        })
    }

    /// Arguments that plumb the socket into the guest as `testrunner0`.
    pub fn qemu_args(&self) -> Vec<String> {
        vec![
            "-device".into(),
            "virtserialport,chardev=testrunner0,name=testrunner0".into(),
            "-chardev".into(),
            format!("socket,id=testrunner0,path={}", self.socket_path.display()),
        ]
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn state(&self) -> MessageState {
        self.state
    }

    pub fn abort_handle(&self) -> MessageAbort {
        self.abort.clone()
    }

    /// Wait for the guest agent to connect. Only one peer is ever accepted.
    pub fn accept_once(&mut self) -> Result<()> {
        if self.state != MessageState::Listening {
            return Err(Error::ChannelInit {
                channel: "message",
                detail: format!("cannot accept in state {:?}", self.state),
            });
        }
        let listener = self.listener.take().ok_or(Error::ChannelInit {
            channel: "message",
            detail: "listener already gone".into(),
        })?;
        let accepted = listener.accept();
        // No second peer: the listener is dropped as soon as one accept returns.
        drop(listener);
        if self.abort.is_aborted() {
            return Err(Error::ChannelInit {
                channel: "message",
                detail: "aborted while waiting for the guest".into(),
            });
        }
        let (conn, _) = accepted.map_err(|e| Error::ChannelInit {
            channel: "message",
            detail: format!("accept failed: {}", e),
        })?;

        *self.abort.state.conn.lock().unwrap_or_else(|e| e.into_inner()) = Some(conn.try_clone()?);
        if self.abort.is_aborted() {
            let _ = conn.shutdown(Shutdown::Both);
        }
        self.conn = Some(conn);
        self.state = MessageState::Connected;
        debug!("guest agent connected");
        Ok(())
    }

    /// Send the command string to the agent.
    pub fn send(&mut self, text: &str) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::ChannelInit {
                channel: "message",
                detail: "connection has not been established yet".into(),
            });
        };
        conn.write_all(text.as_bytes())?;
        conn.flush()?;
        Ok(())
    }

    /// Read one frame. `Ok(None)` means the peer disconnected.
    pub fn receive_frame(&mut self) -> Result<Option<Frame>> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(None);
        };
        let frame = read_frame(conn)?;
        if let Some(Frame::Result(_)) = frame {
            self.state = MessageState::Finished;
        }
        Ok(frame)
    }

    /// Echo log frames to `log` until a result frame or a disconnect.
    pub fn run_until_result(&mut self, log: &mut dyn Write) -> Result<BootOutcome> {
        loop {
            match self.receive_frame()? {
                None => return Ok(BootOutcome::Disconnected),
                Some(Frame::Log(text)) => write_all_blocking(log, &text)?,
                Some(Frame::Result(code)) => return Ok(BootOutcome::Completed(code)),
            }
        }
    }

    /// Drop the connection and remove the socket directory. The channel is done for good.
    pub fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            let _ = conn.shutdown(Shutdown::Both);
        }
        self.listener = None;
        self.abort.state.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.abort.state.conn.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.state = MessageState::Closed;
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        let path = dir.path().to_path_buf();
        match dir.close() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => {
                warn!(path = %path.display(), error = %source, "failed to remove message socket");
                Err(Error::Cleanup { path, source })
            }
        }
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        if self.state != MessageState::Closed {
            let _ = self.close();
        }
    }
}

/// Read one frame from `r`. A stream that ends anywhere inside a frame counts as a disconnect.
pub fn read_frame(r: &mut impl Read) -> Result<Option<Frame>> {
    let mut header = [0u8; 2];
    if !read_exact_or_eof(r, &mut header)? {
        return Ok(None);
    }
    let [kind, len] = header;
    // Reject before reading: a bad peer may never send the payload it declared.
    if kind != FRAME_LOG && kind != FRAME_RESULT {
        return Err(Error::ProtocolViolation(format!("unexpected frame type {}", kind)));
    }
    let mut payload = vec![0u8; usize::from(len)];
    if !read_exact_or_eof(r, &mut payload)? {
        return Ok(None);
    }
    if kind == FRAME_LOG {
        return Ok(Some(Frame::Log(payload)));
    }
    match payload.first() {
        Some(&code) => Ok(Some(Frame::Result(code))),
        None => Err(Error::ProtocolViolation("result frame without a result code".into())),
    }
}

/// Returns false if the stream ended (or was reset) before `buf` was filled.
fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::BrokenPipe) => {
                return Ok(false)
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// QEMU can leave a shared stdout non-blocking; wait it out instead of failing.
pub fn write_all_blocking(out: &mut dyn Write, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        match out.write(bytes) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(5)),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    out.flush()
}
