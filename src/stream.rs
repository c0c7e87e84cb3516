/// Pty-backed capture of one child output stream.
///
/// Each stream gets its own pseudo-terminal so the child sees a tty on both
/// stdout and stderr. The supervisor keeps the master side, registered with
/// the tokio reactor in non-blocking mode; the slave side goes to the child.
use crate::line::{LineAssembler, LineEvent, StreamTag};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::openpty;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd};
use std::task::{Context, Poll};
use tokio::io::unix::AsyncFd;

/// Both ends of a freshly allocated pty.
#[derive(Debug)]
pub struct PtyChannel {
    /// Master side, kept by the supervisor. Non-blocking.
    pub reader: OwnedFd,
    /// Slave side, handed to the child as stdout or stderr.
    pub writer: OwnedFd,
}

impl PtyChannel {
    pub fn open() -> Result<Self, Errno> {
        let pty = openpty(None, None)?;

        for fd in [&pty.master, &pty.slave] {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        }

        let flags = OFlag::from_bits_truncate(fcntl(pty.master.as_raw_fd(), FcntlArg::F_GETFL)?);
        fcntl(
            pty.master.as_raw_fd(),
            FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
        )?;

        Ok(Self {
            reader: pty.master,
            writer: pty.slave,
        })
    }
}

/// Classified result of a single read attempt.
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n` bytes were read into the buffer.
    Data(usize),
    /// The writing side is gone and everything buffered has been read.
    Closed,
    /// Nothing to read right now (spurious wake-up or signal).
    NotReady,
    /// Any other read failure.
    Failed(io::Error),
}

/// Map a raw read result onto [`ReadOutcome`].
///
/// A pty master reports the slave hanging up as `EIO` once its buffer has
/// drained, so that errno counts as end-of-stream alongside a zero-byte read.
pub fn classify(result: io::Result<usize>) -> ReadOutcome {
    match result {
        Ok(0) => ReadOutcome::Closed,
        Ok(n) => ReadOutcome::Data(n),
        Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => ReadOutcome::Closed,
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            ReadOutcome::NotReady
        }
        Err(e) => ReadOutcome::Failed(e),
    }
}

/// Lines produced by one [`StreamHandle::poll_once`] call.
#[derive(Debug)]
pub struct Polled {
    pub lines: Vec<LineEvent>,
    pub still_open: bool,
}

/// One readable stream endpoint plus its line assembler.
pub struct StreamHandle {
    tag: StreamTag,
    fd: AsyncFd<File>,
    buf: Vec<u8>,
    assembler: LineAssembler,
}

impl StreamHandle {
    /// Wrap a non-blocking master fd. Must be called inside a tokio runtime.
    pub fn new(tag: StreamTag, reader: OwnedFd, read_chunk: usize) -> io::Result<Self> {
        Ok(Self {
            tag,
            fd: AsyncFd::new(File::from(reader))?,
            buf: vec![0; read_chunk],
            assembler: LineAssembler::new(tag),
        })
    }

    pub fn tag(&self) -> StreamTag {
        self.tag
    }

    /// Readiness check used by the supervisor's multiplexing wait.
    ///
    /// Readiness is left set, so a following [`poll_once`](Self::poll_once)
    /// does not block.
    pub fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.fd.poll_read_ready(cx).map_ok(|_guard| ())
    }

    /// Perform one read and feed the result through the line assembler.
    pub async fn poll_once(&mut self) -> io::Result<Polled> {
        let outcome = {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(&mut self.buf)
            }) {
                Ok(result) => classify(result),
                Err(_would_block) => ReadOutcome::NotReady,
            }
        };

        match outcome {
            ReadOutcome::Data(n) => Ok(Polled {
                lines: self.assembler.feed(&self.buf[..n]),
                still_open: true,
            }),
            ReadOutcome::Closed => {
                tracing::debug!(stream = %self.tag, "end of stream");
                Ok(Polled {
                    lines: self.assembler.feed(&[]),
                    still_open: false,
                })
            }
            ReadOutcome::NotReady => Ok(Polled {
                lines: Vec::new(),
                still_open: true,
            }),
            ReadOutcome::Failed(e) => Err(e),
        }
    }
}
