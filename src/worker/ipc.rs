//! Newline-framed pipe I/O used on both ends of a process worker.
//!
//! Every frame is one JSON document on one line. Reads and writes retry on
//! EINTR so that signal delivery (SIGCHLD during respawn, SIGTERM during
//! shutdown) never surfaces as a spurious I/O error.

use nix::errno::Errno;
use nix::fcntl::OFlag;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Buffer size on each side of a frame pipe.
const FRAME_BUFFER_SIZE: usize = 64 * 1024;

/// File descriptor the child writes its responses to.
pub const CHILD_RESPONSE_FD: RawFd = 3;

fn retry_eintr<T>(mut op: impl FnMut() -> nix::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(Errno::EINTR) => continue,
            result => return result.map_err(io::Error::from),
        }
    }
}

/// Owned pipe end with EINTR-safe `Read`/`Write`.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Take ownership of an inherited descriptor.
    ///
    /// # Safety
    /// `fd` must be open and owned by nobody else.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self::new(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

impl From<std::process::ChildStdin> for PipeFd {
    fn from(stdin: std::process::ChildStdin) -> Self {
        Self::new(OwnedFd::from(stdin))
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        retry_eintr(|| nix::unistd::read(&self.fd, buf))
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        retry_eintr(|| nix::unistd::write(&self.fd, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Create a close-on-exec pipe, returning `(read, write)`.
///
/// Both ends are close-on-exec so that sibling workers spawned later never
/// inherit them; the child receives its end through an explicit `dup2`.
pub fn pipe() -> io::Result<(PipeFd, OwnedFd)> {
    let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
    Ok((PipeFd::new(read), write))
}

/// Reads frames off a pipe.
pub struct FrameReader {
    reader: BufReader<PipeFd>,
    frame: String,
}

impl FrameReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(FRAME_BUFFER_SIZE, fd),
            frame: String::new(),
        }
    }

    /// Next non-blank frame without its line terminator, or `None` at EOF.
    pub fn read_frame(&mut self) -> io::Result<Option<&str>> {
        loop {
            self.frame.clear();
            if self.reader.read_line(&mut self.frame)? == 0 {
                return Ok(None);
            }
            let len = self.frame.trim_end_matches(['\n', '\r']).len();
            self.frame.truncate(len);
            if !self.frame.trim().is_empty() {
                return Ok(Some(&self.frame));
            }
        }
    }
}

/// Writes frames to a pipe, flushing after each one.
pub struct FrameWriter {
    writer: BufWriter<PipeFd>,
}

impl FrameWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(FRAME_BUFFER_SIZE, fd),
        }
    }

    /// Write `frame` followed by a newline. `frame` must not contain one.
    pub fn write_frame(&mut self, frame: &str) -> io::Result<()> {
        debug_assert!(!frame.contains('\n'), "frame spans several lines");
        self.writer.write_all(frame.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}
