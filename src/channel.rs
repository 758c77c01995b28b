//! Line-oriented duplex channel to the control client.
//!
//! The control client runs as a child process whose standard streams are
//! attached to the slave side of a pseudo-terminal with local echo
//! disabled; this side holds the master. Reads are capped by the timeout
//! the timing controller selects, so an expiry doubles as the periodic
//! tick. Lines consumed by a synchronous sub-protocol but belonging to the
//! general event stream are pushed back and re-served before the OS is
//! read again.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;

use nix::pty::openpty;
use nix::sys::termios::{self, LocalFlags, SetArg};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::process::{Child, Command};
use tracing::{debug, trace};

use crate::error::P2pError;

/// Outcome of [`LineChannel::read_line`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    /// One complete line, newline stripped, carriage returns discarded.
    Line(String),
    /// The selected timeout expired; the caller runs its periodic work.
    Timeout,
    /// The channel is gone (client exited or fds closed); the caller must
    /// initiate termination.
    Eof,
}

/// Duplex line channel; the transport is either the pty master or any
/// injected reader/writer pair (tests, alternative transports).
pub struct LineChannel {
    reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Sync + Unpin>,
    buffer: Vec<u8>,
    pushback: VecDeque<String>,
    child: Option<Child>,
    slave: Option<OwnedFd>,
    terminating: bool,
}

impl LineChannel {
    /// Allocate a pty, disable echo on the slave and start the control
    /// client attached to it.
    pub fn spawn(program: &str, interface: Option<&str>) -> Result<LineChannel, P2pError> {
        let pty = openpty(None, None)?;
        disable_echo(&pty.slave)?;

        let mut command = Command::new(program);
        if let Some(iface) = interface {
            command.arg("-i").arg(iface);
        }
        // No HOME: the control client must not write a history file.
        command.env_remove("HOME");
        command
            .stdin(stdio_from(&pty.slave)?)
            .stdout(stdio_from(&pty.slave)?)
            .stderr(stdio_from(&pty.slave)?)
            .kill_on_drop(true);
        let child = command.spawn().map_err(|source| P2pError::Spawn {
            program: program.to_string(),
            source,
        })?;
        debug!("control client {program:?} started, pid={:?}", child.id());

        let stream = PtyStream::new(pty.master)?;
        let (read_half, write_half) = tokio::io::split(stream);
        Ok(LineChannel {
            reader: Box::new(read_half),
            writer: Box::new(write_half),
            buffer: Vec::new(),
            pushback: VecDeque::new(),
            child: Some(child),
            slave: Some(pty.slave),
            terminating: false,
        })
    }

    /// Build a channel over arbitrary IO halves; no child is supervised.
    pub fn from_io(
        reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Sync + Unpin>,
    ) -> LineChannel {
        LineChannel {
            reader,
            writer,
            buffer: Vec::new(),
            pushback: VecDeque::new(),
            child: None,
            slave: None,
            terminating: false,
        }
    }

    /// Read one line, serving pushed-back lines first. A read capped by
    /// `timeout` that expires yields [`LineRead::Timeout`].
    pub async fn read_line(&mut self, timeout: Duration) -> Result<LineRead, P2pError> {
        if let Some(line) = self.pushback.pop_front() {
            trace!("pop: {line:?}");
            return Ok(LineRead::Line(line));
        }
        self.read_line_raw(timeout).await
    }

    /// Read one line from the transport, bypassing the pushback queue.
    /// Synchronous sub-protocols use this so lines they return to the
    /// main dispatcher are not served back to themselves.
    pub async fn read_line_raw(&mut self, timeout: Duration) -> Result<LineRead, P2pError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut raw: Vec<u8> = self.buffer.drain(..=pos).collect();
                raw.pop();
                raw.retain(|&b| b != b'\r');
                return Ok(LineRead::Line(String::from_utf8_lossy(&raw).into_owned()));
            }
            let mut chunk = [0u8; 1024];
            match tokio::time::timeout(timeout, self.reader.read(&mut chunk)).await {
                Err(_elapsed) => return Ok(LineRead::Timeout),
                Ok(Ok(0)) => return Ok(LineRead::Eof),
                Ok(Ok(n)) => self.buffer.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => {
                    if matches!(e.raw_os_error(), Some(libc::EBADF) | Some(libc::EIO)) {
                        debug!("read interrupted: {e}");
                        return Ok(LineRead::Eof);
                    }
                    if self.terminating {
                        debug!("read interrupted while terminating: {e}");
                        return Ok(LineRead::Eof);
                    }
                    return Err(e.into());
                }
            }
        }
    }

    /// Write one line (newline appended). Soft-fails once termination is
    /// in progress.
    pub async fn write_line(&mut self, line: &str) -> Result<(), P2pError> {
        trace!("write: {line:?}");
        let mut payload = line.as_bytes().to_vec();
        payload.push(b'\n');
        let result = async {
            self.writer.write_all(&payload).await?;
            self.writer.flush().await
        }
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if self.terminating => {
                debug!("write skipped during termination: {e}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Return a line to the head of the queue for the main dispatcher.
    pub fn push_back(&mut self, line: String) {
        trace!("push: {line:?}");
        self.pushback.push_back(line);
    }

    pub fn pushback_len(&self) -> usize {
        self.pushback.len()
    }

    /// Non-blocking child exit check; a `Some` status is fatal.
    pub fn poll_child(&mut self) -> Option<std::process::ExitStatus> {
        self.child
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten())
    }

    /// Duplicate the slave fd, e.g. to hand it to the Enroller child as
    /// its stdout so its records surface as input lines here.
    pub fn slave_stdio(&self) -> Result<Stdio, P2pError> {
        let slave = self
            .slave
            .as_ref()
            .ok_or_else(|| P2pError::ChannelClosed("no pty slave".to_string()))?;
        Ok(stdio_from(slave)?)
    }

    /// Flag the channel as terminating: writes become no-ops on error and
    /// read failures report EOF instead of raising.
    pub fn begin_termination(&mut self) {
        self.terminating = true;
    }

    /// Tear down: close fds and stop the control client.
    pub async fn shutdown(&mut self) {
        self.terminating = true;
        self.slave = None;
        if let Some(mut child) = self.child.take() {
            if let Some(id) = child.id() {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(id as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
            match tokio::time::timeout(Duration::from_secs(1), child.wait()).await {
                Ok(Ok(status)) => debug!("control client exited with {status}"),
                _ => debug!("control client did not terminate in time"),
            }
        }
    }
}

fn stdio_from(fd: &OwnedFd) -> io::Result<Stdio> {
    let duplicate = unsafe { libc::dup(fd.as_raw_fd()) };
    if duplicate < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: dup returned a fresh descriptor we exclusively own.
    Ok(unsafe { std::os::fd::FromRawFd::from_raw_fd(duplicate) })
}

fn disable_echo(slave: &OwnedFd) -> Result<(), nix::Error> {
    let mut attrs = termios::tcgetattr(slave)?;
    attrs.local_flags.remove(LocalFlags::ECHO);
    termios::tcsetattr(slave, SetArg::TCSADRAIN, &attrs)
}

/// `AsyncRead`/`AsyncWrite` over the pty master fd.
struct PtyStream {
    fd: AsyncFd<OwnedFd>,
}

impl PtyStream {
    fn new(master: OwnedFd) -> Result<PtyStream, P2pError> {
        set_nonblocking(&master)?;
        Ok(PtyStream {
            fd: AsyncFd::new(master)?,
        })
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl AsyncRead for PtyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = match self.fd.poll_read_ready(cx) {
                Poll::Ready(ready) => ready?,
                Poll::Pending => return Poll::Pending,
            };
            let mut chunk = [0u8; 1024];
            let read = guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        chunk.as_mut_ptr().cast(),
                        chunk.len().min(buf.remaining()),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match read {
                Ok(Ok(n)) => {
                    buf.put_slice(&chunk[..n]);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for PtyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = match self.fd.poll_write_ready(cx) {
                Poll::Ready(ready) => ready?,
                Poll::Pending => return Poll::Pending,
            };
            let written = guard.try_io(|inner| {
                let n = unsafe { libc::write(inner.as_raw_fd(), data.as_ptr().cast(), data.len()) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match written {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn duplex_channel() -> (LineChannel, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(near);
        (
            LineChannel::from_io(Box::new(read_half), Box::new(write_half)),
            far,
        )
    }

    #[tokio::test]
    async fn reads_lines_and_strips_carriage_returns() {
        let (mut channel, mut far) = duplex_channel();
        far.write_all(b"Interactive mode\r\n<3>P2P-FIND-STOPPED\n").await.unwrap();
        assert_eq!(
            channel.read_line(Duration::from_secs(1)).await.unwrap(),
            LineRead::Line("Interactive mode".to_string())
        );
        assert_eq!(
            channel.read_line(Duration::from_secs(1)).await.unwrap(),
            LineRead::Line("<3>P2P-FIND-STOPPED".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_returns_synthetic_token() {
        let (mut channel, _far) = duplex_channel();
        assert_eq!(
            channel.read_line(Duration::from_secs(10)).await.unwrap(),
            LineRead::Timeout
        );
    }

    #[tokio::test(start_paused = true)]
    async fn partial_line_survives_a_timeout() {
        let (mut channel, mut far) = duplex_channel();
        far.write_all(b"P2P-DEV").await.unwrap();
        assert_eq!(
            channel.read_line(Duration::from_secs(10)).await.unwrap(),
            LineRead::Timeout
        );
        far.write_all(b"ICE-FOUND\n").await.unwrap();
        assert_eq!(
            channel.read_line(Duration::from_secs(10)).await.unwrap(),
            LineRead::Line("P2P-DEVICE-FOUND".to_string())
        );
    }

    #[tokio::test]
    async fn eof_when_peer_closes() {
        let (mut channel, far) = duplex_channel();
        drop(far);
        assert_eq!(
            channel.read_line(Duration::from_secs(1)).await.unwrap(),
            LineRead::Eof
        );
    }

    #[tokio::test]
    async fn pushback_is_served_in_order_before_the_transport() {
        let (mut channel, mut far) = duplex_channel();
        far.write_all(b"from-os\n").await.unwrap();
        channel.push_back("first".to_string());
        channel.push_back("second".to_string());
        assert_eq!(channel.pushback_len(), 2);
        assert_eq!(
            channel.read_line(Duration::from_secs(1)).await.unwrap(),
            LineRead::Line("first".to_string())
        );
        assert_eq!(
            channel.read_line(Duration::from_secs(1)).await.unwrap(),
            LineRead::Line("second".to_string())
        );
        assert_eq!(
            channel.read_line(Duration::from_secs(1)).await.unwrap(),
            LineRead::Line("from-os".to_string())
        );
    }

    #[tokio::test]
    async fn write_line_appends_newline() {
        let (mut channel, mut far) = duplex_channel();
        channel.write_line("p2p_find").await.unwrap();
        let mut buf = [0u8; 16];
        let n = far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"p2p_find\n");
    }

    #[tokio::test]
    async fn write_soft_fails_during_termination() {
        let (mut channel, far) = duplex_channel();
        drop(far);
        channel.begin_termination();
        // The peer is gone; without the termination flag this would error.
        channel.write_line("ping").await.unwrap();
        channel.write_line("ping").await.unwrap();
    }
}
