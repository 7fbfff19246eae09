use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{AppError, Result};

/// Byte stream to the phone: plain TCP, or a usbmuxd-tunnelled Unix socket
#[derive(Debug)]
pub enum PeerStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl PeerStream {
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            PeerStream::Tcp(s) => s.set_nonblocking(nonblocking),
            PeerStream::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            PeerStream::Tcp(s) => s.set_read_timeout(timeout),
            PeerStream::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    pub fn shutdown(&self) {
        let _ = match self {
            PeerStream::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
            PeerStream::Unix(s) => s.shutdown(std::net::Shutdown::Both),
        };
    }

    /// Write a complete request line
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.write_all(text.as_bytes())
            .and_then(|_| self.flush())
            .map_err(|e| AppError::Transport(format!("send '{}': {}", text, e)))
    }

    /// Fill `buf` completely, giving up when `running` clears or the peer
    /// stays silent for longer than `stall_timeout`.
    ///
    /// Requires a read timeout to be set, so the flag is re-checked between reads.
    /// Returns `Ok(false)` when the peer closed the stream or was stopped.
    pub fn read_full(
        &mut self,
        buf: &mut [u8],
        running: &AtomicBool,
        stall_timeout: Duration,
    ) -> Result<bool> {
        let mut filled = 0;
        let mut last_progress = Instant::now();

        while filled < buf.len() {
            if !running.load(Ordering::Acquire) {
                return Ok(false);
            }
            match self.read(&mut buf[filled..]) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    filled += n;
                    last_progress = Instant::now();
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    if last_progress.elapsed() >= stall_timeout {
                        tracing::warn!(
                            "Peer silent for {:?}, treating stream as closed",
                            stall_timeout
                        );
                        return Ok(false);
                    }
                }
                Err(e) => return Err(AppError::Transport(format!("recv: {}", e))),
            }
        }
        Ok(true)
    }
}

impl Read for PeerStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PeerStream::Tcp(s) => s.read(buf),
            PeerStream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for PeerStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            PeerStream::Tcp(s) => s.write(buf),
            PeerStream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            PeerStream::Tcp(s) => s.flush(),
            PeerStream::Unix(s) => s.flush(),
        }
    }
}

impl From<TcpStream> for PeerStream {
    fn from(s: TcpStream) -> Self {
        PeerStream::Tcp(s)
    }
}

impl From<UnixStream> for PeerStream {
    fn from(s: UnixStream) -> Self {
        PeerStream::Unix(s)
    }
}
