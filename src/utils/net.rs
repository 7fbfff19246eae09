//! Socket helpers built on raw nix sockets.
//!
//! Connecting goes through a non-blocking socket plus an explicit poll for
//! writability because some USB tunnel endpoints accept the SYN and then never
//! complete the handshake, leaving a blocking `connect()` hanging for minutes.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    self, sockopt, AddressFamily, Backlog, SockFlag, SockProtocol, SockType, SockaddrIn,
    SockaddrIn6,
};

use crate::error::{AppError, Result};

fn socket_addr_family(addr: &SocketAddr) -> AddressFamily {
    match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    }
}

fn bind_fd(fd: &OwnedFd, addr: SocketAddr) -> io::Result<()> {
    match addr {
        SocketAddr::V4(v4) => {
            let sockaddr = SockaddrIn::from(v4);
            socket::bind(fd.as_raw_fd(), &sockaddr).map_err(io::Error::from)
        }
        SocketAddr::V6(v6) => {
            let sockaddr = SockaddrIn6::from(v6);
            socket::bind(fd.as_raw_fd(), &sockaddr).map_err(io::Error::from)
        }
    }
}

/// Bind a non-blocking TCP listener that accepts a single peer at a time.
pub fn bind_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let fd = socket::socket(
        socket_addr_family(&addr),
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::Tcp,
    )
    .map_err(io::Error::from)?;

    socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(io::Error::from)?;
    if matches!(addr, SocketAddr::V6(_)) {
        socket::setsockopt(&fd, sockopt::Ipv6V6Only, &true).map_err(io::Error::from)?;
    }

    bind_fd(&fd, addr)?;
    let backlog = Backlog::new(1).map_err(io::Error::from)?;
    socket::listen(&fd, backlog).map_err(io::Error::from)?;

    let listener = TcpListener::from(fd);
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Bind a non-blocking UDP socket.
pub fn bind_udp_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let fd = socket::socket(
        socket_addr_family(&addr),
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::Udp,
    )
    .map_err(io::Error::from)?;

    if matches!(addr, SocketAddr::V6(_)) {
        socket::setsockopt(&fd, sockopt::Ipv6V6Only, &true).map_err(io::Error::from)?;
    }

    bind_fd(&fd, addr)?;

    let socket = UdpSocket::from(fd);
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Connect to `addr`, waiting at most `timeout` for the socket to become writable.
///
/// The returned stream is back in blocking mode.
pub fn connect_timeout(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let fd = socket::socket(
        socket_addr_family(&addr),
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        SockProtocol::Tcp,
    )
    .map_err(|e| AppError::Transport(format!("socket(): {}", e)))?;

    let started = match addr {
        SocketAddr::V4(v4) => socket::connect(fd.as_raw_fd(), &SockaddrIn::from(v4)),
        SocketAddr::V6(v6) => socket::connect(fd.as_raw_fd(), &SockaddrIn6::from(v6)),
    };

    match started {
        Ok(()) => {}
        Err(Errno::EINPROGRESS) | Err(Errno::EAGAIN) => {
            wait_writable(&fd, addr, timeout)?;
        }
        Err(Errno::ECONNREFUSED) => return Err(AppError::ConnectRefused(addr.to_string())),
        Err(e) => return Err(AppError::Transport(format!("connect {}: {}", addr, e))),
    }

    let stream = TcpStream::from(fd);
    stream.set_nonblocking(false)?;
    Ok(stream)
}

fn wait_writable(fd: &OwnedFd, addr: SocketAddr, timeout: Duration) -> Result<()> {
    let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
    let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLOUT)];

    let ready = loop {
        match nix::poll::poll(&mut fds, PollTimeout::from(millis)) {
            Ok(n) => break n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(AppError::Transport(format!("poll {}: {}", addr, e))),
        }
    };
    if ready == 0 {
        return Err(AppError::ConnectTimeout(addr.to_string()));
    }

    let pending = socket::getsockopt(fd, sockopt::SocketError)
        .map_err(|e| AppError::Transport(format!("SO_ERROR {}: {}", addr, e)))?;
    match pending {
        0 => Ok(()),
        code if code == Errno::ECONNREFUSED as i32 => {
            Err(AppError::ConnectRefused(addr.to_string()))
        }
        code if code == Errno::ETIMEDOUT as i32 => Err(AppError::ConnectTimeout(addr.to_string())),
        code => Err(AppError::Transport(format!(
            "connect {}: {}",
            addr,
            Errno::from_raw(code)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    #[test]
    fn test_connect_to_listener() {
        let listener = bind_tcp_listener(loopback(0)).unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = connect_timeout(addr, Duration::from_secs(2)).unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[test]
    fn test_connect_refused() {
        // Grab a free port, then close it again.
        let addr = {
            let listener = bind_tcp_listener(loopback(0)).unwrap();
            listener.local_addr().unwrap()
        };

        let err = connect_timeout(addr, Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, AppError::ConnectRefused(_)), "{err}");
    }

    #[test]
    fn test_listener_is_non_blocking() {
        let listener = bind_tcp_listener(loopback(0)).unwrap();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_udp_socket_is_non_blocking() {
        let socket = bind_udp_socket(loopback(0)).unwrap();
        let mut buf = [0u8; 16];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
