use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::stream::PeerStream;
use super::tunnel::{adb, usbmux};
use crate::config::{ConnectionConfig, ConnectionMode};
use crate::error::{AppError, Result};
use crate::utils::{bind_tcp_listener, connect_timeout};

/// Sleep between non-blocking accept attempts
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Connect to `addr` as a TCP client, in blocking mode once connected
pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<PeerStream> {
    debug!("Connecting to {}", addr);
    let stream = connect_timeout(addr, timeout)?;
    let _ = stream.set_nodelay(true);
    Ok(PeerStream::Tcp(stream))
}

/// Non-blocking listener accepting one phone at a time
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Listen on all interfaces at `port`
    pub fn bind(port: u16) -> Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        Self::bind_addr(addr)
    }

    pub fn bind_addr(addr: SocketAddr) -> Result<Self> {
        let inner = bind_tcp_listener(addr).map_err(|e| AppError::BindFailed {
            port: addr.port(),
            reason: e.to_string(),
        })?;
        info!("Waiting for connection on {}", addr);
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Accept a pending peer, or fail with [`AppError::WouldBlock`]
    pub fn try_accept(&self) -> Result<PeerStream> {
        match self.inner.accept() {
            Ok((stream, peer)) => {
                info!("Accepted connection from {}", peer);
                stream.set_nonblocking(false)?;
                let _ = stream.set_nodelay(true);
                Ok(PeerStream::Tcp(stream))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(AppError::WouldBlock),
            Err(e) => Err(AppError::Transport(format!("accept: {}", e))),
        }
    }
}

/// Establishes byte streams to the phone for the ingest threads.
///
/// Client modes open a new connection per call. Server mode keeps a single
/// listener alive across sessions until [`Negotiator::release`].
#[derive(Debug)]
pub struct Negotiator {
    mode: ConnectionMode,
    host: IpAddr,
    port: u16,
    udp_port: u16,
    connect_timeout: Duration,
    listener: Mutex<Option<Listener>>,
}

impl Negotiator {
    pub fn new(config: &ConnectionConfig) -> Self {
        let host = match config.mode {
            ConnectionMode::Adb => IpAddr::V4(Ipv4Addr::LOCALHOST),
            _ => config.host,
        };
        Self {
            mode: config.mode,
            host,
            port: config.port,
            udp_port: config.port.wrapping_add(1),
            connect_timeout: config.connect_timeout(),
            listener: Mutex::new(None),
        }
    }

    /// Override the UDP audio port (defaults to the TCP port plus one)
    pub fn with_udp_port(mut self, port: u16) -> Self {
        self.udp_port = port;
        self
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    /// Address of the phone's TCP service in client modes
    pub fn peer_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Set up the USB tunnel, if any.
    ///
    /// Runs before the ingest threads start so tunnel errors reach the
    /// caller instead of ending a session.
    pub fn prepare(&self) -> Result<()> {
        match self.mode {
            ConnectionMode::Adb => adb::forward(self.port)?,
            ConnectionMode::Ios => {
                usbmux::probe()?;
            }
            ConnectionMode::Wifi | ConnectionMode::Server => {}
        }
        Ok(())
    }

    /// Open a new client connection to the phone
    pub fn open(&self) -> Result<PeerStream> {
        match self.mode {
            ConnectionMode::Wifi | ConnectionMode::Adb => {
                connect(self.peer_addr(), self.connect_timeout)
            }
            ConnectionMode::Ios => Ok(PeerStream::Unix(usbmux::connect(self.port)?)),
            ConnectionMode::Server => Err(AppError::Config(
                "server mode accepts connections, it cannot open them".into(),
            )),
        }
    }

    /// Wait for the phone to connect, polling until `running` clears.
    ///
    /// The listener lock is held for a single accept attempt only.
    /// Returns `Ok(None)` when stopped before a peer arrived.
    pub fn accept(&self, running: &AtomicBool) -> Result<Option<PeerStream>> {
        while running.load(Ordering::Acquire) {
            match self.try_accept() {
                Ok(stream) => return Ok(Some(stream)),
                Err(AppError::WouldBlock) => std::thread::sleep(ACCEPT_POLL),
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn try_accept(&self) -> Result<PeerStream> {
        let mut guard = self.listener.lock();
        if guard.is_none() {
            *guard = Some(Listener::bind(self.port)?);
        }
        match guard.as_ref() {
            Some(listener) => listener.try_accept(),
            None => Err(AppError::WouldBlock),
        }
    }

    /// Either accept (server mode) or open (client modes) the video connection.
    ///
    /// Only the video thread accepts; every other connection uses [`Negotiator::open`].
    pub fn establish(&self, running: &AtomicBool) -> Result<Option<PeerStream>> {
        match self.mode {
            ConnectionMode::Server => self.accept(running),
            _ => self.open().map(Some),
        }
    }

    /// Close the server listener
    pub fn release(&self) {
        if self.listener.lock().take().is_some() {
            debug!("Listener on port {} closed", self.port);
        }
    }

    /// Destination for UDP audio, or `None` when audio must go over TCP
    /// (USB tunnels and loopback peers)
    pub fn audio_udp_target(&self) -> Option<SocketAddr> {
        if self.mode.is_tunnel() || self.mode == ConnectionMode::Server {
            return None;
        }
        if self.host == IpAddr::V4(Ipv4Addr::LOCALHOST) {
            return None;
        }
        Some(SocketAddr::new(self.host, self.udp_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::Arc;

    fn config(mode: ConnectionMode, host: [u8; 4], port: u16) -> ConnectionConfig {
        ConnectionConfig {
            mode,
            host: IpAddr::from(host),
            port,
            connect_timeout_ms: 2000,
        }
    }

    #[test]
    fn test_open_wifi() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let negotiator = Negotiator::new(&config(ConnectionMode::Wifi, [127, 0, 0, 1], port));

        let mut stream = negotiator.open().unwrap();
        let (mut server, _) = listener.accept().unwrap();
        stream.send_text("ping").unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_accept_and_stop() {
        let probe = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let negotiator = Arc::new(Negotiator::new(&config(
            ConnectionMode::Server,
            [0, 0, 0, 0],
            port,
        )));
        let running = Arc::new(AtomicBool::new(true));

        let client = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
            s.write_all(b"hi").unwrap();
        });
        let mut stream = negotiator.accept(&running).unwrap().unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
        client.join().unwrap();

        let stopper = {
            let running = running.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                running.store(false, Ordering::Release);
            })
        };
        assert!(negotiator.accept(&running).unwrap().is_none());
        stopper.join().unwrap();

        negotiator.release();
        negotiator.release();
    }

    #[test]
    fn test_bind_conflict() {
        let taken = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let err = Listener::bind(port).unwrap_err();
        assert!(matches!(err, AppError::BindFailed { port: p, .. } if p == port));
    }

    #[test]
    fn test_try_accept_would_block() {
        let listener =
            Listener::bind_addr(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        assert!(matches!(listener.try_accept(), Err(AppError::WouldBlock)));
    }

    #[test]
    fn test_audio_udp_target() {
        let wifi = Negotiator::new(&config(ConnectionMode::Wifi, [192, 168, 1, 20], 4747));
        assert_eq!(
            wifi.audio_udp_target(),
            Some(SocketAddr::from(([192, 168, 1, 20], 4748)))
        );

        let adb = Negotiator::new(&config(ConnectionMode::Adb, [192, 168, 1, 20], 4747));
        assert_eq!(adb.audio_udp_target(), None);
        assert_eq!(adb.peer_addr(), SocketAddr::from(([127, 0, 0, 1], 4747)));

        let loopback = Negotiator::new(&config(ConnectionMode::Wifi, [127, 0, 0, 1], 4747));
        assert_eq!(loopback.audio_udp_target(), None);

        let custom = Negotiator::new(&config(ConnectionMode::Wifi, [127, 0, 0, 2], 4747))
            .with_udp_port(9000);
        assert_eq!(
            custom.audio_udp_target(),
            Some(SocketAddr::from(([127, 0, 0, 2], 9000)))
        );
    }

    #[test]
    fn test_accept_releases_listener_between_polls() {
        let negotiator = Arc::new(Negotiator::new(&config(
            ConnectionMode::Server,
            [127, 0, 0, 1],
            0,
        )));
        let running = Arc::new(AtomicBool::new(true));

        let waiter = {
            let negotiator = negotiator.clone();
            let running = running.clone();
            std::thread::spawn(move || negotiator.accept(&running).unwrap().is_none())
        };
        std::thread::sleep(Duration::from_millis(100));

        let (tx, rx) = std::sync::mpsc::channel();
        let releaser = {
            let negotiator = negotiator.clone();
            std::thread::spawn(move || {
                negotiator.release();
                tx.send(()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_ok());
        releaser.join().unwrap();

        running.store(false, Ordering::Release);
        assert!(waiter.join().unwrap());
        negotiator.release();
    }
}
