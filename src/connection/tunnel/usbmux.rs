//! iOS USB tunnel through the usbmuxd daemon.
//!
//! Speaks the binary (version 0) usbmux protocol: a 16-byte little-endian
//! header `{length, version, message, tag}` followed by the payload. A
//! `Listen` request streams `DeviceAdd` messages for attached devices; a
//! `Connect` request turns the daemon socket itself into a byte pipe to a
//! TCP port on the device.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::TunnelError;

/// Default daemon socket
pub const USBMUXD_SOCKET: &str = "/var/run/usbmuxd";

const HEADER_LEN: usize = 16;
const PROTOCOL_VERSION: u32 = 0;

const MSG_RESULT: u32 = 1;
const MSG_CONNECT: u32 = 2;
const MSG_LISTEN: u32 = 3;
const MSG_DEVICE_ADD: u32 = 4;

/// How long to wait for the daemon to announce an attached device
const DEVICE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
struct Packet {
    message: u32,
    tag: u32,
    payload: Vec<u8>,
}

fn encode_packet(message: u32, tag: u32, payload: &[u8]) -> Vec<u8> {
    let length = (HEADER_LEN + payload.len()) as u32;
    let mut buf = Vec::with_capacity(length as usize);
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    buf.extend_from_slice(&message.to_le_bytes());
    buf.extend_from_slice(&tag.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn read_packet<R: Read>(reader: &mut R) -> io::Result<Packet> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;

    let field = |i: usize| u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
    let length = field(0) as usize;
    if length < HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("usbmux packet length {} too short", length),
        ));
    }

    let mut payload = vec![0u8; length - HEADER_LEN];
    reader.read_exact(&mut payload)?;
    Ok(Packet {
        message: field(8),
        tag: field(12),
        payload,
    })
}

fn result_code(packet: &Packet) -> Option<u32> {
    if packet.message != MSG_RESULT || packet.payload.len() < 4 {
        return None;
    }
    let p = &packet.payload;
    Some(u32::from_le_bytes([p[0], p[1], p[2], p[3]]))
}

/// Connect payload: device id, big-endian port, reserved
fn connect_payload(device_id: u32, port: u16) -> [u8; 8] {
    let mut payload = [0u8; 8];
    payload[0..4].copy_from_slice(&device_id.to_le_bytes());
    payload[4..6].copy_from_slice(&port.to_be_bytes());
    payload
}

fn open_daemon(path: &Path) -> Result<UnixStream, TunnelError> {
    UnixStream::connect(path)
        .map_err(|e| TunnelError::LoadError(format!("{}: {}", path.display(), e)))
}

/// Id of the first device the daemon reports
pub fn first_device(path: &Path) -> Result<u32, TunnelError> {
    let mut sock = open_daemon(path)?;
    let load_err = |e: io::Error| TunnelError::LoadError(e.to_string());

    sock.set_read_timeout(Some(Duration::from_millis(200)))
        .map_err(load_err)?;
    sock.write_all(&encode_packet(MSG_LISTEN, 1, &[]))
        .map_err(load_err)?;

    let deadline = Instant::now() + DEVICE_WAIT;
    while Instant::now() < deadline {
        let packet = match read_packet(&mut sock) {
            Ok(packet) => packet,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue
            }
            Err(e) => return Err(load_err(e)),
        };

        match packet.message {
            MSG_RESULT => {
                if result_code(&packet) != Some(0) {
                    return Err(TunnelError::LoadError(format!(
                        "listen rejected with {:?}",
                        result_code(&packet)
                    )));
                }
            }
            MSG_DEVICE_ADD if packet.payload.len() >= 4 => {
                let p = &packet.payload;
                let id = u32::from_le_bytes([p[0], p[1], p[2], p[3]]);
                debug!("usbmuxd reported device {}", id);
                return Ok(id);
            }
            _ => {}
        }
    }
    Err(TunnelError::NoDevices)
}

/// Check that usbmuxd is running and reports at least one device
pub fn probe() -> Result<u32, TunnelError> {
    first_device(Path::new(USBMUXD_SOCKET))
}

/// Open a tunnelled connection to `port` on the first attached iOS device
pub fn connect(port: u16) -> Result<UnixStream, TunnelError> {
    connect_via(Path::new(USBMUXD_SOCKET), port)
}

/// [`connect`] against an explicit daemon socket path
pub fn connect_via(path: &Path, port: u16) -> Result<UnixStream, TunnelError> {
    let device_id = first_device(path)?;

    let mut sock = open_daemon(path)?;
    let forward_err = |e: io::Error| TunnelError::ForwardFailed(e.to_string());

    sock.write_all(&encode_packet(MSG_CONNECT, 2, &connect_payload(device_id, port)))
        .map_err(forward_err)?;
    let reply = read_packet(&mut sock).map_err(forward_err)?;
    match result_code(&reply) {
        Some(0) => {}
        other => {
            return Err(TunnelError::ForwardFailed(format!(
                "device {} refused port {} ({:?})",
                device_id, port, other
            )))
        }
    }

    sock.set_read_timeout(None).map_err(forward_err)?;
    info!("usbmux tunnel to device {} port {} open", device_id, port);
    Ok(sock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    fn device_add(id: u32) -> Vec<u8> {
        let mut payload = vec![0u8; 268];
        payload[0..4].copy_from_slice(&id.to_le_bytes());
        encode_packet(MSG_DEVICE_ADD, 0, &payload)
    }

    fn result(tag: u32, code: u32) -> Vec<u8> {
        encode_packet(MSG_RESULT, tag, &code.to_le_bytes())
    }

    #[test]
    fn test_packet_layout() {
        let packet = encode_packet(MSG_CONNECT, 7, &connect_payload(3, 4747));
        assert_eq!(packet.len(), 24);
        assert_eq!(&packet[0..4], &24u32.to_le_bytes());
        assert_eq!(&packet[8..12], &MSG_CONNECT.to_le_bytes());
        assert_eq!(&packet[20..22], &4747u16.to_be_bytes());

        let parsed = read_packet(&mut packet.as_slice()).unwrap();
        assert_eq!(parsed.tag, 7);
        assert_eq!(parsed.payload.len(), 8);
    }

    #[test]
    fn test_connect_through_fake_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbmuxd");
        let listener = UnixListener::bind(&path).unwrap();

        let daemon = std::thread::spawn(move || {
            let (mut listen, _) = listener.accept().unwrap();
            let request = read_packet(&mut listen).unwrap();
            assert_eq!(request.message, MSG_LISTEN);
            listen.write_all(&result(request.tag, 0)).unwrap();
            listen.write_all(&device_add(5)).unwrap();

            let (mut conn, _) = listener.accept().unwrap();
            let request = read_packet(&mut conn).unwrap();
            assert_eq!(request.message, MSG_CONNECT);
            assert_eq!(request.payload, connect_payload(5, 4747).to_vec());
            conn.write_all(&result(request.tag, 0)).unwrap();
            conn.write_all(b"hello").unwrap();
        });

        let mut stream = connect_via(&path, 4747).unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        daemon.join().unwrap();
    }

    #[test]
    fn test_no_devices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbmuxd");
        let listener = UnixListener::bind(&path).unwrap();

        let daemon = std::thread::spawn(move || {
            let (mut listen, _) = listener.accept().unwrap();
            let request = read_packet(&mut listen).unwrap();
            listen.write_all(&result(request.tag, 0)).unwrap();
            std::thread::sleep(DEVICE_WAIT + Duration::from_millis(300));
        });

        assert_eq!(connect_via(&path, 4747).unwrap_err(), TunnelError::NoDevices);
        daemon.join().unwrap();
    }

    #[test]
    fn test_missing_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let err = connect_via(&dir.path().join("absent"), 4747).unwrap_err();
        assert!(matches!(err, TunnelError::LoadError(_)));
    }
}
