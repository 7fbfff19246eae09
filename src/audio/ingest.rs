//! Audio ingest thread: transport negotiation (UDP probe, TCP fallback),
//! packet decoding and the per-period feed of the audio sink with loss
//! concealment.

use std::io::{self, Read};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::codec::{apply_boost, SpeechDecoder, CHUNKS_PER_PACKET, CHUNK_BYTES, FRAME_SAMPLES};
use super::device::{AudioSink, SinkPoll};
use super::jitter::JitterState;
use super::AudioTransportMode;
use crate::connection::{Negotiator, PeerStream};
use crate::error::{AppError, ErrorReporter, Result};
use crate::protocol::{self, AUDIO_HEADER_LEN, AUDIO_REQUEST, STOP_REQUEST};
use crate::session::SessionHandle;
use crate::utils::{bind_udp_socket, LogThrottler};
use crate::warn_throttled;

const VIDEO_WAIT: Duration = Duration::from_millis(200);
const PROBE_ROUNDS: usize = 3;
const PROBE_POLLS: usize = 12;
const PROBE_POLL: Duration = Duration::from_millis(32);
const HANDSHAKE_READ_POLL: Duration = Duration::from_millis(100);
/// Loop sleep between sink transfers
const TICK: Duration = Duration::from_millis(2);
/// Sleep while the sink has no room
const SINK_BUSY_WAIT: Duration = Duration::from_millis(1);
const RECV_BUF_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct AudioIngestSettings {
    /// Gain applied to decoded PCM, in percent
    pub boost_percent: u32,
    /// Hold negotiation until the video session is streaming
    pub wait_for_video: bool,
    pub stall_timeout: Duration,
}

enum AudioState {
    WaitingForVideo,
    Probing,
    Handshaking,
    Streaming(Transport),
    Closing(Option<Transport>),
    Terminated,
}

/// The audio connection, owned by the ingest thread
enum Transport {
    Udp(UdpSocket),
    Tcp(PeerStream),
}

impl Transport {
    fn mode(&self) -> AudioTransportMode {
        match self {
            Transport::Udp(_) => AudioTransportMode::Udp,
            Transport::Tcp(_) => AudioTransportMode::Tcp,
        }
    }

    /// Non-blocking receive; `Ok(0)` means nothing arrived this tick
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let result = match self {
            Transport::Udp(socket) => socket.recv(buf),
            Transport::Tcp(stream) => match stream.read(buf) {
                Ok(0) => return Err(AppError::Transport("audio connection reset".into())),
                other => other,
            },
        };
        match result {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Ok(0)
            }
            Err(e) => Err(AppError::Transport(format!("audio recv: {}", e))),
        }
    }

    fn send_udp(&self, text: &str) -> Result<()> {
        if let Transport::Udp(socket) = self {
            socket
                .send(text.as_bytes())
                .map_err(|e| AppError::Transport(format!("send '{}': {}", text, e)))?;
        }
        Ok(())
    }

    fn close(self) {
        match self {
            Transport::Udp(socket) => {
                if let Err(e) = socket.send(STOP_REQUEST.as_bytes()) {
                    debug!("Failed to send audio stop: {}", e);
                }
            }
            Transport::Tcp(stream) => stream.shutdown(),
        }
    }
}

pub struct AudioIngest {
    handle: Arc<SessionHandle>,
    negotiator: Arc<Negotiator>,
    settings: AudioIngestSettings,
    decoder: Box<dyn SpeechDecoder>,
    sink: Box<dyn AudioSink>,
    reporter: Arc<dyn ErrorReporter>,
    throttler: LogThrottler,
}

impl AudioIngest {
    pub fn new(
        handle: Arc<SessionHandle>,
        negotiator: Arc<Negotiator>,
        settings: AudioIngestSettings,
        decoder: Box<dyn SpeechDecoder>,
        sink: Box<dyn AudioSink>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            handle,
            negotiator,
            settings,
            decoder,
            sink,
            reporter,
            throttler: LogThrottler::default(),
        }
    }

    fn running(&self) -> bool {
        self.handle.audio_running().load(Ordering::Acquire)
    }

    /// Run until stopped or the audio session fails. Never reconnects.
    pub fn run(mut self) {
        let mut state = AudioState::WaitingForVideo;

        loop {
            state = match state {
                AudioState::WaitingForVideo => self.wait_for_video(),
                AudioState::Probing => self.probe(),
                AudioState::Handshaking => self.handshake(),
                AudioState::Streaming(mut transport) => {
                    info!("Audio streaming over {:?}", transport.mode());
                    if let Err(e) = self.stream(&mut transport) {
                        self.reporter.report("Audio stream failed", &e);
                    }
                    AudioState::Closing(Some(transport))
                }
                AudioState::Closing(transport) => {
                    self.handle.set_audio_active(false);
                    if let Some(transport) = transport {
                        transport.close();
                    }
                    AudioState::Terminated
                }
                AudioState::Terminated => break,
            };
        }

        self.handle.audio_running().store(false, Ordering::Release);
        debug!("Audio ingest thread exiting");
    }

    fn wait_for_video(&self) -> AudioState {
        if self.settings.wait_for_video {
            while self.handle.video_running().load(Ordering::Acquire) {
                std::thread::sleep(VIDEO_WAIT);
                if self.handle.video_active() {
                    break;
                }
                if !self.running() {
                    return AudioState::Terminated;
                }
            }
        }
        if self.running() {
            AudioState::Probing
        } else {
            AudioState::Terminated
        }
    }

    /// Ask for audio over UDP; any reply selects UDP for the session
    fn probe(&self) -> AudioState {
        let Some(target) = self.negotiator.audio_udp_target() else {
            return AudioState::Handshaking;
        };

        let socket = match udp_socket_for(target) {
            Ok(socket) => socket,
            Err(e) => {
                debug!("UDP audio unavailable: {}", e);
                return AudioState::Handshaking;
            }
        };

        let mut buf = [0u8; RECV_BUF_SIZE];
        for round in 0..PROBE_ROUNDS {
            debug!("Audio UDP probe #{} to {}", round, target);
            if let Err(e) = socket.send(AUDIO_REQUEST.as_bytes()) {
                debug!("UDP probe send failed: {}", e);
                return AudioState::Handshaking;
            }
            for _ in 0..PROBE_POLLS {
                std::thread::sleep(PROBE_POLL);
                if !self.running() {
                    return AudioState::Terminated;
                }
                match socket.recv(&mut buf) {
                    Ok(n) if n > 0 => return AudioState::Streaming(Transport::Udp(socket)),
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        debug!("UDP probe failed: {}", e);
                        return AudioState::Handshaking;
                    }
                }
            }
        }
        AudioState::Handshaking
    }

    fn handshake(&self) -> AudioState {
        if !self.running() {
            return AudioState::Terminated;
        }
        debug!("Requesting audio over TCP");

        let mut stream = match self.negotiator.open() {
            Ok(stream) => stream,
            Err(e) => {
                self.reporter.report("Audio connection failed", &e);
                return AudioState::Terminated;
            }
        };

        match self.tcp_handshake(&mut stream) {
            Ok(true) => AudioState::Streaming(Transport::Tcp(stream)),
            Ok(false) => AudioState::Closing(Some(Transport::Tcp(stream))),
            Err(e) => {
                self.reporter.report("Audio handshake failed", &e);
                AudioState::Closing(Some(Transport::Tcp(stream)))
            }
        }
    }

    /// Returns `Ok(false)` when stopped mid-handshake
    fn tcp_handshake(&self, stream: &mut PeerStream) -> Result<bool> {
        stream.set_read_timeout(Some(HANDSHAKE_READ_POLL))?;
        stream.send_text(AUDIO_REQUEST)?;

        let mut header = [0u8; AUDIO_HEADER_LEN];
        if !stream.read_full(
            &mut header,
            self.handle.audio_running(),
            self.settings.stall_timeout,
        )? {
            if !self.running() {
                return Ok(false);
            }
            return Err(AppError::Transport("Audio connection reset".into()));
        }
        protocol::parse_audio_header(&header, CHUNKS_PER_PACKET as u8)?;

        stream.set_read_timeout(None)?;
        stream.set_nonblocking(true)?;
        Ok(true)
    }

    fn stream(&mut self, transport: &mut Transport) -> Result<()> {
        self.decoder.reset()?;
        self.handle.set_audio_active(true);

        let mode = transport.mode();
        let mut jitter = JitterState::new();
        let mut recv_buf = [0u8; RECV_BUF_SIZE];
        let mut pcm = vec![0i16; FRAME_SAMPLES];

        while self.running() {
            let len = transport.recv(&mut recv_buf)?;
            if len > 0 {
                let short_before = jitter.short_datagrams();
                let selected = jitter.select_packet(&recv_buf[..len], mode);
                if jitter.short_datagrams() > short_before && self.throttler.should_log("short") {
                    debug!(
                        "Dropped short audio datagram of {} bytes ({} so far)",
                        len,
                        jitter.short_datagrams()
                    );
                }
                if let Some(packet) = selected {
                    for chunk in packet.chunks(CHUNK_BYTES) {
                        match self.decoder.decode_chunk(chunk, &mut pcm) {
                            Ok(n) => {
                                apply_boost(&mut pcm[..n], self.settings.boost_percent);
                                jitter.push(&pcm[..n]);
                            }
                            Err(e) => {
                                warn_throttled!(self.throttler, "decode", "Audio decode failed: {}", e)
                            }
                        }
                    }
                }
            }

            let mut window = match self.sink.check(&mut jitter.first)? {
                SinkPoll::NotReady => {
                    std::thread::sleep(SINK_BUSY_WAIT);
                    continue;
                }
                SinkPoll::Ready(window) => window,
            };

            if jitter.buffered() == 0 {
                let frame = self.decoder.frame_samples();
                if window.frames() >= frame {
                    window.truncate(frame);
                    match self.decoder.conceal(window.samples_mut()) {
                        Ok(n) => window.truncate(n),
                        Err(e) => {
                            warn_throttled!(self.throttler, "plc", "Concealment failed: {}", e);
                            window.samples_mut().fill(0);
                        }
                    }
                } else {
                    window.samples_mut().fill(0);
                }
            } else {
                let n = jitter.drain_into(window.samples_mut());
                window.truncate(n);
            }

            self.sink.commit(window, &mut jitter.first)?;

            if mode == AudioTransportMode::Udp && jitter.keepalive_due() {
                debug!("Audio keepalive");
                transport.send_udp(AUDIO_REQUEST)?;
            }
            std::thread::sleep(TICK);
        }
        Ok(())
    }
}

/// Non-blocking UDP socket connected to `target`, so only its datagrams arrive
fn udp_socket_for(target: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = if target.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = bind_udp_socket(local)?;
    socket.connect(target)?;
    Ok(socket)
}

impl std::fmt::Debug for AudioIngest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioIngest")
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::codec::PACKET_BYTES;
    use crate::audio::device::TransferWindow;
    use crate::config::{ConnectionConfig, ConnectionMode};
    use crate::error::LogReporter;
    use crate::video::OrientationState;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::net::{IpAddr, TcpListener};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Instant;

    pub const DECODED_SAMPLE: i16 = 7;

    #[derive(Default)]
    pub struct DecoderLog {
        pub decoded: AtomicUsize,
        pub concealed: AtomicUsize,
    }

    pub struct FakeSpeechDecoder(pub Arc<DecoderLog>);

    impl SpeechDecoder for FakeSpeechDecoder {
        fn frame_samples(&self) -> usize {
            FRAME_SAMPLES
        }

        fn decode_chunk(&mut self, _chunk: &[u8], out: &mut [i16]) -> Result<usize> {
            self.0.decoded.fetch_add(1, Ordering::SeqCst);
            out[..FRAME_SAMPLES].fill(DECODED_SAMPLE);
            Ok(FRAME_SAMPLES)
        }

        fn conceal(&mut self, out: &mut [i16]) -> Result<usize> {
            self.0.concealed.fetch_add(1, Ordering::SeqCst);
            out.fill(0);
            Ok(out.len())
        }

        fn reset(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct SinkLog {
        pub checks: AtomicUsize,
        /// (frames, first sample) per commit
        pub commits: Mutex<Vec<(usize, i16)>>,
    }

    pub struct FakeAudioSink {
        pub ready: bool,
        pub log: Arc<SinkLog>,
    }

    impl AudioSink for FakeAudioSink {
        fn check(&mut self, first: &mut bool) -> Result<SinkPoll> {
            self.log.checks.fetch_add(1, Ordering::SeqCst);
            if !self.ready {
                return Ok(SinkPoll::NotReady);
            }
            *first = false;
            Ok(SinkPoll::Ready(TransferWindow::new(0, FRAME_SAMPLES, Vec::new())))
        }

        fn commit(&mut self, window: TransferWindow, _first: &mut bool) -> Result<()> {
            let samples = window.into_samples();
            self.log
                .commits
                .lock()
                .push((samples.len(), samples.first().copied().unwrap_or(0)));
            Ok(())
        }
    }

    fn settings() -> AudioIngestSettings {
        AudioIngestSettings {
            boost_percent: 100,
            wait_for_video: false,
            stall_timeout: Duration::from_secs(2),
        }
    }

    /// Phone side of a TCP audio stream: checks the request, replies with
    /// the header and optional payload, then holds the connection open
    fn audio_peer(
        listener: TcpListener,
        payload: Vec<u8>,
        done: mpsc::Receiver<()>,
    ) -> std::thread::JoinHandle<usize> {
        std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = [0u8; AUDIO_REQUEST.len()];
            conn.read_exact(&mut request).unwrap();
            assert_eq!(&request, AUDIO_REQUEST.as_bytes());
            conn.write_all(b"-@v02\x02").unwrap();
            conn.write_all(&payload).unwrap();

            let _ = done.recv_timeout(Duration::from_secs(10));
            listener.set_nonblocking(true).unwrap();
            let mut accepted = 1;
            while listener.accept().is_ok() {
                accepted += 1;
            }
            accepted
        })
    }

    fn wait_until(deadline: Duration, cond: impl Fn() -> bool) {
        let end = Instant::now() + deadline;
        while !cond() && Instant::now() < end {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_udp_silence_falls_back_to_tcp_once() {
        let host = IpAddr::from([127, 0, 0, 2]);
        let listener = TcpListener::bind((host, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let silent = UdpSocket::bind((host, 0)).unwrap();
        silent
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let udp_port = silent.local_addr().unwrap().port();

        let negotiator = Arc::new(
            Negotiator::new(&ConnectionConfig {
                mode: ConnectionMode::Wifi,
                host,
                port,
                connect_timeout_ms: 2000,
            })
            .with_udp_port(udp_port),
        );
        let handle = Arc::new(SessionHandle::new(OrientationState::default()));
        let decoded = Arc::new(DecoderLog::default());
        let sink_log = Arc::new(SinkLog::default());

        let (done_tx, done_rx) = mpsc::channel();
        let peer = audio_peer(listener, vec![0u8; PACKET_BYTES], done_rx);

        let started = Instant::now();
        let ingest = AudioIngest::new(
            handle.clone(),
            negotiator,
            settings(),
            Box::new(FakeSpeechDecoder(decoded.clone())),
            Box::new(FakeAudioSink {
                ready: true,
                log: sink_log.clone(),
            }),
            Arc::new(LogReporter),
        );
        let thread = std::thread::spawn(move || ingest.run());

        wait_until(Duration::from_secs(5), || {
            sink_log
                .commits
                .lock()
                .iter()
                .any(|(_, first)| *first == DECODED_SAMPLE)
        });
        assert!(started.elapsed() >= PROBE_POLL * (PROBE_ROUNDS * PROBE_POLLS) as u32);
        assert!(handle.audio_active());

        handle.stop();
        thread.join().unwrap();
        done_tx.send(()).unwrap();
        assert_eq!(peer.join().unwrap(), 1);
        assert!(!handle.audio_active());

        let mut probes = 0;
        let mut buf = [0u8; 64];
        while let Ok(n) = silent.recv(&mut buf) {
            assert_eq!(&buf[..n], AUDIO_REQUEST.as_bytes());
            probes += 1;
        }
        assert_eq!(probes, PROBE_ROUNDS);
        assert_eq!(decoded.decoded.load(Ordering::SeqCst), CHUNKS_PER_PACKET);
        let commits = sink_log.commits.lock();
        assert_eq!(
            commits.iter().filter(|(_, s)| *s == DECODED_SAMPLE).count(),
            CHUNKS_PER_PACKET
        );
    }

    #[test]
    fn test_udp_keepalive_and_stop_on_teardown() {
        let host = IpAddr::from([127, 0, 0, 2]);
        let phone = UdpSocket::bind((host, 0)).unwrap();
        phone
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let udp_port = phone.local_addr().unwrap().port();

        let negotiator = Arc::new(
            Negotiator::new(&ConnectionConfig {
                mode: ConnectionMode::Wifi,
                host,
                port: 1,
                connect_timeout_ms: 2000,
            })
            .with_udp_port(udp_port),
        );
        let handle = Arc::new(SessionHandle::new(OrientationState::default()));
        let decoded = Arc::new(DecoderLog::default());
        let received = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));

        let peer = {
            let received = received.clone();
            std::thread::spawn(move || {
                let end = Instant::now() + Duration::from_secs(15);
                let mut buf = [0u8; 64];
                while Instant::now() < end {
                    let Ok((n, from)) = phone.recv_from(&mut buf) else {
                        continue;
                    };
                    let message = buf[..n].to_vec();
                    let stop = message == STOP_REQUEST.as_bytes();
                    if message == AUDIO_REQUEST.as_bytes() {
                        phone.send_to(&[1u8; PACKET_BYTES], from).unwrap();
                    }
                    received.lock().push(message);
                    if stop {
                        break;
                    }
                }
            })
        };

        let ingest = AudioIngest::new(
            handle.clone(),
            negotiator,
            settings(),
            Box::new(FakeSpeechDecoder(decoded.clone())),
            Box::new(FakeAudioSink {
                ready: true,
                log: Arc::new(SinkLog::default()),
            }),
            Arc::new(LogReporter),
        );
        let thread = std::thread::spawn(move || ingest.run());

        // probe, then a keepalive once the tick counter passes its limit
        wait_until(Duration::from_secs(10), || {
            decoded.decoded.load(Ordering::SeqCst) > 0 && received.lock().len() >= 2
        });
        assert!(handle.audio_active());

        handle.stop();
        thread.join().unwrap();
        peer.join().unwrap();

        let received = received.lock();
        assert!(received.len() >= 3, "{} datagrams", received.len());
        let (last, requests) = received.split_last().unwrap();
        assert_eq!(last.as_slice(), STOP_REQUEST.as_bytes());
        assert!(requests.iter().all(|m| m == AUDIO_REQUEST.as_bytes()));
        assert!(decoded.decoded.load(Ordering::SeqCst) >= CHUNKS_PER_PACKET);
        assert!(!handle.audio_active());
    }

    #[test]
    fn test_sink_not_ready_never_commits() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let negotiator = Arc::new(Negotiator::new(&ConnectionConfig {
            mode: ConnectionMode::Wifi,
            host: IpAddr::from([127, 0, 0, 1]),
            port,
            connect_timeout_ms: 2000,
        }));
        let handle = Arc::new(SessionHandle::new(OrientationState::default()));
        let decoded = Arc::new(DecoderLog::default());
        let sink_log = Arc::new(SinkLog::default());

        let (done_tx, done_rx) = mpsc::channel();
        let peer = audio_peer(listener, Vec::new(), done_rx);

        let ingest = AudioIngest::new(
            handle.clone(),
            negotiator,
            settings(),
            Box::new(FakeSpeechDecoder(decoded.clone())),
            Box::new(FakeAudioSink {
                ready: false,
                log: sink_log.clone(),
            }),
            Arc::new(LogReporter),
        );
        let thread = std::thread::spawn(move || ingest.run());

        wait_until(Duration::from_secs(5), || handle.audio_active());
        let before = sink_log.checks.load(Ordering::SeqCst);
        let window = Instant::now();
        std::thread::sleep(Duration::from_millis(200));
        let checks = sink_log.checks.load(Ordering::SeqCst) - before;
        let elapsed_ms = window.elapsed().as_millis() as usize;

        handle.stop();
        thread.join().unwrap();
        done_tx.send(()).unwrap();
        peer.join().unwrap();

        assert!(checks > 0);
        assert!(checks <= elapsed_ms + 1, "{} checks in {}ms", checks, elapsed_ms);
        assert!(sink_log.commits.lock().is_empty());
        assert_eq!(decoded.concealed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_bad_magic_ends_audio_only() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let negotiator = Arc::new(Negotiator::new(&ConnectionConfig {
            mode: ConnectionMode::Wifi,
            host: IpAddr::from([127, 0, 0, 1]),
            port,
            connect_timeout_ms: 2000,
        }));
        let handle = Arc::new(SessionHandle::new(OrientationState::default()));
        let sink_log = Arc::new(SinkLog::default());

        let peer = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = [0u8; AUDIO_REQUEST.len()];
            conn.read_exact(&mut request).unwrap();
            conn.write_all(b"-@v01\x02").unwrap();
            std::thread::sleep(Duration::from_millis(100));
        });

        AudioIngest::new(
            handle.clone(),
            negotiator,
            settings(),
            Box::new(FakeSpeechDecoder(Arc::default())),
            Box::new(FakeAudioSink {
                ready: true,
                log: sink_log.clone(),
            }),
            Arc::new(LogReporter),
        )
        .run();
        peer.join().unwrap();

        assert!(!handle.audio_running().load(Ordering::SeqCst));
        assert!(handle.video_running().load(Ordering::SeqCst));
        assert_eq!(sink_log.checks.load(Ordering::SeqCst), 0);
    }
}
