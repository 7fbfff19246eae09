//! Streaming session: shared flags, the three worker threads and their
//! lifecycle

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tracing::{debug, error, info, warn};

use crate::audio::{
    AlsaSink, AudioIngest, AudioIngestSettings, AudioSink, SpeechDecoder, SpeexDecoder,
};
use crate::config::{AppConfig, ConnectionMode};
use crate::connection::Negotiator;
use crate::control::ControlChannel;
use crate::error::{AppError, ErrorReporter, Result};
use crate::protocol::{self, BATTERY_REQUEST};
use crate::video::{
    DecodeWorker, FrameDecoder, OrientationState, SharedOrientation, TurboJpegDecoder,
    V4l2Sink, VideoIngest, VideoIngestSettings, VideoSink, VideoStream,
};

const BATTERY_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared by the ingest threads, the decode worker and the UI.
///
/// Clearing a running flag asks the owning threads to finish; they poll it
/// between short sleeps and socket read timeouts.
#[derive(Debug)]
pub struct SessionHandle {
    video_running: AtomicBool,
    audio_running: AtomicBool,
    video_active: AtomicBool,
    audio_active: AtomicBool,
    control: ControlChannel,
    orientation: SharedOrientation,
    stream: ArcSwapOption<VideoStream>,
}

impl SessionHandle {
    pub fn new(orientation: OrientationState) -> Self {
        Self {
            video_running: AtomicBool::new(true),
            audio_running: AtomicBool::new(true),
            video_active: AtomicBool::new(false),
            audio_active: AtomicBool::new(false),
            control: ControlChannel::new(),
            orientation: SharedOrientation::new(orientation),
            stream: ArcSwapOption::empty(),
        }
    }

    pub fn video_running(&self) -> &AtomicBool {
        &self.video_running
    }

    pub fn audio_running(&self) -> &AtomicBool {
        &self.audio_running
    }

    /// Ask every thread to finish. Safe to call any number of times.
    pub fn stop(&self) {
        let was_video = self.video_running.swap(false, Ordering::AcqRel);
        let was_audio = self.audio_running.swap(false, Ordering::AcqRel);
        if was_video || was_audio {
            debug!("Session stop requested");
        }
    }

    /// True while a video peer is past the handshake
    pub fn video_active(&self) -> bool {
        self.video_active.load(Ordering::Acquire)
    }

    pub fn set_video_active(&self, active: bool) {
        self.video_active.store(active, Ordering::Release);
    }

    pub fn audio_active(&self) -> bool {
        self.audio_active.load(Ordering::Acquire)
    }

    pub fn set_audio_active(&self, active: bool) {
        self.audio_active.store(active, Ordering::Release);
    }

    pub fn control(&self) -> &ControlChannel {
        &self.control
    }

    pub fn orientation(&self) -> &SharedOrientation {
        &self.orientation
    }

    /// Hand the stream of a new handshake to the decode worker, or `None` when it ended
    pub fn publish_stream(&self, stream: Option<Arc<VideoStream>>) {
        self.stream.store(stream);
    }

    pub fn current_stream(&self) -> Option<Arc<VideoStream>> {
        self.stream.load_full()
    }
}

/// Decoder and sink for the video path
pub struct VideoBackend {
    pub decoder: Box<dyn FrameDecoder>,
    pub sink: Box<dyn VideoSink>,
}

impl VideoBackend {
    /// JPEG decoder plus the configured or discovered v4l2loopback device
    pub fn open(config: &AppConfig) -> Result<Self> {
        let device = config.video.device.as_deref().map(std::path::Path::new);
        let sink = V4l2Sink::open(device, config.video.sink_size())?;
        Ok(Self {
            decoder: Box::new(TurboJpegDecoder::new()?),
            sink: Box::new(sink),
        })
    }
}

/// Decoder and sink for the audio path
pub struct AudioBackend {
    pub decoder: Box<dyn SpeechDecoder>,
    pub sink: Box<dyn AudioSink>,
}

impl AudioBackend {
    /// Speex decoder plus the configured or discovered ALSA loopback device
    pub fn open(config: &AppConfig) -> Result<Self> {
        let sink = AlsaSink::open(config.audio.device.as_deref())?;
        Ok(Self {
            decoder: Box::new(SpeexDecoder::new()?),
            sink: Box::new(sink),
        })
    }
}

/// One streaming session: a video ingest thread, a decode worker and an
/// audio ingest thread, each optional.
///
/// Dropping the session stops and joins every thread.
pub struct Session {
    handle: Arc<SessionHandle>,
    negotiator: Arc<Negotiator>,
    threads: Vec<JoinHandle<()>>,
}

impl Session {
    /// Set up the tunnel, open the configured devices and start streaming.
    ///
    /// Tunnel and video device errors are returned before any thread starts.
    /// A missing audio device is reported and only disables audio.
    pub fn start(config: &AppConfig, reporter: Arc<dyn ErrorReporter>) -> Result<Self> {
        let negotiator = Negotiator::new(&config.connection);
        negotiator.prepare()?;

        let video = if config.video.enabled {
            Some(VideoBackend::open(config)?)
        } else {
            None
        };

        let audio = if config.audio.enabled {
            match AudioBackend::open(config) {
                Ok(backend) => Some(backend),
                Err(e) => {
                    reporter.report("Audio disabled", &e);
                    None
                }
            }
        } else {
            None
        };

        Self::spawn(config, Arc::new(negotiator), video, audio, reporter)
    }

    /// Start the threads with the given backends.
    ///
    /// Audio is skipped in server mode.
    pub fn spawn(
        config: &AppConfig,
        negotiator: Arc<Negotiator>,
        video: Option<VideoBackend>,
        audio: Option<AudioBackend>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self> {
        // the phone's connections to the listener all belong to the video thread
        let audio = match audio {
            Some(_) if negotiator.mode() == ConnectionMode::Server => {
                warn!("Audio is not available when listening for the phone");
                None
            }
            audio => audio,
        };
        if video.is_none() && audio.is_none() {
            return Err(AppError::Config("neither video nor audio is enabled".into()));
        }

        let handle = Arc::new(SessionHandle::new(OrientationState::new(
            config.video.mirror_horizontal,
            config.video.mirror_vertical,
        )));
        let mut session = Session {
            handle: handle.clone(),
            negotiator: negotiator.clone(),
            threads: Vec::with_capacity(3),
        };

        match video {
            Some(backend) => {
                let settings = VideoIngestSettings {
                    codec: config.video.codec.clone(),
                    sink: backend.sink.resolution(),
                    frame_slots: config.video.frame_slots,
                    buffer_limit: config.video.buffer_limit,
                    stall_timeout: config.video.stall_timeout(),
                };
                info!(
                    "Starting video: {} via {:?} to {}",
                    settings.sink,
                    negotiator.mode(),
                    negotiator.peer_addr()
                );

                let worker = DecodeWorker::new(handle.clone(), backend.decoder, backend.sink);
                session.spawn_thread("video-decode", move || worker.run())?;

                let ingest =
                    VideoIngest::new(handle.clone(), negotiator.clone(), settings, reporter.clone());
                session.spawn_thread("video-ingest", move || ingest.run())?;
            }
            None => handle.video_running().store(false, Ordering::Release),
        }

        match audio {
            Some(backend) => {
                let settings = AudioIngestSettings {
                    boost_percent: config.audio.boost_percent,
                    wait_for_video: config.video.enabled,
                    stall_timeout: config.video.stall_timeout(),
                };
                let ingest = AudioIngest::new(
                    handle.clone(),
                    negotiator,
                    settings,
                    backend.decoder,
                    backend.sink,
                    reporter,
                );
                session.spawn_thread("audio-ingest", move || ingest.run())?;
            }
            None => handle.audio_running().store(false, Ordering::Release),
        }

        Ok(session)
    }

    fn spawn_thread<F>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(f)
            .map_err(|e| {
                self.handle.stop();
                AppError::Io(e)
            })?;
        self.threads.push(thread);
        Ok(())
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    pub fn negotiator(&self) -> &Arc<Negotiator> {
        &self.negotiator
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    /// True once every thread has exited
    pub fn is_finished(&self) -> bool {
        self.threads.iter().all(|t| t.is_finished())
    }

    /// Wait for every thread to exit
    pub fn join(mut self) {
        self.join_threads();
    }

    fn join_threads(&mut self) {
        for thread in self.threads.drain(..) {
            let name = thread.thread().name().unwrap_or("session").to_string();
            if thread.join().is_err() {
                error!("Thread {} panicked", name);
            }
        }
    }

    /// Ask the phone for its battery level over a separate connection
    pub fn query_battery(&self) -> Result<Option<u8>> {
        query_battery(&self.negotiator)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.handle.stop();
        self.join_threads();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.negotiator.mode())
            .field("threads", &self.threads.len())
            .finish()
    }
}

/// Battery percentage, or `None` when the reply carries no level
pub fn query_battery(negotiator: &Negotiator) -> Result<Option<u8>> {
    let mut stream = negotiator.open()?;
    stream.set_read_timeout(Some(BATTERY_TIMEOUT))?;
    stream.send_text(BATTERY_REQUEST)?;

    let mut reply = Vec::with_capacity(64);
    let mut buf = [0u8; 64];
    while reply.len() < 256 {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => reply.extend_from_slice(&buf[..n]),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                break
            }
            Err(e) => return Err(AppError::Transport(format!("battery reply: {}", e))),
        }
    }
    stream.shutdown();
    Ok(protocol::parse_battery_reply(&reply))
}
