//! Video ingest thread: handshake, length-prefixed frame reads, control
//! command injection and, in server mode, re-accepting new peers.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::format::{Resolution, StreamGeometry};
use super::VideoStream;
use crate::config::ConnectionMode;
use crate::connection::{Negotiator, PeerStream};
use crate::error::{AppError, ErrorReporter};
use crate::protocol::{self, FRAME_LENGTH_LEN, VIDEO_HEADER_LEN};
use crate::session::SessionHandle;

/// Socket read timeout; bounds how long a read ignores the stop flag
const READ_POLL: Duration = Duration::from_millis(100);
/// Sleep while every frame slot is queued or in use
const SLOT_WAIT: Duration = Duration::from_millis(2);

#[derive(Debug, Clone)]
pub struct VideoIngestSettings {
    /// Codec name sent in the request
    pub codec: String,
    /// Sink size sent in the request
    pub sink: Resolution,
    pub frame_slots: usize,
    pub buffer_limit: usize,
    pub stall_timeout: Duration,
}

enum IngestState {
    Connecting,
    Requesting(PeerStream),
    AwaitingHeader(PeerStream),
    Streaming(PeerStream, Arc<VideoStream>),
    Closing,
    Terminated,
}

/// How a streaming loop ended
enum StreamEnd {
    Stopped,
    PeerClosed,
    Failed(AppError),
}

pub struct VideoIngest {
    handle: Arc<SessionHandle>,
    negotiator: Arc<Negotiator>,
    settings: VideoIngestSettings,
    reporter: Arc<dyn ErrorReporter>,
}

impl VideoIngest {
    pub fn new(
        handle: Arc<SessionHandle>,
        negotiator: Arc<Negotiator>,
        settings: VideoIngestSettings,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            handle,
            negotiator,
            settings,
            reporter,
        }
    }

    fn running(&self) -> bool {
        self.handle.video_running().load(Ordering::Acquire)
    }

    fn server_mode(&self) -> bool {
        self.negotiator.mode() == ConnectionMode::Server
    }

    /// Fatal to the current peer. Reported once; in server mode the next
    /// peer may still connect, so it is only logged there.
    fn fail(&self, context: &str, error: AppError) {
        if self.server_mode() && error.is_transport() {
            warn!("{}: {}", context, error);
        } else {
            self.reporter.report(context, &error);
        }
    }

    /// Run the state machine until stopped or the session ends
    pub fn run(self) {
        let mut state = IngestState::Connecting;

        loop {
            state = match state {
                IngestState::Connecting => self.connect(),
                IngestState::Requesting(stream) => self.request(stream),
                IngestState::AwaitingHeader(stream) => self.await_header(stream),
                IngestState::Streaming(stream, video) => {
                    match self.stream_frames(stream, &video) {
                        StreamEnd::Stopped => debug!("Video stream stopped"),
                        StreamEnd::PeerClosed => info!("Video connection closed by peer"),
                        StreamEnd::Failed(e) => self.fail("Video stream failed", e),
                    }
                    IngestState::Closing
                }
                IngestState::Closing => self.close(),
                IngestState::Terminated => break,
            };
        }

        self.negotiator.release();
        // the decode worker ends with the ingest thread
        self.handle.video_running().store(false, Ordering::Release);
        debug!("Video ingest thread exiting");
    }

    fn connect(&self) -> IngestState {
        if !self.running() {
            return IngestState::Terminated;
        }
        match self.negotiator.establish(self.handle.video_running()) {
            Ok(Some(stream)) => IngestState::Requesting(stream),
            Ok(None) => IngestState::Terminated,
            Err(e) => {
                self.reporter.report("Video connection failed", &e);
                IngestState::Terminated
            }
        }
    }

    fn request(&self, mut stream: PeerStream) -> IngestState {
        let request = protocol::video_request(&self.settings.codec, self.settings.sink);
        let sent = stream
            .set_read_timeout(Some(READ_POLL))
            .map_err(AppError::from)
            .and_then(|_| stream.send_text(&request));

        match sent {
            Ok(()) => {
                debug!("Sent video request '{}'", request);
                IngestState::AwaitingHeader(stream)
            }
            Err(e) => {
                self.fail("Error sending video request", e);
                IngestState::Closing
            }
        }
    }

    fn await_header(&self, mut stream: PeerStream) -> IngestState {
        let mut header = [0u8; VIDEO_HEADER_LEN];
        match stream.read_full(
            &mut header,
            self.handle.video_running(),
            self.settings.stall_timeout,
        ) {
            Ok(true) => {}
            Ok(false) => {
                if self.running() {
                    self.fail(
                        "Video handshake failed",
                        AppError::Transport("connection closed before stream header".into()),
                    );
                }
                return IngestState::Closing;
            }
            Err(e) => {
                self.fail("Video handshake failed", e);
                return IngestState::Closing;
            }
        }

        let source = match protocol::parse_video_header(&header) {
            Ok(size) => size,
            Err(e) => {
                self.reporter.report("Video handshake failed", &e);
                return IngestState::Closing;
            }
        };

        let geometry = StreamGeometry::new(source, self.settings.sink);
        info!(
            "Video stream {} -> sink {}{}",
            geometry.source,
            geometry.sink,
            if geometry.invert { " (rotated)" } else { "" }
        );

        let video = Arc::new(VideoStream::new(
            geometry,
            self.settings.frame_slots,
            self.settings.buffer_limit,
        ));
        self.handle.publish_stream(Some(video.clone()));
        self.handle.set_video_active(true);
        IngestState::Streaming(stream, video)
    }

    fn stream_frames(&self, mut stream: PeerStream, video: &VideoStream) -> StreamEnd {
        let running = self.handle.video_running();
        let stall = self.settings.stall_timeout;

        while self.running() {
            // the slot stays busy until the command is on the wire
            if let Some(cmd) = self.handle.control().peek() {
                let text = protocol::encode_control(&cmd);
                if let Err(e) = stream.send_text(&text) {
                    return StreamEnd::Failed(e);
                }
                self.handle.control().clear();
                debug!("Sent control '{}'", text);
            }

            let Some(mut frame) = video.pool.take_empty() else {
                std::thread::sleep(SLOT_WAIT);
                continue;
            };

            let mut prefix = [0u8; FRAME_LENGTH_LEN];
            match stream.read_full(&mut prefix, running, stall) {
                Ok(true) => {}
                Ok(false) => return self.end_of_stream(),
                Err(e) => return StreamEnd::Failed(e),
            }
            let length = protocol::parse_frame_length(prefix);

            let buf = match frame.fill(length) {
                Ok(buf) => buf,
                Err(e) => return StreamEnd::Failed(e),
            };
            match stream.read_full(buf, running, stall) {
                Ok(true) => {}
                Ok(false) => return self.end_of_stream(),
                Err(e) => return StreamEnd::Failed(e),
            }

            let to_ready = length > 0;
            video.pool.recycle(frame, to_ready);
        }
        StreamEnd::Stopped
    }

    fn end_of_stream(&self) -> StreamEnd {
        if self.running() {
            StreamEnd::PeerClosed
        } else {
            StreamEnd::Stopped
        }
    }

    fn close(&self) -> IngestState {
        self.handle.set_video_active(false);
        self.handle.publish_stream(None);

        if self.server_mode() && self.running() {
            info!("Waiting for the next video connection");
            IngestState::Connecting
        } else {
            IngestState::Terminated
        }
    }
}
