//! Decode worker: drains ready frames, decodes, orients, resamples and
//! writes them to the video sink.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::decoder::{FrameDecoder, Subsampling};
use super::device::VideoSink;
use super::format::StreamGeometry;
use super::orientation::PixelTransform;
use super::pattern::test_pattern;
use super::scale::{scale_yuv420, Yuv420pBuffer};
use super::VideoStream;
use crate::error::{AppError, Result};
use crate::session::SessionHandle;
use crate::utils::LogThrottler;
use crate::{error_throttled, warn_throttled};

/// Sleep when no frame is ready
const IDLE_WAIT: Duration = Duration::from_millis(2);

pub struct DecodeWorker {
    handle: Arc<SessionHandle>,
    decoder: Box<dyn FrameDecoder>,
    sink: Box<dyn VideoSink>,
    throttler: LogThrottler,
    stream: Option<Arc<VideoStream>>,
    /// First frame of the current stream passed the header checks
    validated: bool,
    decoded: Yuv420pBuffer,
    scaled: Yuv420pBuffer,
}

impl DecodeWorker {
    pub fn new(
        handle: Arc<SessionHandle>,
        decoder: Box<dyn FrameDecoder>,
        sink: Box<dyn VideoSink>,
    ) -> Self {
        let sink_size = sink.resolution();
        Self {
            handle,
            decoder,
            sink,
            throttler: LogThrottler::default(),
            stream: None,
            validated: false,
            decoded: Yuv420pBuffer::new(sink_size),
            scaled: Yuv420pBuffer::new(sink_size),
        }
    }

    pub fn run(mut self) {
        self.show_test_pattern();

        while self.handle.video_running().load(Ordering::Acquire) {
            self.follow_stream();

            let Some(video) = self.stream.clone() else {
                std::thread::sleep(IDLE_WAIT);
                continue;
            };
            // pull with the same limit the ingest side pushes with
            let Some(frame) = video.pool.take_ready(video.pool.buffer_limit()) else {
                std::thread::sleep(IDLE_WAIT);
                continue;
            };

            if let Err(e) = self.process(frame.data(), &video.geometry) {
                warn_throttled!(self.throttler, "decode", "Dropping video frame: {}", e);
            }
            video.pool.recycle(frame, false);
        }

        self.stream = None;
        debug!("Decode worker exiting");
    }

    /// Pick up a new or ended stream published by the ingest thread
    fn follow_stream(&mut self) {
        let current = self.handle.current_stream();
        let changed = match (&current, &self.stream) {
            (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
            (None, None) => false,
            _ => true,
        };
        if !changed {
            return;
        }

        let ended = self.stream.is_some() && current.is_none();
        self.stream = current;
        self.validated = false;
        self.throttler.clear("decode");
        if ended {
            info!("Video stream ended");
            self.show_test_pattern();
        }
    }

    fn show_test_pattern(&mut self) {
        let image = test_pattern(self.sink.resolution());
        if let Err(e) = self.sink.write_frame(image.as_bytes()) {
            error_throttled!(self.throttler, "sink", "Failed to write test image: {}", e);
        }
    }

    fn validate(&mut self, jpeg: &[u8], geometry: &StreamGeometry) -> Result<()> {
        let info = self.decoder.probe(jpeg)?;
        if info.subsampling != Subsampling::Yuv420 {
            return Err(AppError::Protocol(format!(
                "unexpected video image subsampling {:?}",
                info.subsampling
            )));
        }
        if info.size != geometry.source {
            return Err(AppError::Protocol(format!(
                "unexpected video image dimensions {} vs expected {}",
                info.size, geometry.source
            )));
        }
        debug!("Video stream is {} 4:2:0", info.size);
        self.validated = true;
        Ok(())
    }

    fn process(&mut self, jpeg: &[u8], geometry: &StreamGeometry) -> Result<()> {
        if !self.validated {
            self.validate(jpeg, geometry)?;
        }

        let mirror = self.handle.orientation().get().transform();
        let transform = if geometry.invert {
            mirror.after_rotate90()
        } else {
            mirror
        };

        let decoded_size = self.decoder.decode(jpeg, transform, &mut self.decoded)?;
        let sink_size = self.sink.resolution();

        let output = if decoded_size == sink_size {
            &self.decoded
        } else {
            self.scaled.resize(sink_size);
            scale_yuv420(&self.decoded, &mut self.scaled);
            &self.scaled
        };

        self.sink.write_frame(output.as_bytes()).map_err(|e| {
            error_throttled!(self.throttler, "sink", "Video sink write failed: {}", e);
            e
        })?;
        Ok(())
    }
}

impl std::fmt::Debug for DecodeWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeWorker")
            .field("sink", &self.sink.resolution())
            .finish()
    }
}
