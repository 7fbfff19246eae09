//! Video path: ingest thread, frame pool, decode worker and sink

pub mod decoder;
pub mod device;
pub mod format;
pub mod frame_pool;
pub mod ingest;
pub mod orientation;
pub mod pattern;
pub mod scale;
pub mod worker;

pub use decoder::{FrameDecoder, JpegInfo, Subsampling, TurboJpegDecoder};
pub use device::{V4l2Sink, VideoSink};
pub use format::{Resolution, StreamGeometry};
pub use frame_pool::{Frame, FramePool, PoolStats};
pub use ingest::{VideoIngest, VideoIngestSettings};
pub use orientation::{OrientationState, PixelTransform, SharedOrientation};
pub use worker::DecodeWorker;

/// State created by one successful video handshake, shared by the ingest
/// thread and the decode worker until both let go of it
#[derive(Debug)]
pub struct VideoStream {
    pub geometry: StreamGeometry,
    pub pool: FramePool,
}

impl VideoStream {
    pub fn new(geometry: StreamGeometry, frame_slots: usize, buffer_limit: usize) -> Self {
        Self {
            pool: FramePool::new(frame_slots, geometry.frame_capacity(), buffer_limit),
            geometry,
        }
    }
}
