//! JPEG frame decoding into planar YUV 4:2:0
//!
//! The image codec sits behind [`FrameDecoder`] so the decode worker can be
//! exercised without a real codec.

pub mod mjpeg_turbo;

pub use mjpeg_turbo::TurboJpegDecoder;

use crate::error::Result;
use crate::video::format::Resolution;
use crate::video::orientation::PixelTransform;
use crate::video::scale::Yuv420pBuffer;

/// Chroma subsampling reported by a JPEG header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsampling {
    /// 4:2:0, the only mode the decode path handles
    Yuv420,
    Yuv422,
    Yuv444,
    Other,
}

/// Header facts of one compressed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JpegInfo {
    pub size: Resolution,
    pub subsampling: Subsampling,
}

pub trait FrameDecoder: Send {
    /// Read the frame header without decoding pixels
    fn probe(&mut self, jpeg: &[u8]) -> Result<JpegInfo>;

    /// Apply `transform` losslessly, then decode into `out`.
    ///
    /// `out` is resized to the decoded image, which is returned.
    fn decode(
        &mut self,
        jpeg: &[u8],
        transform: PixelTransform,
        out: &mut Yuv420pBuffer,
    ) -> Result<Resolution>;
}
