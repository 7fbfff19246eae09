//! Frame geometry definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use v4l::format::fourcc;

/// FourCC of the planar format written to the video sink (I420)
pub fn sink_fourcc() -> fourcc::FourCC {
    fourcc::FourCC::new(b"YU12")
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Smallest accepted sink dimension
    pub const MIN_DIMENSION: u32 = 2;
    /// Largest accepted sink dimension
    pub const MAX_DIMENSION: u32 = 9999;

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Check if both dimensions lie in the range a sink accepts
    pub fn is_valid(&self) -> bool {
        let range = Self::MIN_DIMENSION..=Self::MAX_DIMENSION;
        range.contains(&self.width) && range.contains(&self.height)
    }

    /// Get total pixels
    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Width and height swapped
    pub fn transposed(&self) -> Resolution {
        Resolution::new(self.height, self.width)
    }

    /// Whether the image is taller than wide
    pub fn is_portrait(&self) -> bool {
        self.height > self.width
    }

    /// Chroma plane dimensions for 4:2:0 subsampling
    pub fn chroma(&self) -> (usize, usize) {
        (
            (self.width as usize + 1) / 2,
            (self.height as usize + 1) / 2,
        )
    }

    /// Byte size of a planar YUV 4:2:0 image
    pub fn yuv420_size(&self) -> usize {
        let (cw, ch) = self.chroma();
        self.pixels() + 2 * cw * ch
    }

    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

impl FromStr for Resolution {
    type Err = String;

    /// Parse `WxH`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("Expected WIDTHxHEIGHT, got '{}'", s))?;
        let width = w
            .trim()
            .parse()
            .map_err(|_| format!("Invalid width '{}'", w))?;
        let height = h
            .trim()
            .parse()
            .map_err(|_| format!("Invalid height '{}'", h))?;
        let res = Resolution::new(width, height);
        if !res.is_valid() {
            return Err(format!("Resolution {} out of range", res));
        }
        Ok(res)
    }
}

/// Geometry of one video session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamGeometry {
    /// Size announced by the peer in the handshake
    pub source: Resolution,
    /// Size of the buffers the sink accepts
    pub sink: Resolution,
    /// Sink is portrait while the source is assumed landscape: rotate 90° first
    pub invert: bool,
}

impl StreamGeometry {
    pub fn new(source: Resolution, sink: Resolution) -> Self {
        Self {
            source,
            sink,
            invert: sink.is_portrait(),
        }
    }

    /// Size of the decoded image, after the optional 90° pre-rotation
    pub fn decoded(&self) -> Resolution {
        if self.invert {
            self.source.transposed()
        } else {
            self.source
        }
    }

    /// Whether decoded frames must be resampled before reaching the sink
    pub fn needs_scaling(&self) -> bool {
        self.decoded() != self.sink
    }

    /// Capacity of a compressed-frame slot for this source size
    pub fn frame_capacity(&self) -> usize {
        self.source.pixels() * 3 / 2
    }
}
