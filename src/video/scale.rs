//! Planar YUV 4:2:0 buffers and bilinear resampling

use crate::video::format::Resolution;

/// YUV420P buffer with separate Y, U, V planes
#[derive(Debug, Clone)]
pub struct Yuv420pBuffer {
    /// Raw buffer containing all planes
    data: Vec<u8>,
    resolution: Resolution,
    /// U plane offset
    u_offset: usize,
    /// V plane offset
    v_offset: usize,
}

impl Yuv420pBuffer {
    /// Create a new YUV420P buffer for the given resolution
    pub fn new(resolution: Resolution) -> Self {
        let mut buf = Self {
            data: Vec::new(),
            resolution,
            u_offset: 0,
            v_offset: 0,
        };
        buf.resize(resolution);
        buf
    }

    /// Change the resolution, reusing the allocation when possible
    pub fn resize(&mut self, resolution: Resolution) {
        let y_size = resolution.pixels();
        let (cw, ch) = resolution.chroma();
        let uv_size = cw * ch;

        self.data.resize(y_size + 2 * uv_size, 0);
        self.resolution = resolution;
        self.u_offset = y_size;
        self.v_offset = y_size + uv_size;
    }

    /// Get the raw buffer as bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get the raw buffer as mutable bytes
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn y_plane(&self) -> &[u8] {
        &self.data[..self.u_offset]
    }

    pub fn u_plane(&self) -> &[u8] {
        &self.data[self.u_offset..self.v_offset]
    }

    pub fn v_plane(&self) -> &[u8] {
        &self.data[self.v_offset..]
    }

    /// All three planes, mutably
    pub fn planes_mut(&mut self) -> (&mut [u8], &mut [u8], &mut [u8]) {
        let (y, rest) = self.data.split_at_mut(self.u_offset);
        let (u, v) = rest.split_at_mut(self.v_offset - self.u_offset);
        (y, u, v)
    }

    /// Get buffer length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }
}

const FRAC_BITS: u32 = 16;
const FRAC_ONE: u32 = 1 << FRAC_BITS;

/// Source coordinate (16.16 fixed point) for each destination coordinate
fn sample_positions(src_len: usize, dst_len: usize) -> Vec<(usize, u32)> {
    if dst_len == 0 {
        return Vec::new();
    }
    let step = ((src_len as u64) << FRAC_BITS) / dst_len as u64;
    let max = src_len.saturating_sub(1);
    (0..dst_len)
        .map(|i| {
            // sample at pixel centres
            let pos = ((2 * i as u64 + 1) * step / 2).saturating_sub(FRAC_ONE as u64 / 2);
            let idx = ((pos >> FRAC_BITS) as usize).min(max);
            let frac = if idx >= max {
                0
            } else {
                (pos & (FRAC_ONE as u64 - 1)) as u32
            };
            (idx, frac)
        })
        .collect()
}

fn lerp(a: u8, b: u8, frac: u32) -> u32 {
    (a as u32 * (FRAC_ONE - frac) + b as u32 * frac) >> 8
}

/// Bilinear resample of one plane
pub fn scale_plane(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst: &mut [u8],
    dst_w: usize,
    dst_h: usize,
) {
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return;
    }
    let xs = sample_positions(src_w, dst_w);
    let ys = sample_positions(src_h, dst_h);

    for (dy, &(sy, fy)) in ys.iter().enumerate() {
        let row0 = &src[sy * src_w..(sy + 1) * src_w];
        let sy1 = (sy + 1).min(src_h - 1);
        let row1 = &src[sy1 * src_w..(sy1 + 1) * src_w];
        let out = &mut dst[dy * dst_w..(dy + 1) * dst_w];

        for (o, &(sx, fx)) in out.iter_mut().zip(xs.iter()) {
            let sx1 = (sx + 1).min(src_w - 1);
            // 8 fractional bits left after each lerp
            let top = lerp(row0[sx], row0[sx1], fx);
            let bottom = lerp(row1[sx], row1[sx1], fx);
            let fy8 = fy >> 8;
            let v = (top * (256 - fy8) + bottom * fy8 + (1 << 15)) >> 16;
            *o = v.min(255) as u8;
        }
    }
}

/// Resample `src` into `dst`, each at its own resolution
pub fn scale_yuv420(src: &Yuv420pBuffer, dst: &mut Yuv420pBuffer) {
    let s = src.resolution();
    let d = dst.resolution();
    let (scw, sch) = s.chroma();
    let (dcw, dch) = d.chroma();

    let (dy, du, dv) = dst.planes_mut();
    scale_plane(
        src.y_plane(),
        s.width as usize,
        s.height as usize,
        dy,
        d.width as usize,
        d.height as usize,
    );
    scale_plane(src.u_plane(), scw, sch, du, dcw, dch);
    scale_plane(src.v_plane(), scw, sch, dv, dcw, dch);
}
