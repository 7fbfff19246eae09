//! JPEG decoder using TurboJPEG (software) -> YUV420P, with lossless transforms.

use turbojpeg::{Decompressor, Subsamp, Transform, TransformOp, Transformer, YuvImage};

use super::{FrameDecoder, JpegInfo, Subsampling};
use crate::error::{AppError, Result};
use crate::video::format::Resolution;
use crate::video::orientation::PixelTransform;
use crate::video::scale::Yuv420pBuffer;

pub struct TurboJpegDecoder {
    decompressor: Decompressor,
    transformer: Transformer,
}

impl TurboJpegDecoder {
    pub fn new() -> Result<Self> {
        let decompressor = Decompressor::new().map_err(|e| {
            AppError::Device(format!("Failed to create turbojpeg decoder: {}", e))
        })?;
        let transformer = Transformer::new().map_err(|e| {
            AppError::Device(format!("Failed to create turbojpeg transformer: {}", e))
        })?;
        Ok(Self {
            decompressor,
            transformer,
        })
    }
}

fn transform_op(transform: PixelTransform) -> TransformOp {
    match transform {
        PixelTransform::None => TransformOp::None,
        PixelTransform::HFlip => TransformOp::Hflip,
        PixelTransform::VFlip => TransformOp::Vflip,
        PixelTransform::Rotate90 => TransformOp::Rot90,
        PixelTransform::Rotate180 => TransformOp::Rot180,
        PixelTransform::Rotate270 => TransformOp::Rot270,
        PixelTransform::Transpose => TransformOp::Transpose,
        PixelTransform::Transverse => TransformOp::Transverse,
    }
}

fn subsampling(subsamp: Subsamp) -> Subsampling {
    match subsamp {
        Subsamp::Sub2x2 => Subsampling::Yuv420,
        Subsamp::Sub2x1 => Subsampling::Yuv422,
        Subsamp::None => Subsampling::Yuv444,
        _ => Subsampling::Other,
    }
}

impl FrameDecoder for TurboJpegDecoder {
    fn probe(&mut self, jpeg: &[u8]) -> Result<JpegInfo> {
        let header = self
            .decompressor
            .read_header(jpeg)
            .map_err(|e| AppError::Protocol(format!("turbojpeg read_header failed: {}", e)))?;

        Ok(JpegInfo {
            size: Resolution::new(header.width as u32, header.height as u32),
            subsampling: subsampling(header.subsamp),
        })
    }

    fn decode(
        &mut self,
        jpeg: &[u8],
        transform: PixelTransform,
        out: &mut Yuv420pBuffer,
    ) -> Result<Resolution> {
        let transformed;
        let input = if transform == PixelTransform::None {
            jpeg
        } else {
            let op = Transform {
                op: transform_op(transform),
                // drop partial edge blocks the lossless transform cannot move
                trim: true,
                ..Transform::default()
            };
            transformed = self
                .transformer
                .transform(&op, jpeg)
                .map_err(|e| AppError::Protocol(format!("turbojpeg transform failed: {}", e)))?;
            &transformed[..]
        };

        let info = self.probe(input)?;
        out.resize(info.size);

        let image = YuvImage {
            pixels: out.as_bytes_mut(),
            width: info.size.width as usize,
            align: 1,
            height: info.size.height as usize,
            subsamp: Subsamp::Sub2x2,
        };
        self.decompressor
            .decompress_to_yuv(input, image)
            .map_err(|e| AppError::Protocol(format!("turbojpeg decode failed: {}", e)))?;

        Ok(info.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_is_rejected() {
        let mut decoder = TurboJpegDecoder::new().unwrap();
        let err = decoder.probe(&[0u8; 64]).unwrap_err();
        assert!(matches!(err, AppError::Protocol(_)));

        let mut out = Yuv420pBuffer::new(Resolution::VGA);
        assert!(decoder
            .decode(&[0xFF, 0xD8, 0x00], PixelTransform::HFlip, &mut out)
            .is_err());
    }

    fn encode_flat(size: Resolution, luma: u8) -> Vec<u8> {
        let mut yuv = Yuv420pBuffer::new(size);
        let (y, u, v) = yuv.planes_mut();
        y.fill(luma);
        u.fill(128);
        v.fill(128);

        let mut compressor = turbojpeg::Compressor::new().unwrap();
        compressor.set_quality(90).unwrap();
        compressor
            .compress_yuv_to_vec(YuvImage {
                pixels: yuv.as_bytes(),
                width: size.width as usize,
                align: 1,
                height: size.height as usize,
                subsamp: Subsamp::Sub2x2,
            })
            .unwrap()
    }

    #[test]
    fn test_decode_with_rotation() {
        let jpeg = encode_flat(Resolution::new(64, 48), 180);
        let mut decoder = TurboJpegDecoder::new().unwrap();

        let info = decoder.probe(&jpeg).unwrap();
        assert_eq!(info.size, Resolution::new(64, 48));
        assert_eq!(info.subsampling, Subsampling::Yuv420);

        let mut out = Yuv420pBuffer::new(Resolution::new(2, 2));
        let size = decoder
            .decode(&jpeg, PixelTransform::Rotate90, &mut out)
            .unwrap();
        assert_eq!(size, Resolution::new(48, 64));
        assert_eq!(out.len(), size.yuv420_size());
        let luma = out.y_plane()[out.y_plane().len() / 2];
        assert!((170..=190).contains(&luma), "luma {}", luma);
    }

    #[test]
    fn test_transform_mapping() {
        assert_eq!(transform_op(PixelTransform::None), TransformOp::None);
        assert_eq!(transform_op(PixelTransform::Rotate180), TransformOp::Rot180);
        assert_eq!(transform_op(PixelTransform::Transverse), TransformOp::Transverse);
        assert_eq!(subsampling(Subsamp::Sub2x2), Subsampling::Yuv420);
    }
}
