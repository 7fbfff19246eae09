//! Synthetic test image shown while no phone is streaming

use super::format::Resolution;
use super::scale::Yuv420pBuffer;

/// Four vertical luma bars (black, dark grey, mid grey, noise) on neutral chroma
pub fn test_pattern(size: Resolution) -> Yuv420pBuffer {
    let mut image = Yuv420pBuffer::new(size);
    let width = size.width as usize;
    let bar = (width / 4).max(1);

    let (y, u, v) = image.planes_mut();
    u.fill(128);
    v.fill(128);
    for row in y.chunks_exact_mut(width.max(1)) {
        for (x, px) in row.iter_mut().enumerate() {
            *px = match x / bar {
                0 => 0,
                1 => 64,
                2 => 128,
                _ => rand::random::<u8>() % 250,
            };
        }
    }
    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_bars() {
        let size = Resolution::new(8, 2);
        let image = test_pattern(size);
        assert_eq!(image.len(), size.yuv420_size());

        let row = &image.y_plane()[8..16];
        assert_eq!(&row[..6], &[0, 0, 64, 64, 128, 128]);
        assert!(row[6] < 250 && row[7] < 250);
        assert!(image.u_plane().iter().all(|&c| c == 128));
        assert!(image.v_plane().iter().all(|&c| c == 128));
    }
}
