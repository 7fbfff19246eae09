//! Mirror state and the lossless pixel transform derived from it

use std::sync::atomic::{AtomicBool, Ordering};

/// Lossless transform applied to the compressed image before decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelTransform {
    None,
    HFlip,
    VFlip,
    Rotate90,
    Rotate180,
    Rotate270,
    /// Mirror around the top-left/bottom-right diagonal
    Transpose,
    /// Mirror around the top-right/bottom-left diagonal
    Transverse,
}

impl PixelTransform {
    /// Whether output width and height are swapped
    pub fn swaps_axes(&self) -> bool {
        matches!(
            self,
            PixelTransform::Rotate90
                | PixelTransform::Rotate270
                | PixelTransform::Transpose
                | PixelTransform::Transverse
        )
    }

    /// Transform equivalent to a 90° clockwise rotation followed by `self`.
    ///
    /// Only defined for the mirror transforms; others are returned unchanged.
    pub fn after_rotate90(self) -> PixelTransform {
        match self {
            PixelTransform::None => PixelTransform::Rotate90,
            PixelTransform::HFlip => PixelTransform::Transpose,
            PixelTransform::VFlip => PixelTransform::Transverse,
            PixelTransform::Rotate180 => PixelTransform::Rotate270,
            other => other,
        }
    }
}

/// The two independent mirror axes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrientationState {
    pub mirror_horizontal: bool,
    pub mirror_vertical: bool,
}

impl OrientationState {
    pub fn new(mirror_horizontal: bool, mirror_vertical: bool) -> Self {
        Self {
            mirror_horizontal,
            mirror_vertical,
        }
    }

    pub fn toggle_horizontal(self) -> Self {
        Self {
            mirror_horizontal: !self.mirror_horizontal,
            ..self
        }
    }

    pub fn toggle_vertical(self) -> Self {
        Self {
            mirror_vertical: !self.mirror_vertical,
            ..self
        }
    }

    pub fn transform(&self) -> PixelTransform {
        match (self.mirror_horizontal, self.mirror_vertical) {
            (false, false) => PixelTransform::None,
            (true, false) => PixelTransform::HFlip,
            (false, true) => PixelTransform::VFlip,
            (true, true) => PixelTransform::Rotate180,
        }
    }
}

/// Orientation shared between the UI and the decode worker
#[derive(Debug, Default)]
pub struct SharedOrientation {
    horizontal: AtomicBool,
    vertical: AtomicBool,
}

impl SharedOrientation {
    pub fn new(initial: OrientationState) -> Self {
        Self {
            horizontal: AtomicBool::new(initial.mirror_horizontal),
            vertical: AtomicBool::new(initial.mirror_vertical),
        }
    }

    pub fn get(&self) -> OrientationState {
        OrientationState {
            mirror_horizontal: self.horizontal.load(Ordering::Relaxed),
            mirror_vertical: self.vertical.load(Ordering::Relaxed),
        }
    }

    /// Flip the horizontal axis, returning the new state
    pub fn toggle_horizontal(&self) -> OrientationState {
        self.horizontal.fetch_xor(true, Ordering::Relaxed);
        self.get()
    }

    /// Flip the vertical axis, returning the new state
    pub fn toggle_vertical(&self) -> OrientationState {
        self.vertical.fetch_xor(true, Ordering::Relaxed);
        self.get()
    }
}
