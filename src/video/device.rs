//! Video sink: a v4l2loopback output device fed with I420 frames

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use v4l::prelude::*;
use v4l::video::{Capture, Output};
use v4l::Format;

use super::format::{sink_fourcc, Resolution};
use crate::error::{AppError, Result};

/// Bus info prefix of the dedicated loopback module build
pub const BUS_LOOPBACK_DC: &str = "platform:v4l2loopback_dc";
/// Bus info prefix of the stock v4l2loopback module
pub const BUS_LOOPBACK: &str = "platform:v4l2loopback";

/// Consumer of fully decoded planar frames
pub trait VideoSink: Send {
    /// Size of the buffers the sink accepts
    fn resolution(&self) -> Resolution;

    /// Write one complete I420 image of [`Resolution::yuv420_size`] bytes
    fn write_frame(&mut self, frame: &[u8]) -> Result<()>;
}

/// v4l2loopback output device
pub struct V4l2Sink {
    path: PathBuf,
    file: File,
    resolution: Resolution,
}

impl V4l2Sink {
    /// Open `path`, or discover a loopback device when `None`.
    ///
    /// With `size`, the device format is set to I420 at that size; otherwise
    /// the size the device already advertises is used.
    pub fn open(path: Option<&Path>, size: Option<Resolution>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => find_loopback_device()?,
        };
        debug!("Opening video sink: {:?}", path);

        let device = Device::with_path(&path).map_err(|e| {
            AppError::Device(format!("Failed to open device {:?}: {}", path, e))
        })?;
        let resolution = negotiate_format(&device, &path, size)?;

        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .map_err(|e| AppError::Device(format!("Failed to open {:?} for writing: {}", path, e)))?;

        info!("Video sink {:?} at {}", path, resolution);
        Ok(Self {
            path,
            file,
            resolution,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn negotiate_format(device: &Device, path: &Path, size: Option<Resolution>) -> Result<Resolution> {
    let current = match size {
        Some(size) => {
            let wanted = Format::new(size.width, size.height, sink_fourcc());
            Output::set_format(device, &wanted).map_err(|e| {
                AppError::Device(format!("Failed to set format {} on {:?}: {}", size, path, e))
            })?
        }
        None => match Capture::format(device) {
            Ok(fmt) => fmt,
            Err(e) => {
                debug!("No capture format on {:?} ({}), trying output", path, e);
                Output::format(device).map_err(|e| {
                    AppError::Device(format!("Unable to query video device {:?}: {}", path, e))
                })?
            }
        },
    };

    if current.fourcc != sink_fourcc() {
        return Err(AppError::Device(format!(
            "Video device {:?} reported pixel format {}, expected YU12 (I420); \
             configure it with: v4l2loopback-ctl set-caps \"video/x-raw, format=I420, width=640, height=480\" {}",
            path,
            current.fourcc,
            path.display()
        )));
    }

    let resolution = Resolution::new(current.width, current.height);
    if !resolution.is_valid() {
        return Err(AppError::Device(format!(
            "Video device {:?} reported invalid resolution {}",
            path, resolution
        )));
    }
    if let Some(size) = size {
        if size != resolution {
            warn!("Requested {}, device uses {}", size, resolution);
        }
    }
    Ok(resolution)
}

impl VideoSink for V4l2Sink {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let written = self
            .file
            .write(frame)
            .map_err(|e| AppError::Device(format!("write to {:?}: {}", self.path, e)))?;
        if written != frame.len() {
            return Err(AppError::Device(format!(
                "short write to {:?}: {} of {} bytes",
                self.path,
                written,
                frame.len()
            )));
        }
        Ok(())
    }
}

fn video_device_paths() -> Result<Vec<PathBuf>> {
    let mut paths: Vec<(u32, PathBuf)> = std::fs::read_dir("/dev")
        .map_err(|e| AppError::Device(format!("Failed to read /dev: {}", e)))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let path = entry.path();
            let index = path
                .file_name()?
                .to_str()?
                .strip_prefix("video")?
                .parse::<u32>()
                .ok()?;
            Some((index, path))
        })
        .collect();
    paths.sort();
    Ok(paths.into_iter().map(|(_, p)| p).collect())
}

/// Pick the loopback device with the most specific bus info.
///
/// `candidates` holds `(path, bus_info)` pairs in device order.
pub fn select_loopback(candidates: &[(PathBuf, String)]) -> Option<PathBuf> {
    [BUS_LOOPBACK_DC, BUS_LOOPBACK].iter().find_map(|prefix| {
        candidates
            .iter()
            .find(|(_, bus)| bus.starts_with(prefix))
            .map(|(path, _)| path.clone())
    })
}

/// Scan `/dev/video*` for a v4l2loopback device
pub fn find_loopback_device() -> Result<PathBuf> {
    let mut candidates = Vec::new();
    for path in video_device_paths()? {
        match Device::with_path(&path).and_then(|d| d.query_caps()) {
            Ok(caps) => {
                debug!("{:?}: card '{}', bus '{}'", path, caps.card, caps.bus);
                candidates.push((path, caps.bus));
            }
            Err(e) => debug!("Failed to query {:?}: {}", path, e),
        }
    }

    select_loopback(&candidates).ok_or_else(|| {
        AppError::Device(
            "No v4l2loopback device found; load the kernel module \
             (modprobe v4l2loopback exclusive_caps=1)"
                .to_string(),
        )
    })
}
