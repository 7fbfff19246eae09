//! Audio sink: ALSA loopback playback device driven through transfer windows

use std::path::Path;
use std::time::Duration;

use alsa::pcm::{Access, Format, Frames, HwParams, State};
use alsa::{Direction, ValueOr, PCM};
use tracing::{debug, info, warn};

use super::codec::{FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::{AppError, Result};

/// Frames per period (20 ms)
pub const PERIOD_FRAMES: usize = FRAME_SAMPLES;
/// Periods in the ring buffer
pub const PERIODS: usize = 2;
/// Upper bound on one wait for the device to drain a period
const SINK_WAIT_MS: u32 = 100;
/// Attempts to resume a suspended device before re-preparing it
const RESUME_ATTEMPTS: u32 = 1000;

/// A writable region of the sink's ring buffer.
///
/// Returned by [`AudioSink::check`]; hand it to [`AudioSink::commit`] or
/// give it up with [`TransferWindow::discard`].
#[must_use = "a transfer window must be committed or discarded"]
#[derive(Debug)]
pub struct TransferWindow {
    offset: usize,
    frames: usize,
    samples: Vec<i16>,
    consumed: bool,
}

impl TransferWindow {
    pub fn new(offset: usize, frames: usize, mut samples: Vec<i16>) -> Self {
        samples.clear();
        samples.resize(frames, 0);
        Self {
            offset,
            frames,
            samples,
            consumed: false,
        }
    }

    /// Position of the window in the ring buffer, in frames
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Frames the window accepts
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn samples_mut(&mut self) -> &mut [i16] {
        &mut self.samples[..self.frames]
    }

    /// Commit fewer frames than offered
    pub fn truncate(&mut self, frames: usize) {
        self.frames = self.frames.min(frames);
    }

    /// Give the window up without writing anything
    pub fn discard(mut self) -> Vec<i16> {
        self.consumed = true;
        std::mem::take(&mut self.samples)
    }

    /// Consume the window, yielding the samples to write and the spare buffer
    pub fn into_samples(mut self) -> Vec<i16> {
        self.consumed = true;
        let mut samples = std::mem::take(&mut self.samples);
        samples.truncate(self.frames);
        samples
    }
}

impl Drop for TransferWindow {
    fn drop(&mut self) {
        if !self.consumed {
            warn!(
                "Transfer window of {} frames dropped without commit",
                self.frames
            );
        }
    }
}

/// Outcome of polling the sink
#[derive(Debug)]
pub enum SinkPoll {
    NotReady,
    Ready(TransferWindow),
}

/// Consumer of decoded PCM through a ring buffer.
///
/// `first` is true until the ring has been primed once; recovery from an
/// underrun or overrun sets it again.
pub trait AudioSink: Send {
    fn check(&mut self, first: &mut bool) -> Result<SinkPoll>;

    fn commit(&mut self, window: TransferWindow, first: &mut bool) -> Result<()>;
}

/// ALSA playback device, 16 kHz mono S16
pub struct AlsaSink {
    pcm: PCM,
    name: String,
    period: usize,
    buffer: usize,
    written: usize,
    spare: Vec<i16>,
}

impl AlsaSink {
    /// Open `device`, or the first free ALSA Loopback substream when `None`
    pub fn open(device: Option<&str>) -> Result<Self> {
        if let Some(name) = device {
            return Self::open_pcm(name);
        }

        for card in loopback_cards(Path::new("/proc/asound")) {
            for sub in 0..8 {
                let name = format!("hw:{},0,{}", card, sub);
                match Self::open_pcm(&name) {
                    Ok(sink) => {
                        info!(
                            "Audio sink {} (capture side hw:{},1,{})",
                            name, card, sub
                        );
                        return Ok(sink);
                    }
                    Err(e) => debug!("Skipping {}: {}", name, e),
                }
            }
        }
        Err(AppError::Device(
            "No free ALSA Loopback device found; load the kernel module (modprobe snd-aloop)"
                .to_string(),
        ))
    }

    fn open_pcm(name: &str) -> Result<Self> {
        let pcm = PCM::new(name, Direction::Playback, false).map_err(|e| {
            AppError::Device(format!("Failed to open audio device {}: {}", name, e))
        })?;

        let (period, buffer) = {
            let hwp = HwParams::any(&pcm)
                .map_err(|e| AppError::Device(format!("Failed to get HwParams: {}", e)))?;
            hwp.set_access(Access::RWInterleaved)
                .map_err(|e| AppError::Device(format!("Failed to set access: {}", e)))?;
            hwp.set_format(Format::s16())
                .map_err(|e| AppError::Device(format!("Failed to set format: {}", e)))?;
            hwp.set_channels(1)
                .map_err(|e| AppError::Device(format!("Failed to set channels: {}", e)))?;
            hwp.set_rate(SAMPLE_RATE, ValueOr::Nearest)
                .map_err(|e| AppError::Device(format!("Failed to set sample rate: {}", e)))?;
            hwp.set_period_size_near(PERIOD_FRAMES as Frames, ValueOr::Nearest)
                .map_err(|e| AppError::Device(format!("Failed to set period size: {}", e)))?;
            hwp.set_buffer_size_near((PERIOD_FRAMES * PERIODS) as Frames)
                .map_err(|e| AppError::Device(format!("Failed to set buffer size: {}", e)))?;
            pcm.hw_params(&hwp)
                .map_err(|e| AppError::Device(format!("Failed to apply hw params: {}", e)))?;

            let current = pcm
                .hw_params_current()
                .map_err(|e| AppError::Device(format!("Failed to read hw params: {}", e)))?;
            let rate = current.get_rate().unwrap_or(0);
            if rate != SAMPLE_RATE {
                return Err(AppError::Device(format!(
                    "Rate doesn't match (requested {}Hz, got {}Hz)",
                    SAMPLE_RATE, rate
                )));
            }
            let period = current.get_period_size().unwrap_or(0) as usize;
            let buffer = current.get_buffer_size().unwrap_or(0) as usize;
            (period, buffer)
        };

        if period != PERIOD_FRAMES || buffer != PERIOD_FRAMES * PERIODS {
            return Err(AppError::Device(format!(
                "Unexpected audio device geometry: period {} buffer {}",
                period, buffer
            )));
        }

        {
            let swp = pcm
                .sw_params_current()
                .map_err(|e| AppError::Device(format!("Failed to get SwParams: {}", e)))?;
            swp.set_start_threshold(period as Frames)
                .map_err(|e| AppError::Device(format!("Failed to set start threshold: {}", e)))?;
            swp.set_avail_min(period as Frames)
                .map_err(|e| AppError::Device(format!("Failed to set avail min: {}", e)))?;
            pcm.sw_params(&swp)
                .map_err(|e| AppError::Device(format!("Failed to apply sw params: {}", e)))?;
        }

        pcm.prepare()
            .map_err(|e| AppError::Device(format!("Failed to prepare PCM: {}", e)))?;

        Ok(Self {
            pcm,
            name: name.to_string(),
            period,
            buffer,
            written: 0,
            spare: Vec::with_capacity(period),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn recover(&self, err: alsa::Error) -> Result<()> {
        warn!("Audio device {} recovering from: {}", self.name, err);
        self.pcm
            .try_recover(err, true)
            .map_err(|e| AppError::Device(format!("{} recovery failed: {}", self.name, e)))
    }

    fn resume(&self) -> Result<()> {
        for _ in 0..RESUME_ATTEMPTS {
            match self.pcm.resume() {
                Ok(()) => return Ok(()),
                Err(e) if e.errno() == libc::EAGAIN => {
                    std::thread::sleep(Duration::from_millis(1))
                }
                Err(_) => break,
            }
        }
        self.pcm
            .prepare()
            .map_err(|e| AppError::Device(format!("Can't recover {} from suspend: {}", self.name, e)))
    }
}

impl AudioSink for AlsaSink {
    fn check(&mut self, first: &mut bool) -> Result<SinkPoll> {
        match self.pcm.state() {
            State::XRun => {
                warn!("Audio device {} underrun", self.name);
                self.pcm
                    .prepare()
                    .map_err(|e| AppError::Device(format!("XRUN recovery failed: {}", e)))?;
                *first = true;
            }
            State::Suspended => {
                warn!("Audio device {} suspended", self.name);
                self.resume()?;
            }
            _ => {}
        }

        let avail = match self.pcm.avail_update() {
            Ok(avail) => avail.max(0) as usize,
            Err(e) => {
                self.recover(e)?;
                *first = true;
                return Ok(SinkPoll::NotReady);
            }
        };

        if avail < self.period {
            if *first {
                *first = false;
                self.pcm
                    .start()
                    .map_err(|e| AppError::Device(format!("PCM start failed: {}", e)))?;
            } else if let Err(e) = self.pcm.wait(Some(SINK_WAIT_MS)) {
                self.recover(e)?;
                *first = true;
            }
            return Ok(SinkPoll::NotReady);
        }

        let offset = self.written % self.buffer.max(1);
        let samples = std::mem::take(&mut self.spare);
        Ok(SinkPoll::Ready(TransferWindow::new(
            offset,
            self.period,
            samples,
        )))
    }

    fn commit(&mut self, window: TransferWindow, first: &mut bool) -> Result<()> {
        let samples = window.into_samples();
        let result = self.pcm.io_i16().and_then(|io| io.writei(&samples));

        match result {
            Ok(n) if n == samples.len() => self.written += n,
            Ok(n) => {
                debug!("Short audio write: {} of {}", n, samples.len());
                self.written += n;
                self.pcm
                    .prepare()
                    .map_err(|e| AppError::Device(format!("Commit recovery failed: {}", e)))?;
                *first = true;
            }
            Err(e) => {
                self.recover(e)?;
                *first = true;
            }
        }

        self.spare = samples;
        Ok(())
    }
}

/// Indices of ALSA cards whose id is `Loopback`
pub fn loopback_cards(proc_root: &Path) -> Vec<u32> {
    (0..50)
        .filter(|card| {
            std::fs::read_to_string(proc_root.join(format!("card{}/id", card)))
                .map(|id| id.starts_with("Loopback"))
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_cards() {
        let dir = tempfile::tempdir().unwrap();
        for (card, id) in [(0, "PCH\n"), (2, "Loopback\n"), (3, "Loopback_1\n")] {
            let card_dir = dir.path().join(format!("card{}", card));
            std::fs::create_dir(&card_dir).unwrap();
            std::fs::write(card_dir.join("id"), id).unwrap();
        }
        assert_eq!(loopback_cards(dir.path()), vec![2, 3]);
    }

    #[test]
    fn test_window_truncate_and_consume() {
        let mut window = TransferWindow::new(320, 320, Vec::new());
        assert_eq!(window.offset(), 320);
        window.samples_mut()[0] = 7;
        window.truncate(100);
        assert_eq!(window.frames(), 100);
        window.truncate(500);
        assert_eq!(window.frames(), 100);

        let samples = window.into_samples();
        assert_eq!(samples.len(), 100);
        assert_eq!(samples[0], 7);

        let window = TransferWindow::new(0, 320, samples);
        assert_eq!(window.discard().len(), 320);
    }
}
