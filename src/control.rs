//! Camera control commands and the single-slot mailbox carrying them to the video thread

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppError, Result};

/// White balance presets understood by the phone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WhiteBalance {
    Auto,
    Incandescent,
    WarmFluorescent,
    Twilight,
    Fluorescent,
    Daylight,
    CloudyDaylight,
    Shade,
}

impl WhiteBalance {
    pub const ALL: [WhiteBalance; 8] = [
        WhiteBalance::Auto,
        WhiteBalance::Incandescent,
        WhiteBalance::WarmFluorescent,
        WhiteBalance::Twilight,
        WhiteBalance::Fluorescent,
        WhiteBalance::Daylight,
        WhiteBalance::CloudyDaylight,
        WhiteBalance::Shade,
    ];

    /// Value sent on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            WhiteBalance::Auto => "auto",
            WhiteBalance::Incandescent => "incandescent",
            WhiteBalance::WarmFluorescent => "warm-fluorescent",
            WhiteBalance::Twilight => "twilight",
            WhiteBalance::Fluorescent => "fluorescent",
            WhiteBalance::Daylight => "daylight",
            WhiteBalance::CloudyDaylight => "cloudy-daylight",
            WhiteBalance::Shade => "shade",
        }
    }

    /// Next preset, wrapping around
    pub fn next(&self) -> WhiteBalance {
        let idx = Self::ALL.iter().position(|wb| wb == self).unwrap_or(0);
        Self::ALL[(idx + 1) % Self::ALL.len()]
    }
}

impl fmt::Display for WhiteBalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WhiteBalance {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|wb| wb.as_str() == s)
            .ok_or_else(|| AppError::Protocol(format!("unknown white balance '{}'", s)))
    }
}

/// Command codes
mod code {
    pub const EXPOSURE_UNLOCK: u32 = 1;
    pub const EXPOSURE_LOCK: u32 = 2;
    pub const WHITE_BALANCE: u32 = 3;
    pub const ZOOM_IN: u32 = 6;
    pub const ZOOM_OUT: u32 = 7;
    pub const AUTO_FOCUS: u32 = 8;
    pub const TOGGLE_LED: u32 = 9;
}

/// A camera control command, multiplexed onto the video connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    ExposureLock(bool),
    WhiteBalance(WhiteBalance),
    ZoomIn,
    ZoomOut,
    AutoFocus,
    ToggleLed,
}

impl ControlCommand {
    /// Numeric code of the command
    pub fn code(&self) -> u32 {
        match self {
            ControlCommand::ExposureLock(false) => code::EXPOSURE_UNLOCK,
            ControlCommand::ExposureLock(true) => code::EXPOSURE_LOCK,
            ControlCommand::WhiteBalance(_) => code::WHITE_BALANCE,
            ControlCommand::ZoomIn => code::ZOOM_IN,
            ControlCommand::ZoomOut => code::ZOOM_OUT,
            ControlCommand::AutoFocus => code::AUTO_FOCUS,
            ControlCommand::ToggleLed => code::TOGGLE_LED,
        }
    }

    /// String payload, for commands that carry one
    pub fn value(&self) -> Option<&'static str> {
        match self {
            ControlCommand::WhiteBalance(wb) => Some(wb.as_str()),
            _ => None,
        }
    }

    /// Rebuild a command from its `(code, value)` pair
    pub fn from_parts(code: u32, value: Option<&str>) -> Result<Self> {
        let cmd = match (code, value) {
            (code::EXPOSURE_UNLOCK, None) => ControlCommand::ExposureLock(false),
            (code::EXPOSURE_LOCK, None) => ControlCommand::ExposureLock(true),
            (code::WHITE_BALANCE, Some(v)) => ControlCommand::WhiteBalance(v.parse()?),
            (code::ZOOM_IN, None) => ControlCommand::ZoomIn,
            (code::ZOOM_OUT, None) => ControlCommand::ZoomOut,
            (code::AUTO_FOCUS, None) => ControlCommand::AutoFocus,
            (code::TOGGLE_LED, None) => ControlCommand::ToggleLed,
            (code, Some(v)) => {
                return Err(AppError::Protocol(format!(
                    "control code {} does not take a value (got '{}')",
                    code, v
                )))
            }
            (code, None) => {
                return Err(AppError::Protocol(format!(
                    "unknown or incomplete control code {}",
                    code
                )))
            }
        };
        Ok(cmd)
    }
}

/// Single-slot outgoing command mailbox.
///
/// Written by the UI side, drained by the video ingest thread after the
/// command has been sent. A full slot is back-pressure: the caller retries.
#[derive(Debug, Default)]
pub struct ControlChannel {
    pending: Mutex<Option<ControlCommand>>,
}

impl ControlChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `cmd`, failing with [`AppError::ControlBusy`] when a command is still pending
    pub fn post(&self, cmd: ControlCommand) -> Result<()> {
        let mut slot = self.pending.lock();
        if slot.is_some() {
            return Err(AppError::ControlBusy);
        }
        debug!("Control command queued: {:?}", cmd);
        *slot = Some(cmd);
        Ok(())
    }

    /// The pending command, left in the slot until [`ControlChannel::clear`]
    pub fn peek(&self) -> Option<ControlCommand> {
        *self.pending.lock()
    }

    /// Whether a command is waiting to be sent
    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Drop any pending command
    pub fn clear(&self) {
        self.pending.lock().take();
    }
}

/// Camera settings the phone does not report back, tracked locally.
///
/// A setting changes only once its command is accepted by the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraSettings {
    pub white_balance: WhiteBalance,
    pub exposure_locked: bool,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            white_balance: WhiteBalance::Auto,
            exposure_locked: false,
        }
    }
}

impl CameraSettings {
    /// Request the next white balance preset
    pub fn cycle_white_balance(&mut self, channel: &ControlChannel) -> Result<WhiteBalance> {
        let next = self.white_balance.next();
        channel.post(ControlCommand::WhiteBalance(next))?;
        self.white_balance = next;
        Ok(next)
    }

    /// Request the opposite exposure lock state
    pub fn toggle_exposure_lock(&mut self, channel: &ControlChannel) -> Result<bool> {
        let locked = !self.exposure_locked;
        channel.post(ControlCommand::ExposureLock(locked))?;
        self.exposure_locked = locked;
        Ok(locked)
    }
}
