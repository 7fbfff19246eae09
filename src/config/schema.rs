use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::video::format::Resolution;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// How the phone is reached
    pub connection: ConnectionConfig,
    /// Video stream and sink settings
    pub video: VideoConfig,
    /// Audio stream and sink settings
    pub audio: AudioConfig,
}

/// How the byte stream to the phone is established
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// TCP client to the phone's address
    #[default]
    Wifi,
    /// TCP client to localhost through `adb forward`
    Adb,
    /// usbmuxd tunnel to the first attached iOS device
    Ios,
    /// Listen for the phone to connect
    Server,
}

impl ConnectionMode {
    /// Whether the link runs through a USB tunnel rather than the network
    pub fn is_tunnel(&self) -> bool {
        matches!(self, ConnectionMode::Adb | ConnectionMode::Ios)
    }
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub mode: ConnectionMode,
    /// Phone address (ignored for adb, ios and server modes)
    pub host: IpAddr,
    /// Phone TCP port; audio over UDP uses `port + 1`
    pub port: u16,
    /// Readiness wait for outgoing connects, in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mode: ConnectionMode::Wifi,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 4747,
            connect_timeout_ms: 2000,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Video configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VideoConfig {
    pub enabled: bool,
    /// v4l2loopback device path; discovered by bus info when unset
    pub device: Option<String>,
    /// Sink width, only applied to generic v4l2loopback devices
    pub width: Option<u32>,
    /// Sink height, only applied to generic v4l2loopback devices
    pub height: Option<u32>,
    /// Codec name sent in the stream request
    pub codec: String,
    /// Ready frames tolerated before newly received frames are dropped
    pub buffer_limit: usize,
    /// Frame slots allocated per session
    pub frame_slots: usize,
    pub mirror_horizontal: bool,
    pub mirror_vertical: bool,
    /// Seconds without any byte from the peer before the stream is considered dead
    pub stall_timeout_secs: u64,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: None,
            width: None,
            height: None,
            codec: "jpg".to_string(),
            buffer_limit: 0,
            frame_slots: 3,
            mirror_horizontal: false,
            mirror_vertical: false,
            stall_timeout_secs: 10,
        }
    }
}

impl VideoConfig {
    /// Explicit sink size, when both dimensions are configured
    pub fn sink_size(&self) -> Option<Resolution> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some(Resolution::new(w, h)),
            _ => None,
        }
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

/// Audio configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    /// ALSA device name; the first Loopback card is used when unset
    pub device: Option<String>,
    /// Output gain in percent (effective for 50..200)
    pub boost_percent: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device: None,
            boost_percent: 100,
        }
    }
}
