//! phonecam - use a phone as a webcam and microphone
//!
//! Receives the JPEG video and speech-coded audio streams of a phone
//! camera application over TCP (UDP for audio when available) and feeds a
//! v4l2loopback video device and an ALSA loopback audio device.

pub mod audio;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod protocol;
pub mod session;
pub mod utils;
pub mod video;

pub use error::{AppError, Result};
