//! Audio path: speech decoding, jitter buffering and the ALSA loopback sink
//!
//! Unlike video, audio never skips a period: missing data is concealed by
//! the codec, or replaced with silence when the sink offers less than a
//! codec frame.

pub mod codec;
pub mod device;
pub mod ingest;
pub mod jitter;

pub use codec::{apply_boost, SpeechDecoder, SpeexDecoder};
pub use device::{AlsaSink, AudioSink, SinkPoll, TransferWindow};
pub use ingest::{AudioIngest, AudioIngestSettings};
pub use jitter::JitterState;

/// Transport carrying the audio stream, fixed once negotiated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioTransportMode {
    Udp,
    Tcp,
}
