//! Jitter state: decoded PCM awaiting the sink, packet selection and the
//! keepalive counter

use super::codec::{FRAME_SAMPLES, PACKET_BYTES};
use super::AudioTransportMode;

/// Most decoded samples held before the oldest are dropped
pub const MAX_BUFFERED_SAMPLES: usize = FRAME_SAMPLES * 6;
/// Loop iterations between UDP keepalives
pub const KEEPALIVE_TICKS: u32 = 1024;

#[derive(Debug)]
pub struct JitterState {
    pcm: Vec<i16>,
    /// True until the sink ring has been primed; set again after recovery
    pub first: bool,
    keepalive: u32,
    /// Trailing bytes of an incomplete TCP packet
    partial: Vec<u8>,
    short_datagrams: u64,
}

impl Default for JitterState {
    fn default() -> Self {
        Self::new()
    }
}

impl JitterState {
    pub fn new() -> Self {
        Self {
            pcm: Vec::with_capacity(MAX_BUFFERED_SAMPLES),
            first: true,
            keepalive: 0,
            partial: Vec::with_capacity(PACKET_BYTES * 2),
            short_datagrams: 0,
        }
    }

    /// Decoded samples not yet handed to the sink
    pub fn buffered(&self) -> usize {
        self.pcm.len()
    }

    /// Datagrams dropped for being shorter than one packet
    pub fn short_datagrams(&self) -> u64 {
        self.short_datagrams
    }

    /// Select the newest complete packet from data received this tick.
    ///
    /// Older packets in the same read are skipped. Over TCP, bytes of an
    /// incomplete packet are kept for the next tick; a short datagram is dropped.
    pub fn select_packet(
        &mut self,
        data: &[u8],
        mode: AudioTransportMode,
    ) -> Option<[u8; PACKET_BYTES]> {
        let mut packet = [0u8; PACKET_BYTES];
        match mode {
            AudioTransportMode::Udp => {
                if data.len() < PACKET_BYTES {
                    self.short_datagrams += 1;
                    return None;
                }
                packet.copy_from_slice(&data[data.len() - PACKET_BYTES..]);
            }
            AudioTransportMode::Tcp => {
                self.partial.extend_from_slice(data);
                let whole = self.partial.len() / PACKET_BYTES;
                if whole == 0 {
                    return None;
                }
                let start = (whole - 1) * PACKET_BYTES;
                packet.copy_from_slice(&self.partial[start..start + PACKET_BYTES]);
                self.partial.drain(..whole * PACKET_BYTES);
            }
        }
        Some(packet)
    }

    /// Append decoded samples, keeping only the newest when over capacity
    pub fn push(&mut self, samples: &[i16]) {
        self.pcm.extend_from_slice(samples);
        if self.pcm.len() > MAX_BUFFERED_SAMPLES {
            let excess = self.pcm.len() - MAX_BUFFERED_SAMPLES;
            self.pcm.drain(..excess);
        }
    }

    /// Move up to one codec frame of samples into `out`, returning the count
    pub fn drain_into(&mut self, out: &mut [i16]) -> usize {
        let n = self.pcm.len().min(out.len()).min(FRAME_SAMPLES);
        out[..n].copy_from_slice(&self.pcm[..n]);
        self.pcm.drain(..n);
        n
    }

    /// Count one loop iteration; true when a keepalive is due
    pub fn keepalive_due(&mut self) -> bool {
        self.keepalive += 1;
        if self.keepalive > KEEPALIVE_TICKS {
            self.keepalive = 0;
            true
        } else {
            false
        }
    }
}
