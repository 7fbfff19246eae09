//! Speech decoding for the phone's audio stream

use std::os::raw::{c_char, c_int, c_void};
use std::ptr;

use tracing::info;

use crate::error::{AppError, Result};

/// Output sample rate
pub const SAMPLE_RATE: u32 = 16000;
/// Samples per decoded codec frame (20 ms)
pub const FRAME_SAMPLES: usize = 320;
/// Bytes per encoded chunk
pub const CHUNK_BYTES: usize = 70;
/// Chunks carried by one datagram or TCP packet
pub const CHUNKS_PER_PACKET: usize = 2;
/// Bytes of one packet
pub const PACKET_BYTES: usize = CHUNK_BYTES * CHUNKS_PER_PACKET;

/// Decoder for fixed-size speech chunks with built-in loss concealment
pub trait SpeechDecoder: Send {
    /// Samples produced per decoded chunk
    fn frame_samples(&self) -> usize;

    /// Decode one chunk into `out`, returning the sample count
    fn decode_chunk(&mut self, chunk: &[u8], out: &mut [i16]) -> Result<usize>;

    /// Synthesize one frame from the decoder state in place of lost data
    fn conceal(&mut self, out: &mut [i16]) -> Result<usize>;

    /// Forget the inter-frame state
    fn reset(&mut self) -> Result<()>;
}

// libspeex FFI
mod ffi {
    use super::{c_char, c_int, c_void};

    pub const SPEEX_MODEID_WB: c_int = 1;
    pub const SPEEX_GET_FRAME_SIZE: c_int = 3;
    pub const SPEEX_RESET_STATE: c_int = 26;

    /// `SpeexBits` from speex_bits.h
    #[repr(C)]
    pub struct SpeexBits {
        pub chars: *mut c_char,
        pub nb_bits: c_int,
        pub char_ptr: c_int,
        pub bit_ptr: c_int,
        pub owner: c_int,
        pub overflow: c_int,
        pub buf_size: c_int,
        pub reserved1: c_int,
        pub reserved2: *mut c_void,
    }

    #[link(name = "speex")]
    extern "C" {
        pub fn speex_lib_get_mode(mode: c_int) -> *const c_void;
        pub fn speex_decoder_init(mode: *const c_void) -> *mut c_void;
        pub fn speex_decoder_destroy(state: *mut c_void);
        pub fn speex_decoder_ctl(state: *mut c_void, request: c_int, ptr: *mut c_void) -> c_int;
        pub fn speex_decode_int(state: *mut c_void, bits: *mut SpeexBits, out: *mut i16) -> c_int;

        pub fn speex_bits_init(bits: *mut SpeexBits);
        pub fn speex_bits_destroy(bits: *mut SpeexBits);
        pub fn speex_bits_reset(bits: *mut SpeexBits);
        pub fn speex_bits_read_from(bits: *mut SpeexBits, bytes: *const c_char, len: c_int);
    }
}

/// Speex wideband decoder (16 kHz mono, 20 ms frames) through libspeex
pub struct SpeexDecoder {
    state: *mut c_void,
    bits: Box<ffi::SpeexBits>,
    frame_size: usize,
}

// The decoder state and bit buffer are only reached through `&mut self`.
unsafe impl Send for SpeexDecoder {}

impl SpeexDecoder {
    pub fn new() -> Result<Self> {
        let mut bits = Box::new(ffi::SpeexBits {
            chars: ptr::null_mut(),
            nb_bits: 0,
            char_ptr: 0,
            bit_ptr: 0,
            owner: 0,
            overflow: 0,
            buf_size: 0,
            reserved1: 0,
            reserved2: ptr::null_mut(),
        });

        let (state, frame_size) = unsafe {
            let mode = ffi::speex_lib_get_mode(ffi::SPEEX_MODEID_WB);
            if mode.is_null() {
                return Err(AppError::Device("Speex wideband mode unavailable".into()));
            }
            let state = ffi::speex_decoder_init(mode);
            if state.is_null() {
                return Err(AppError::Device("Failed to create Speex decoder".into()));
            }
            ffi::speex_bits_init(&mut *bits);

            let mut frame_size: c_int = 0;
            ffi::speex_decoder_ctl(
                state,
                ffi::SPEEX_GET_FRAME_SIZE,
                &mut frame_size as *mut c_int as *mut c_void,
            );
            (state, frame_size)
        };

        let decoder = Self {
            state,
            bits,
            frame_size: frame_size.max(0) as usize,
        };
        if decoder.frame_size != FRAME_SAMPLES {
            return Err(AppError::Device(format!(
                "Speex wideband frame is {} samples, expected {}",
                decoder.frame_size, FRAME_SAMPLES
            )));
        }
        info!("Speex decoder created: {}Hz mono", SAMPLE_RATE);
        Ok(decoder)
    }
}

impl SpeechDecoder for SpeexDecoder {
    fn frame_samples(&self) -> usize {
        self.frame_size
    }

    /// Decodes every frame packed in `chunk` that fits in `out`
    fn decode_chunk(&mut self, chunk: &[u8], out: &mut [i16]) -> Result<usize> {
        let len = c_int::try_from(chunk.len())
            .map_err(|_| AppError::Protocol(format!("speech chunk of {} bytes", chunk.len())))?;
        let mut used = 0;
        unsafe {
            ffi::speex_bits_read_from(&mut *self.bits, chunk.as_ptr() as *const c_char, len);
            while out.len() - used >= self.frame_size {
                let ret = ffi::speex_decode_int(
                    self.state,
                    &mut *self.bits,
                    out[used..].as_mut_ptr(),
                );
                if ret != 0 {
                    break;
                }
                used += self.frame_size;
            }
        }
        if used == 0 {
            return Err(AppError::Protocol("Speex chunk carries no frame".into()));
        }
        Ok(used)
    }

    fn conceal(&mut self, out: &mut [i16]) -> Result<usize> {
        if out.len() < self.frame_size {
            return Err(AppError::Protocol(format!(
                "concealment needs {} samples, window has {}",
                self.frame_size,
                out.len()
            )));
        }
        // null bits: synthesize from the decoder state
        unsafe {
            ffi::speex_decode_int(self.state, ptr::null_mut(), out.as_mut_ptr());
        }
        Ok(self.frame_size)
    }

    fn reset(&mut self) -> Result<()> {
        unsafe {
            ffi::speex_bits_reset(&mut *self.bits);
            ffi::speex_decoder_ctl(self.state, ffi::SPEEX_RESET_STATE, ptr::null_mut());
        }
        Ok(())
    }
}

impl Drop for SpeexDecoder {
    fn drop(&mut self) {
        unsafe {
            ffi::speex_bits_destroy(&mut *self.bits);
            ffi::speex_decoder_destroy(self.state);
        }
    }
}

/// Scale samples by `percent`, saturating at the i16 limits.
///
/// Only values in 50..200 other than 100 have an effect.
pub fn apply_boost(samples: &mut [i16], percent: u32) {
    if percent == 100 || !(50..200).contains(&percent) {
        return;
    }
    for s in samples.iter_mut() {
        let boosted = *s as i32 * percent as i32 / 100;
        *s = boosted.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    }
}
