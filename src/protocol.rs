//! Wire format of the phone application's video, audio and control messages
//!
//! Requests are plain text lines sent on a fresh connection. Replies and
//! stream payloads are binary.

use crate::control::ControlCommand;
use crate::error::{AppError, Result};
use crate::video::format::Resolution;

/// Size of the video handshake reply
pub const VIDEO_HEADER_LEN: usize = 9;
/// Size of the little-endian frame length prefix
pub const FRAME_LENGTH_LEN: usize = 4;
/// Size of the audio handshake reply (TCP only)
pub const AUDIO_HEADER_LEN: usize = 6;
/// Magic prefix of the audio handshake reply
pub const AUDIO_MAGIC: &[u8; 5] = b"-@v02";

/// Audio stream start request, also the UDP probe and keepalive
pub const AUDIO_REQUEST: &str = "CMD /v2/audio";
/// Sent once when a UDP audio stream is torn down
pub const STOP_REQUEST: &str = "CMD /v1/stop";
/// Battery level request
pub const BATTERY_REQUEST: &str = "GET /battery HTTP/1.0\r\n\r\n";

const CONTROL_PREFIX: &str = "CMD /v1/ctl?";

/// Video stream request carrying the sink's codec and size
pub fn video_request(codec: &str, size: Resolution) -> String {
    format!("CMD /v3/video/{}/{}x{}", codec, size.width, size.height)
}

/// Parse the video handshake reply.
///
/// Width and height are big-endian and interpreted as signed; zero or
/// negative values are rejected.
pub fn parse_video_header(header: &[u8; VIDEO_HEADER_LEN]) -> Result<Resolution> {
    let width = i16::from_be_bytes([header[0], header[1]]);
    let height = i16::from_be_bytes([header[2], header[3]]);

    if width <= 0 || height <= 0 {
        return Err(AppError::Protocol(format!(
            "Invalid video stream size {}x{}",
            width, height
        )));
    }
    Ok(Resolution::new(width as u32, height as u32))
}

/// Build a video handshake reply (used by test peers)
pub fn encode_video_header(size: Resolution) -> [u8; VIDEO_HEADER_LEN] {
    let mut header = [0u8; VIDEO_HEADER_LEN];
    header[0..2].copy_from_slice(&(size.width as u16).to_be_bytes());
    header[2..4].copy_from_slice(&(size.height as u16).to_be_bytes());
    header
}

/// Decode the little-endian length prefix of a video frame
pub fn parse_frame_length(prefix: [u8; FRAME_LENGTH_LEN]) -> usize {
    u32::from_le_bytes(prefix) as usize
}

/// Control frame text for `cmd`
pub fn encode_control(cmd: &ControlCommand) -> String {
    match cmd.value() {
        Some(value) => format!("{}{}={}", CONTROL_PREFIX, cmd.code(), value),
        None => format!("{}{}", CONTROL_PREFIX, cmd.code()),
    }
}

/// Parse a control frame back into a command
pub fn parse_control(text: &str) -> Result<ControlCommand> {
    let query = text
        .strip_prefix(CONTROL_PREFIX)
        .ok_or_else(|| AppError::Protocol(format!("not a control frame: '{}'", text)))?;

    let (code, value) = match query.split_once('=') {
        Some((code, value)) => (code, Some(value)),
        None => (query, None),
    };
    let code = code
        .parse::<u32>()
        .map_err(|_| AppError::Protocol(format!("invalid control code '{}'", code)))?;

    ControlCommand::from_parts(code, value)
}

/// Validate the audio handshake reply against the expected chunks per packet
pub fn parse_audio_header(header: &[u8; AUDIO_HEADER_LEN], expected_chunks: u8) -> Result<()> {
    if &header[..AUDIO_MAGIC.len()] != AUDIO_MAGIC {
        return Err(AppError::Protocol("Invalid audio data stream".into()));
    }
    let chunks = header[AUDIO_MAGIC.len()];
    if chunks != expected_chunks {
        return Err(AppError::Protocol(format!(
            "Unsupported audio stream: {} chunks per packet, expected {}",
            chunks, expected_chunks
        )));
    }
    Ok(())
}

/// Extract the battery percentage from an HTTP-style reply.
///
/// Returns `None` when no digits follow the blank line.
pub fn parse_battery_reply(reply: &[u8]) -> Option<u8> {
    let body_start = reply
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)?;

    let digits: String = reply[body_start..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .map(|&b| b as char)
        .collect();
    digits.parse::<u32>().ok().map(|v| v.min(100) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::WhiteBalance;

    #[test]
    fn test_video_request() {
        assert_eq!(
            video_request("jpg", Resolution::VGA),
            "CMD /v3/video/jpg/640x480"
        );
    }

    #[test]
    fn test_video_header() {
        let header = encode_video_header(Resolution::new(640, 480));
        assert_eq!(&header[..4], &[0x02, 0x80, 0x01, 0xE0]);
        assert_eq!(parse_video_header(&header).unwrap(), Resolution::VGA);
    }

    #[test]
    fn test_video_header_rejects_zero_and_negative() {
        let zero_width = encode_video_header(Resolution::new(0, 480));
        assert!(matches!(
            parse_video_header(&zero_width),
            Err(AppError::Protocol(_))
        ));

        let zero_height = encode_video_header(Resolution::new(640, 0));
        assert!(matches!(
            parse_video_header(&zero_height),
            Err(AppError::Protocol(_))
        ));

        let mut negative = [0u8; VIDEO_HEADER_LEN];
        negative[0..2].copy_from_slice(&(-2i16).to_be_bytes());
        negative[2..4].copy_from_slice(&480u16.to_be_bytes());
        assert!(parse_video_header(&negative).is_err());
    }

    #[test]
    fn test_frame_length_is_little_endian() {
        assert_eq!(parse_frame_length([0xE8, 0x03, 0, 0]), 1000);
    }

    #[test]
    fn test_control_wire_text() {
        assert_eq!(encode_control(&ControlCommand::AutoFocus), "CMD /v1/ctl?8");
        assert_eq!(
            encode_control(&ControlCommand::WhiteBalance(WhiteBalance::Daylight)),
            "CMD /v1/ctl?3=daylight"
        );
    }

    #[test]
    fn test_control_parses_back() {
        let commands = [
            ControlCommand::ExposureLock(true),
            ControlCommand::ExposureLock(false),
            ControlCommand::WhiteBalance(WhiteBalance::WarmFluorescent),
            ControlCommand::ZoomIn,
            ControlCommand::ZoomOut,
            ControlCommand::AutoFocus,
            ControlCommand::ToggleLed,
        ];
        for cmd in commands {
            let parsed = parse_control(&encode_control(&cmd)).unwrap();
            assert_eq!(parsed, cmd);
            assert_eq!((parsed.code(), parsed.value()), (cmd.code(), cmd.value()));
        }

        assert!(parse_control("CMD /v2/audio").is_err());
        assert!(parse_control("CMD /v1/ctl?zoom").is_err());
    }

    #[test]
    fn test_audio_header() {
        assert!(parse_audio_header(b"-@v02\x02", 2).is_ok());
        assert!(matches!(
            parse_audio_header(b"-@v01\x02", 2),
            Err(AppError::Protocol(_))
        ));
        assert!(matches!(
            parse_audio_header(b"-@v02\x03", 2),
            Err(AppError::Protocol(_))
        ));
    }

    #[test]
    fn test_battery_reply() {
        assert_eq!(
            parse_battery_reply(b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\n87"),
            Some(87)
        );
        assert_eq!(parse_battery_reply(b"HTTP/1.0 200 OK\r\n\r\n"), None);
        assert_eq!(parse_battery_reply(b"42"), None);
    }
}
