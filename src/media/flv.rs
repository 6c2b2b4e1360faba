//! FLV tag body classification
//!
//! RTMP audio/video messages are FLV tag bodies. The core only needs to know
//! whether a body is a keyframe or a codec sequence header; everything else
//! belongs to the codec layer.
//!
//! RTMP Video Data:
//! ```text
//! +----------+----------+
//! | FrameType| CodecID  | AVCPacketType(1) | ...
//! | (4 bits) | (4 bits) |
//! +----------+----------+
//! ```
//!
//! Enhanced RTMP sets the top bit of the first byte (IsExHeader); the frame
//! type then occupies bits 4-6 and the low nibble is the packet type.
//!
//! RTMP Audio Data:
//! ```text
//! +-----------+---------+----------+----------+
//! |SoundFormat|SoundRate|SoundSize |SoundType | AACPacketType(1) | ...
//! | (4 bits)  | (2 bits)| (1 bit)  | (1 bit)  |
//! +-----------+---------+----------+----------+
//! ```

/// Enhanced RTMP extended header flag
const EX_HEADER: u8 = 0x80;

/// Enhanced RTMP packet type: sequence start
const EX_PACKET_SEQUENCE_START: u8 = 0;

/// Video frame type (upper 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    /// Keyframe (for AVC, a seekable frame)
    Keyframe = 1,
    /// Inter frame (for AVC, a non-seekable frame)
    InterFrame = 2,
    /// Disposable inter frame (H.263 only)
    DisposableInterFrame = 3,
    /// Generated keyframe (reserved for server use)
    GeneratedKeyframe = 4,
    /// Video info/command frame
    VideoInfoFrame = 5,
}

impl VideoFrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        let bits = if b & EX_HEADER != 0 {
            (b >> 4) & 0x07
        } else {
            (b >> 4) & 0x0F
        };

        match bits {
            1 => Some(VideoFrameType::Keyframe),
            2 => Some(VideoFrameType::InterFrame),
            3 => Some(VideoFrameType::DisposableInterFrame),
            4 => Some(VideoFrameType::GeneratedKeyframe),
            5 => Some(VideoFrameType::VideoInfoFrame),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(
            self,
            VideoFrameType::Keyframe | VideoFrameType::GeneratedKeyframe
        )
    }
}

/// Video codec ID (lower 4 bits of first byte, legacy header only)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    /// AVC (H.264)
    Avc = 7,
    /// HEVC (H.265) - enhanced RTMP extension
    Hevc = 12,
    /// AV1 - enhanced RTMP extension
    Av1 = 13,
}

impl VideoCodec {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x0F {
            7 => Some(VideoCodec::Avc),
            12 => Some(VideoCodec::Hevc),
            13 => Some(VideoCodec::Av1),
            _ => None,
        }
    }
}

/// Audio format (upper 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    /// MP3
    Mp3 = 2,
    /// AAC
    Aac = 10,
    /// Speex
    Speex = 11,
}

impl AudioFormat {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            2 => Some(AudioFormat::Mp3),
            10 => Some(AudioFormat::Aac),
            11 => Some(AudioFormat::Speex),
            _ => None,
        }
    }
}

/// Whether a video tag body is a keyframe (sequence headers included)
pub fn is_video_keyframe(data: &[u8]) -> bool {
    data.first()
        .and_then(|b| VideoFrameType::from_byte(*b))
        .map(|ft| ft.is_keyframe())
        .unwrap_or(false)
}

/// Whether a video tag body is a codec sequence header
pub fn is_video_sequence_header(data: &[u8]) -> bool {
    let Some(&first) = data.first() else {
        return false;
    };

    if first & EX_HEADER != 0 {
        return first & 0x0F == EX_PACKET_SEQUENCE_START;
    }

    data.len() >= 2 && VideoCodec::from_byte(first).is_some() && data[1] == 0
}

/// Whether an audio tag body is an AAC sequence header
pub fn is_audio_sequence_header(data: &[u8]) -> bool {
    data.len() >= 2 && AudioFormat::from_byte(data[0]) == Some(AudioFormat::Aac) && data[1] == 0
}
