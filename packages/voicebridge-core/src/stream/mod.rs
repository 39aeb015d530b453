//! Outbound streaming: shared format types, the streaming playback manager,
//! and the file-playback fallback.

pub mod fallback;
pub mod playback;

pub use fallback::{FallbackError, FallbackPlaybackManager, PlaybackRef};
pub use playback::{
    AudioSocketOutbound, OutboundAudio, RtpOutbound, StreamPhase, StreamSnapshot,
    StreamingPlaybackManager, TransportKind,
};

use serde::{Deserialize, Serialize};

/// Wire encodings handled by the media path.
///
/// Only linear PCM16 and the two G.711 encodings exist here; anything else
/// is rejected at the transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Ulaw,
    Alaw,
    #[serde(alias = "slin16", alias = "linear16", alias = "pcm16")]
    Slin16,
}

impl Encoding {
    /// Parses the many spellings seen in provider configs and wire metadata.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ulaw" | "mulaw" | "mu-law" | "g711_ulaw" | "g711ulaw" => Some(Self::Ulaw),
            "alaw" | "a-law" | "g711_alaw" | "g711alaw" => Some(Self::Alaw),
            "slin" | "slin12" | "slin16" | "linear16" | "pcm16" | "pcm16le" => Some(Self::Slin16),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_g711(self) -> bool {
        matches!(self, Self::Ulaw | Self::Alaw)
    }

    #[must_use]
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            Self::Ulaw | Self::Alaw => 1,
            Self::Slin16 => 2,
        }
    }

    /// Canonical sample rate when a config leaves it unspecified.
    #[must_use]
    pub const fn default_sample_rate(self) -> u32 {
        match self {
            Self::Ulaw | Self::Alaw => 8000,
            Self::Slin16 => 16000,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ulaw => "ulaw",
            Self::Alaw => "alaw",
            Self::Slin16 => "slin16",
        }
    }

    /// The byte that represents silence for one sample in this encoding.
    #[must_use]
    pub const fn silence_byte(self) -> u8 {
        match self {
            Self::Ulaw => 0xFF,
            Self::Alaw => 0xD5,
            Self::Slin16 => 0x00,
        }
    }
}

/// An encoding paired with its sample rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub encoding: Encoding,
    pub sample_rate: u32,
}

impl AudioFormat {
    #[must_use]
    pub const fn new(encoding: Encoding, sample_rate: u32) -> Self {
        Self {
            encoding,
            sample_rate,
        }
    }

    /// µ-law at the telephony rate: the canonical Asterisk-side format.
    #[must_use]
    pub const fn ulaw_8k() -> Self {
        Self::new(Encoding::Ulaw, 8000)
    }

    /// Frame size in bytes for the given frame duration.
    ///
    /// 20 ms yields the canonical sizes: 160 B µ-law@8k, 320 B PCM16@8k,
    /// 640 B PCM16@16k.
    #[must_use]
    pub fn frame_bytes(&self, duration_ms: u32) -> usize {
        let samples =
            (u64::from(self.sample_rate) * u64::from(duration_ms)).div_ceil(1000) as usize;
        let size = samples * self.encoding.bytes_per_sample();
        if size == 0 {
            // Degenerate config; fall back to 20 ms at the default rate.
            self.encoding.bytes_per_sample() * 160
        } else {
            size
        }
    }

    /// A frame of pure silence in this encoding.
    #[must_use]
    pub fn silence_frame(&self, duration_ms: u32) -> Vec<u8> {
        vec![self.encoding.silence_byte(); self.frame_bytes(duration_ms)]
    }
}

/// What kind of segment an outbound stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackType {
    Greeting,
    Response,
    Fallback,
}

impl PlaybackType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::Response => "response",
            Self::Fallback => "fallback",
        }
    }
}

/// Builds the deterministic stream id for a playback segment.
#[must_use]
pub fn stream_id(playback_type: PlaybackType, call_id: &str, epoch_ms: u64) -> String {
    format!("stream:{}:{}:{}", playback_type.as_str(), call_id, epoch_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_parse_accepts_aliases() {
        assert_eq!(Encoding::parse("MULAW"), Some(Encoding::Ulaw));
        assert_eq!(Encoding::parse("g711_ulaw"), Some(Encoding::Ulaw));
        assert_eq!(Encoding::parse("linear16"), Some(Encoding::Slin16));
        assert_eq!(Encoding::parse("slin"), Some(Encoding::Slin16));
        assert_eq!(Encoding::parse("a-law"), Some(Encoding::Alaw));
        assert_eq!(Encoding::parse("opus"), None);
    }

    #[test]
    fn canonical_frame_sizes_at_20ms() {
        assert_eq!(AudioFormat::ulaw_8k().frame_bytes(20), 160);
        assert_eq!(
            AudioFormat::new(Encoding::Slin16, 8000).frame_bytes(20),
            320
        );
        assert_eq!(
            AudioFormat::new(Encoding::Slin16, 16000).frame_bytes(20),
            640
        );
    }

    #[test]
    fn silence_frame_uses_encoding_fill() {
        let ulaw = AudioFormat::ulaw_8k().silence_frame(20);
        assert!(ulaw.iter().all(|&b| b == 0xFF));
        let pcm = AudioFormat::new(Encoding::Slin16, 8000).silence_frame(20);
        assert!(pcm.iter().all(|&b| b == 0x00));
    }

    #[test]
    fn stream_id_is_deterministic() {
        assert_eq!(
            stream_id(PlaybackType::Greeting, "call-1", 12345),
            "stream:greeting:call-1:12345"
        );
    }
}
