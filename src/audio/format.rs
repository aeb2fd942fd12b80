//! Target formats and how the transcoding tool is asked to produce them

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bitrates offered for lossy targets (kbps)
pub const COMMON_BITRATES: &[u32] = &[128, 192, 256, 320];

/// Bitrate used when none is configured (kbps)
pub const DEFAULT_BITRATE: u32 = 192;

/// Output container/codec combinations the engine can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp3,
    Wav,
    Flac,
    Aac,
    Ogg,
    M4a,
    Wma,
    Opus,
    Aiff,
    Alac,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 10] = [
        OutputFormat::Mp3,
        OutputFormat::Wav,
        OutputFormat::Flac,
        OutputFormat::Aac,
        OutputFormat::Ogg,
        OutputFormat::M4a,
        OutputFormat::Wma,
        OutputFormat::Opus,
        OutputFormat::Aiff,
        OutputFormat::Alac,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Wav => "wav",
            OutputFormat::Flac => "flac",
            OutputFormat::Aac => "aac",
            OutputFormat::Ogg => "ogg",
            OutputFormat::M4a => "m4a",
            OutputFormat::Wma => "wma",
            OutputFormat::Opus => "opus",
            OutputFormat::Aiff => "aiff",
            OutputFormat::Alac => "alac",
        }
    }

    /// File extension written for this format
    ///
    /// ALAC lives in an MP4 container, so it shares `.m4a` with AAC-in-MP4.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Alac => "m4a",
            other => other.name(),
        }
    }

    /// ffmpeg audio encoder for this format
    pub fn codec(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "libmp3lame",
            OutputFormat::Wav => "pcm_s16le",
            OutputFormat::Flac => "flac",
            OutputFormat::Aac | OutputFormat::M4a => "aac",
            OutputFormat::Ogg => "libvorbis",
            OutputFormat::Wma => "wmav2",
            OutputFormat::Opus => "libopus",
            OutputFormat::Aiff => "pcm_s16be",
            OutputFormat::Alac => "alac",
        }
    }

    /// Whether a bitrate is meaningful for this format
    pub fn is_lossy(&self) -> bool {
        matches!(
            self,
            OutputFormat::Mp3
                | OutputFormat::Aac
                | OutputFormat::Ogg
                | OutputFormat::M4a
                | OutputFormat::Wma
                | OutputFormat::Opus
        )
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        OutputFormat::ALL
            .iter()
            .copied()
            .find(|f| f.name() == lower)
            .ok_or_else(|| format!("unsupported output format: {}", s))
    }
}

/// Parse a bitrate written as `192`, `192k` or `192K`
pub fn parse_bitrate(s: &str) -> Result<u32, String> {
    let trimmed = s.trim().trim_end_matches(['k', 'K']);
    match trimmed.parse::<u32>() {
        Ok(0) | Err(_) => Err(format!("invalid bitrate: {}", s)),
        Ok(kbps) => Ok(kbps),
    }
}
