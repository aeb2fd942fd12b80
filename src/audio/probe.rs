use std::fs::File;
use std::path::Path;
use symphonia::core::codecs::{
    CODEC_TYPE_AAC, CODEC_TYPE_ALAC, CODEC_TYPE_FLAC, CODEC_TYPE_MP3, CODEC_TYPE_NULL,
    CODEC_TYPE_OPUS, CODEC_TYPE_VORBIS, CodecType,
};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::detection::extension_of;

/// What a container probe could tell us about an input file
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeInfo {
    /// Short codec name, e.g. "flac" or "mp3"
    pub codec: String,
    /// Duration in seconds, when the container reports a frame count
    pub duration: Option<f64>,
}

/// Probe an audio file for its codec and duration
///
/// Never fails: files symphonia cannot read (empty, truncated, WMA) fall back
/// to the lowercase extension with an unknown duration.
pub fn probe_audio(path: &Path) -> ProbeInfo {
    match try_probe(path) {
        Ok(info) => info,
        Err(e) => {
            log::debug!("Probe failed for {}: {}", path.display(), e);
            ProbeInfo {
                codec: extension_of(path),
                duration: None,
            }
        }
    }
}

fn try_probe(path: &Path) -> Result<ProbeInfo, String> {
    let file = File::open(path).map_err(|e| format!("Failed to open file: {}", e))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension() {
        hint.with_extension(&ext.to_string_lossy());
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| format!("Failed to probe audio format: {}", e))?;

    let track = probed
        .format
        .default_track()
        .ok_or_else(|| "No default track found".to_string())?;

    let params = &track.codec_params;
    let duration = match (params.n_frames, params.sample_rate) {
        (Some(frames), Some(rate)) if rate > 0 => Some(frames as f64 / rate as f64),
        _ => None,
    };

    Ok(ProbeInfo {
        codec: codec_name(params.codec, path),
        duration,
    })
}

/// Map a symphonia codec type to the short names used in descriptors
fn codec_name(codec: CodecType, path: &Path) -> String {
    let name = match codec {
        CODEC_TYPE_MP3 => "mp3",
        CODEC_TYPE_FLAC => "flac",
        CODEC_TYPE_AAC => "aac",
        CODEC_TYPE_VORBIS => "vorbis",
        CODEC_TYPE_OPUS => "opus",
        CODEC_TYPE_ALAC => "alac",
        CODEC_TYPE_NULL => return extension_of(path),
        other => {
            // PCM variants: report the container (wav/aiff) rather than the sample layout
            match symphonia::default::get_codecs().get_codec(other) {
                Some(desc) if desc.short_name.starts_with("pcm") => return extension_of(path),
                Some(desc) => desc.short_name,
                None => return extension_of(path),
            }
        }
    };
    name.to_string()
}
