//! Test fixtures for expansion, job building and engine tests
//!
//! Audio inputs are tiny files written on the fly, and the transcoder is a
//! shell script that understands just enough of ffmpeg's command line to
//! find its input and output.

#![cfg(test)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::audio::OutputFormat;
use crate::conversion::{DestinationPolicy, JobSpec, OutputSettings, OverwritePolicy};
use crate::core::{InputDescriptor, JobId};

/// Write `contents` to `path` (creating parents) and describe it
pub fn descriptor(path: &Path, contents: &[u8]) -> InputDescriptor {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create input directory");
    }
    std::fs::write(path, contents).expect("Failed to write input file");
    InputDescriptor::from_path(path).expect("Failed to describe input file")
}

/// Jobs that never touch the filesystem, for state bookkeeping tests
pub fn dummy_specs(count: usize) -> Vec<JobSpec> {
    let settings = Arc::new(OutputSettings {
        format: OutputFormat::Mp3,
        bitrate: Some(192),
        destination: DestinationPolicy::SameAsSource,
        overwrite: OverwritePolicy::Skip,
    });
    (0..count)
        .map(|i| JobSpec {
            id: JobId::new(),
            input: InputDescriptor {
                path: PathBuf::from(format!("/nonexistent/in-{}.wav", i)),
                codec: "wav".to_string(),
                size: 0,
                modified: None,
                duration: None,
            },
            settings: settings.clone(),
            output_path: PathBuf::from(format!("/nonexistent/in-{}.mp3", i)),
        })
        .collect()
}

/// Write a mono 16-bit PCM wav of silence
pub fn write_silent_wav(path: &Path, sample_rate: u32, frames: u32) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create wav directory");
    }
    let data_len = frames * 2;
    let mut bytes = Vec::with_capacity(44 + data_len as usize);
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
    bytes.extend_from_slice(b"WAVE");
    bytes.extend_from_slice(b"fmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
    bytes.extend_from_slice(&1u16.to_le_bytes()); // mono
    bytes.extend_from_slice(&sample_rate.to_le_bytes());
    bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    bytes.extend_from_slice(&2u16.to_le_bytes());
    bytes.extend_from_slice(&16u16.to_le_bytes());
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_len.to_le_bytes());
    bytes.resize(44 + data_len as usize, 0);
    std::fs::write(path, bytes).expect("Failed to write wav file");
}

/// Finds `-i <input>` and takes the last argument as the output
const ARG_PRELUDE: &str = r#"#!/bin/sh
in=""
out=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "-i" ]; then in="$arg"; fi
  prev="$arg"
  out="$arg"
done
"#;

const COPY_BODY: &str = r#"if [ ! -s "$in" ]; then
  echo "[in#0 @ 0x0] Error opening input: Invalid data found when processing input" >&2
  echo "$in: Invalid data found when processing input" >&2
  exit 1
fi
echo "out_time=00:00:00.500000"
echo "speed=2.0x"
echo "progress=continue"
cp "$in" "$out" || exit 1
echo "out_time=00:00:01.000000"
echo "progress=end"
exit 0
"#;

/// An executable script standing in for ffmpeg
pub struct FakeTool {
    path: PathBuf,
}

impl FakeTool {
    /// Script running `body` after the argument prelude
    pub fn script(dir: &Path, body: &str) -> Self {
        let path = dir.join(format!("fake-ffmpeg-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, format!("{}{}\n", ARG_PRELUDE, body))
            .expect("Failed to write fake tool");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .expect("Failed to make fake tool executable");
        }
        Self { path }
    }

    /// Copies input to output, rejecting empty inputs like ffmpeg does
    pub fn copying(dir: &Path) -> Self {
        Self::script(dir, COPY_BODY)
    }

    /// Like [`copying`](Self::copying) after a short pause
    pub fn slow_copying(dir: &Path, secs: &str) -> Self {
        Self::script(dir, &format!("sleep {}\n{}", secs, COPY_BODY))
    }

    /// Sleeps until killed
    pub fn sleeping(dir: &Path, secs: u32) -> Self {
        Self::script(dir, &format!("exec sleep {}", secs))
    }

    /// Ignores SIGTERM, so only a kill stops it
    pub fn stubborn(dir: &Path, secs: u32) -> Self {
        Self::script(dir, &format!("trap '' TERM\nsleep {}\nexit 0", secs))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_silent_wav_has_expected_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/tone.wav");
        write_silent_wav(&path, 8000, 800);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 44 + 1600);
    }

    #[cfg(unix)]
    #[test]
    fn test_copying_tool_copies() {
        let dir = TempDir::new().unwrap();
        let tool = FakeTool::copying(dir.path());
        let input = dir.path().join("in.wav");
        let output = dir.path().join("out.mp3");
        std::fs::write(&input, b"pcm").unwrap();

        let status = std::process::Command::new(tool.path())
            .args(["-n", "-i"])
            .arg(&input)
            .args(["-codec:a", "libmp3lame"])
            .arg(&output)
            .stdout(std::process::Stdio::null())
            .status()
            .unwrap();
        assert!(status.success());
        assert_eq!(std::fs::read(&output).unwrap(), b"pcm");
    }
}
