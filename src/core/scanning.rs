//! Selection expansion and audio file discovery
//!
//! Turns whatever the user picked (files, folders, a mix of both) into a flat,
//! deduplicated list of [`InputDescriptor`]s in a stable order.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::audio::{is_audio_file, probe_audio};
use crate::error::InputError;

/// Describes one input file as found on disk
#[derive(Debug, Clone, PartialEq)]
pub struct InputDescriptor {
    /// Absolute path as selected (links are not resolved)
    pub path: PathBuf,
    /// Detected codec, or the lowercase extension if probing failed
    pub codec: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Duration in seconds, when the container reports one
    pub duration: Option<f64>,
}

impl InputDescriptor {
    /// Build a descriptor for a single file, probing its container
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let probe = probe_audio(path);
        Ok(Self {
            path: std::path::absolute(path)?,
            codec: probe.codec,
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            duration: probe.duration,
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Result of expanding a set of selections
#[derive(Debug, Default)]
pub struct Expansion {
    pub inputs: Vec<InputDescriptor>,
    /// Files skipped because their extension is not a supported input
    pub unsupported: usize,
    /// Files reached more than once (overlapping selections, links)
    pub duplicates: usize,
}

impl Expansion {
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Expand user selections into input descriptors
///
/// Directories are walked recursively in file-name order, following links.
/// Each real file is visited once, keyed by its canonical path, so link
/// cycles and overlapping selections cannot produce duplicates. Only a
/// selection root that cannot be read is an error.
pub fn expand(selections: &[PathBuf]) -> Result<Expansion, InputError> {
    let mut expansion = Expansion::default();
    let mut visited: HashSet<PathBuf> = HashSet::new();

    for selection in selections {
        let metadata = fs::metadata(selection).map_err(|e| InputError::UnreadableSelection {
            path: selection.clone(),
            source: e,
        })?;

        if metadata.is_dir() {
            // Surface an unreadable root now rather than as a silent empty walk
            fs::read_dir(selection).map_err(|e| InputError::UnreadableSelection {
                path: selection.clone(),
                source: e,
            })?;

            for entry in WalkDir::new(selection)
                .follow_links(true)
                .sort_by_file_name()
            {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        if e.loop_ancestor().is_some() {
                            log::debug!("Skipping link cycle: {}", e);
                        } else {
                            log::warn!("Skipping unreadable entry: {}", e);
                        }
                        continue;
                    }
                };
                if entry.file_type().is_file() {
                    visit_file(entry.path(), &mut visited, &mut expansion);
                }
            }
        } else {
            visit_file(selection, &mut visited, &mut expansion);
        }
    }

    log::info!(
        "Expanded {} selection(s): {} input(s), {} unsupported, {} duplicate(s)",
        selections.len(),
        expansion.inputs.len(),
        expansion.unsupported,
        expansion.duplicates
    );

    Ok(expansion)
}

fn visit_file(path: &Path, visited: &mut HashSet<PathBuf>, expansion: &mut Expansion) {
    if !is_audio_file(path) {
        expansion.unsupported += 1;
        return;
    }

    let canonical = match fs::canonicalize(path) {
        Ok(p) => p,
        Err(e) => {
            log::warn!("Cannot resolve {}: {}", path.display(), e);
            return;
        }
    };
    if !visited.insert(canonical) {
        expansion.duplicates += 1;
        return;
    }

    match InputDescriptor::from_path(path) {
        Ok(descriptor) => expansion.inputs.push(descriptor),
        Err(e) => log::warn!("Cannot read {}: {}", path.display(), e),
    }
}

/// Format size in human-readable form (KB, MB, GB)
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1000;
    const MB: u64 = KB * 1000;
    const GB: u64 = MB * 1000;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn touch(path: &Path, contents: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut f = File::create(path).unwrap();
        f.write_all(contents).unwrap();
    }

    fn names(expansion: &Expansion) -> Vec<String> {
        expansion.inputs.iter().map(|d| d.file_name()).collect()
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(500), "500 bytes");
        assert_eq!(format_size(1500), "1.50 KB");
        assert_eq!(format_size(1_000_000), "1.00 MB");
        assert_eq!(format_size(1_000_000_000), "1.00 GB");
    }

    #[test]
    fn test_expand_nonexistent_selection_is_error() {
        let result = expand(&[PathBuf::from("/nonexistent/path/for/sure")]);
        assert!(matches!(
            result,
            Err(InputError::UnreadableSelection { .. })
        ));
    }

    #[test]
    fn test_expand_empty_directory_is_empty_not_error() {
        let dir = TempDir::new().unwrap();
        let expansion = expand(&[dir.path().to_path_buf()]).unwrap();
        assert!(expansion.is_empty());
        assert_eq!(expansion.unsupported, 0);
    }

    #[test]
    fn test_expand_counts_unsupported_files() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("cover.jpg"), b"jpg");
        touch(&dir.path().join("notes.txt"), b"txt");
        touch(&dir.path().join("song.mp3"), b"mp3");

        let expansion = expand(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(names(&expansion), vec!["song.mp3"]);
        assert_eq!(expansion.unsupported, 2);
    }

    #[test]
    fn test_expand_is_recursive_and_ordered() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("b.flac"), b"b");
        touch(&dir.path().join("a.flac"), b"a");
        touch(&dir.path().join("disc2/c.flac"), b"c");
        touch(&dir.path().join("disc1/d.flac"), b"d");

        let expansion = expand(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(
            names(&expansion),
            vec!["a.flac", "b.flac", "d.flac", "c.flac"]
        );
    }

    #[test]
    fn test_expand_preserves_selection_order() {
        let dir = TempDir::new().unwrap();
        let z = dir.path().join("z.wav");
        let a = dir.path().join("a.wav");
        touch(&z, b"z");
        touch(&a, b"a");

        let expansion = expand(&[z.clone(), a.clone()]).unwrap();
        assert_eq!(names(&expansion), vec!["z.wav", "a.wav"]);
    }

    #[test]
    fn test_expand_deduplicates_overlapping_selections() {
        let dir = TempDir::new().unwrap();
        let song = dir.path().join("album/song.ogg");
        touch(&song, b"ogg");

        let expansion = expand(&[song.clone(), dir.path().to_path_buf()]).unwrap();
        assert_eq!(expansion.inputs.len(), 1);
        assert_eq!(expansion.duplicates, 1);
    }

    #[test]
    fn test_descriptor_records_size_and_absolute_path() {
        let dir = TempDir::new().unwrap();
        let song = dir.path().join("song.opus");
        touch(&song, b"0123456789");

        let expansion = expand(&[song]).unwrap();
        let descriptor = &expansion.inputs[0];
        assert_eq!(descriptor.size, 10);
        assert!(descriptor.path.is_absolute());
        assert_eq!(descriptor.codec, "opus");
        assert!(descriptor.modified.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_expand_survives_symlink_cycle() {
        let dir = TempDir::new().unwrap();
        let album = dir.path().join("album");
        touch(&album.join("track.flac"), b"flac");
        std::os::unix::fs::symlink(&album, album.join("loop")).unwrap();

        let expansion = expand(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(names(&expansion), vec!["track.flac"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_expand_visits_linked_file_once() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("real.mp3");
        touch(&real, b"mp3");
        std::os::unix::fs::symlink(&real, dir.path().join("alias.mp3")).unwrap();

        let expansion = expand(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(expansion.inputs.len(), 1);
        assert_eq!(expansion.duplicates, 1);
    }
}
