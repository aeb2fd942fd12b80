//! Job specifications and output path resolution
//!
//! A batch's output paths are fixed here, before anything is submitted, so
//! naming collisions are resolved the same way every time for the same inputs.

use std::collections::{BTreeMap, HashSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audio::OutputFormat;
use crate::core::{InputDescriptor, JobId};
use crate::error::InputError;

/// Where converted files are written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationPolicy {
    /// Next to each source file
    SameAsSource,
    /// Into one fixed directory, created if missing
    Directory(PathBuf),
}

/// What to do when an output file already exists on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    /// Leave the existing file alone and drop the input from the batch
    #[default]
    Skip,
    Overwrite,
    /// Pick a free `-N` suffixed name instead
    Rename,
}

impl std::str::FromStr for OverwritePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "skip" => Ok(OverwritePolicy::Skip),
            "overwrite" => Ok(OverwritePolicy::Overwrite),
            "rename" => Ok(OverwritePolicy::Rename),
            other => Err(format!("unknown overwrite policy: {}", other)),
        }
    }
}

/// Batch-wide output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSettings {
    pub format: OutputFormat,
    /// kbps; ignored for lossless formats
    pub bitrate: Option<u32>,
    pub destination: DestinationPolicy,
    pub overwrite: OverwritePolicy,
}

impl OutputSettings {
    /// Bitrate actually handed to the tool
    pub fn effective_bitrate(&self) -> Option<u32> {
        if self.format.is_lossy() {
            self.bitrate
        } else {
            None
        }
    }
}

/// A single immutable unit of work
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: JobId,
    pub input: InputDescriptor,
    pub settings: Arc<OutputSettings>,
    pub output_path: PathBuf,
}

/// Jobs built for a batch, plus inputs left out under [`OverwritePolicy::Skip`]
#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub jobs: Vec<JobSpec>,
    pub skipped: Vec<InputDescriptor>,
}

/// Build one job per input, resolving every output path up front
///
/// The destination is checked once for the whole batch: a directory that
/// cannot be created or written rejects the batch before any path is resolved.
pub fn build_jobs(
    inputs: Vec<InputDescriptor>,
    settings: OutputSettings,
) -> Result<BuildOutcome, InputError> {
    let settings = Arc::new(settings);

    let mut destinations = Vec::with_capacity(inputs.len());
    for input in &inputs {
        destinations.push(destination_dir(&input.path, &settings.destination)?);
    }
    check_destinations(&settings.destination, &destinations)?;

    let avoid_existing = settings.overwrite != OverwritePolicy::Overwrite;
    let extension = settings.format.extension();

    // Inputs are never valid outputs, for any job in the batch
    let mut taken: HashSet<PathBuf> = inputs.iter().map(|i| i.path.clone()).collect();

    let mut kept: Vec<(InputDescriptor, PathBuf, String)> = Vec::with_capacity(inputs.len());
    let mut skipped = Vec::new();
    for (input, dir) in inputs.into_iter().zip(destinations) {
        let stem = input
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());
        let base = dir.join(format!("{}.{}", stem, extension));

        if settings.overwrite == OverwritePolicy::Skip && base != input.path && base.exists() {
            log::info!("Skipping {}: {} already exists", input.path.display(), base.display());
            skipped.push(input);
            continue;
        }
        kept.push((input, base, stem));
    }

    // Group by the name each input would naturally get
    let mut groups: BTreeMap<PathBuf, Vec<usize>> = BTreeMap::new();
    for (idx, (_, base, _)) in kept.iter().enumerate() {
        groups.entry(base.clone()).or_default().push(idx);
    }
    for members in groups.values_mut() {
        members.sort_by(|&a, &b| kept[a].0.path.cmp(&kept[b].0.path));
    }

    let is_free = |candidate: &Path, taken: &HashSet<PathBuf>| {
        !taken.contains(candidate) && !(avoid_existing && candidate.exists())
    };

    let mut resolved: Vec<Option<PathBuf>> = vec![None; kept.len()];

    // First member of each group claims the plain name when it can
    for (base, members) in &groups {
        if is_free(base, &taken) {
            taken.insert(base.clone());
            resolved[members[0]] = Some(base.clone());
        }
    }

    // Everyone else gets the lowest free numeric suffix
    for (base, members) in &groups {
        let dir = base.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut n = 1usize;
        for &idx in members {
            if resolved[idx].is_some() {
                continue;
            }
            let stem = &kept[idx].2;
            let path = loop {
                let candidate = dir.join(format!("{}-{}.{}", stem, n, extension));
                n += 1;
                if is_free(&candidate, &taken) {
                    break candidate;
                }
            };
            taken.insert(path.clone());
            resolved[idx] = Some(path);
        }
    }

    let jobs = kept
        .into_iter()
        .zip(resolved)
        .filter_map(|((input, _, _), output)| {
            output.map(|output_path| JobSpec {
                id: JobId::new(),
                input,
                settings: settings.clone(),
                output_path,
            })
        })
        .collect::<Vec<_>>();

    log::info!(
        "Built {} job(s) for {} ({} skipped)",
        jobs.len(),
        settings.format,
        skipped.len()
    );

    Ok(BuildOutcome { jobs, skipped })
}

fn destination_dir(input: &Path, policy: &DestinationPolicy) -> Result<PathBuf, InputError> {
    match policy {
        DestinationPolicy::Directory(dir) => Ok(dir.clone()),
        DestinationPolicy::SameAsSource => input
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| InputError::NoDestination(input.to_path_buf())),
    }
}

/// Create the fixed directory if needed and probe each distinct destination once
fn check_destinations(policy: &DestinationPolicy, dirs: &[PathBuf]) -> Result<(), InputError> {
    if let DestinationPolicy::Directory(dir) = policy {
        std::fs::create_dir_all(dir).map_err(|e| InputError::DestinationNotWritable {
            path: dir.clone(),
            source: e,
        })?;
        // An empty batch still validates the fixed directory
        return probe_writable(dir);
    }

    let distinct: HashSet<&PathBuf> = dirs.iter().collect();
    for dir in distinct {
        probe_writable(dir)?;
    }
    Ok(())
}

fn probe_writable(dir: &Path) -> Result<(), InputError> {
    let probe = dir.join(format!(".sonifylab-write-test-{}", uuid::Uuid::new_v4()));
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)
        .map_err(|e| InputError::DestinationNotWritable {
            path: dir.to_path_buf(),
            source: e,
        })?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::descriptor;
    use tempfile::TempDir;

    fn settings(dest: DestinationPolicy, overwrite: OverwritePolicy) -> OutputSettings {
        OutputSettings {
            format: OutputFormat::Mp3,
            bitrate: Some(192),
            destination: dest,
            overwrite,
        }
    }

    fn outputs(outcome: &BuildOutcome) -> Vec<PathBuf> {
        outcome.jobs.iter().map(|j| j.output_path.clone()).collect()
    }

    #[test]
    fn test_replaces_extension_and_keeps_order() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let inputs = vec![
            descriptor(&src.path().join("b.flac"), b"b"),
            descriptor(&src.path().join("a.wav"), b"a"),
        ];

        let outcome = build_jobs(
            inputs,
            settings(
                DestinationPolicy::Directory(out.path().to_path_buf()),
                OverwritePolicy::Skip,
            ),
        )
        .unwrap();

        assert_eq!(
            outputs(&outcome),
            vec![out.path().join("b.mp3"), out.path().join("a.mp3")]
        );
    }

    #[test]
    fn test_same_named_inputs_get_numeric_suffix() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let inputs = vec![
            descriptor(&src.path().join("disc2/track.wav"), b"2"),
            descriptor(&src.path().join("disc1/track.wav"), b"1"),
            descriptor(&src.path().join("disc3/track.wav"), b"3"),
        ];

        let outcome = build_jobs(
            inputs,
            settings(
                DestinationPolicy::Directory(out.path().to_path_buf()),
                OverwritePolicy::Skip,
            ),
        )
        .unwrap();

        // Suffixes follow input path order, not submission order
        assert_eq!(
            outputs(&outcome),
            vec![
                out.path().join("track-1.mp3"),
                out.path().join("track.mp3"),
                out.path().join("track-2.mp3"),
            ]
        );
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let make = || {
            vec![
                descriptor(&src.path().join("x/song.flac"), b"x"),
                descriptor(&src.path().join("y/song.ogg"), b"y"),
                descriptor(&src.path().join("song.wav"), b"z"),
            ]
        };
        let policy = || {
            settings(
                DestinationPolicy::Directory(out.path().to_path_buf()),
                OverwritePolicy::Rename,
            )
        };

        let first = build_jobs(make(), policy()).unwrap();
        let second = build_jobs(make(), policy()).unwrap();
        assert_eq!(outputs(&first), outputs(&second));
    }

    #[test]
    fn test_suffix_skips_names_already_claimed() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let inputs = vec![
            descriptor(&src.path().join("a/track.wav"), b"1"),
            descriptor(&src.path().join("b/track.wav"), b"2"),
            descriptor(&src.path().join("track-1.wav"), b"3"),
        ];

        let outcome = build_jobs(
            inputs,
            settings(
                DestinationPolicy::Directory(out.path().to_path_buf()),
                OverwritePolicy::Skip,
            ),
        )
        .unwrap();

        let paths = outputs(&outcome);
        assert_eq!(paths[0], out.path().join("track.mp3"));
        assert_eq!(paths[2], out.path().join("track-1.mp3"));
        assert_eq!(paths[1], out.path().join("track-2.mp3"));
    }

    #[test]
    fn test_output_never_equals_input() {
        let src = TempDir::new().unwrap();
        let input = descriptor(&src.path().join("song.mp3"), b"mp3");
        let input_path = input.path.clone();

        for policy in [
            OverwritePolicy::Skip,
            OverwritePolicy::Rename,
            OverwritePolicy::Overwrite,
        ] {
            let outcome = build_jobs(
                vec![input.clone()],
                settings(DestinationPolicy::SameAsSource, policy),
            )
            .unwrap();
            assert_eq!(outcome.jobs.len(), 1);
            assert_ne!(outcome.jobs[0].output_path, input_path);
            assert_eq!(outcome.jobs[0].output_path, src.path().join("song-1.mp3"));
        }
    }

    #[test]
    fn test_skip_policy_drops_existing_outputs() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::write(out.path().join("old.mp3"), b"done").unwrap();
        let inputs = vec![
            descriptor(&src.path().join("old.flac"), b"o"),
            descriptor(&src.path().join("new.flac"), b"n"),
        ];

        let outcome = build_jobs(
            inputs,
            settings(
                DestinationPolicy::Directory(out.path().to_path_buf()),
                OverwritePolicy::Skip,
            ),
        )
        .unwrap();

        assert_eq!(outputs(&outcome), vec![out.path().join("new.mp3")]);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].file_name(), "old.flac");
    }

    #[test]
    fn test_rename_policy_avoids_existing_outputs() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::write(out.path().join("old.mp3"), b"done").unwrap();

        let outcome = build_jobs(
            vec![descriptor(&src.path().join("old.flac"), b"o")],
            settings(
                DestinationPolicy::Directory(out.path().to_path_buf()),
                OverwritePolicy::Rename,
            ),
        )
        .unwrap();

        assert_eq!(outputs(&outcome), vec![out.path().join("old-1.mp3")]);
    }

    #[test]
    fn test_overwrite_policy_reuses_existing_name() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::write(out.path().join("old.mp3"), b"done").unwrap();

        let outcome = build_jobs(
            vec![descriptor(&src.path().join("old.flac"), b"o")],
            settings(
                DestinationPolicy::Directory(out.path().to_path_buf()),
                OverwritePolicy::Overwrite,
            ),
        )
        .unwrap();

        assert_eq!(outputs(&outcome), vec![out.path().join("old.mp3")]);
    }

    #[test]
    fn test_fixed_directory_is_created() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let nested = out.path().join("converted").join("mp3");

        let outcome = build_jobs(
            vec![descriptor(&src.path().join("a.flac"), b"a")],
            settings(DestinationPolicy::Directory(nested.clone()), OverwritePolicy::Skip),
        )
        .unwrap();

        assert!(nested.is_dir());
        assert_eq!(outcome.jobs[0].output_path, nested.join("a.mp3"));
    }

    #[test]
    fn test_uncreatable_destination_rejects_batch() {
        let src = TempDir::new().unwrap();
        let blocker = src.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let result = build_jobs(
            vec![descriptor(&src.path().join("a.flac"), b"a")],
            settings(
                DestinationPolicy::Directory(blocker.join("out")),
                OverwritePolicy::Skip,
            ),
        );

        assert!(matches!(
            result,
            Err(InputError::DestinationNotWritable { .. })
        ));
    }

    #[test]
    fn test_lossless_target_drops_bitrate() {
        let flac = OutputSettings {
            format: OutputFormat::Flac,
            bitrate: Some(320),
            destination: DestinationPolicy::SameAsSource,
            overwrite: OverwritePolicy::Skip,
        };
        assert_eq!(flac.effective_bitrate(), None);

        let mp3 = OutputSettings {
            format: OutputFormat::Mp3,
            ..flac
        };
        assert_eq!(mp3.effective_bitrate(), Some(320));
    }

    #[test]
    fn test_overwrite_policy_from_str() {
        assert_eq!("Rename".parse::<OverwritePolicy>().unwrap(), OverwritePolicy::Rename);
        assert!("replace".parse::<OverwritePolicy>().is_err());
    }
}
