use std::path::Path;

/// Extensions accepted as conversion inputs
pub const SUPPORTED_INPUT_EXTENSIONS: &[&str] = &[
    "mp3", "wav", "flac", "aac", "ogg", "m4a", "wma", "opus", "aiff", "aif", "alac",
];

/// Check if a file is an audio file based on its extension
pub fn is_audio_file(path: &Path) -> bool {
    match path.extension() {
        Some(ext) => {
            let ext = ext.to_string_lossy().to_lowercase();
            SUPPORTED_INPUT_EXTENSIONS.contains(&ext.as_str())
        }
        None => false,
    }
}

/// Lowercase extension of a path, or an empty string
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}
