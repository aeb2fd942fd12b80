// Audio module - input detection, container probing and target formats

pub mod detection;
pub mod format;
pub mod probe;

pub use detection::{SUPPORTED_INPUT_EXTENSIONS, extension_of, is_audio_file};
pub use format::{COMMON_BITRATES, DEFAULT_BITRATE, OutputFormat, parse_bitrate};
pub use probe::{ProbeInfo, probe_audio};
