//! SonifyLab - batch audio conversion
//!
//! Expands a selection of files and folders into audio inputs, resolves one
//! output path per input and converts them with ffmpeg on a bounded worker
//! pool, reporting progress as events and results in a JSON-lines log.

pub mod audio;
pub mod conversion;
pub mod core;
pub mod error;
pub mod logging;

#[cfg(test)]
mod test_fixtures;
