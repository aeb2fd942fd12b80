//! Core types and input handling
//!
//! This module contains:
//! - Job and batch identifiers
//! - Selection expansion and audio file discovery
//! - Persistent settings

mod ids;
mod scanning;
mod settings;

pub use ids::{BatchId, JobId};
pub use scanning::{Expansion, InputDescriptor, expand, format_size};
pub use settings::{Settings, default_result_log_path};
