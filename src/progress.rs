//! Task progress file
//!
//! A task advertises its progress as a single integer percentage in a
//! file next to its scratch space. Scripts write it, the worker polls
//! it. Reading is deliberately forgiving: a missing, empty or garbled
//! file reads as zero, because progress is a hint and must never fail
//! a running task.

use std::path::Path;
use thiserror::Error;

/// Rejected progress value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("progress value {0} is outside 0..=100")]
pub struct InvalidProgress(pub i64);

/// Writes the progress percentage to the file
///
/// An out-of-range value is reported to the caller without touching
/// the file. An I/O failure is only logged: the file is advisory.
///
/// # Errors
///
/// Returns [`InvalidProgress`] when `value` is not within `0..=100`.
pub fn set(path: &Path, value: i64) -> Result<(), InvalidProgress> {
    if !(0..=100).contains(&value) {
        return Err(InvalidProgress(value));
    }
    if let Err(e) = std::fs::write(path, format!("{value}\n")) {
        tracing::warn!(path = %path.display(), error = %e, "Could not write progress file");
    }
    Ok(())
}

/// Reads the progress percentage from the file
///
/// Any failure (missing file, unreadable content, out-of-range value)
/// reads as zero.
#[must_use]
pub fn get(path: &Path) -> u8 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse::<i64>().ok())
        .filter(|value| (0..=100).contains(value))
        .map_or(0, |value| value as u8)
}

/// Creates the progress file at zero so polling works from the first
/// moment of execution
pub fn init(path: &Path) {
    if let Err(e) = set(path, 0) {
        tracing::warn!(error = %e, "Could not initialize progress file");
    }
}
