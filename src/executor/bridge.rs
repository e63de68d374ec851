//! Handoff file bridge between parent and forked child
//!
//! Parent and child exchange exactly one file: the parent serializes
//! the task context into it before spawning, the child overwrites it
//! with the task result before exiting. A handoff that still holds a
//! context after the child exited means the child never got as far as
//! reporting.

use crate::task::{TaskContext, TaskFailure, TaskResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Content of the handoff file, in either direction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Handoff {
    /// Parent-to-child: the task to execute
    Context(TaskContext),
    /// Child-to-parent: the outcome
    Result(TaskResult),
}

/// Writes the task context into the handoff file and verifies the file
/// is in place and readable before any process is spawned
///
/// # Errors
///
/// Returns [`TaskFailure::Launch`] when the file cannot be written or
/// read back.
pub fn write_context(path: &Path, context: &TaskContext) -> Result<(), TaskFailure> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            TaskFailure::Launch(format!("could not create handoff directory: {e}"))
        })?;
    }
    let encoded = serde_json::to_vec(&Handoff::Context(context.clone()))
        .map_err(|e| TaskFailure::Launch(format!("could not encode task context: {e}")))?;
    std::fs::write(path, encoded)
        .map_err(|e| TaskFailure::Launch(format!("could not write handoff file: {e}")))?;

    // The child must find a complete, readable context; catch
    // permission and disk problems here, where they are still launch
    // failures.
    let metadata = std::fs::metadata(path)
        .map_err(|e| TaskFailure::Launch(format!("handoff file not readable after write: {e}")))?;
    if metadata.len() == 0 {
        return Err(TaskFailure::Launch(
            "handoff file empty after write".to_string(),
        ));
    }
    Ok(())
}

/// Reads the task context out of the handoff file (child side)
///
/// The file is opened for both reading and writing before anything is
/// deserialized: the child will overwrite it with the result later,
/// and a write-check up front catches a parent still flushing or a
/// permission problem while it is still a startup failure.
///
/// # Errors
///
/// Returns [`TaskFailure::Launch`] when the file is missing, not
/// writable, garbled or already holds a result.
pub fn read_context(path: &Path) -> Result<TaskContext, TaskFailure> {
    use std::io::Read as _;

    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| {
            TaskFailure::Launch(format!("handoff file not readable and writable: {e}"))
        })?;
    let mut content = Vec::new();
    file.read_to_end(&mut content)
        .map_err(|e| TaskFailure::Launch(format!("could not read handoff file: {e}")))?;
    match serde_json::from_slice(&content) {
        Ok(Handoff::Context(context)) => Ok(context),
        Ok(Handoff::Result(_)) => Err(TaskFailure::Launch(
            "handoff file already holds a result".to_string(),
        )),
        Err(e) => Err(TaskFailure::Launch(format!(
            "could not decode handoff file: {e}"
        ))),
    }
}

/// Overwrites the handoff file with the task result (child side)
///
/// # Errors
///
/// Returns [`TaskFailure::ResultUnreadable`] when the result cannot be
/// written; the parent will observe the same condition from its side.
pub fn write_result(path: &Path, result: &TaskResult) -> Result<(), TaskFailure> {
    let encoded = serde_json::to_vec(&Handoff::Result(result.clone()))
        .map_err(|e| TaskFailure::ResultUnreadable(format!("could not encode result: {e}")))?;
    std::fs::write(path, encoded)
        .map_err(|e| TaskFailure::ResultUnreadable(format!("could not write result: {e}")))
}

/// Why the parent found no result in the handoff after the child
/// exited
///
/// A context echo means the child never got as far as reporting; the
/// exit code is then the most truthful classification. An unreadable
/// file (missing, truncated, garbled) means the report itself was
/// destroyed, which is its own failure kind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResultReadError {
    /// The file still holds the context the parent wrote
    #[error("child exited without reporting a result")]
    ContextEcho,

    /// The file is missing, truncated or garbled
    #[error("{0}")]
    Unreadable(String),
}

/// Reads the task result out of the handoff file (parent side, after
/// the child exited)
///
/// # Errors
///
/// Returns [`ResultReadError::ContextEcho`] when the file still holds
/// the original context, [`ResultReadError::Unreadable`] when it is
/// missing, truncated or garbled.
pub fn read_result(path: &Path) -> Result<TaskResult, ResultReadError> {
    let content = std::fs::read(path)
        .map_err(|e| ResultReadError::Unreadable(format!("could not read handoff file: {e}")))?;
    match serde_json::from_slice(&content) {
        Ok(Handoff::Result(result)) => Ok(result),
        Ok(Handoff::Context(_)) => Err(ResultReadError::ContextEcho),
        Err(e) => Err(ResultReadError::Unreadable(format!(
            "could not decode handoff file: {e}"
        ))),
    }
}

/// Deletes the handoff file with bounded retries
///
/// A file that is already gone counts as success, so cleanup stays
/// idempotent across the normal and the kill path.
///
/// # Errors
///
/// Returns [`TaskFailure::HandoffCleanup`] when the file still exists
/// after the last attempt.
pub fn delete_with_retry(path: &Path, attempts: u32, backoff: Duration) -> Result<(), TaskFailure> {
    for attempt in 1..=attempts.max(1) {
        match std::fs::remove_file(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                tracing::debug!(
                    path = %path.display(),
                    attempt,
                    error = %e,
                    "Handoff deletion attempt failed"
                );
                if attempt < attempts {
                    std::thread::sleep(backoff);
                }
            }
        }
    }
    Err(TaskFailure::HandoffCleanup {
        path: path.display().to_string(),
        attempts: attempts.max(1),
    })
}
