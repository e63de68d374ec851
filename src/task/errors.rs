//! Error types for task execution
//!
//! All failure kinds converge into the same error slot of a
//! [`crate::task::TaskResult`]; only the classification differs, so a
//! caller can always tell "my script threw" apart from "the worker
//! process died" without branching on distinct result shapes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stage of the script sequence a failure originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptStage {
    /// Optional pre-script, runs before the main script
    Pre,
    /// The task's main script
    Main,
    /// Optional post-script, runs after a successful main script
    Post,
    /// Control-flow script, always attempted
    Flow,
}

impl fmt::Display for ScriptStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pre => write!(f, "pre"),
            Self::Main => write!(f, "main"),
            Self::Post => write!(f, "post"),
            Self::Flow => write!(f, "flow"),
        }
    }
}

/// Classified task failure
///
/// Serializable because a forked child reports its failure back to the
/// parent through the handoff file.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskFailure {
    /// A pre/main/post script raised; carries the original cause text
    #[error("{stage} script failed: {message}")]
    Script {
        /// Stage the failing script belonged to.
        stage: ScriptStage,
        /// Cause reported by the script engine.
        message: String,
    },

    /// The encrypted credential blob could not be decoded
    #[error("credentials unavailable: {0}")]
    CredentialsUnavailable(String),

    /// Working directory, runtime or command resolution failed before
    /// any process existed
    #[error("could not launch forked process: {0}")]
    Launch(String),

    /// The forked process exited non-zero without leaving a
    /// recoverable structured error behind
    #[error("forked process returned non-zero exit code {code}")]
    NonZeroExit {
        /// Exit code reported by the operating system.
        code: i32,
    },

    /// Handoff file missing, truncated or type-mismatched after the
    /// child exited
    #[error("forked process failure, could not read result: {0}")]
    ResultUnreadable(String),

    /// The handoff file survived its bounded-retry deletion
    #[error("could not delete handoff file after {attempts} attempts: {path}")]
    HandoffCleanup {
        /// Path of the file that could not be removed.
        path: String,
        /// Number of deletion attempts made.
        attempts: u32,
    },
}

impl TaskFailure {
    /// Returns true for process-level failures (launch, crash, exit
    /// code), as opposed to failures raised by user script code.
    #[must_use]
    pub fn is_process_failure(&self) -> bool {
        matches!(
            self,
            Self::Launch(_) | Self::NonZeroExit { .. } | Self::ResultUnreadable(_)
        )
    }
}
