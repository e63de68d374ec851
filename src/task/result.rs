//! Task results and control-flow actions

use crate::task::context::TaskId;
use crate::task::errors::TaskFailure;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Continuation decided by a control-flow script
///
/// Flow scripts emit their decision as the last non-empty line of
/// their output; anything unparseable is a flow failure and the
/// default [`FlowAction::Continue`] is substituted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowAction {
    /// Proceed to the next task (default)
    #[default]
    Continue,
    /// Loop back when active, proceed otherwise
    Loop {
        /// Whether the loop should take another iteration.
        active: bool,
    },
    /// Branch to the named target
    Branch {
        /// Name of the branch to follow.
        target: String,
    },
    /// Replicate the downstream block the given number of times
    Replicate {
        /// Number of replicas to schedule.
        runs: u32,
    },
}

impl FlowAction {
    /// Parses an action from a flow script's emitted line
    ///
    /// Recognized forms: `continue`, `loop <true|false>`,
    /// `branch <name>`, `replicate <n>`.
    ///
    /// # Errors
    ///
    /// Returns the offending text when it matches no known form.
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("continue"), None, _) => Ok(Self::Continue),
            (Some("loop"), Some(flag), None) => match flag {
                "true" => Ok(Self::Loop { active: true }),
                "false" => Ok(Self::Loop { active: false }),
                other => Err(format!("invalid loop flag '{other}'")),
            },
            (Some("branch"), Some(target), None) => Ok(Self::Branch {
                target: target.to_string(),
            }),
            (Some("replicate"), Some(runs), None) => runs
                .parse::<u32>()
                .map(|runs| Self::Replicate { runs })
                .map_err(|_| format!("invalid replication count '{runs}'")),
            _ => Err(format!("unrecognized flow action '{line}'")),
        }
    }
}

/// Uniform outcome of one task execution
///
/// Exactly one of value/error is set; both the in-process and the
/// forked executor produce this shape, so the scheduler layer never
/// distinguishes how a task was run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Identifier of the task that produced this result
    pub task_id: TaskId,

    value: Option<Value>,

    error: Option<TaskFailure>,

    /// Wall-clock execution time, in milliseconds
    pub duration_ms: u64,

    /// Scope-map contents at task end, inherited by dependent tasks
    pub propagated_variables: HashMap<String, String>,

    /// Named side-outputs published by scripts
    pub result_map: HashMap<String, Value>,

    /// Result metadata hints (content type, filename, extension)
    pub metadata: HashMap<String, String>,

    /// Continuation decided by the control-flow script
    pub action: FlowAction,
}

impl TaskResult {
    /// Creates a successful result carrying the produced value
    #[must_use]
    pub fn success(task_id: TaskId, value: Value, duration: Duration) -> Self {
        Self {
            task_id,
            value: Some(value),
            error: None,
            duration_ms: duration.as_millis() as u64,
            propagated_variables: HashMap::new(),
            result_map: HashMap::new(),
            metadata: HashMap::new(),
            action: FlowAction::Continue,
        }
    }

    /// Creates a failed result carrying the classified failure
    #[must_use]
    pub fn failure(task_id: TaskId, error: TaskFailure, duration: Duration) -> Self {
        Self {
            task_id,
            value: None,
            error: Some(error),
            duration_ms: duration.as_millis() as u64,
            propagated_variables: HashMap::new(),
            result_map: HashMap::new(),
            metadata: HashMap::new(),
            action: FlowAction::Continue,
        }
    }

    /// The produced value, if the task succeeded
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// The classified failure, if the task failed
    #[must_use]
    pub fn error(&self) -> Option<&TaskFailure> {
        self.error.as_ref()
    }

    /// True when the result carries a failure
    #[must_use]
    pub fn had_error(&self) -> bool {
        self.error.is_some()
    }
}
