//! In-process task execution
//!
//! Runs the whole script sequence on the calling thread. This is both
//! an execution mode in its own right and the code path a forked child
//! ends up in once it has read its context from the handoff file.

use crate::config::WorkerConfig;
use crate::executor::{LogSink, TaskExecutor};
use crate::progress;
use crate::script::{Bindings, ScriptRunner};
use crate::task::variables::{self, SystemBindings};
use crate::task::{TaskContext, TaskResult};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Binding pointing scripts at their progress file
pub const PROGRESS_FILE_ENV: &str = "TASKLINE_PROGRESS_FILE";

/// Data-space URI bindings exported to every script
fn data_space_bindings(context: &TaskContext) -> [(&'static str, &str); 5] {
    let spaces = &context.data_spaces;
    [
        ("TASKLINE_DS_CACHE", &spaces.cache),
        ("TASKLINE_DS_INPUT", &spaces.input),
        ("TASKLINE_DS_OUTPUT", &spaces.output),
        ("TASKLINE_DS_GLOBAL", &spaces.global),
        ("TASKLINE_DS_USER", &spaces.user),
    ]
}

/// Executes tasks on the calling thread
#[derive(Debug, Clone, Default)]
pub struct InProcessExecutor {
    config: WorkerConfig,
    runner: ScriptRunner,
}

impl InProcessExecutor {
    /// Creates an executor with the given configuration
    #[must_use]
    pub fn new(config: WorkerConfig) -> Self {
        let runner = ScriptRunner::new(crate::script::EngineRegistry::with_defaults(
            config.shell.clone(),
        ));
        Self { config, runner }
    }

    /// Per-task scratch directory: the scratch data space when given,
    /// the system temp directory otherwise
    fn scratch_dir(&self, context: &TaskContext) -> PathBuf {
        if context.data_spaces.scratch.is_empty() {
            std::env::temp_dir()
        } else {
            PathBuf::from(&context.data_spaces.scratch)
        }
    }
}

impl TaskExecutor for InProcessExecutor {
    fn execute(&self, context: &TaskContext, out: &LogSink, err: &LogSink) -> TaskResult {
        let started = Instant::now();
        tracing::info!(task = %context.id, "Executing task in process");

        let credentials = match context.third_party_credentials() {
            Ok(credentials) => credentials,
            Err(failure) => {
                err.write_line(&failure.to_string());
                return TaskResult::failure(context.id.clone(), failure, started.elapsed());
            }
        };

        let scratch = self.scratch_dir(context);
        let nodes_file = if context.is_multi_node() {
            write_nodes_file(&scratch, context)
        } else {
            None
        };

        let progress_file = scratch.join(format!("{}.progress", context.id.tag()));
        progress::init(&progress_file);

        let system = SystemBindings {
            worker_home: self.config.worker_home.clone(),
            scratch_dir: scratch.display().to_string(),
            nodes_file: nodes_file.as_ref().map(|p| p.display().to_string()),
            nodes_number: context.node_hosts.len().max(1),
        };

        let mut bindings = Bindings {
            variables: variables::resolve(context, &system, &credentials),
            credentials,
            previous_values: context
                .previous_results
                .iter()
                .map(|result| result.value().cloned().unwrap_or(Value::Null))
                .collect(),
            ..Bindings::default()
        };
        bindings.extra.insert(
            PROGRESS_FILE_ENV.to_string(),
            progress_file.display().to_string(),
        );
        for (name, uri) in data_space_bindings(context) {
            bindings.extra.insert(name.to_string(), uri.to_string());
        }

        let outcome = self.runner.run_sequence(context, &mut bindings, out, err);

        let mut result = match outcome.value {
            Ok(value) => TaskResult::success(context.id.clone(), value, started.elapsed()),
            Err(failure) => {
                err.write_line(&failure.to_string());
                TaskResult::failure(context.id.clone(), failure, started.elapsed())
            }
        };
        result.propagated_variables = bindings.variables.propagated().clone();
        result.result_map = bindings.result_map;
        result.metadata = bindings.metadata;
        result.action = outcome.action;

        tracing::info!(
            task = %context.id,
            failed = result.had_error(),
            duration_ms = result.duration_ms,
            "Task finished"
        );
        result
    }
}

/// Writes the node-list file for a multi-node task: one hostname per
/// line, the hosting node first
fn write_nodes_file(scratch: &Path, context: &TaskContext) -> Option<PathBuf> {
    let path = scratch.join(format!("{}.nodes", context.id.tag()));
    let mut content = context.node_hosts.join("\n");
    content.push('\n');
    match std::fs::write(&path, content) {
        Ok(()) => Some(path),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Could not write nodes file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{FlowScript, Script};
    use crate::task::context::{Credentials, DataSpaces, TaskContextBuilder, TaskId};
    use crate::task::variables::VAR_JOB_OWNER;
    use crate::task::{FlowAction, TaskFailure};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::tempdir;

    fn executor() -> InProcessExecutor {
        InProcessExecutor::default()
    }

    fn run(context: &TaskContext) -> (TaskResult, String, String) {
        let (out, out_capture) = LogSink::capture();
        let (err, err_capture) = LogSink::capture();
        let result = executor().execute(context, &out, &err);
        (result, out_capture.contents(), err_capture.contents())
    }

    #[test]
    fn test_pre_main_post_output_order() {
        let context = TaskContextBuilder::new(
            TaskId::new("1", "1", "ordered"),
            Script::shell("echo hello"),
        )
        .pre_script(Script::shell("echo pre"))
        .post_script(Script::shell("echo post"))
        .build();

        let (result, out, _) = run(&context);
        assert!(!result.had_error());
        assert_eq!(out, "pre\nhello\npost\n");
        // The task value is the main script's, not the post script's.
        assert_eq!(result.value(), Some(&Value::String("hello".to_string())));
    }

    #[test]
    fn test_arithmetic_value_comes_back_as_number() {
        let context = TaskContextBuilder::new(
            TaskId::new("1", "2", "arith"),
            Script::shell("echo $((6*7))"),
        )
        .build();

        let (result, _, _) = run(&context);
        assert_eq!(result.value(), Some(&Value::from(42)));
    }

    #[test]
    fn test_variables_propagate_across_stages_into_result() {
        let context = TaskContextBuilder::new(
            TaskId::new("1", "3", "chain"),
            Script::shell("echo \"var=${var}task\" >> \"$TASKLINE_SETVARS\""),
        )
        .pre_script(Script::shell("echo 'var=valuepre' >> \"$TASKLINE_SETVARS\""))
        .build();

        let (result, _, _) = run(&context);
        assert_eq!(
            result.propagated_variables.get("var"),
            Some(&"valuepretask".to_string())
        );
    }

    #[test]
    fn test_job_owner_is_bound() {
        let context = TaskContextBuilder::new(
            TaskId::new("1", "4", "identity"),
            Script::shell(format!("echo \"${{{VAR_JOB_OWNER}}}\"")),
        )
        .job_owner("demo_user")
        .build();

        let (result, _, _) = run(&context);
        assert_eq!(result.value(), Some(&Value::String("demo_user".to_string())));
    }

    #[test]
    fn test_nodes_file_for_multi_node_task() {
        let dir = tempdir().unwrap();
        let context = TaskContextBuilder::new(
            TaskId::new("1", "5", "nodes"),
            Script::shell("cat \"$TASKLINE_NODESFILE\""),
        )
        .data_spaces(DataSpaces {
            scratch: dir.path().display().to_string(),
            ..DataSpaces::default()
        })
        .node_hosts(vec!["thishost".to_string(), "dummyhost".to_string()])
        .build();

        let (result, out, _) = run(&context);
        assert!(!result.had_error());
        assert_eq!(out, "thishost\ndummyhost\n");

        let nodes_path = dir.path().join("1t5.nodes");
        assert!(nodes_path.exists());
    }

    #[test]
    fn test_progress_file_starts_at_zero() {
        let dir = tempdir().unwrap();
        let context = TaskContextBuilder::new(
            TaskId::new("1", "6", "progress"),
            Script::shell("echo 55 > \"$TASKLINE_PROGRESS_FILE\""),
        )
        .data_spaces(DataSpaces {
            scratch: dir.path().display().to_string(),
            ..DataSpaces::default()
        })
        .build();

        let (result, _, _) = run(&context);
        assert!(!result.had_error());
        assert_eq!(progress::get(&dir.path().join("1t6.progress")), 55);
    }

    #[test]
    fn test_malformed_credentials_fail_before_any_script() {
        let context = TaskContextBuilder::new(
            TaskId::new("1", "7", "creds"),
            Script::shell("echo should-not-run"),
        )
        .credentials(Credentials::from_blob(b"not json".to_vec()))
        .build();

        let (result, out, err) = run(&context);
        assert!(matches!(
            result.error(),
            Some(TaskFailure::CredentialsUnavailable(_))
        ));
        assert_eq!(out, "");
        assert!(err.contains("credentials unavailable"));
    }

    #[test]
    fn test_credentials_reach_scripts() {
        let mut secrets = HashMap::new();
        secrets.insert("PASSWORD".to_string(), "p4ssw0rd".to_string());
        let context = TaskContextBuilder::new(
            TaskId::new("1", "8", "creds"),
            Script::shell("echo \"$credentials_PASSWORD\""),
        )
        .credentials(Credentials::seal(&secrets))
        .build();

        let (result, _, _) = run(&context);
        assert_eq!(result.value(), Some(&Value::String("p4ssw0rd".to_string())));
    }

    #[test]
    fn test_previous_values_are_bound() {
        let previous = TaskResult::success(
            TaskId::new("1", "1", "upstream"),
            Value::from(21),
            Duration::ZERO,
        );
        let context = TaskContextBuilder::new(
            TaskId::new("1", "9", "downstream"),
            Script::shell("echo \"$TASKLINE_RESULTS\""),
        )
        .previous_results(vec![previous])
        .build();

        let (result, _, _) = run(&context);
        assert_eq!(result.value(), Some(&serde_json::json!([21])));
    }

    #[test]
    fn test_variable_chain_between_two_tasks() {
        let first = TaskContextBuilder::new(
            TaskId::new("1", "13", "first"),
            Script::shell("echo 'shared=from-first' >> \"$TASKLINE_SETVARS\""),
        )
        .build();
        let (first_result, _, _) = run(&first);
        assert!(!first_result.had_error());

        let second = TaskContextBuilder::new(
            TaskId::new("1", "14", "second"),
            Script::shell("echo \"${shared}\""),
        )
        .previous_results(vec![first_result])
        .build();
        let (second_result, _, _) = run(&second);

        assert_eq!(
            second_result.value(),
            Some(&Value::String("from-first".to_string()))
        );
        // Inherited only: the second task did not write it, so it is
        // not propagated further.
        assert!(!second_result.propagated_variables.contains_key("shared"));
    }

    #[test]
    fn test_metadata_and_result_map_collected() {
        let context = TaskContextBuilder::new(
            TaskId::new("1", "10", "meta"),
            Script::shell(
                "echo 'content.type=text/csv' >> \"$TASKLINE_SETMETA\"; \
                 echo 'rows=120' >> \"$TASKLINE_SETRESULTS\"; echo done",
            ),
        )
        .build();

        let (result, _, _) = run(&context);
        assert_eq!(
            result.metadata.get("content.type"),
            Some(&"text/csv".to_string())
        );
        assert_eq!(result.result_map.get("rows"), Some(&Value::from(120)));
    }

    #[test]
    fn test_flow_action_lands_in_result() {
        let context = TaskContextBuilder::new(
            TaskId::new("1", "11", "flow"),
            Script::shell("echo 42"),
        )
        .flow_script(FlowScript::new(Script::shell("echo 'loop true'")))
        .build();

        let (result, _, _) = run(&context);
        assert!(!result.had_error());
        assert_eq!(result.action, FlowAction::Loop { active: true });
    }

    #[test]
    fn test_failure_is_appended_to_error_sink() {
        let context = TaskContextBuilder::new(
            TaskId::new("1", "12", "failing"),
            Script::shell("exit 3"),
        )
        .build();

        let (result, _, err) = run(&context);
        assert!(result.had_error());
        assert!(err.contains("main script failed"));
    }
}
