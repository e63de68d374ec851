//! Forked task execution and process supervision
//!
//! Spawns the task in a separate runtime process, streams its output,
//! waits for exit and reconciles the exit code with the result the
//! child left in the handoff file. Cleanup is idempotent: the normal
//! return path and an out-of-band kill through the node registry can
//! both run it without double-killing or leaking the handoff file.

use crate::config::WorkerConfig;
use crate::executor::process::{COOKIE_ENV, ProcessHandle};
use crate::executor::registry::NodeSessionRegistry;
use crate::executor::{LogSink, TaskExecutor, bridge, launcher};
use crate::script::{EngineRegistry, ScriptRunner};
use crate::task::variables::{self, SystemBindings, substitute};
use crate::task::{TaskContext, TaskFailure, TaskResult};
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Executes tasks in a supervised child process
#[derive(Debug, Clone)]
pub struct ForkedExecutor {
    config: WorkerConfig,
    runner: ScriptRunner,
    registry: Arc<NodeSessionRegistry>,
}

impl ForkedExecutor {
    /// Creates an executor registering its children with the given
    /// node registry
    #[must_use]
    pub fn new(config: WorkerConfig, registry: Arc<NodeSessionRegistry>) -> Self {
        let runner = ScriptRunner::new(EngineRegistry::with_defaults(config.shell.clone()));
        Self {
            config,
            runner,
            registry,
        }
    }

    fn supervise(
        &self,
        context: &TaskContext,
        out: &LogSink,
        err: &LogSink,
        handoff_slot: &mut Option<PathBuf>,
    ) -> Result<TaskResult, TaskFailure> {
        let credentials = context.third_party_credentials()?;

        let scratch = if context.data_spaces.scratch.is_empty() {
            std::env::temp_dir().display().to_string()
        } else {
            context.data_spaces.scratch.clone()
        };
        let system = SystemBindings {
            worker_home: self.config.worker_home.clone(),
            scratch_dir: scratch,
            nodes_file: None,
            nodes_number: context.node_hosts.len().max(1),
        };
        let vars = variables::resolve(context, &system, &credentials);

        let working_dir = match context.fork.as_ref().and_then(|f| f.working_dir.as_ref()) {
            Some(dir) => PathBuf::from(substitute(dir, &vars, &credentials)),
            None => std::env::current_dir()
                .map_err(|e| TaskFailure::Launch(format!("no working directory: {e}")))?,
        };
        std::fs::create_dir_all(&working_dir)
            .map_err(|e| TaskFailure::Launch(format!("could not create working directory: {e}")))?;

        let handoff = working_dir.join(context.handoff_file_name());
        bridge::write_context(&handoff, context)?;
        *handoff_slot = Some(handoff.clone());

        let plan = launcher::build(
            context,
            &self.config,
            &self.runner,
            &vars,
            &credentials,
            &handoff,
            out,
            err,
        )?;

        // Unique per task so a tree-kill never matches a sibling.
        let cookie = format!("{}_{}", context.id.tag(), Uuid::new_v4());

        let mut cmd = plan.to_command();
        cmd.env(COOKIE_ENV, &cookie);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(Stdio::null());

        tracing::info!(task = %context.id, argv = ?plan.argv, "Spawning forked task");
        let mut child = cmd
            .spawn()
            .map_err(|e| TaskFailure::Launch(format!("could not spawn '{}': {e}", plan.argv[0])))?;

        let grace = std::time::Duration::from_millis(self.config.cleanup_timeout_ms);
        let handle = ProcessHandle::new(child.id(), &cookie, grace);
        self.registry
            .register(self.config.node_name.clone(), handle.clone());

        // Drain threads start before the blocking wait and are joined
        // after the process is definitely down, so no output is lost.
        let out_thread = child.stdout.take().map(|pipe| {
            let sink = out.clone();
            std::thread::spawn(move || {
                for line in BufReader::new(pipe).lines().map_while(Result::ok) {
                    sink.write_line(&line);
                }
            })
        });
        let err_thread = child.stderr.take().map(|pipe| {
            let sink = err.clone();
            std::thread::spawn(move || {
                for line in BufReader::new(pipe).lines().map_while(Result::ok) {
                    sink.write_line(&line);
                }
            })
        });

        let status = child.wait();

        // Descendants carrying the cookie are swept on every path, not
        // just the kill path: a backgrounded grandchild survives the
        // child's normal exit and would keep the output pipes open,
        // blocking the drain joins below.
        if status.is_err() {
            handle.kill_tree();
        } else {
            handle.sweep_descendants();
        }
        handle.mark_terminated();
        self.registry.clear(&self.config.node_name);

        if let Some(thread) = out_thread {
            let _ = thread.join();
        }
        if let Some(thread) = err_thread {
            let _ = thread.join();
        }

        let status =
            status.map_err(|e| TaskFailure::Launch(format!("wait for child failed: {e}")))?;
        let code = status.code().unwrap_or(-1);

        // Exit-code reconciliation: a structured result wins when it is
        // consistent with the exit code. A context echo means the child
        // never reported, so the exit code is the classification; a
        // destroyed report is unreadable regardless of the exit code.
        match bridge::read_result(&handoff) {
            Ok(result) if status.success() => Ok(result),
            Ok(result) if result.had_error() => Ok(result),
            Ok(_) => Err(TaskFailure::NonZeroExit { code }),
            Err(bridge::ResultReadError::ContextEcho) if !status.success() => {
                Err(TaskFailure::NonZeroExit { code })
            }
            Err(error) => Err(TaskFailure::ResultUnreadable(error.to_string())),
        }
    }

    fn cleanup(&self, handoff: Option<&PathBuf>) {
        self.registry.clear(&self.config.node_name);
        if let Some(handoff) = handoff {
            let backoff = std::time::Duration::from_millis(self.config.delete_retry_backoff_ms);
            if let Err(e) =
                bridge::delete_with_retry(handoff, self.config.delete_retry_attempts, backoff)
            {
                tracing::warn!(error = %e, "Handoff cleanup failed");
            }
        }
    }
}

impl TaskExecutor for ForkedExecutor {
    fn execute(&self, context: &TaskContext, out: &LogSink, err: &LogSink) -> TaskResult {
        let started = Instant::now();
        let mut handoff = None;

        let outcome = self.supervise(context, out, err, &mut handoff);
        self.cleanup(handoff.as_ref());

        match outcome {
            Ok(result) => result,
            Err(failure) => {
                tracing::warn!(task = %context.id, error = %failure, "Forked task failed");
                err.write_line(&failure.to_string());
                TaskResult::failure(context.id.clone(), failure, started.elapsed())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Script;
    use crate::task::TaskId;
    use crate::task::context::{ForkEnvironment, TaskContextBuilder};
    use tempfile::tempdir;

    fn executor() -> (ForkedExecutor, Arc<NodeSessionRegistry>) {
        let registry = Arc::new(NodeSessionRegistry::new());
        (
            ForkedExecutor::new(WorkerConfig::default(), Arc::clone(&registry)),
            registry,
        )
    }

    /// Fork environment whose "runtime" is the shell, so the child's
    /// behavior is fully scripted without a real worker binary
    fn shell_fork(dir: &std::path::Path, body: &str) -> ForkEnvironment {
        ForkEnvironment {
            runtime: Some("sh".to_string()),
            working_dir: Some(dir.display().to_string()),
            extra_args: vec!["-c".to_string(), body.to_string()],
            ..ForkEnvironment::default()
        }
    }

    #[test]
    fn test_nonzero_exit_without_result_is_process_failure() {
        let dir = tempdir().unwrap();
        let context = TaskContextBuilder::new(TaskId::new("1", "1", "crash"), Script::shell("true"))
            .fork(shell_fork(dir.path(), "exit 5"))
            .build();

        let (executor, _) = executor();
        let (out, _) = LogSink::capture();
        let (err, _) = LogSink::capture();
        let result = executor.execute(&context, &out, &err);

        assert_eq!(result.error(), Some(&TaskFailure::NonZeroExit { code: 5 }));
        assert!(result.error().unwrap().is_process_failure());
        // Cleanup removed the handoff file.
        assert!(!dir.path().join("1t1.handoff").exists());
    }

    #[test]
    fn test_zero_exit_without_result_is_unreadable() {
        let dir = tempdir().unwrap();
        let context = TaskContextBuilder::new(TaskId::new("1", "2", "silent"), Script::shell("true"))
            .fork(shell_fork(dir.path(), "exit 0"))
            .build();

        let (executor, _) = executor();
        let (out, _) = LogSink::capture();
        let (err, _) = LogSink::capture();
        let result = executor.execute(&context, &out, &err);

        assert!(matches!(
            result.error(),
            Some(TaskFailure::ResultUnreadable(_))
        ));
    }

    #[test]
    fn test_garbled_result_with_nonzero_exit_is_unreadable() {
        let dir = tempdir().unwrap();
        // The child destroys its own report before dying: the parent
        // must classify this as an unreadable result, not an exit code.
        let context =
            TaskContextBuilder::new(TaskId::new("1", "7", "garbled"), Script::shell("true"))
                .fork(shell_fork(
                    dir.path(),
                    "echo 'not json at all' > 1t7.handoff; exit 3",
                ))
                .build();

        let (executor, _) = executor();
        let (out, _) = LogSink::capture();
        let (err, _) = LogSink::capture();
        let result = executor.execute(&context, &out, &err);

        assert!(matches!(
            result.error(),
            Some(TaskFailure::ResultUnreadable(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_cookie_descendants_die_with_a_normal_exit() {
        let dir = tempdir().unwrap();
        // The script backgrounds a long sleeper and exits immediately;
        // the sleeper inherits the cookie and the output pipes.
        let context =
            TaskContextBuilder::new(TaskId::new("1", "8", "orphaning"), Script::shell("true"))
                .fork(shell_fork(
                    dir.path(),
                    "sleep 300 & echo $! > orphan.pid; exit 0",
                ))
                .build();

        let (executor, _) = executor();
        let (out, _) = LogSink::capture();
        let (err, _) = LogSink::capture();
        let started = std::time::Instant::now();
        executor.execute(&context, &out, &err);
        // The drain joins must not block on the orphan's pipe.
        assert!(started.elapsed() < std::time::Duration::from_secs(30));

        let pid: i32 = std::fs::read_to_string(dir.path().join("orphan.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        // The sweep already signalled; allow a moment for reaping.
        let mut gone = false;
        for _ in 0..40 {
            if unsafe { libc::kill(pid, 0) } != 0 {
                gone = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        assert!(gone, "backgrounded descendant {pid} survived cleanup");
    }

    #[test]
    fn test_unspawnable_runtime_is_a_launch_failure() {
        let dir = tempdir().unwrap();
        let context = TaskContextBuilder::new(TaskId::new("1", "3", "gone"), Script::shell("true"))
            .fork(ForkEnvironment {
                runtime: Some("/nonexistent/taskline-runtime".to_string()),
                working_dir: Some(dir.path().display().to_string()),
                ..ForkEnvironment::default()
            })
            .build();

        let (executor, _) = executor();
        let (out, _) = LogSink::capture();
        let (err, err_capture) = LogSink::capture();
        let result = executor.execute(&context, &out, &err);

        assert!(matches!(result.error(), Some(TaskFailure::Launch(_))));
        assert!(err_capture.contents().contains("could not launch"));
        assert!(!dir.path().join("1t3.handoff").exists());
    }

    #[test]
    fn test_child_output_is_streamed() {
        let dir = tempdir().unwrap();
        let context = TaskContextBuilder::new(TaskId::new("1", "4", "noisy"), Script::shell("true"))
            .fork(shell_fork(
                dir.path(),
                "echo child-out; echo child-err >&2; exit 1",
            ))
            .build();

        let (executor, _) = executor();
        let (out, out_capture) = LogSink::capture();
        let (err, err_capture) = LogSink::capture();
        executor.execute(&context, &out, &err);

        assert_eq!(out_capture.contents(), "child-out\n");
        assert!(err_capture.contents().contains("child-err"));
    }

    #[cfg(unix)]
    #[test]
    fn test_registry_kill_terminates_running_fork() {
        let dir = tempdir().unwrap();
        let context = TaskContextBuilder::new(TaskId::new("1", "5", "killed"), Script::shell("true"))
            .fork(shell_fork(dir.path(), "sleep 30"))
            .build();

        let (executor, registry) = executor();
        let node = WorkerConfig::default().node_name;
        let killer = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                // Wait for the fork to be registered, then kill it.
                for _ in 0..100 {
                    if registry.get(&node).is_some() {
                        registry.kill(&node);
                        return;
                    }
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
                panic!("fork was never registered");
            })
        };

        let (out, _) = LogSink::capture();
        let (err, _) = LogSink::capture();
        let result = executor.execute(&context, &out, &err);
        killer.join().unwrap();

        let failure = result.error().expect("killed task must fail");
        assert!(failure.is_process_failure());
        assert!(!dir.path().join("1t5.handoff").exists());
    }

    #[test]
    fn test_registry_entry_cleared_after_completion() {
        let dir = tempdir().unwrap();
        let context = TaskContextBuilder::new(TaskId::new("1", "6", "done"), Script::shell("true"))
            .fork(shell_fork(dir.path(), "exit 0"))
            .build();

        let (executor, registry) = executor();
        let (out, _) = LogSink::capture();
        let (err, _) = LogSink::capture();
        executor.execute(&context, &out, &err);

        assert!(registry.get(&WorkerConfig::default().node_name).is_none());
    }
}
