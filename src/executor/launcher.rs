//! Launch-plan construction for forked tasks
//!
//! Builds the complete command line, environment and working directory
//! for a forked child before anything is spawned. Construction is
//! deterministic and never mutates the task context; every resolution
//! failure surfaces as a launch failure while no process exists yet.

use crate::config::WorkerConfig;
use crate::executor::LogSink;
use crate::logging::DEFAULT_LOG_FILTER;
use crate::script::{Bindings, ScriptRunner, ScriptResult};
use crate::task::variables::{convert_path, convert_well_known_paths, substitute};
use crate::task::{TargetOs, TaskContext, TaskFailure, VariablesMap};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Search-path environment variable handed to the child
pub const PATH_ENV: &str = "TASKLINE_PATH";
/// Marker telling the child it runs as a forked task
pub const FORK_MARKER_ENV: &str = "TASKLINE_FORKED";
/// Scope variable an environment script may publish to override the
/// runtime executable
pub const ENV_SCRIPT_RUNTIME: &str = "TASKLINE_FORK_RUNTIME";
/// Scope variable an environment script may publish to prepend a
/// prefix command
pub const ENV_SCRIPT_PREFIX: &str = "TASKLINE_FORK_PREFIX";

/// Fully resolved recipe for spawning one forked child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Complete argument vector; first element is the executable
    pub argv: Vec<String>,

    /// Environment variables set in the child
    pub env: HashMap<String, String>,

    /// Working directory of the child
    pub cwd: PathBuf,
}

impl LaunchPlan {
    /// Builds a spawnable command from the plan
    #[must_use]
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);
        cmd.envs(&self.env);
        cmd.current_dir(&self.cwd);
        cmd
    }
}

/// Builds the launch plan for a task whose context carries a fork
/// environment
///
/// The environment script, when present, runs first on the hosting
/// node; scope variables it publishes may override the runtime
/// executable and the prefix command. The input variables are cloned,
/// with well-known paths rewritten once when the fork targets another
/// platform.
///
/// # Errors
///
/// Returns [`TaskFailure::Launch`] when the environment script fails
/// or no runtime executable can be resolved.
pub fn build(
    context: &TaskContext,
    config: &WorkerConfig,
    runner: &ScriptRunner,
    vars: &VariablesMap,
    credentials: &HashMap<String, String>,
    handoff: &Path,
    out: &LogSink,
    err: &LogSink,
) -> Result<LaunchPlan, TaskFailure> {
    let Some(fork) = &context.fork else {
        return Err(TaskFailure::Launch(
            "task context carries no fork environment".to_string(),
        ));
    };
    let target = fork.target_os.unwrap_or_else(TargetOs::host);

    let mut vars = vars.clone();
    if fork.is_cross_platform() {
        convert_well_known_paths(&mut vars, target);
    }

    // Environment script runs before anything is resolved; its
    // published variables win over static fork-environment settings.
    let mut bindings = Bindings {
        variables: vars,
        credentials: credentials.clone(),
        ..Bindings::default()
    };
    if let Some(env_script) = &fork.env_script {
        tracing::debug!(task = %context.id, "Running fork environment script");
        if let ScriptResult::Error(e) = runner.run_single(env_script, &mut bindings, out, err) {
            return Err(TaskFailure::Launch(format!(
                "environment script failed: {}",
                e.0
            )));
        }
    }
    let vars = bindings.variables;

    let runtime = resolve_runtime(&vars, fork.runtime.as_deref(), credentials)?;

    let mut env = HashMap::new();
    for name in &config.propagated_env {
        if let Ok(value) = std::env::var(name) {
            env.insert(name.clone(), value);
        }
    }
    for (key, value) in &fork.system_env {
        env.insert(key.clone(), substitute(value, &vars, credentials));
    }
    env.insert(FORK_MARKER_ENV.to_string(), "1".to_string());
    env.insert(
        PATH_ENV.to_string(),
        search_path(&runtime, &fork.additional_paths, &vars, credentials, target),
    );

    let mut argv = Vec::new();
    let prefix = vars
        .get(ENV_SCRIPT_PREFIX)
        .map(str::to_string)
        .or_else(|| fork.prefix_command.clone());
    if let Some(prefix) = prefix {
        let substituted = substitute(&prefix, &vars, credentials);
        let words = shell_words::split(&substituted)
            .map_err(|e| TaskFailure::Launch(format!("invalid prefix command: {e}")))?;
        argv.extend(words);
    }
    argv.push(runtime);
    for arg in &fork.extra_args {
        argv.push(substitute(arg, &vars, credentials));
    }
    argv.push("--log-filter".to_string());
    argv.push(resolve_log_filter(config));
    argv.push("fork".to_string());
    argv.push(convert_path(&handoff.display().to_string(), target));

    let cwd = match &fork.working_dir {
        Some(dir) => PathBuf::from(substitute(dir, &vars, credentials)),
        None => std::env::current_dir()
            .map_err(|e| TaskFailure::Launch(format!("no working directory: {e}")))?,
    };

    Ok(LaunchPlan { argv, env, cwd })
}

/// Runtime executable, in decreasing priority: environment-script
/// override, fork-environment override, the running executable
fn resolve_runtime(
    vars: &VariablesMap,
    configured: Option<&str>,
    credentials: &HashMap<String, String>,
) -> Result<String, TaskFailure> {
    if let Some(runtime) = vars.get(ENV_SCRIPT_RUNTIME) {
        return Ok(runtime.to_string());
    }
    if let Some(runtime) = configured {
        return Ok(substitute(runtime, vars, credentials));
    }
    std::env::current_exe()
        .map(|path| path.display().to_string())
        .map_err(|e| TaskFailure::Launch(format!("no resolvable runtime executable: {e}")))
}

/// Search path for the child: current dir, the runtime's own
/// directory, then the fork's additional entries
///
/// Additional entries are substituted but never path-converted; they
/// are already expressed for the target platform.
fn search_path(
    runtime: &str,
    additional: &[String],
    vars: &VariablesMap,
    credentials: &HashMap<String, String>,
    target: TargetOs,
) -> String {
    let mut entries = vec![".".to_string()];
    if let Some(parent) = Path::new(runtime).parent() {
        let parent = parent.display().to_string();
        if !parent.is_empty() {
            entries.push(convert_path(&parent, target));
        }
    }
    for path in additional {
        entries.push(substitute(path, vars, credentials));
    }
    entries.join(&target.path_list_separator().to_string())
}

/// Log filter for the child: the configured filter file when it
/// exists, the bundled default otherwise
fn resolve_log_filter(config: &WorkerConfig) -> String {
    if let Some(file) = &config.log_filter_file {
        match std::fs::read_to_string(file) {
            Ok(content) if !content.trim().is_empty() => return content.trim().to_string(),
            Ok(_) => tracing::warn!(%file, "Log-filter file is empty, using default"),
            Err(e) => tracing::debug!(%file, error = %e, "Log-filter file unavailable"),
        }
    }
    DEFAULT_LOG_FILTER.to_string()
}
