//! Scripts and script engines
//!
//! The scripting engine itself is a black box behind [`ScriptEngine`]:
//! it receives a script plus a mutable binding set and returns either a
//! produced value or an error. The bundled [`ShellEngine`] executes
//! script bodies through the system shell; bindings are exported as
//! environment variables, and scripts publish variable writes, result
//! metadata and named side-outputs through pointer files advertised in
//! their environment.

pub mod runner;

pub use runner::ScriptRunner;

use crate::executor::LogSink;
use crate::task::VariablesMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Environment variable advertising the scope-variable out-file
pub const SETVARS_POINTER: &str = "TASKLINE_SETVARS";
/// Environment variable advertising the result-metadata out-file
pub const SETMETA_POINTER: &str = "TASKLINE_SETMETA";
/// Environment variable advertising the named side-output out-file
pub const SETRESULTS_POINTER: &str = "TASKLINE_SETRESULTS";
/// Environment variable carrying previous task values as a JSON array
pub const RESULTS_BINDING: &str = "TASKLINE_RESULTS";
/// Environment variable carrying the primary outcome value into a
/// control-flow script
pub const TASK_RESULT_BINDING: &str = "TASKLINE_TASK_RESULT";
/// Environment variable carrying the primary outcome error into a
/// control-flow script
pub const TASK_ERROR_BINDING: &str = "TASKLINE_TASK_ERROR";

/// One script reference: engine name, body, arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    /// Name of the engine that runs this script
    pub engine: String,

    /// Script body
    pub body: String,

    /// Arguments, each passed through variable substitution before the
    /// engine sees them
    pub args: Vec<String>,
}

impl Script {
    /// Creates a script for a named engine
    #[must_use]
    pub fn new(engine: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            body: body.into(),
            args: Vec::new(),
        }
    }

    /// Creates a shell script
    #[must_use]
    pub fn shell(body: impl Into<String>) -> Self {
        Self::new(ShellEngine::NAME, body)
    }

    /// Sets the script arguments
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

/// A script that inspects the task outcome and decides the
/// continuation action for the enclosing workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowScript {
    /// The underlying script
    pub script: Script,
}

impl FlowScript {
    /// Wraps a script as a control-flow script
    #[must_use]
    pub fn new(script: Script) -> Self {
        Self { script }
    }
}

/// Failure reported by a script engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ScriptError(pub String);

/// Outcome of running one script: a produced value or an error,
/// never both
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptResult {
    /// The script produced a value
    Value(Value),
    /// The script failed
    Error(ScriptError),
}

impl ScriptResult {
    /// The produced value, if any
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Error(_) => None,
        }
    }

    /// The error, if any
    #[must_use]
    pub fn error(&self) -> Option<&ScriptError> {
        match self {
            Self::Value(_) => None,
            Self::Error(error) => Some(error),
        }
    }
}

/// Mutable binding set shared by every script of one task
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    /// Layered task variables; scripts write new scope entries here
    pub variables: VariablesMap,

    /// Decrypted third-party credentials
    pub credentials: HashMap<String, String>,

    /// Values produced by previous tasks, in dependency order
    pub previous_values: Vec<Value>,

    /// Result metadata accumulated across the script sequence
    pub metadata: HashMap<String, String>,

    /// Named side-outputs accumulated across the script sequence
    pub result_map: HashMap<String, Value>,

    /// Additional engine bindings (data-space URIs, progress-file
    /// path, outcome bindings for the control-flow script)
    pub extra: HashMap<String, String>,
}

/// Black-box script engine: run this script with these bindings, get a
/// result or an error
pub trait ScriptEngine: Send + Sync {
    /// Evaluates a script against the bindings, streaming its output
    /// to the sinks; may add scope variables, metadata and side-outputs
    /// to the bindings
    fn eval(
        &self,
        script: &Script,
        bindings: &mut Bindings,
        out: &LogSink,
        err: &LogSink,
    ) -> ScriptResult;
}

/// Maps engine names to engine instances
///
/// `shell` is registered by default; tests and embedders may register
/// their own engines.
#[derive(Clone)]
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn ScriptEngine>>,
}

impl EngineRegistry {
    /// Registry with the bundled shell engine
    #[must_use]
    pub fn with_defaults(shell: impl Into<String>) -> Self {
        let mut registry = Self {
            engines: HashMap::new(),
        };
        registry.register(ShellEngine::NAME, Arc::new(ShellEngine::new(shell)));
        registry
    }

    /// Registers an engine under a name
    pub fn register(&mut self, name: impl Into<String>, engine: Arc<dyn ScriptEngine>) {
        self.engines.insert(name.into(), engine);
    }

    /// Looks up an engine by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ScriptEngine>> {
        self.engines.get(name).cloned()
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::with_defaults("sh")
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.engines.keys().collect();
        names.sort();
        write!(f, "EngineRegistry({names:?})")
    }
}

/// Bundled engine executing script bodies through the system shell
///
/// Bindings become environment variables: task variables under their
/// own names (scope winning over inherited), credentials as
/// `credentials_<key>`, previous values as a JSON array. The produced
/// value is the trimmed stdout, parsed as JSON when it parses.
#[derive(Debug, Clone)]
pub struct ShellEngine {
    shell: String,
}

impl ShellEngine {
    /// Engine name used in [`Script::engine`]
    pub const NAME: &'static str = "shell";

    /// Creates an engine using the given shell executable
    #[must_use]
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl ScriptEngine for ShellEngine {
    fn eval(
        &self,
        script: &Script,
        bindings: &mut Bindings,
        out: &LogSink,
        err: &LogSink,
    ) -> ScriptResult {
        let outfiles = match OutFiles::create() {
            Ok(outfiles) => outfiles,
            Err(e) => return ScriptResult::Error(ScriptError(e)),
        };

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(&script.body);
        // Positional parameters: $0 is conventional, $1.. are the
        // script arguments.
        cmd.arg("taskline").args(&script.args);
        cmd.envs(bindings.variables.effective());
        for (key, value) in &bindings.credentials {
            cmd.env(format!("credentials_{key}"), value);
        }
        cmd.envs(&bindings.extra);
        cmd.env(
            RESULTS_BINDING,
            serde_json::to_string(&bindings.previous_values).unwrap_or_else(|_| "[]".to_string()),
        );
        cmd.env(SETVARS_POINTER, &outfiles.variables);
        cmd.env(SETMETA_POINTER, &outfiles.metadata);
        cmd.env(SETRESULTS_POINTER, &outfiles.results);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(Stdio::null());

        tracing::debug!(engine = Self::NAME, "Evaluating script");

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ScriptResult::Error(ScriptError(format!(
                    "could not start shell '{}': {e}",
                    self.shell
                )));
            }
        };

        // Drain both pipes concurrently; a full pipe buffer would
        // otherwise deadlock the child.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_thread = stdout.map(|pipe| {
            let sink = out.clone();
            std::thread::spawn(move || {
                let mut captured = String::new();
                for line in BufReader::new(pipe).lines().map_while(Result::ok) {
                    sink.write_line(&line);
                    captured.push_str(&line);
                    captured.push('\n');
                }
                captured
            })
        });
        let stderr_thread = stderr.map(|pipe| {
            let sink = err.clone();
            std::thread::spawn(move || {
                for line in BufReader::new(pipe).lines().map_while(Result::ok) {
                    sink.write_line(&line);
                }
            })
        });

        let status = child.wait();
        let captured = stdout_thread
            .and_then(|t| t.join().ok())
            .unwrap_or_default();
        if let Some(thread) = stderr_thread {
            let _ = thread.join();
        }

        let result = match status {
            Err(e) => ScriptResult::Error(ScriptError(format!("wait for shell failed: {e}"))),
            Ok(status) if !status.success() => ScriptResult::Error(ScriptError(format!(
                "shell script exited with code {}",
                status.code().unwrap_or(-1)
            ))),
            Ok(_) => {
                outfiles.collect(bindings);
                let trimmed = captured.trim();
                if trimmed.is_empty() {
                    ScriptResult::Value(Value::Null)
                } else {
                    ScriptResult::Value(
                        serde_json::from_str(trimmed)
                            .unwrap_or_else(|_| Value::String(trimmed.to_string())),
                    )
                }
            }
        };

        outfiles.cleanup();
        result
    }
}

/// Pointer files a script writes variable/metadata/side-output updates
/// through, one `key=value` pair per line
struct OutFiles {
    dir: PathBuf,
    variables: PathBuf,
    metadata: PathBuf,
    results: PathBuf,
}

impl OutFiles {
    fn create() -> Result<Self, String> {
        let dir = std::env::temp_dir().join(format!("taskline-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir)
            .map_err(|e| format!("could not create script out-file directory: {e}"))?;
        Ok(Self {
            variables: dir.join("variables"),
            metadata: dir.join("metadata"),
            results: dir.join("results"),
            dir,
        })
    }

    fn collect(&self, bindings: &mut Bindings) {
        for (key, value) in read_pairs(&self.variables) {
            bindings.variables.set_scope(key, value);
        }
        for (key, value) in read_pairs(&self.metadata) {
            bindings.metadata.insert(key, value);
        }
        for (key, value) in read_pairs(&self.results) {
            let parsed =
                serde_json::from_str(&value).unwrap_or_else(|_| Value::String(value.clone()));
            bindings.result_map.insert(key, parsed);
        }
    }

    fn cleanup(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            tracing::debug!(error = %e, "Could not remove script out-file directory");
        }
    }
}

/// Parses `key=value` lines from an out-file; missing file means no
/// updates
fn read_pairs(path: &Path) -> Vec<(String, String)> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            line.split_once('=')
                .map(|(key, value)| (key.trim().to_string(), value.to_string()))
                .or_else(|| {
                    tracing::warn!(line, "Ignoring malformed out-file line");
                    None
                })
        })
        .collect()
}
