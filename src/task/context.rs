//! Task invocation context
//!
//! A [`TaskContext`] is a fully populated, immutable description of one
//! task invocation. It arrives from the scheduler layer with every
//! field already computed; this core only reads it, and serializes it
//! across the fork boundary.

use crate::script::{FlowScript, Script};
use crate::task::errors::TaskFailure;
use crate::task::result::TaskResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifier of one task inside one job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    /// Identifier of the enclosing job
    pub job_id: String,

    /// Identifier of the task within the job
    pub task_id: String,

    /// Human-readable task name
    pub name: String,
}

impl TaskId {
    /// Creates a new task identifier
    #[must_use]
    pub fn new(
        job_id: impl Into<String>,
        task_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            task_id: task_id.into(),
            name: name.into(),
        }
    }

    /// Filesystem-safe tag used to name per-task artifacts (handoff
    /// file, nodes file, progress file) so concurrent tasks never
    /// collide.
    #[must_use]
    pub fn tag(&self) -> String {
        format!("{}t{}", self.job_id, self.task_id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job_id, self.task_id)
    }
}

/// Data-space URIs bound into every script run
///
/// The transport behind these URIs lives in the excluded scheduler
/// layer; this core only forwards them to scripts as bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSpaces {
    /// Per-task scratch space (also hosts local artifacts)
    pub scratch: String,
    /// Per-node cache space
    pub cache: String,
    /// Job input space
    pub input: String,
    /// Job output space
    pub output: String,
    /// Global space shared by all users
    pub global: String,
    /// Per-user space
    pub user: String,
}

/// Target platform of a cross-platform fork
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetOs {
    /// Unix-like target (`/` separators, `:` path lists)
    Unix,
    /// Windows target (`\` separators, `;` path lists)
    Windows,
}

impl TargetOs {
    /// The platform the current process runs on
    #[must_use]
    pub fn host() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }

    /// Path-list separator of the target platform
    #[must_use]
    pub fn path_list_separator(self) -> char {
        match self {
            Self::Unix => ':',
            Self::Windows => ';',
        }
    }
}

/// Configuration describing how to launch a task in a separate process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForkEnvironment {
    /// Runtime executable override; falls back to the currently
    /// running executable when unset
    pub runtime: Option<String>,

    /// Working directory for the forked process
    pub working_dir: Option<String>,

    /// Extra arguments appended to the command line, each passed
    /// through variable substitution
    pub extra_args: Vec<String>,

    /// Additional search-path entries appended after the worker's own
    /// distribution; substituted, never path-converted
    pub additional_paths: Vec<String>,

    /// Environment variables set in the child process
    pub system_env: HashMap<String, String>,

    /// Command prepended before the runtime executable (e.g. a
    /// container-entry wrapper), parsed with shell word splitting
    pub prefix_command: Option<String>,

    /// Script run on the hosting node before the command is built; its
    /// published variables feed into the launch plan
    pub env_script: Option<Script>,

    /// Target platform when it differs from the host (cross-platform
    /// fork); triggers well-known path rewriting
    pub target_os: Option<TargetOs>,
}

impl ForkEnvironment {
    /// True when the fork targets a platform other than the host
    #[must_use]
    pub fn is_cross_platform(&self) -> bool {
        self.target_os.is_some_and(|os| os != TargetOs::host())
    }
}

/// Opaque encrypted credential blob
///
/// Encryption and key exchange belong to the excluded scheduler layer;
/// inside this core the blob is only decoded into the third-party
/// credential map, or rejected as a whole.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    blob: Vec<u8>,
}

impl Credentials {
    /// Wraps an already-encrypted blob received from the scheduler
    #[must_use]
    pub fn from_blob(blob: Vec<u8>) -> Self {
        Self { blob }
    }

    /// Seals a credential map into a blob (scheduler-side helper, used
    /// here to build test fixtures and local invocations)
    #[must_use]
    pub fn seal(credentials: &HashMap<String, String>) -> Self {
        // Infallible for a string map.
        let blob = serde_json::to_vec(credentials).unwrap_or_default();
        Self { blob }
    }

    /// Decodes the blob into the third-party credential map
    ///
    /// # Errors
    ///
    /// Returns [`TaskFailure::CredentialsUnavailable`] when the blob is
    /// malformed; this fails the whole task.
    pub fn decrypt(&self) -> Result<HashMap<String, String>, TaskFailure> {
        serde_json::from_slice(&self.blob)
            .map_err(|e| TaskFailure::CredentialsUnavailable(e.to_string()))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print credential material.
        write!(f, "Credentials({} bytes)", self.blob.len())
    }
}

/// Immutable description of one task invocation
///
/// Owned exclusively by the invocation that created it; every component
/// in this core treats it as read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    /// Task identifier
    pub id: TaskId,

    /// Results of the tasks this one depends on, in dependency order
    pub previous_results: Vec<TaskResult>,

    /// Optional pre-script, run before the main script
    pub pre_script: Option<Script>,

    /// The main script; required, exactly one
    pub main_script: Script,

    /// Optional post-script, run after a successful main script
    pub post_script: Option<Script>,

    /// Control-flow script, always attempted regardless of outcome
    pub flow_script: Option<FlowScript>,

    /// Fork-environment descriptor; present when the task should run
    /// in a separate process
    pub fork: Option<ForkEnvironment>,

    /// Data-space URIs
    pub data_spaces: DataSpaces,

    /// Run the forked process under the task owner's account
    pub run_as_user: bool,

    /// Hostnames the task spans; more than one means multi-node
    pub node_hosts: Vec<String>,

    /// Job-level generic information (lowest variable precedence)
    pub job_variables: HashMap<String, String>,

    /// Task-level generic information (scope variables)
    pub generic_info: HashMap<String, String>,

    /// Owner of the enclosing job
    pub job_owner: String,

    /// Encrypted third-party credentials, if any
    pub credentials: Option<Credentials>,
}

impl TaskContext {
    /// Name of the handoff file for this task inside a working
    /// directory
    #[must_use]
    pub fn handoff_file_name(&self) -> String {
        format!("{}.handoff", self.id.tag())
    }

    /// True when the task spans more than one node
    #[must_use]
    pub fn is_multi_node(&self) -> bool {
        self.node_hosts.len() > 1
    }

    /// Decrypts third-party credentials, yielding an empty map when
    /// the context carries none.
    ///
    /// # Errors
    ///
    /// Returns [`TaskFailure::CredentialsUnavailable`] on a malformed
    /// blob.
    pub fn third_party_credentials(&self) -> Result<HashMap<String, String>, TaskFailure> {
        match &self.credentials {
            Some(credentials) => credentials.decrypt(),
            None => Ok(HashMap::new()),
        }
    }
}

/// Builder for task contexts
///
/// The scheduler layer populates contexts wholesale; the builder keeps
/// local construction (and tests) readable.
#[derive(Debug, Clone)]
pub struct TaskContextBuilder {
    context: TaskContext,
}

impl TaskContextBuilder {
    /// Starts a context for the given identifier and main script
    #[must_use]
    pub fn new(id: TaskId, main_script: Script) -> Self {
        Self {
            context: TaskContext {
                id,
                previous_results: Vec::new(),
                pre_script: None,
                main_script,
                post_script: None,
                flow_script: None,
                fork: None,
                data_spaces: DataSpaces::default(),
                run_as_user: false,
                node_hosts: Vec::new(),
                job_variables: HashMap::new(),
                generic_info: HashMap::new(),
                job_owner: String::new(),
                credentials: None,
            },
        }
    }

    /// Sets the pre-script
    #[must_use]
    pub fn pre_script(mut self, script: Script) -> Self {
        self.context.pre_script = Some(script);
        self
    }

    /// Sets the post-script
    #[must_use]
    pub fn post_script(mut self, script: Script) -> Self {
        self.context.post_script = Some(script);
        self
    }

    /// Sets the control-flow script
    #[must_use]
    pub fn flow_script(mut self, script: FlowScript) -> Self {
        self.context.flow_script = Some(script);
        self
    }

    /// Sets the fork environment
    #[must_use]
    pub fn fork(mut self, fork: ForkEnvironment) -> Self {
        self.context.fork = Some(fork);
        self
    }

    /// Sets the data-space URIs
    #[must_use]
    pub fn data_spaces(mut self, spaces: DataSpaces) -> Self {
        self.context.data_spaces = spaces;
        self
    }

    /// Sets the previous task results
    #[must_use]
    pub fn previous_results(mut self, results: Vec<TaskResult>) -> Self {
        self.context.previous_results = results;
        self
    }

    /// Sets the node host list
    #[must_use]
    pub fn node_hosts(mut self, hosts: Vec<String>) -> Self {
        self.context.node_hosts = hosts;
        self
    }

    /// Adds a job-level variable
    #[must_use]
    pub fn job_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.job_variables.insert(key.into(), value.into());
        self
    }

    /// Adds a task-level generic-information entry
    #[must_use]
    pub fn generic_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.generic_info.insert(key.into(), value.into());
        self
    }

    /// Sets the job owner
    #[must_use]
    pub fn job_owner(mut self, owner: impl Into<String>) -> Self {
        self.context.job_owner = owner.into();
        self
    }

    /// Sets the encrypted credentials
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.context.credentials = Some(credentials);
        self
    }

    /// Finishes the context
    #[must_use]
    pub fn build(self) -> TaskContext {
        self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_id() -> TaskId {
        TaskId::new("1000", "42", "task")
    }

    #[test]
    fn test_task_id_tag_is_filesystem_safe() {
        assert_eq!(task_id().tag(), "1000t42");
        assert_eq!(task_id().to_string(), "1000/42");
    }

    #[test]
    fn test_credentials_round_trip() {
        let mut map = HashMap::new();
        map.insert("PASSWORD".to_string(), "p4ssw0rd".to_string());

        let credentials = Credentials::seal(&map);
        assert_eq!(credentials.decrypt().unwrap(), map);
    }

    #[test]
    fn test_malformed_credentials_fail_decryption() {
        let credentials = Credentials::from_blob(b"not json".to_vec());
        let err = credentials.decrypt().unwrap_err();
        assert!(matches!(err, TaskFailure::CredentialsUnavailable(_)));
    }

    #[test]
    fn test_credentials_debug_redacts_content() {
        let credentials = Credentials::from_blob(b"secret".to_vec());
        assert_eq!(format!("{:?}", credentials), "Credentials(6 bytes)");
    }

    #[test]
    fn test_multi_node_detection() {
        let single = TaskContextBuilder::new(task_id(), Script::shell("echo hi"))
            .node_hosts(vec!["host1".to_string()])
            .build();
        assert!(!single.is_multi_node());

        let multi = TaskContextBuilder::new(task_id(), Script::shell("echo hi"))
            .node_hosts(vec!["host1".to_string(), "host2".to_string()])
            .build();
        assert!(multi.is_multi_node());
    }

    #[test]
    fn test_cross_platform_detection() {
        let same = ForkEnvironment {
            target_os: Some(TargetOs::host()),
            ..ForkEnvironment::default()
        };
        assert!(!same.is_cross_platform());

        let other = ForkEnvironment {
            target_os: Some(match TargetOs::host() {
                TargetOs::Unix => TargetOs::Windows,
                TargetOs::Windows => TargetOs::Unix,
            }),
            ..ForkEnvironment::default()
        };
        assert!(other.is_cross_platform());
    }
}
