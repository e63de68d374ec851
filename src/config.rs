//! Worker configuration

use serde::{Deserialize, Serialize};

/// Configuration of the hosting worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Name of the node this worker runs on
    pub node_name: String,

    /// Worker installation directory
    pub worker_home: String,

    /// Shell executable used by the bundled script engine
    pub shell: String,

    /// Grace period between asking a forked process to terminate and
    /// killing its process tree, in milliseconds
    pub cleanup_timeout_ms: u64,

    /// Number of attempts when deleting a handoff file
    pub delete_retry_attempts: u32,

    /// Backoff between handoff deletion attempts, in milliseconds
    pub delete_retry_backoff_ms: u64,

    /// Environment variables copied from the worker into forked
    /// processes when set
    pub propagated_env: Vec<String>,

    /// Log-filter file handed to forked processes; the bundled default
    /// filter is used when the file does not exist
    pub log_filter_file: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            node_name: "local".to_string(),
            worker_home: ".".to_string(),
            shell: "sh".to_string(),
            cleanup_timeout_ms: 5_000,
            delete_retry_attempts: 10,
            delete_retry_backoff_ms: 100,
            propagated_env: vec![
                "http_proxy".to_string(),
                "https_proxy".to_string(),
                "no_proxy".to_string(),
                "HTTP_PROXY".to_string(),
                "HTTPS_PROXY".to_string(),
                "NO_PROXY".to_string(),
            ],
            log_filter_file: None,
        }
    }
}
