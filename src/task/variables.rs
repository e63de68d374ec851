//! Variable scopes, substitution and path conversion
//!
//! Variables visible to a task come from four places with defined
//! precedence: job-level generic variables, variables propagated by
//! previous tasks, system-derived entries, and the task's own generic
//! information. The first three form the inherited layer; the last one
//! forms the scope layer, which always wins on lookup and is the part
//! propagated to dependent tasks.

use crate::task::context::{TargetOs, TaskContext};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Worker installation directory, bound into every script run
pub const VAR_HOME: &str = "TASKLINE_HOME";
/// Path of the node-list file for multi-node tasks
pub const VAR_NODESFILE: &str = "TASKLINE_NODESFILE";
/// Number of nodes the task spans
pub const VAR_NODES_NUMBER: &str = "TASKLINE_NODES_NUMBER";
/// Local scratch directory
pub const VAR_SCRATCH: &str = "TASKLINE_SCRATCH";
/// Identifier of the enclosing job
pub const VAR_JOB_ID: &str = "TASKLINE_JOB_ID";
/// Identifier of the task
pub const VAR_TASK_ID: &str = "TASKLINE_TASK_ID";
/// Human-readable task name
pub const VAR_TASK_NAME: &str = "TASKLINE_TASK_NAME";
/// Owner of the enclosing job
pub const VAR_JOB_OWNER: &str = "TASKLINE_JOB_OWNER";

/// Prefix selecting the credential map instead of the variable map in
/// a `${...}` placeholder
const CREDENTIALS_PREFIX: &str = "credentials_";

/// Variable names whose values are filesystem paths and must be
/// rewritten for the target platform of a cross-platform fork
const PATH_VARIABLES: [&str; 3] = [VAR_HOME, VAR_NODESFILE, VAR_SCRATCH];

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Two layered variable mappings: local scope over inherited values
///
/// A lookup always checks scope before inherited. Scripts mutate only
/// the scope layer; its contents at task end become the propagated
/// variables of the task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariablesMap {
    inherited: HashMap<String, String>,
    scope: HashMap<String, String>,
}

impl VariablesMap {
    /// Creates an empty variables map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a variable, scope layer first
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.scope
            .get(name)
            .or_else(|| self.inherited.get(name))
            .map(String::as_str)
    }

    /// Sets an inherited-layer entry
    pub fn set_inherited(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inherited.insert(name.into(), value.into());
    }

    /// Sets a scope-layer entry (local override)
    pub fn set_scope(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.scope.insert(name.into(), value.into());
    }

    /// The scope map, i.e. the variables propagated at task end
    #[must_use]
    pub fn propagated(&self) -> &HashMap<String, String> {
        &self.scope
    }

    /// Effective view with scope overriding inherited, for exporting
    /// into a child environment
    #[must_use]
    pub fn effective(&self) -> HashMap<String, String> {
        let mut merged = self.inherited.clone();
        merged.extend(self.scope.clone());
        merged
    }
}

/// System-derived inputs to variable resolution, owned by the worker
/// process hosting the execution
#[derive(Debug, Clone, Default)]
pub struct SystemBindings {
    /// Worker installation directory
    pub worker_home: String,

    /// Local scratch directory for this task
    pub scratch_dir: String,

    /// Path of the node-list file, when one was written
    pub nodes_file: Option<String>,

    /// Number of nodes the task spans
    pub nodes_number: usize,
}

/// Builds the variables map for one task invocation
///
/// Inherited layer, in increasing precedence: job variables,
/// previous-task propagated variables (dependency order), identity and
/// system-derived entries. Scope layer: the task's generic information,
/// already filtered through substitution.
#[must_use]
pub fn resolve(
    context: &TaskContext,
    system: &SystemBindings,
    credentials: &HashMap<String, String>,
) -> VariablesMap {
    let mut vars = VariablesMap::new();

    for (key, value) in &context.job_variables {
        vars.set_inherited(key, value);
    }
    for previous in &context.previous_results {
        for (key, value) in &previous.propagated_variables {
            vars.set_inherited(key, value);
        }
    }

    vars.set_inherited(VAR_JOB_ID, &context.id.job_id);
    vars.set_inherited(VAR_TASK_ID, &context.id.task_id);
    vars.set_inherited(VAR_TASK_NAME, &context.id.name);
    vars.set_inherited(VAR_JOB_OWNER, &context.job_owner);
    vars.set_inherited(VAR_HOME, &system.worker_home);
    vars.set_inherited(VAR_SCRATCH, &system.scratch_dir);
    vars.set_inherited(VAR_NODES_NUMBER, system.nodes_number.to_string());
    if let Some(nodes_file) = &system.nodes_file {
        vars.set_inherited(VAR_NODESFILE, nodes_file);
    }

    // Scope entries see the inherited layer while being substituted,
    // not each other: generic info is an unordered map.
    let scope: Vec<(String, String)> = context
        .generic_info
        .iter()
        .map(|(key, value)| (key.clone(), substitute(value, &vars, credentials)))
        .collect();
    for (key, value) in scope {
        vars.set_scope(key, value);
    }

    vars
}

/// Replaces `${name}` placeholders using scope-then-inherited lookup,
/// and `${credentials_<key>}` placeholders from the decrypted
/// credential map
///
/// An unresolved placeholder is left verbatim; this leniency is
/// deliberate, so scripts can carry `${...}` text of their own.
#[must_use]
pub fn substitute(
    text: &str,
    variables: &VariablesMap,
    credentials: &HashMap<String, String>,
) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &regex::Captures| {
            let name = caps.get(1).map_or("", |m| m.as_str());
            let replacement = if let Some(key) = name.strip_prefix(CREDENTIALS_PREFIX) {
                credentials.get(key).map(String::as_str)
            } else {
                variables.get(name)
            };
            match replacement {
                Some(value) => value.to_string(),
                None => {
                    tracing::debug!(placeholder = name, "Unresolved variable left verbatim");
                    caps.get(0).map_or(String::new(), |m| m.as_str().to_string())
                }
            }
        })
        .to_string()
}

/// Rewrites a filesystem path for the target platform
#[must_use]
pub fn convert_path(path: &str, target: TargetOs) -> String {
    match target {
        TargetOs::Unix => path.replace('\\', "/"),
        TargetOs::Windows => path.replace('/', "\\"),
    }
}

/// Rewrites the well-known path-valued variables for a cross-platform
/// fork
///
/// Must run exactly once, before general substitution; the launcher is
/// the single caller.
pub fn convert_well_known_paths(vars: &mut VariablesMap, target: TargetOs) {
    for name in PATH_VARIABLES {
        if let Some(value) = vars.get(name) {
            let converted = convert_path(value, target);
            if vars.scope.contains_key(name) {
                vars.set_scope(name, converted);
            } else {
                vars.set_inherited(name, converted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Script;
    use crate::task::context::{TaskContextBuilder, TaskId};
    use crate::task::result::TaskResult;
    use std::time::Duration;

    fn no_credentials() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn test_scope_takes_precedence_over_inherited() {
        let mut vars = VariablesMap::new();
        vars.set_inherited("A", "1");
        vars.set_scope("A", "2");
        assert_eq!(substitute("${A}", &vars, &no_credentials()), "2");
    }

    #[test]
    fn test_inherited_visible_without_override() {
        let mut vars = VariablesMap::new();
        vars.set_inherited("A", "1");
        assert_eq!(substitute("${A}", &vars, &no_credentials()), "1");
    }

    #[test]
    fn test_unknown_placeholder_left_verbatim() {
        let vars = VariablesMap::new();
        assert_eq!(substitute("${B}", &vars, &no_credentials()), "${B}");
    }

    #[test]
    fn test_mixed_substitution() {
        let mut vars = VariablesMap::new();
        vars.set_inherited("KNOWN", "yes");
        assert_eq!(
            substitute("${KNOWN} and ${UNKNOWN}", &vars, &no_credentials()),
            "yes and ${UNKNOWN}"
        );
    }

    #[test]
    fn test_credential_placeholder() {
        let vars = VariablesMap::new();
        let mut credentials = HashMap::new();
        credentials.insert("PASSWORD".to_string(), "p4ssw0rd".to_string());
        assert_eq!(
            substitute("${credentials_PASSWORD}", &vars, &credentials),
            "p4ssw0rd"
        );
        assert_eq!(
            substitute("${credentials_MISSING}", &vars, &credentials),
            "${credentials_MISSING}"
        );
    }

    #[test]
    fn test_resolve_precedence_order() {
        let previous = {
            let mut result = TaskResult::success(
                TaskId::new("1000", "1", "upstream"),
                serde_json::Value::Null,
                Duration::ZERO,
            );
            result
                .propagated_variables
                .insert("var".to_string(), "from-parent".to_string());
            result
        };

        let context = TaskContextBuilder::new(
            TaskId::new("1000", "2", "downstream"),
            Script::shell("echo hi"),
        )
        .job_variable("var", "from-job")
        .previous_results(vec![previous])
        .build();

        let vars = resolve(&context, &SystemBindings::default(), &no_credentials());
        // Propagated variables override job variables.
        assert_eq!(vars.get("var"), Some("from-parent"));
        assert_eq!(vars.get(VAR_JOB_ID), Some("1000"));
        assert_eq!(vars.get(VAR_TASK_ID), Some("2"));
    }

    #[test]
    fn test_generic_info_lands_in_scope_substituted() {
        let context = TaskContextBuilder::new(
            TaskId::new("1000", "2", "task"),
            Script::shell("echo hi"),
        )
        .job_variable("base", "/data")
        .generic_info("input", "${base}/in.csv")
        .build();

        let vars = resolve(&context, &SystemBindings::default(), &no_credentials());
        assert_eq!(vars.get("input"), Some("/data/in.csv"));
        assert!(vars.propagated().contains_key("input"));
    }

    #[test]
    fn test_convert_path() {
        assert_eq!(
            convert_path("/opt/worker/home", TargetOs::Windows),
            "\\opt\\worker\\home"
        );
        assert_eq!(
            convert_path("C:\\worker\\home", TargetOs::Unix),
            "C:/worker/home"
        );
    }

    #[test]
    fn test_convert_well_known_paths_only_touches_path_variables() {
        let mut vars = VariablesMap::new();
        vars.set_inherited(VAR_HOME, "/opt/worker");
        vars.set_inherited("untouched", "/keep/as/is");

        convert_well_known_paths(&mut vars, TargetOs::Windows);

        assert_eq!(vars.get(VAR_HOME), Some("\\opt\\worker"));
        assert_eq!(vars.get("untouched"), Some("/keep/as/is"));
    }
}
