//! Script sequence execution
//!
//! Runs one task's scripts in fixed order: pre, main, post, then the
//! control-flow script. A failure in any of the first three stages
//! aborts the remaining ones; the control-flow script is attempted
//! regardless, and its own failure is logged and replaced by the
//! default action rather than overriding the primary outcome.

use crate::executor::LogSink;
use crate::script::{
    Bindings, EngineRegistry, Script, ScriptResult, TASK_ERROR_BINDING, TASK_RESULT_BINDING,
};
use crate::task::{FlowAction, ScriptStage, TaskContext, TaskFailure};
use crate::task::variables::substitute;
use serde_json::Value;

/// Primary outcome of the script sequence plus the continuation action
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceOutcome {
    /// Value produced by the main script, or the first stage failure
    pub value: Result<Value, TaskFailure>,

    /// Action decided by the control-flow script
    pub action: FlowAction,
}

/// Drives the pre/main/post/flow sequence against a binding set
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    engines: EngineRegistry,
}

impl ScriptRunner {
    /// Creates a runner using the given engine registry
    #[must_use]
    pub fn new(engines: EngineRegistry) -> Self {
        Self { engines }
    }

    /// Runs the full script sequence of a task
    ///
    /// Bindings are shared across stages, so scope variables written by
    /// the pre-script are visible to the main and post scripts. The
    /// returned value is always the main script's; post and flow
    /// scripts never override it.
    pub fn run_sequence(
        &self,
        context: &TaskContext,
        bindings: &mut Bindings,
        out: &LogSink,
        err: &LogSink,
    ) -> SequenceOutcome {
        let mut outcome: Result<Value, TaskFailure> = Ok(Value::Null);

        if let Some(pre) = &context.pre_script {
            if let ScriptResult::Error(e) = self.run_stage(ScriptStage::Pre, pre, bindings, out, err)
            {
                outcome = Err(TaskFailure::Script {
                    stage: ScriptStage::Pre,
                    message: e.0,
                });
            }
        }

        if outcome.is_ok() {
            match self.run_stage(ScriptStage::Main, &context.main_script, bindings, out, err) {
                ScriptResult::Value(value) => outcome = Ok(value),
                ScriptResult::Error(e) => {
                    outcome = Err(TaskFailure::Script {
                        stage: ScriptStage::Main,
                        message: e.0,
                    });
                }
            }
        }

        if outcome.is_ok() {
            if let Some(post) = &context.post_script {
                if let ScriptResult::Error(e) =
                    self.run_stage(ScriptStage::Post, post, bindings, out, err)
                {
                    outcome = Err(TaskFailure::Script {
                        stage: ScriptStage::Post,
                        message: e.0,
                    });
                }
            }
        }

        let action = match &context.flow_script {
            Some(flow) => self.run_flow(&flow.script, &outcome, bindings, out, err),
            None => FlowAction::Continue,
        };

        SequenceOutcome {
            value: outcome,
            action,
        }
    }

    /// Runs a standalone script against the bindings (environment
    /// scripts of a fork, engine self-tests)
    pub fn run_single(
        &self,
        script: &Script,
        bindings: &mut Bindings,
        out: &LogSink,
        err: &LogSink,
    ) -> ScriptResult {
        self.eval(script, bindings, out, err)
    }

    fn run_stage(
        &self,
        stage: ScriptStage,
        script: &Script,
        bindings: &mut Bindings,
        out: &LogSink,
        err: &LogSink,
    ) -> ScriptResult {
        tracing::debug!(%stage, engine = %script.engine, "Running script stage");
        self.eval(script, bindings, out, err)
    }

    /// Runs the control-flow script and parses its decision from the
    /// last non-empty output line
    ///
    /// The script observes the primary outcome through dedicated
    /// bindings. Any flow failure (engine error, unparseable decision)
    /// is logged and mapped to [`FlowAction::Continue`]; it never
    /// replaces the primary outcome.
    fn run_flow(
        &self,
        script: &Script,
        outcome: &Result<Value, TaskFailure>,
        bindings: &mut Bindings,
        out: &LogSink,
        err: &LogSink,
    ) -> FlowAction {
        match outcome {
            Ok(value) => {
                let encoded = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
                bindings.extra.insert(TASK_RESULT_BINDING.to_string(), encoded);
            }
            Err(failure) => {
                bindings
                    .extra
                    .insert(TASK_ERROR_BINDING.to_string(), failure.to_string());
            }
        }

        let result = self.run_stage(ScriptStage::Flow, script, bindings, out, err);
        bindings.extra.remove(TASK_RESULT_BINDING);
        bindings.extra.remove(TASK_ERROR_BINDING);

        let decision = match result {
            ScriptResult::Error(e) => Err(e.0),
            ScriptResult::Value(value) => {
                let text = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                match text.lines().rev().find(|line| !line.trim().is_empty()) {
                    Some(line) => FlowAction::parse(line.trim()),
                    None => Err("flow script emitted no decision".to_string()),
                }
            }
        };

        match decision {
            Ok(action) => action,
            Err(reason) => {
                tracing::warn!(%reason, "Flow script failed, continuing with default action");
                err.write_line(&format!("flow script failed: {reason}"));
                FlowAction::Continue
            }
        }
    }

    fn eval(
        &self,
        script: &Script,
        bindings: &mut Bindings,
        out: &LogSink,
        err: &LogSink,
    ) -> ScriptResult {
        let Some(engine) = self.engines.get(&script.engine) else {
            return ScriptResult::Error(crate::script::ScriptError(format!(
                "unknown script engine '{}'",
                script.engine
            )));
        };

        // Body and arguments are substituted against the current
        // bindings right before the engine sees them, so pre-script
        // writes are visible downstream. Unresolved placeholders stay
        // verbatim, which keeps the engine's own `${...}` syntax
        // working.
        let substituted = Script {
            engine: script.engine.clone(),
            body: substitute(&script.body, &bindings.variables, &bindings.credentials),
            args: script
                .args
                .iter()
                .map(|arg| substitute(arg, &bindings.variables, &bindings.credentials))
                .collect(),
        };

        engine.eval(&substituted, bindings, out, err)
    }
}

impl Default for ScriptRunner {
    fn default() -> Self {
        Self::new(EngineRegistry::default())
    }
}
