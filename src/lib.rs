//! # Taskline - Task execution core for a distributed scheduling worker
//!
//! Taskline is the execution core of a scheduling worker node: it takes
//! a fully populated task description (scripts, variables, execution
//! mode) and runs it either on the calling thread or in a supervised
//! child process, handling variable propagation, process lifecycle and
//! result collection along the way.
//!
//! ## Features
//!
//! - **Two execution modes**: in-process and forked, behind one
//!   [`TaskExecutor`] trait
//! - **Layered variables**: inherited/scope maps with defined
//!   precedence and `${...}` substitution
//! - **Script sequences**: pre, main, post and control-flow scripts
//!   sharing one binding set
//! - **Process supervision**: cookie-based tree kill, handoff-file
//!   result exchange, exit-code reconciliation
//!
//! ## Quick Start
//!
//! ```no_run
//! use taskline::executor::{InProcessExecutor, LogSink, TaskExecutor};
//! use taskline::script::Script;
//! use taskline::task::context::{TaskContextBuilder, TaskId};
//!
//! let context = TaskContextBuilder::new(
//!     TaskId::new("1000", "1", "greet"),
//!     Script::shell("echo hello"),
//! )
//! .build();
//!
//! let executor = InProcessExecutor::default();
//! let result = executor.execute(&context, &LogSink::stdout(), &LogSink::stderr());
//! assert!(!result.had_error());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
pub mod executor;
pub mod logging;
pub mod progress;
pub mod script;
pub mod task;

// Re-export commonly used types
pub use config::WorkerConfig;
pub use executor::{
    ForkedExecutor, InProcessExecutor, LaunchPlan, LogSink, NodeSessionRegistry, ProcessHandle,
    TaskExecutor,
};
pub use script::{
    Bindings, EngineRegistry, FlowScript, Script, ScriptEngine, ScriptResult, ScriptRunner,
    ShellEngine,
};
pub use task::{
    Credentials, FlowAction, ForkEnvironment, ScriptStage, TaskContext, TaskFailure, TaskId,
    TaskResult, VariablesMap,
};

/// Version of the taskline crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
