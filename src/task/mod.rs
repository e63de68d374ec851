//! Task domain model
//!
//! This module contains the types describing one task invocation and
//! its outcome: the immutable [`TaskContext`] handed to an executor,
//! the layered [`VariablesMap`] visible to scripts, and the uniform
//! [`TaskResult`] every execution path produces.

pub mod context;
pub mod errors;
pub mod result;
pub mod variables;

pub use context::{Credentials, DataSpaces, ForkEnvironment, TargetOs, TaskContext, TaskId};
pub use errors::{ScriptStage, TaskFailure};
pub use result::{FlowAction, TaskResult};
pub use variables::VariablesMap;
