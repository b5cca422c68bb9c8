//! The purpose of this module is to alleviate the need to import many of the `[script_engine]`
//! types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use script_engine::prelude::*;
//! ```
pub use crate::backoff::{RetryBackoff, Strategy};
pub use crate::executor::{ExecutionError, ExecutionResult, Executor};
pub use crate::job::{Job, JobId, JobStatus};
pub use crate::pruner::Pruner;
pub use crate::pruner::PrunerConfig;
pub use crate::service::ScriptEngine;
pub use crate::{RuntimeError, WorkerRuntime};
