#![forbid(unsafe_code)]
//! Execution core for declarative CI/CD pipelines.
//!
//! A deployment is a partially specified document. Components inside it carry
//! a compute script (`#up`), an ordered list of operations that build a
//! filesystem and export a value from it. The [`Env`] merges the plan, the
//! user input and the computed output into one state, and the [`Scheduler`]
//! runs every component whose inputs have become concrete until nothing new
//! can run. Filesystem states are lazy graphs realized by a [`Solver`].
//!
//! ```
//! use std::sync::Arc;
//! use sluice::{Compiler, Config, Context, Env, JsonCompiler, MemorySolver};
//!
//! let plan = JsonCompiler
//!     .compile(
//!         "plan.json",
//!         r##"{
//!             "hello": {
//!                 "$type": "string",
//!                 "#up": [
//!                     {"do": "mkfile", "dest": "/greeting", "content": "hi"},
//!                     {"do": "export", "source": "/greeting"}
//!                 ]
//!             }
//!         }"##,
//!     )
//!     .unwrap();
//!
//! let mut env = Env::new(plan, Arc::new(MemorySolver::new()), Config::default()).unwrap();
//! env.compute(&Context::new()).unwrap();
//! assert_eq!(env.export().unwrap(), r#"{"hello":"hi"}"#);
//! ```

mod compiler;
mod config;
mod context;
mod core;
pub mod engine;
mod env;
mod error;
mod fs;
pub mod llb;
mod manager;
pub mod op;
mod pipeline;
pub mod script;
mod sink;
pub mod solver;
mod utils;
pub mod value;

pub use crate::compiler::{Compiler, JsonCompiler};
pub use crate::config::Config;
pub use crate::context::Context;
pub use crate::core::Hash32;
pub use crate::engine::{Diagnostics, Scheduler, Task, TaskExecution, TaskState};
pub use crate::env::Env;
pub use crate::error::*;
pub use crate::fs::FS;
pub use crate::manager::PipelineManager;
pub use crate::op::{Entitlement, Op};
pub use crate::pipeline::{CACHE_BUSTER_ENV, Pipeline};
pub use crate::script::Script;
pub use crate::sink::{Discard, Fillable};
pub use crate::solver::{DirEntry, Grants, ImageConfig, MemorySolver, Reference, Solver};
pub use crate::value::{Node, Path, Value};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
