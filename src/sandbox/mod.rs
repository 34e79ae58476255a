//! Isolated execution contexts for candidate programs.
//!
//! Candidate source is parsed and evaluated by an embedded interpreter for
//! a JavaScript subset. Each context runs on a worker thread of its own and
//! shares no runtime state with the host or with other contexts.

pub mod ast;
pub mod builtins;
pub mod context;
pub mod env;
pub mod event_loop;
pub mod executor;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod value;
pub mod worker;

pub use executor::{SandboxConfig, SandboxExecutor};
