//! Interpreter core of an embeddable command shell.
//!
//! Input lines become [`command::Command`]s and go through a dispatch
//! pipeline: verb/noun handlers, then named processors, then a Lua script
//! of the same name, resolved from the configured source roots, macro
//! expanded and run as an isolated unit.  [`shell::Shell`] owns the whole
//! pipeline and its startup/shutdown lifecycle.

pub mod command;
pub mod config;
pub mod dispatch;
pub mod document;
pub mod embedded;
pub mod error;
pub mod feature;
pub mod fsutil;
pub mod macros;
pub mod paths;
pub mod reader;
pub mod script;
pub mod shell;
pub mod value;
pub mod var;

pub use command::Command;
pub use error::{Result, ShellError};
pub use shell::{Shell, ShellBuilder, ShellState};
pub use value::Value;
