//! Error taxonomy shared by every layer of the shell.
//!
//! Each variant is one failure class.  Any of them raised while handling an
//! input line is caught at [`Shell::execute`](crate::shell::Shell::execute),
//! logged, and swallowed; during initialization they abort startup.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = ShellError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShellError {
    /// Malformed token stream: empty bare word, unmatched quote, missing name.
    #[error("parse error: {0}")]
    Parse(String),

    /// Unknown macro, format, processor, variable or script source.
    #[error("lookup error: {0}")]
    Lookup(String),

    /// A registered participant broke its contract (unhandled dispatch,
    /// protected overwrite, locked document write, failed validation).
    #[error("contract violation: {0}")]
    Contract(String),

    /// Script unit failure, or a collaborator failure (I/O, bad document).
    #[error("runtime failure: {0}")]
    Runtime(String),
}

impl ShellError {
    pub fn parse(msg: impl Into<String>) -> Self {
        ShellError::Parse(msg.into())
    }

    pub fn lookup(msg: impl Into<String>) -> Self {
        ShellError::Lookup(msg.into())
    }

    pub fn contract(msg: impl Into<String>) -> Self {
        ShellError::Contract(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        ShellError::Runtime(msg.into())
    }

    /// Wrap an I/O failure on `path`.
    pub fn io(path: impl AsRef<std::path::Path>, err: std::io::Error) -> Self {
        ShellError::Runtime(format!("{}: {err}", path.as_ref().display()))
    }

    /// Short class name used in log lines.
    pub fn class(&self) -> &'static str {
        match self {
            ShellError::Parse(_) => "ParseError",
            ShellError::Lookup(_) => "LookupError",
            ShellError::Contract(_) => "ContractViolation",
            ShellError::Runtime(_) => "RuntimeFailure",
        }
    }
}

impl From<mlua::Error> for ShellError {
    fn from(err: mlua::Error) -> Self {
        ShellError::Runtime(err.to_string())
    }
}

impl From<ShellError> for mlua::Error {
    fn from(err: ShellError) -> Self {
        mlua::Error::external(err)
    }
}
