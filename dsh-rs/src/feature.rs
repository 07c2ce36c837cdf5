//! Feature plugins and the stage contracts they provide.
//!
//! A [`Feature`] contributes any of:
//!
//! | Contract              | Installed into                               |
//! |-----------------------|----------------------------------------------|
//! | fields                | the shell's field document                   |
//! | processors            | the processor registry                       |
//! | [`ParserStage`]       | the source pipeline, after earlier stages    |
//! | [`ExecutorStage`]     | the dispatch chain, after earlier stages     |
//!
//! Features install in order during startup.  The built-in set provides the
//! format pass, the macro pass, handler dispatch and processor dispatch.

use std::rc::Rc;

use crate::command::Command;
use crate::dispatch::{self, Context, Processor};
use crate::error::Result;
use crate::macros::{self, Macro};
use crate::shell::Shell;
use crate::value::Value;

/// Rewrites source text before it is compiled.
pub trait ParserStage {
    fn parse(&self, shell: &mut Shell, src: String) -> Result<String>;
}

/// Tries to handle a command.  `Ok(true)` stops the dispatch chain.
pub trait ExecutorStage {
    fn execute(&self, shell: &mut Shell, cmd: &mut Command) -> Result<bool>;
}

pub trait Feature {
    fn name(&self) -> &str;

    /// Named values published on the shell.
    fn fields(&self) -> Vec<(String, Value)> {
        Vec::new()
    }

    /// Processors registered on install.
    fn processors(&self) -> Vec<(String, Processor)> {
        Vec::new()
    }

    fn parser_stage(self: Rc<Self>) -> Option<Rc<dyn ParserStage>> {
        None
    }

    fn executor_stage(self: Rc<Self>) -> Option<Rc<dyn ExecutorStage>> {
        None
    }

    /// Extra setup once the contracts above are in place.
    fn install(&self, _shell: &mut Shell) -> Result<()> {
        Ok(())
    }
}

/// Built-in features, in install order.
pub fn default_features() -> Vec<Rc<dyn Feature>> {
    vec![
        Rc::new(Formats),
        Rc::new(Macros),
        Rc::new(Handlers),
        Rc::new(Processors),
    ]
}

// ── Formats ───────────────────────────────────────────────────────────────────

/// `#!<id>` format pass.
pub struct Formats;

impl Feature for Formats {
    fn name(&self) -> &str {
        "formats"
    }

    fn parser_stage(self: Rc<Self>) -> Option<Rc<dyn ParserStage>> {
        Some(self)
    }
}

impl ParserStage for Formats {
    fn parse(&self, shell: &mut Shell, src: String) -> Result<String> {
        macros::apply_format(shell, &src)
    }
}

// ── Macros ────────────────────────────────────────────────────────────────────

/// `@` macro pass, plus the `include` macro.
pub struct Macros;

impl Feature for Macros {
    fn name(&self) -> &str {
        "macros"
    }

    fn parser_stage(self: Rc<Self>) -> Option<Rc<dyn ParserStage>> {
        Some(self)
    }

    fn install(&self, shell: &mut Shell) -> Result<()> {
        let include: Macro = Rc::new(|shell: &mut Shell, cmd: &mut Command| {
            let name = cmd
                .pop()
                .ok_or_else(|| crate::error::ShellError::parse("@include needs a script name"))?;
            shell.source(&name).map(Some)
        });
        shell.register_macro("include", include);
        Ok(())
    }
}

impl ParserStage for Macros {
    fn parse(&self, shell: &mut Shell, src: String) -> Result<String> {
        macros::expand_macros(shell, &src)
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// Verb/noun handler dispatch.
pub struct Handlers;

impl Feature for Handlers {
    fn name(&self) -> &str {
        "handlers"
    }

    fn executor_stage(self: Rc<Self>) -> Option<Rc<dyn ExecutorStage>> {
        Some(self)
    }
}

impl ExecutorStage for Handlers {
    fn execute(&self, shell: &mut Shell, cmd: &mut Command) -> Result<bool> {
        dispatch::dispatch_handler(shell, cmd)
    }
}

// ── Processors ────────────────────────────────────────────────────────────────

/// Named processor dispatch.
pub struct Processors;

impl Feature for Processors {
    fn name(&self) -> &str {
        "processors"
    }

    fn executor_stage(self: Rc<Self>) -> Option<Rc<dyn ExecutorStage>> {
        Some(self)
    }
}

impl ExecutorStage for Processors {
    fn execute(&self, shell: &mut Shell, cmd: &mut Command) -> Result<bool> {
        let Some(processor) = shell.processors().get(&cmd.name) else {
            return Ok(false);
        };
        let mut ctx = Context::from_command(cmd, shell.settings().root().clone())?;
        processor(shell, &mut ctx)?;
        Ok(true)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
