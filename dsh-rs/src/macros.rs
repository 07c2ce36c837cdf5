//! Source preprocessing: format handlers and `@` macro lines.
//!
//! ## Format pass
//!
//! Text whose first line is `#!<id>` is handed, minus that line, to the
//! format handler registered as `<id>`; its return value replaces the text.
//!
//! ## Macro pass
//!
//! A line whose left-trimmed content starts with `@` is a macro call.  The
//! rest of the line is parsed as a [`Command`]; its name picks the macro.
//! The macro's body is dedented, run through the full parser pipeline
//! again, and every resulting line is emitted with the call line's leading
//! whitespace:
//!
//! ```text
//!     @inc foo        →        x
//!                              y
//! ```
//!
//! Other lines pass through unchanged.

use std::collections::HashMap;
use std::rc::Rc;

use crate::command::Command;
use crate::error::{Result, ShellError};
use crate::shell::Shell;

/// Marker that opens a macro line.
pub const MACRO_MARKER: char = '@';

/// Marker that opens a format line.
pub const FORMAT_MARKER: &str = "#!";

/// `macro(shell, command)` → replacement body, `None` for nothing.
pub type Macro = Rc<dyn Fn(&mut Shell, &mut Command) -> Result<Option<String>>>;

/// `format(shell, text)` → replacement text.
pub type Format = Rc<dyn Fn(&mut Shell, &str) -> Result<String>>;

// ── Tables ────────────────────────────────────────────────────────────────────

/// Named callables of one kind.
pub struct NamedTable<F> {
    entries: HashMap<String, F>,
}

impl<F> Default for NamedTable<F> {
    fn default() -> Self {
        Self { entries: HashMap::new() }
    }
}

impl<F: Clone> NamedTable<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace.  Returns `true` if an entry was replaced.
    pub fn add(&mut self, name: impl Into<String>, entry: F) -> bool {
        self.entries.insert(name.into(), entry).is_some()
    }

    pub fn get(&self, name: &str) -> Option<F> {
        self.entries.get(name).cloned()
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type MacroTable = NamedTable<Macro>;
pub type FormatTable = NamedTable<Format>;

// ── Passes ────────────────────────────────────────────────────────────────────

/// Apply the format handler named on a leading `#!` line, if any.
pub fn apply_format(shell: &mut Shell, src: &str) -> Result<String> {
    let Some(rest) = src.strip_prefix(FORMAT_MARKER) else {
        return Ok(src.to_owned());
    };
    let (id, body) = rest.split_once('\n').unwrap_or((rest, ""));
    let id = id.trim();
    let format = shell
        .formats()
        .get(id)
        .ok_or_else(|| ShellError::lookup(format!("format '{FORMAT_MARKER}{id}' is not defined")))?;
    format(shell, body)
}

/// Expand every `@` line of `src`, depth first.
pub fn expand_macros(shell: &mut Shell, src: &str) -> Result<String> {
    let mut out = String::with_capacity(src.len());
    for line in src.lines() {
        let tail = line.trim_start();
        let Some(call) = tail.strip_prefix(MACRO_MARKER) else {
            out.push_str(line);
            out.push('\n');
            continue;
        };
        let head = &line[..line.len() - tail.len()];
        let mut cmd = Command::parse(call)?;
        let mac = shell.macros().get(&cmd.name).ok_or_else(|| {
            ShellError::lookup(format!("macro '{MACRO_MARKER}{}' is not defined", cmd.name))
        })?;
        let body = shell.nested(|shell| {
            let body = mac(shell, &mut cmd)?.unwrap_or_default();
            shell.parse(&dedent(&body))
        })?;
        for part in body.lines() {
            out.push_str(head);
            out.push_str(part);
            out.push('\n');
        }
    }
    Ok(out)
}

/// Remove the whitespace prefix common to all non-blank lines.
///
/// Whitespace-only lines become empty.
pub fn dedent(text: &str) -> String {
    let mut common: Option<&str> = None;
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let indent = &line[..line.len() - line.trim_start().len()];
        common = Some(match common {
            None => indent,
            Some(prev) => {
                let shared = prev
                    .char_indices()
                    .zip(indent.chars())
                    .find(|((_, a), b)| a != b)
                    .map_or(prev.len().min(indent.len()), |((i, _), _)| i);
                &prev[..shared]
            }
        });
    }
    let cut = common.map_or(0, str::len);
    let mut out = String::with_capacity(text.len());
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if !line.trim().is_empty() {
            out.push_str(&line[cut..]);
        }
    }
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::testing::scratch_shell;

    fn fixed(body: &'static str) -> Macro {
        Rc::new(move |_: &mut Shell, _: &mut Command| Ok(Some(body.to_owned())))
    }

    // ── dedent ────────────────────────────────────────────────────────────────

    #[test]
    fn dedent_common_prefix() {
        assert_eq!(dedent("    a\n      b\n    c"), "a\n  b\nc");
        assert_eq!(dedent("\ta\n\tb\n"), "a\nb\n");
        assert_eq!(dedent("  a\n   \n  b"), "a\n\nb");
        assert_eq!(dedent("no indent\n  some"), "no indent\n  some");
    }

    #[test]
    fn dedent_mixed_tabs_and_spaces_share_nothing() {
        assert_eq!(dedent("\ta\n  b"), "\ta\n  b");
    }

    // ── Macro pass ────────────────────────────────────────────────────────────

    #[test]
    fn macro_line_keeps_indentation_on_every_line() {
        let (mut shell, _dir) = scratch_shell();
        shell.register_macro("inc", fixed("x\ny"));
        let out = expand_macros(&mut shell, "    @inc foo").unwrap();
        assert_eq!(out, "    x\n    y\n");
    }

    #[test]
    fn plain_lines_pass_through() {
        let (mut shell, _dir) = scratch_shell();
        let out = expand_macros(&mut shell, "local a = 1\n\n  return a").unwrap();
        assert_eq!(out, "local a = 1\n\n  return a\n");
    }

    #[test]
    fn nested_macros_expand_depth_first() {
        let (mut shell, _dir) = scratch_shell();
        shell.register_macro("outer", fixed("    begin\n      @inner\n    finish"));
        shell.register_macro("inner", fixed("a\nb"));
        let out = expand_macros(&mut shell, "  @outer\nlast").unwrap();
        assert_eq!(out, "  begin\n    a\n    b\n  finish\nlast\n");
    }

    #[test]
    fn macro_receives_parsed_command() {
        let (mut shell, _dir) = scratch_shell();
        let mac: Macro = Rc::new(|_: &mut Shell, cmd: &mut Command| {
            let who = cmd.pop().unwrap_or_default();
            let times = cmd.value("times").cloned().unwrap_or_default();
            Ok(Some(format!("print('{who} x{times}')")))
        });
        shell.register_macro("hello", mac);
        let out = expand_macros(&mut shell, "@hello bob times=2").unwrap();
        assert_eq!(out, "print('bob x2')\n");
    }

    #[test]
    fn empty_body_emits_nothing() {
        let (mut shell, _dir) = scratch_shell();
        let mac: Macro = Rc::new(|_: &mut Shell, _: &mut Command| Ok(None));
        shell.register_macro("nothing", mac);
        assert_eq!(expand_macros(&mut shell, "a\n  @nothing\nb").unwrap(), "a\nb\n");
    }

    #[test]
    fn unknown_macro_is_lookup_error() {
        let (mut shell, _dir) = scratch_shell();
        let err = expand_macros(&mut shell, "@missing").unwrap_err();
        assert!(matches!(err, ShellError::Lookup(_)));
    }

    #[test]
    fn runaway_recursion_is_stopped() {
        let (mut shell, _dir) = scratch_shell();
        shell.register_macro("again", fixed("@again"));
        let err = expand_macros(&mut shell, "@again").unwrap_err();
        assert!(matches!(err, ShellError::Runtime(_)));
    }

    // ── Format pass ───────────────────────────────────────────────────────────

    #[test]
    fn format_handler_replaces_text() {
        let (mut shell, _dir) = scratch_shell();
        let upper: Format = Rc::new(|_: &mut Shell, text: &str| Ok(text.to_uppercase()));
        shell.register_format("upper", upper);
        assert_eq!(apply_format(&mut shell, "#!upper\nabc\ndef").unwrap(), "ABC\nDEF");
        assert_eq!(apply_format(&mut shell, "plain").unwrap(), "plain");
    }

    #[test]
    fn unknown_format_is_lookup_error() {
        let (mut shell, _dir) = scratch_shell();
        let err = apply_format(&mut shell, "#!yaml\na: 1").unwrap_err();
        assert!(matches!(err, ShellError::Lookup(_)));
    }
}
