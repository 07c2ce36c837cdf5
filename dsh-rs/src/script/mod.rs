//! Script units.
//!
//! Script source is wrapped into a self-contained unit before it runs:
//!
//! ```text
//! -- script7: greet              header
//! local shell = shell            preamble
//! <configured include text>
//! local config = __declared.config    one line per declared variable
//! ...
//! -- source: greet
//! <macro-expanded source>
//! ```
//!
//! Each unit gets a fresh id and runs in its own environment (see
//! [`LuaEngine::run`]).

pub mod lua;

pub use lua::{LuaEngine, ScriptRequest};

use crate::value::Value;

/// Global the unit may define to be called once after it runs.
pub const LIFECYCLE_HOOK: &str = "on_load";

/// Global holding the shell API table in every unit.
pub const API_NAME: &str = "shell";

/// Id of the first compiled unit.
const FIRST_UNIT_ID: u64 = 100;

const LUA_KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if",
    "in", "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

/// `true` if `name` can be bound as a Lua local.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !LUA_KEYWORDS.contains(&name)
}

/// A compiled, not yet run, script unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptUnit {
    id: u64,
    label: String,
    text: String,
    bindings: Vec<(String, Value)>,
}

impl ScriptUnit {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Unique unit name, `script<id>`.
    pub fn name(&self) -> String {
        format!("script{}", self.id)
    }

    /// File name used when the unit text is kept on disk.
    pub fn file_name(&self) -> String {
        format!("{}.lua", self.name())
    }

    /// Diagnostic label, usually the script name.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Full wrapped text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Declared variables captured at compile time.
    pub fn bindings(&self) -> &[(String, Value)] {
        &self.bindings
    }
}

/// Assigns unit ids and assembles wrapped unit text.
#[derive(Debug)]
pub struct UnitCompiler {
    next_id: u64,
}

impl Default for UnitCompiler {
    fn default() -> Self {
        Self { next_id: FIRST_UNIT_ID }
    }
}

impl UnitCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `source`.  Declared variables whose names are not Lua
    /// identifiers are skipped.
    pub fn compile(
        &mut self,
        source: &str,
        label: &str,
        include: Option<&str>,
        declared: Vec<(String, Value)>,
    ) -> ScriptUnit {
        let id = self.next_id;
        self.next_id += 1;

        let bindings: Vec<(String, Value)> = declared
            .into_iter()
            .filter(|(key, _)| {
                if key == API_NAME {
                    tracing::warn!(unit = id, "declared variable '{key}' would hide the shell API, not bound");
                    return false;
                }
                let ok = is_identifier(key);
                if !ok {
                    tracing::warn!(unit = id, "declared variable '{key}' is not a Lua identifier, not bound");
                }
                ok
            })
            .collect();

        let mut text = format!("-- script{id}: {label}\nlocal {API_NAME} = {API_NAME}\n");
        if let Some(include) = include.filter(|i| !i.trim().is_empty()) {
            text.push_str("-- include\n");
            text.push_str(include);
            if !include.ends_with('\n') {
                text.push('\n');
            }
        }
        for (key, _) in &bindings {
            text.push_str(&format!("local {key} = __declared.{key}\n"));
        }
        text.push_str(&format!("-- source: {label}\n"));
        text.push_str(source);
        if !source.ends_with('\n') {
            text.push('\n');
        }

        ScriptUnit { id, label: label.to_owned(), text, bindings }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(is_identifier("config"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier("a.b"));
        assert!(!is_identifier("end"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn ids_increase() {
        let mut compiler = UnitCompiler::new();
        let a = compiler.compile("", "a", None, Vec::new());
        let b = compiler.compile("", "b", None, Vec::new());
        assert_eq!(a.id(), 100);
        assert_eq!(b.id(), 101);
        assert_eq!(b.name(), "script101");
        assert_eq!(b.file_name(), "script101.lua");
    }

    #[test]
    fn wrapped_text_order() {
        let mut compiler = UnitCompiler::new();
        let unit = compiler.compile(
            "print(x)",
            "greet",
            Some("local helper = 1"),
            vec![
                ("config".to_owned(), Value::Null),
                ("bad-name".to_owned(), Value::Int(1)),
                ("x".to_owned(), Value::Int(2)),
            ],
        );
        let text = unit.text();
        let preamble = text.find("local shell = shell").unwrap();
        let include = text.find("local helper = 1").unwrap();
        let binding = text.find("local config = __declared.config").unwrap();
        let source = text.find("print(x)").unwrap();
        assert!(preamble < include && include < binding && binding < source);
        assert!(text.contains("-- source: greet"));
        assert!(!text.contains("bad-name"));
        assert_eq!(unit.bindings().len(), 2);
    }

    #[test]
    fn declared_shell_is_not_bound() {
        let mut compiler = UnitCompiler::new();
        let unit = compiler.compile(
            "shell.set('ok', true)",
            "guarded",
            None,
            vec![("shell".to_owned(), Value::from("oops")), ("y".to_owned(), Value::Int(1))],
        );
        assert!(!unit.text().contains("__declared.shell"));
        assert_eq!(unit.bindings().len(), 1);
    }
}
