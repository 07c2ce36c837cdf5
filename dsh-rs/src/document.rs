//! Structured documents: an owned nested map with dotted-path access, plus
//! loading and saving in TOML or JSON chosen by file extension.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Result, ShellError};
use crate::fsutil;
use crate::value::Value;

// ── Format ────────────────────────────────────────────────────────────────────

/// Serialization format of a document file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Json,
    /// Anything else loads as plain text.
    Text,
}

impl Format {
    pub fn of(path: impl AsRef<Path>) -> Self {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Format::Toml,
            Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
            _ => Format::Text,
        }
    }

    /// Parse `text` in this format.
    pub fn parse(self, text: &str, origin: &str) -> Result<Value> {
        match self {
            Format::Toml => toml::from_str(text)
                .map_err(|e| ShellError::runtime(format!("{origin}: malformed TOML: {e}"))),
            Format::Json => serde_json::from_str(text)
                .map_err(|e| ShellError::runtime(format!("{origin}: malformed JSON: {e}"))),
            Format::Text => Ok(Value::Str(text.to_owned())),
        }
    }

    pub fn render(self, value: &Value, origin: &str) -> Result<String> {
        match self {
            Format::Toml => toml::to_string_pretty(value)
                .map_err(|e| ShellError::runtime(format!("{origin}: cannot write TOML: {e}"))),
            Format::Json => serde_json::to_string_pretty(value)
                .map_err(|e| ShellError::runtime(format!("{origin}: cannot write JSON: {e}"))),
            Format::Text => Ok(value.to_string()),
        }
    }
}

/// Load a document (or plain text) from `path`.
pub fn load(path: impl AsRef<Path>) -> Result<Value> {
    let path = path.as_ref();
    let text = fsutil::load_file(path)?;
    Format::of(path).parse(&text, &path.display().to_string())
}

/// Save `value` to `path` in the format implied by its extension.
pub fn save(path: impl AsRef<Path>, value: &Value) -> Result<()> {
    let path = path.as_ref();
    let text = Format::of(path).render(value, &path.display().to_string())?;
    fsutil::save_file(path, &text)
}

// ── Document ──────────────────────────────────────────────────────────────────

/// Nested map addressed by dotted paths (`"paths.temp"`).
///
/// Once locked, every write fails with a contract violation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    root: BTreeMap<String, Value>,
    locked: bool,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a loaded value.  `Null` becomes an empty document; any other
    /// non-map root is rejected.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Map(root) => Ok(Self { root, locked: false }),
            Value::Null => Ok(Self::new()),
            other => Err(ShellError::runtime(format!(
                "document root must be a map, found {}",
                other.type_name()
            ))),
        }
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut node = self.root.get(first)?;
        for part in parts {
            node = node.as_map()?.get(part)?;
        }
        Some(node)
    }

    /// `get` for text leaves.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Set `path`, creating intermediate maps.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> Result<()> {
        self.check_unlocked(path)?;
        let mut parts: Vec<&str> = path.split('.').collect();
        let leaf = parts.pop().filter(|p| !p.is_empty()).ok_or_else(|| {
            ShellError::contract(format!("invalid document path '{path}'"))
        })?;
        let mut node = &mut self.root;
        for part in parts {
            let entry = node
                .entry(part.to_owned())
                .or_insert_with(|| Value::Map(BTreeMap::new()));
            node = match entry {
                Value::Map(map) => map,
                other => {
                    return Err(ShellError::contract(format!(
                        "cannot set '{path}': '{part}' is a {}",
                        other.type_name()
                    )))
                }
            };
        }
        node.insert(leaf.to_owned(), value.into());
        Ok(())
    }

    /// Shallow update: top-level keys of `other` replace ours.
    pub fn merge(&mut self, other: &BTreeMap<String, Value>) -> Result<()> {
        self.check_unlocked("<merge>")?;
        for (key, value) in other {
            self.root.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn root(&self) -> &BTreeMap<String, Value> {
        &self.root
    }

    pub fn to_value(&self) -> Value {
        Value::Map(self.root.clone())
    }

    fn check_unlocked(&self, path: &str) -> Result<()> {
        if self.locked {
            return Err(ShellError::contract(format!(
                "document is locked, cannot write '{path}'"
            )));
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
