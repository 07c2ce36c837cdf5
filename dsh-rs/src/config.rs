//! Shell configuration file.
//!
//! The file is TOML or JSON (chosen by extension).  Every key is optional:
//!
//! | Key        | Type                 | Meaning                                        |
//! |------------|----------------------|------------------------------------------------|
//! | `paths`    | table name → dir     | extra virtual path namespaces                  |
//! | `settings` | list                 | `KEY=VALUE` items or settings document paths   |
//! | `modules`  | list                 | Lua module directories                         |
//! | `sources`  | list                 | script source roots, searched in order         |
//! | `startup`  | list                 | command lines run after startup scripts        |
//! | `shutdown` | list                 | command lines run before shutdown scripts      |
//! | `include`  | string               | text prepended to every script unit            |
//! | `history`  | string               | history file of the interactive prompt         |
//! | `prompt`   | string               | prompt text, overrides the `prompt` setting    |
//!
//! Unknown keys are kept in the document (scripts see it as `config`) but
//! ignored here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::command::{coerce, Command};
use crate::document;
use crate::error::{Result, ShellError};
use crate::fsutil;
use crate::value::Value;

/// File read when no `--config` flag is given.
pub const DEFAULT_CONFIG: &str = "config.toml";

/// Typed view of the configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub paths: BTreeMap<String, String>,
    pub settings: Vec<String>,
    pub modules: Vec<String>,
    pub sources: Vec<String>,
    pub startup: Vec<String>,
    pub shutdown: Vec<String>,
    pub include: Option<String>,
    pub history: Option<String>,
    pub prompt: Option<String>,
}

impl ShellConfig {
    /// Read the typed view out of a loaded document.
    pub fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        let json = serde_json::to_value(value)
            .map_err(|e| ShellError::runtime(format!("configuration: {e}")))?;
        serde_json::from_value(json).map_err(|e| ShellError::runtime(format!("configuration: {e}")))
    }
}

/// One `settings` list item.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsEntry {
    /// `KEY=VALUE`, value coerced like a command literal.
    Assign(String, Value),
    /// Path of a settings document to merge.
    Document(String),
}

impl SettingsEntry {
    pub fn parse(item: &str) -> Self {
        match item.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() && !key.contains(['/', '\\', ':']) => {
                SettingsEntry::Assign(key.trim().to_owned(), coerce(value.trim()))
            }
            _ => SettingsEntry::Document(item.trim().to_owned()),
        }
    }
}

/// Configuration file named by the startup command.
pub fn config_path(startup: &Command) -> PathBuf {
    match startup.flag("config") {
        Some(Value::Str(path)) => PathBuf::from(path),
        // a bare `--config` is `true`
        Some(Value::Bool(true)) | None => PathBuf::from(DEFAULT_CONFIG),
        Some(other) => PathBuf::from(other.to_string()),
    }
}

/// Load the configuration document and the directory that holds it.
///
/// A missing default file yields an empty document; a missing file named
/// with `--config` is an error.
pub fn load_config(startup: &Command) -> Result<(Value, PathBuf)> {
    let path = config_path(startup);
    let dir = config_dir_of(&path)?;
    if !fsutil::file_exists(&path) && startup.flag("config").is_none() {
        debug!(path = %path.display(), "no configuration file");
        return Ok((Value::Map(BTreeMap::new()), dir));
    }
    let value = document::load(&path)?;
    if !matches!(value, Value::Map(_)) {
        return Err(ShellError::runtime(format!(
            "{}: configuration must be a table",
            path.display()
        )));
    }
    debug!(path = %path.display(), "configuration loaded");
    Ok((value, dir))
}

/// Absolute directory holding `path`.
fn config_dir_of(path: &Path) -> Result<PathBuf> {
    let cwd = std::env::current_dir().map_err(|e| ShellError::io(".", e))?;
    Ok(match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) if parent.is_absolute() => parent.to_path_buf(),
        Some(parent) => cwd.join(parent),
        None => cwd,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = ShellConfig::from_value(&Value::Map(BTreeMap::new())).unwrap();
        assert_eq!(config, ShellConfig::default());
        assert_eq!(ShellConfig::from_value(&Value::Null).unwrap(), ShellConfig::default());
    }

    #[test]
    fn typed_view_of_toml() {
        let doc = document::Format::Toml
            .parse(
                r#"
                sources = ["shell:/a", "shell:/b"]
                startup = ["greet bob"]
                include = "local x = 1"
                extra = 5

                [paths]
                data = "shell:/data"
                "#,
                "test",
            )
            .unwrap();
        let config = ShellConfig::from_value(&doc).unwrap();
        assert_eq!(config.sources, ["shell:/a", "shell:/b"]);
        assert_eq!(config.startup, ["greet bob"]);
        assert_eq!(config.include.as_deref(), Some("local x = 1"));
        assert_eq!(config.paths.get("data").map(String::as_str), Some("shell:/data"));
        assert!(config.shutdown.is_empty());
    }

    #[test]
    fn wrong_type_is_runtime_failure() {
        let mut map = BTreeMap::new();
        map.insert("sources".to_owned(), Value::Int(3));
        let err = ShellConfig::from_value(&Value::Map(map)).unwrap_err();
        assert!(matches!(err, ShellError::Runtime(_)));
    }

    #[test]
    fn settings_entries() {
        assert_eq!(
            SettingsEntry::parse("script_delay=0.5"),
            SettingsEntry::Assign("script_delay".into(), Value::Float(0.5))
        );
        assert_eq!(
            SettingsEntry::parse("shell:/local.toml"),
            SettingsEntry::Document("shell:/local.toml".into())
        );
        assert_eq!(
            SettingsEntry::parse("shell:/x=y.toml"),
            SettingsEntry::Document("shell:/x=y.toml".into())
        );
    }

    #[test]
    fn config_flag_names_the_file() {
        let cmd = Command::parse("dsh --config=/etc/dsh/site.json").unwrap();
        assert_eq!(config_path(&cmd), PathBuf::from("/etc/dsh/site.json"));
        let cmd = Command::parse("dsh").unwrap();
        assert_eq!(config_path(&cmd), PathBuf::from(DEFAULT_CONFIG));
    }

    #[test]
    fn load_from_file_and_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("site.json");
        std::fs::write(&file, r#"{ "startup": ["hello"] }"#).unwrap();

        let cmd = Command::parse(&format!("dsh --config='{}'", file.display())).unwrap();
        let (value, root) = load_config(&cmd).unwrap();
        assert_eq!(root, dir.path());
        assert_eq!(ShellConfig::from_value(&value).unwrap().startup, ["hello"]);

        let missing = dir.path().join("nope.toml");
        let cmd = Command::parse(&format!("dsh --config='{}'", missing.display())).unwrap();
        assert!(load_config(&cmd).is_err());
    }

    #[test]
    fn config_flag_of_any_type_names_a_file() {
        let path = |line: &str| config_path(&Command::parse(line).unwrap());
        assert_eq!(path("dsh --config=123"), PathBuf::from("123"));
        assert_eq!(path("dsh --config=site.toml"), PathBuf::from("site.toml"));
        assert_eq!(path("dsh --config"), PathBuf::from(DEFAULT_CONFIG));
        assert_eq!(path("dsh"), PathBuf::from(DEFAULT_CONFIG));
    }
}
