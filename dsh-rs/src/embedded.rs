//! Resources compiled into the binary, and the packaged-resource loader.
//!
//! Files from `resources/` are baked in with `include_str!()` so the shell
//! starts without any installed data directory.

use std::collections::BTreeMap;

use crate::document::{self, Format};
use crate::error::{Result, ShellError};
use crate::value::Value;

/// Bundle name under which the embedded resources are published.
pub const BUNDLE: &str = "dynashell";

/// A single embedded resource file.
pub struct EmbeddedFile {
    pub name: &'static str,
    pub content: &'static str,
}

pub static EMBEDDED_RESOURCES: &[EmbeddedFile] = &[EmbeddedFile {
    name: "settings.toml",
    content: include_str!("../resources/settings.toml"),
}];

/// Look up an embedded resource by bare file name.
pub fn get_embedded(name: &str) -> Option<&'static str> {
    EMBEDDED_RESOURCES
        .iter()
        .find(|f| f.name == name)
        .map(|f| f.content)
}

/// Load a packaged resource.
///
/// With no bundle `name` is a filesystem path; with [`BUNDLE`] it names an
/// embedded file.  The extension picks the document format.
pub fn load_resource(bundle: Option<&str>, name: &str) -> Result<Value> {
    match bundle {
        None => document::load(name),
        Some(BUNDLE) => {
            let text = get_embedded(name).ok_or_else(|| {
                ShellError::lookup(format!("resource '{name}' not found in bundle '{BUNDLE}'"))
            })?;
            Format::of(name).parse(text, name)
        }
        Some(other) => Err(ShellError::lookup(format!("unknown resource bundle '{other}'"))),
    }
}

/// Collapse a settings document to one flat map: the `default` table with
/// the table for the running platform merged over it.  Documents without a
/// `default` table are returned unchanged.
pub fn platform_settings(doc: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    platform_settings_for(doc, std::env::consts::OS)
}

pub fn platform_settings_for(doc: &BTreeMap<String, Value>, os: &str) -> BTreeMap<String, Value> {
    let Some(Value::Map(defaults)) = doc.get("default") else {
        return doc.clone();
    };
    let mut merged = defaults.clone();
    let platform = doc
        .iter()
        .find(|(key, _)| key.as_str() != "default" && os.starts_with(key.as_str()));
    if let Some((_, Value::Map(overrides))) = platform {
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

// ── Tests ─────────────────────────────────────────────────────────────────────
