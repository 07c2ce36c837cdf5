//! Shell variable store.
//!
//! Every entry carries two flags.  *Declared* entries are bound as locals in
//! each compiled script unit; *protected* entries can never be overwritten
//! or removed.

use std::collections::BTreeMap;

use crate::error::{Result, ShellError};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub value: Value,
    pub declared: bool,
    pub protect: bool,
}

/// Key/value variable store.
#[derive(Debug, Default)]
pub struct VarStore {
    vars: BTreeMap<String, Variable>,
}

impl VarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `key` for binding into script units.
    pub fn declare(&mut self, key: impl Into<String>, value: impl Into<Value>, protect: bool) -> Result<()> {
        let key = key.into();
        self.check_writable(&key)?;
        self.vars.insert(key, Variable { value: value.into(), declared: true, protect });
        Ok(())
    }

    /// Declare `key` even when it is protected.  For variables the shell
    /// itself owns.
    pub fn redeclare(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(key.into(), Variable { value: value.into(), declared: true, protect: false });
    }

    /// Set (or overwrite) a variable.  Existing flags are kept.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        self.check_writable(&key)?;
        let value = value.into();
        match self.vars.get_mut(&key) {
            Some(var) => var.value = value,
            None => {
                self.vars.insert(key, Variable { value, declared: false, protect: false });
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key).map(|v| &v.value)
    }

    /// Like [`get`](Self::get) but a missing key is a lookup error.
    pub fn fetch(&self, key: &str) -> Result<&Value> {
        self.get(key)
            .ok_or_else(|| ShellError::lookup(format!("variable '{key}' is not set")))
    }

    pub fn entry(&self, key: &str) -> Option<&Variable> {
        self.vars.get(key)
    }

    /// Remove a variable.  Returns `true` if it existed.
    pub fn unset(&mut self, key: &str) -> Result<bool> {
        self.check_writable(key)?;
        Ok(self.vars.remove(key).is_some())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Declared entries in key order.
    pub fn declared(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.vars
            .iter()
            .filter(|(_, v)| v.declared)
            .map(|(k, v)| (k.as_str(), &v.value))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    fn check_writable(&self, key: &str) -> Result<()> {
        match self.vars.get(key) {
            Some(var) if var.protect => Err(ShellError::contract(format!(
                "variable '{key}' is protected"
            ))),
            _ => Ok(()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let mut vars = VarStore::new();
        vars.set("depth", 3i64).unwrap();
        assert_eq!(vars.get("depth"), Some(&Value::Int(3)));
        assert!(vars.declared().next().is_none());
    }

    #[test]
    fn overwrite_unprotected() {
        let mut vars = VarStore::new();
        vars.declare("x", "old", false).unwrap();
        vars.declare("x", "new", false).unwrap();
        vars.set("x", "newer").unwrap();
        assert_eq!(vars.get("x"), Some(&Value::from("newer")));
        assert_eq!(vars.len(), 1);
        assert!(vars.entry("x").unwrap().declared);
    }

    #[test]
    fn protected_cannot_be_overwritten() {
        let mut vars = VarStore::new();
        vars.declare("config", "original", true).unwrap();

        let err = vars.declare("config", "again", false).unwrap_err();
        assert!(matches!(err, ShellError::Contract(_)));
        assert!(matches!(vars.set("config", "x"), Err(ShellError::Contract(_))));
        assert!(matches!(vars.unset("config"), Err(ShellError::Contract(_))));
        assert_eq!(vars.get("config"), Some(&Value::from("original")));
    }

    #[test]
    fn declared_iterates_only_declared() {
        let mut vars = VarStore::new();
        vars.declare("b", 2i64, false).unwrap();
        vars.set("plain", 0i64).unwrap();
        vars.declare("a", 1i64, true).unwrap();
        let keys: Vec<_> = vars.declared().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a", "b"]);
    }

    #[test]
    fn fetch_missing_is_lookup_error() {
        let vars = VarStore::new();
        assert!(matches!(vars.fetch("nope"), Err(ShellError::Lookup(_))));
        assert!(!vars.contains("nope"));
    }

    #[test]
    fn redeclare_ignores_protection() {
        let mut vars = VarStore::new();
        vars.declare("owned", 1i64, true).unwrap();
        vars.redeclare("owned", 2i64);
        assert_eq!(vars.get("owned"), Some(&Value::Int(2)));
        vars.set("owned", 3i64).unwrap();
        assert_eq!(vars.declared().count(), 1);
    }

    #[test]
    fn unset() {
        let mut vars = VarStore::new();
        vars.set("gone", "bye").unwrap();
        assert!(vars.unset("gone").unwrap());
        assert!(!vars.unset("gone").unwrap());
    }
}
