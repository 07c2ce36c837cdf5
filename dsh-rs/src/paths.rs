//! Virtual path namespaces.
//!
//! A value such as `shell:/scripts/greet` names a file relative to a
//! registered root.  Roots are matched in registration order; values with
//! no registered `name:` prefix are plain filesystem paths.

use crate::fsutil::slashed_path;

/// Ordered table of namespace roots.
#[derive(Debug, Clone, Default)]
pub struct VirtualPaths {
    roots: Vec<(String, String)>,
}

impl VirtualPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name:` for the directory `dir`.  `dir` may itself use an
    /// already-registered namespace.  Re-registering keeps the original
    /// position and replaces the directory.
    pub fn register(&mut self, name: impl Into<String>, dir: &str) {
        let name = name.into();
        let dir = slashed_path(self.resolve(dir));
        match self.roots.iter_mut().find(|(key, _)| *key == name) {
            Some(entry) => entry.1 = dir,
            None => self.roots.push((name, dir)),
        }
    }

    /// Register roots whose directories may refer to each other in any
    /// order.  An entry waits until the namespace its directory uses is
    /// registered; entries caught in a cycle are registered literally.
    pub fn register_all<N, D>(&mut self, entries: impl IntoIterator<Item = (N, D)>)
    where
        N: Into<String>,
        D: Into<String>,
    {
        let mut pending: Vec<(String, String)> = entries
            .into_iter()
            .map(|(name, dir)| (name.into(), dir.into()))
            .collect();
        while !pending.is_empty() {
            let ready = pending.iter().position(|(_, dir)| match dir.split_once(':') {
                Some((prefix, _)) => {
                    self.contains(prefix) || !pending.iter().any(|(name, _)| name == prefix)
                }
                None => true,
            });
            let (name, dir) = pending.remove(ready.unwrap_or(0));
            self.register(name, &dir);
        }
    }

    /// Map a virtual path to a filesystem path.
    pub fn resolve(&self, value: &str) -> String {
        for (key, dir) in &self.roots {
            let Some(rest) = value
                .strip_prefix(key.as_str())
                .and_then(|r| r.strip_prefix(':'))
            else {
                continue;
            };
            return if rest.starts_with('/') {
                format!("{dir}{rest}")
            } else {
                format!("{dir}/{rest}")
            };
        }
        value.to_owned()
    }

    /// Directory registered for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.roots
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, dir)| dir.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Namespace used by `value`, if it is registered.
    pub fn namespace_of<'v>(&self, value: &'v str) -> Option<&'v str> {
        let (prefix, _) = value.split_once(':')?;
        self.contains(prefix).then_some(prefix)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.roots.iter().map(|(k, d)| (k.as_str(), d.as_str()))
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> VirtualPaths {
        let mut paths = VirtualPaths::new();
        paths.register("cwd", "/home/user/work");
        paths.register("shell", "/etc/dsh/");
        paths.register("temp", "shell:/temp");
        paths
    }

    #[test]
    fn resolves_registered_prefix() {
        let paths = table();
        assert_eq!(paths.resolve("shell:/scripts/greet"), "/etc/dsh/scripts/greet");
        assert_eq!(paths.resolve("cwd:notes.txt"), "/home/user/work/notes.txt");
    }

    #[test]
    fn registration_may_use_earlier_namespaces() {
        let paths = table();
        assert_eq!(paths.get("temp"), Some("/etc/dsh/temp"));
        assert_eq!(paths.resolve("temp:/script7.lua"), "/etc/dsh/temp/script7.lua");
    }

    #[test]
    fn unknown_prefix_is_returned_unchanged() {
        let paths = table();
        assert_eq!(paths.resolve("/abs/file"), "/abs/file");
        assert_eq!(paths.resolve("C:/games"), "C:/games");
        assert_eq!(paths.resolve("shellx:/a"), "shellx:/a");
    }

    #[test]
    fn reregistering_replaces_directory() {
        let mut paths = VirtualPaths::new();
        paths.register("a", "/one");
        paths.register("a", "/two");
        assert_eq!(paths.len(), 1);
        assert_eq!(paths.resolve("a:/x"), "/two/x");
    }

    #[test]
    fn register_all_waits_for_referenced_namespaces() {
        let mut paths = table();
        paths.register_all([
            ("logs", "data:/logs"),
            ("data", "shell:/data"),
            ("plain", "/var/plain"),
        ]);
        assert_eq!(paths.get("data"), Some("/etc/dsh/data"));
        assert_eq!(paths.get("logs"), Some("/etc/dsh/data/logs"));
        assert_eq!(paths.get("plain"), Some("/var/plain"));
    }

    #[test]
    fn register_all_breaks_cycles_literally() {
        let mut paths = VirtualPaths::new();
        paths.register_all([("a", "b:/x"), ("b", "a:/y")]);
        assert_eq!(paths.len(), 2);
        assert_eq!(paths.get("a"), Some("b:/x"));
        assert_eq!(paths.get("b"), Some("b:/x/y"));
    }

    #[test]
    fn namespace_of_only_reports_registered_names() {
        let paths = table();
        assert_eq!(paths.namespace_of("temp:/x"), Some("temp"));
        assert_eq!(paths.namespace_of("data:/x"), None);
        assert_eq!(paths.namespace_of("plain"), None);
    }
}
