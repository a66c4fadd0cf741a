//! The `NAME=VALUE` environment passed alongside a command.
//!
//! Ordered, unique-by-name, insertion order preserved — matching the
//! original library's environment list, which callers iterate to rebuild a
//! shell-style `NAME=VALUE\0` sequence.

/// An ordered set of `NAME=VALUE` pairs, unique by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: Vec<(String, String)>,
}

impl Environment {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` to `value`, replacing any existing value for `name` in
    /// place (preserving its original position) rather than moving it to
    /// the end.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(entry) = self.vars.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = value;
        } else {
            self.vars.push((name, value));
        }
    }

    /// Remove `name`, returning its previous value if present.
    pub fn unset(&mut self, name: &str) -> Option<String> {
        let idx = self.vars.iter().position(|(n, _)| n == name)?;
        Some(self.vars.remove(idx).1)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// An independent copy of this environment.
    #[must_use]
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Merge `inferior` into `self`, keeping `self`'s value whenever a name
    /// is present in both (mirroring shell "inferior" environment inheritance,
    /// where the caller's explicit settings win over inherited defaults).
    pub fn merge_inferior(&mut self, inferior: &Environment) {
        for (name, value) in &inferior.vars {
            if self.get(name).is_none() {
                self.set(name.clone(), value.clone());
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Render as a vector of `NAME=VALUE` strings, in insertion order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        self.vars
            .iter()
            .map(|(n, v)| format!("{n}={v}"))
            .collect()
    }
}

impl FromIterator<(String, String)> for Environment {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut env = Self::new();
        for (name, value) in iter {
            env.set(name, value);
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let mut env = Environment::new();
        env.set("PATH", "/bin");
        assert_eq!(env.get("PATH"), Some("/bin"));
    }

    #[test]
    fn set_replaces_in_place() {
        let mut env = Environment::new();
        env.set("A", "1");
        env.set("B", "2");
        env.set("A", "3");
        assert_eq!(env.to_vec(), vec!["A=3".to_string(), "B=2".to_string()]);
    }

    #[test]
    fn unset_removes() {
        let mut env = Environment::new();
        env.set("A", "1");
        assert_eq!(env.unset("A"), Some("1".to_string()));
        assert_eq!(env.get("A"), None);
        assert!(env.unset("A").is_none());
    }

    #[test]
    fn merge_inferior_does_not_override() {
        let mut env = Environment::new();
        env.set("A", "explicit");
        let mut inferior = Environment::new();
        inferior.set("A", "inherited");
        inferior.set("B", "inherited");
        env.merge_inferior(&inferior);
        assert_eq!(env.get("A"), Some("explicit"));
        assert_eq!(env.get("B"), Some("inherited"));
    }
}
