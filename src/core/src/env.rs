//! Environment bindings and variable expansion.
//!
//! Bindings are resolved when they are declared: `PATH=/new/bin:$PATH`
//! captures the value `PATH` holds at that point in the pipeline, and the
//! resolved string is what the image carries. Later bindings of `PATH` do
//! not retroactively change earlier ones.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A key/value pair exposed to processes in the image.
///
/// `value` is a template that may reference previously bound variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentBinding {
    pub key: String,
    pub value: String,
}

impl EnvironmentBinding {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Binding that prepends `addition` to the current value of `key`.
    ///
    /// Produces `addition + separator + ${key}`, the augmenting form for
    /// search-path variables.
    pub fn extend(key: impl Into<String>, addition: &str, separator: &str) -> Self {
        let key = key.into();
        let value = format!("{}{}${{{}}}", addition, separator, key);
        Self { key, value }
    }

    /// Parse a `KEY=VALUE` string.
    pub fn parse(s: &str) -> Option<Self> {
        let (key, value) = s.split_once('=')?;
        if !is_valid_name(key) {
            return None;
        }
        Some(Self::new(key, value))
    }
}

impl fmt::Display for EnvironmentBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Ordered set of resolved environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    vars: Vec<(String, String)>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `KEY=VALUE` strings, as stored in image configs.
    ///
    /// Entries without `=` are ignored.
    pub fn from_env_list<S: AsRef<str>>(list: &[S]) -> Self {
        let mut env = Self::new();
        for entry in list {
            if let Some((k, v)) = entry.as_ref().split_once('=') {
                env.set(k, v);
            }
        }
        env
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set a resolved value, replacing an existing key in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(existing) = self.vars.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
        } else {
            self.vars.push((key, value));
        }
    }

    /// Resolve a binding against the current values and store the result.
    ///
    /// Returns the resolved value.
    pub fn apply(&mut self, binding: &EnvironmentBinding) -> String {
        let resolved = self.expand(&binding.value);
        self.set(binding.key.clone(), resolved.clone());
        resolved
    }

    /// Expand `$VAR`, `${VAR}` and `${VAR:-default}` using this environment.
    pub fn expand(&self, template: &str) -> String {
        expand(template, |name| self.get(name).map(str::to_string))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// `KEY=VALUE` strings in declaration order.
    pub fn to_env_list(&self) -> Vec<String> {
        self.vars.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    /// Directories listed in `PATH`, in search order.
    pub fn search_path(&self) -> Vec<String> {
        self.get("PATH")
            .map(|p| {
                p.split(':')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Expand variable references in `template` using `lookup`.
///
/// Supports `$NAME`, `${NAME}`, `${NAME:-default}` and `\$` for a literal
/// dollar sign. Unknown variables expand to the empty string. A `$` that
/// does not start a reference is kept as-is.
pub fn expand<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    expand_with(template, &lookup)
}

fn expand_with(template: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(template.len());
    let chars: Vec<char> = template.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\\' && chars.get(i + 1) == Some(&'$') {
            out.push('$');
            i += 2;
            continue;
        }

        if c != '$' {
            out.push(c);
            i += 1;
            continue;
        }

        match chars.get(i + 1).copied() {
            Some('{') => {
                let Some(close) = chars[i + 2..].iter().position(|&ch| ch == '}') else {
                    // Unterminated: keep literally
                    out.extend(&chars[i..]);
                    break;
                };
                let inner: String = chars[i + 2..i + 2 + close].iter().collect();
                let (name, default) = match inner.split_once(":-") {
                    Some((n, d)) => (n, Some(d)),
                    None => (inner.as_str(), None),
                };
                let value = lookup(name).filter(|v| !v.is_empty() || default.is_none());
                match (value, default) {
                    (Some(v), _) => out.push_str(&v),
                    (None, Some(d)) => out.push_str(&expand_with(d, lookup)),
                    (None, None) => {}
                }
                i += close + 3;
            }
            Some(next) if next == '_' || next.is_ascii_alphabetic() => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end] == '_' || chars[end].is_ascii_alphanumeric())
                {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                if let Some(v) = lookup(&name) {
                    out.push_str(&v);
                }
                i = end;
            }
            _ => {
                out.push('$');
                i += 1;
            }
        }
    }

    out
}

/// Whether `name` is a valid environment variable name.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        let mut env = Environment::new();
        for (k, v) in pairs {
            env.set(*k, *v);
        }
        env
    }

    #[test]
    fn test_extend_path_from_base() {
        let mut e = env(&[("PATH", "/usr/bin")]);
        let resolved = e.apply(&EnvironmentBinding::new("PATH", "/new/bin:$PATH"));
        assert_eq!(resolved, "/new/bin:/usr/bin");
        assert_eq!(e.get("PATH"), Some("/new/bin:/usr/bin"));
    }

    #[test]
    fn test_extend_helper() {
        let binding = EnvironmentBinding::extend("PYTHONPATH", "/usr/tvm/python", ":");
        assert_eq!(binding.value, "/usr/tvm/python:${PYTHONPATH}");

        let mut e = env(&[("PYTHONPATH", "/opt/lib")]);
        e.apply(&binding);
        assert_eq!(e.get("PYTHONPATH"), Some("/usr/tvm/python:/opt/lib"));
    }

    #[test]
    fn test_binding_uses_value_at_declaration() {
        let mut e = env(&[("PATH", "/usr/bin")]);
        e.apply(&EnvironmentBinding::new("TOOLS", "${PATH}"));
        e.apply(&EnvironmentBinding::new("PATH", "/override"));
        assert_eq!(e.get("TOOLS"), Some("/usr/bin"));
        assert_eq!(e.get("PATH"), Some("/override"));
    }

    #[test]
    fn test_chained_augmentation() {
        let mut e = env(&[("PATH", "/usr/bin")]);
        e.apply(&EnvironmentBinding::extend("PATH", "/usr/local/nvidia/bin", ":"));
        e.apply(&EnvironmentBinding::extend("PATH", "/usr/local/cuda/bin", ":"));
        assert_eq!(
            e.get("PATH"),
            Some("/usr/local/cuda/bin:/usr/local/nvidia/bin:/usr/bin")
        );
    }

    #[test]
    fn test_unset_reference_expands_empty() {
        let mut e = Environment::new();
        e.apply(&EnvironmentBinding::new("LD_LIBRARY_PATH", "/usr/local/cuda/lib64:${LD_LIBRARY_PATH}"));
        assert_eq!(e.get("LD_LIBRARY_PATH"), Some("/usr/local/cuda/lib64:"));
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut e = env(&[("A", "1"), ("B", "2")]);
        e.set("A", "3");
        assert_eq!(e.to_env_list(), vec!["A=3", "B=2"]);
    }

    #[test]
    fn test_expand_default() {
        let e = env(&[("EMPTY", "")]);
        assert_eq!(e.expand("${MISSING:-fallback}"), "fallback");
        assert_eq!(e.expand("${EMPTY:-fallback}"), "fallback");
        assert_eq!(e.expand("${EMPTY}x"), "x");
    }

    #[test]
    fn test_expand_escape_and_literals() {
        let e = env(&[("HOME", "/root")]);
        assert_eq!(e.expand(r"\$HOME"), "$HOME");
        assert_eq!(e.expand("cost: $5"), "cost: $5");
        assert_eq!(e.expand("trailing $"), "trailing $");
        assert_eq!(e.expand("${HOME"), "${HOME");
        assert_eq!(e.expand("$HOME/.cache"), "/root/.cache");
    }

    #[test]
    fn test_from_env_list() {
        let e = Environment::from_env_list(&["PATH=/usr/bin:/bin", "LANG=C.UTF-8", "garbage"]);
        assert_eq!(e.len(), 2);
        assert_eq!(e.search_path(), vec!["/usr/bin", "/bin"]);
    }

    #[test]
    fn test_parse_binding() {
        let b = EnvironmentBinding::parse("PATH=/a:$PATH").unwrap();
        assert_eq!(b.key, "PATH");
        assert_eq!(b.value, "/a:$PATH");
        assert!(EnvironmentBinding::parse("1BAD=x").is_none());
        assert!(EnvironmentBinding::parse("novalue").is_none());
    }

    #[test]
    fn test_is_valid_name() {
        assert!(is_valid_name("PATH"));
        assert!(is_valid_name("_private1"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("9LIVES"));
        assert!(!is_valid_name("A-B"));
    }
}
