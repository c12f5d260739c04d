//! Variable policies and capability matching.
//!
//! A policy grants capabilities on path globs inside namespace globs. When
//! several rules match, the most specific one (an exact match, otherwise the
//! glob with the longest literal text) decides, and `deny` in the deciding
//! rule removes every capability.

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Capabilities on variables.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Capabilities: u8 {
        /// Read a variable's items.
        const READ = 0b0000_0001;
        /// See a variable in listings.
        const LIST = 0b0000_0010;
        /// Set, CAS and the lock operations.
        const WRITE = 0b0000_0100;
        /// Delete and delete-CAS.
        const DESTROY = 0b0000_1000;
        /// Overrides every other capability.
        const DENY = 0b1000_0000;
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::empty()
    }
}

impl Capabilities {
    /// Read, list, write and destroy.
    pub fn all_access() -> Self {
        Self::READ | Self::LIST | Self::WRITE | Self::DESTROY
    }

    /// Read and list.
    pub fn read_only() -> Self {
        Self::READ | Self::LIST
    }

    /// Capabilities with deny applied.
    pub fn effective(self) -> Self {
        if self.contains(Self::DENY) {
            Self::empty()
        } else {
            self
        }
    }
}

/// Capabilities on paths matching a glob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRule {
    /// Path glob; `*` matches any run of characters.
    pub path: String,
    /// Granted capabilities.
    pub capabilities: Capabilities,
}

/// Path rules for namespaces matching a glob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRule {
    /// Namespace glob.
    pub namespace: String,
    /// Path rules.
    pub paths: Vec<PathRule>,
}

/// Named set of namespace rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Policy name.
    pub name: String,
    /// Namespace rules.
    pub namespaces: Vec<NamespaceRule>,
}

impl Policy {
    /// Create an empty policy.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespaces: Vec::new(),
        }
    }

    /// Grant `capabilities` on `path` in `namespace`.
    pub fn with_rule(
        mut self,
        namespace: impl Into<String>,
        path: impl Into<String>,
        capabilities: Capabilities,
    ) -> Self {
        let namespace = namespace.into();
        let rule = PathRule {
            path: path.into(),
            capabilities,
        };
        match self.namespaces.iter_mut().find(|n| n.namespace == namespace) {
            Some(existing) => existing.paths.push(rule),
            None => self.namespaces.push(NamespaceRule {
                namespace,
                paths: vec![rule],
            }),
        }
        self
    }

    /// Capabilities this policy grants on `namespace/path`, deny unapplied.
    pub fn capabilities(&self, namespace: &str, path: &str) -> Option<Capabilities> {
        let ns_rule = most_specific(&self.namespaces, namespace, |n| n.namespace.as_str())?;
        let path_rule = most_specific(&ns_rule.paths, path, |p| p.path.as_str())?;
        Some(path_rule.capabilities)
    }
}

/// Match `value` against a glob where `*` matches any run of characters.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == value;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !value.starts_with(first) || value.len() < first.len() + last.len() {
        return false;
    }
    if !value.ends_with(last) {
        return false;
    }

    let mut rest = &value[first.len()..value.len() - last.len()];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(pos) => rest = &rest[pos + middle.len()..],
            None => return false,
        }
    }
    true
}

/// Pick the matching rule with an exact pattern, else the most literal text.
fn most_specific<'a, T>(rules: &'a [T], value: &str, pattern: impl Fn(&T) -> &str) -> Option<&'a T> {
    let mut best: Option<(&T, usize, bool)> = None;
    for rule in rules {
        let pat = pattern(rule);
        if !glob_match(pat, value) {
            continue;
        }
        let exact = !pat.contains('*');
        let literal = pat.len() - pat.matches('*').count();
        let better = match best {
            None => true,
            Some((_, best_literal, best_exact)) => {
                (exact && !best_exact) || (exact == best_exact && literal > best_literal)
            }
        };
        if better {
            best = Some((rule, literal, exact));
        }
    }
    best.map(|(rule, _, _)| rule)
}
