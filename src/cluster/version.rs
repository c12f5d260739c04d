//! Server version parsing and feature minimums.

use anyhow::{Context, Result};
use std::fmt;

/// Minimum version for applying variables (encrypted keyring).
pub const MIN_VERSION_KEYRING: Version = Version::new(1, 4, 0);

/// Minimum version for variable locks.
pub const MIN_VERSION_VARIABLE_LOCKS: Version = Version::new(1, 7, 0);

/// Version advertised by a server whose config names none.
pub const DEFAULT_SERVER_VERSION: &str = "1.8.0";

/// A `major.minor.patch[-prerelease]` version.
///
/// Minimum checks compare the numeric core only: `1.7.0-beta` meets a
/// `1.7.0` minimum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version.
    pub patch: u32,
    /// Prerelease suffix, without the dash.
    pub prerelease: Option<String>,
}

impl Version {
    /// Create a release version.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: None,
        }
    }

    /// Parse `major.minor.patch[-prerelease]`; a leading `v` is accepted.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let s = s.strip_prefix('v').unwrap_or(s);
        let (core, prerelease) = match s.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => anyhow::bail!("empty prerelease in version {s:?}"),
            None => (s, None),
        };

        let mut parts = core.split('.');
        let mut next = |name: &str| -> Result<u32> {
            parts
                .next()
                .with_context(|| format!("missing {name} component in version {s:?}"))?
                .parse::<u32>()
                .with_context(|| format!("invalid {name} component in version {s:?}"))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        if parts.next().is_some() {
            anyhow::bail!("too many components in version {s:?}");
        }

        Ok(Self {
            major,
            minor,
            patch,
            prerelease,
        })
    }

    fn core(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }

    /// Check if this version is at least `min`.
    pub fn meets(&self, min: &Version) -> bool {
        self.core() >= min.core()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(ref pre) = self.prerelease {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_versions() {
        assert_eq!(Version::parse("1.7.2").unwrap(), Version::new(1, 7, 2));
        assert_eq!(Version::parse("v1.4.0").unwrap(), Version::new(1, 4, 0));
        let beta = Version::parse("1.7.0-beta.1").unwrap();
        assert_eq!(beta.prerelease.as_deref(), Some("beta.1"));
        assert_eq!(beta.to_string(), "1.7.0-beta.1");

        assert!(Version::parse("1.7").is_err());
        assert!(Version::parse("1.7.0.1").is_err());
        assert!(Version::parse("one.two.three").is_err());
        assert!(Version::parse("1.7.0-").is_err());
    }

    #[test]
    fn minimums() {
        assert!(Version::new(1, 7, 0).meets(&MIN_VERSION_VARIABLE_LOCKS));
        assert!(Version::parse("1.7.0-rc1").unwrap().meets(&MIN_VERSION_VARIABLE_LOCKS));
        assert!(!Version::new(1, 6, 9).meets(&MIN_VERSION_VARIABLE_LOCKS));
        assert!(Version::new(1, 6, 9).meets(&MIN_VERSION_KEYRING));
        assert!(Version::new(2, 0, 0).meets(&Version::new(1, 99, 99)));
    }
}
