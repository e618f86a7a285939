//! Target engine versions and their artifact layouts.

use std::fmt;

use super::format::{LAYOUT_V1, LAYOUT_V2};
use crate::error::CompileError;

/// A routing engine version, `MAJOR.MINOR[.PATCH][-pre]`.
///
/// A leading `v` is accepted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub pre: Option<String>,
}

impl EngineVersion {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let s = s.strip_prefix('v').unwrap_or(s);
        let (core, pre) = match s.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return None,
            None => (s, None),
        };

        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            patch,
            pre,
        })
    }

    /// Artifact layout for this version, `None` if unknown.
    pub fn layout(&self) -> Option<u32> {
        match (self.major, self.minor) {
            (1, 8..=9) => Some(LAYOUT_V1),
            (1, 10..=12) => Some(LAYOUT_V2),
            _ => None,
        }
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

/// A resolved compile target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileTarget {
    pub version: EngineVersion,
    pub platform: String,
    pub layout: u32,
}

impl CompileTarget {
    /// Resolve a version string and platform.
    ///
    /// Fails with [`CompileError::UnsupportedVersion`] when the version does
    /// not parse or has no known layout.
    pub fn resolve(version: &str, platform: &str) -> Result<Self, CompileError> {
        let unsupported = || CompileError::UnsupportedVersion {
            version: version.to_string(),
        };
        let parsed = EngineVersion::parse(version).ok_or_else(unsupported)?;
        let layout = parsed.layout().ok_or_else(unsupported)?;
        Ok(Self {
            version: parsed,
            platform: platform.to_string(),
            layout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_versions() {
        let v = EngineVersion::parse("1.11.4").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (1, 11, 4));
        assert_eq!(v.pre, None);

        let v = EngineVersion::parse("v1.12.0-beta.3").unwrap();
        assert_eq!(v.pre.as_deref(), Some("beta.3"));
        assert_eq!(v.to_string(), "1.12.0-beta.3");

        assert_eq!(EngineVersion::parse("1.9").unwrap().patch, 0);
        assert!(EngineVersion::parse("1").is_none());
        assert!(EngineVersion::parse("1.2.3.4").is_none());
        assert!(EngineVersion::parse("latest").is_none());
        assert!(EngineVersion::parse("1.10.0-").is_none());
    }

    #[test]
    fn test_layouts() {
        assert_eq!(EngineVersion::parse("1.8.0").unwrap().layout(), Some(LAYOUT_V1));
        assert_eq!(EngineVersion::parse("1.9.7").unwrap().layout(), Some(LAYOUT_V1));
        assert_eq!(EngineVersion::parse("1.10.0").unwrap().layout(), Some(LAYOUT_V2));
        assert_eq!(EngineVersion::parse("1.12.9").unwrap().layout(), Some(LAYOUT_V2));
        assert_eq!(EngineVersion::parse("1.7.8").unwrap().layout(), None);
        assert_eq!(EngineVersion::parse("1.13.0").unwrap().layout(), None);
        assert_eq!(EngineVersion::parse("2.0.0").unwrap().layout(), None);
    }

    #[test]
    fn test_resolve() {
        let target = CompileTarget::resolve("1.11.4", "linux-amd64").unwrap();
        assert_eq!(target.layout, LAYOUT_V2);
        assert_eq!(target.platform, "linux-amd64");

        assert!(matches!(
            CompileTarget::resolve("9.9.9", "linux-amd64"),
            Err(CompileError::UnsupportedVersion { version }) if version == "9.9.9"
        ));
        assert!(matches!(
            CompileTarget::resolve("garbage", "linux-amd64"),
            Err(CompileError::UnsupportedVersion { .. })
        ));
    }
}
