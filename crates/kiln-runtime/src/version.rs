//! Semantic versions and version requirements.
//!
//! Manifests carry a mod `version` and an `apiVersion` requirement, and each
//! dependency may carry a requirement on the dependency's version. Parsing
//! and matching follow Cargo's rules via the `semver` crate:
//!
//! ```text
//! ^1.2      >=1.2.0, <2.0.0
//! ~1.2.3    >=1.2.3, <1.3.0
//! >=1.0, <3 both bounds
//! 1.4       same as ^1.4
//! *         anything
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A parsed semantic version. Build metadata is dropped on parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(semver::Version);

/// Error produced when a version or requirement fails to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionError(pub String);

impl fmt::Display for VersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for VersionError {}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(semver::Version::new(major, minor, patch))
    }

    /// Parse `MAJOR.MINOR.PATCH[-pre][+build]`.
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let s = s.trim();
        let mut version = semver::Version::parse(s)
            .map_err(|e| VersionError(format!("invalid version '{}': {}", s, e)))?;
        version.build = semver::BuildMetadata::EMPTY;
        Ok(Self(version))
    }

    pub fn major(&self) -> u64 {
        self.0.major
    }

    pub fn minor(&self) -> u64 {
        self.0.minor
    }

    pub fn patch(&self) -> u64 {
        self.0.patch
    }

    /// Pre-release identifiers, empty for a release.
    pub fn pre(&self) -> &str {
        self.0.pre.as_str()
    }

    pub fn is_prerelease(&self) -> bool {
        !self.0.pre.is_empty()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A version requirement: all comparators must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionReq(semver::VersionReq);

impl VersionReq {
    /// Requirement matching every release.
    pub const STAR: VersionReq = VersionReq(semver::VersionReq::STAR);

    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(VersionError("empty version requirement".to_string()));
        }
        semver::VersionReq::parse(s)
            .map(Self)
            .map_err(|e| VersionError(format!("invalid version requirement '{}': {}", s, e)))
    }

    /// Check whether a version satisfies this requirement.
    ///
    /// A pre-release only matches when some comparator names a pre-release
    /// of the same `MAJOR.MINOR.PATCH`.
    pub fn matches(&self, version: &Version) -> bool {
        self.0.matches(&version.0)
    }
}

impl fmt::Display for VersionReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for VersionReq {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionReq::parse(s)
    }
}

impl Serialize for VersionReq {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionReq {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        VersionReq::parse(&s).map_err(serde::de::Error::custom)
    }
}
