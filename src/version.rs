// src/version.rs

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

/// Version reported when neither the tag nor the title of a release parses.
pub const DEFAULT_VERSION: &str = "0.0.0";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("empty version string")]
    Empty,
    #[error("version must have 2 to 4 components: {0}")]
    ComponentCount(String),
    #[error("non-numeric version component '{component}' in {input}")]
    NonNumeric { input: String, component: String },
}

/// A dotted numeric version (`major.minor[.patch[.build]]`).
///
/// Missing trailing components compare as 0, so `1.2` == `1.2.0`.
#[derive(Debug, Clone)]
pub struct ReleaseVersion {
    components: Vec<u64>,
}

impl ReleaseVersion {
    pub fn default_version() -> Self {
        Self { components: vec![0, 0, 0] }
    }

    /// Parses `input`, returning the default version instead of an error.
    pub fn parse_or_default(input: &str) -> Self {
        input.parse().unwrap_or_else(|err| {
            debug!(input, %err, "unparsable version, using default");
            Self::default_version()
        })
    }

    /// Resolves a release version from its tag, then from a numeric run in its title.
    pub fn resolve(tag: Option<&str>, title: Option<&str>) -> Self {
        if let Some(version) = tag.and_then(|t| t.parse().ok()) {
            return version;
        }
        if let Some(version) = title
            .and_then(|t| title_version_regex().find(t))
            .and_then(|m| m.as_str().parse().ok())
        {
            return version;
        }
        debug!(?tag, ?title, "no version in release metadata, using default");
        Self::default_version()
    }

    pub fn components(&self) -> &[u64] {
        &self.components
    }

    /// Drops a leading `v` and any `+build` metadata suffix.
    pub fn normalize(input: &str) -> &str {
        let trimmed = input.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        match trimmed.split_once('+') {
            Some((head, _)) => head,
            None => trimmed,
        }
    }

    fn component(&self, index: usize) -> u64 {
        self.components.get(index).copied().unwrap_or(0)
    }
}

/// True iff `candidate` orders strictly after `current`.
pub fn is_update_available(current: &ReleaseVersion, candidate: &ReleaseVersion) -> bool {
    candidate > current
}

/// Compares two version strings after normalization; unparsable input compares as the default.
pub fn compare(a: &str, b: &str) -> Ordering {
    ReleaseVersion::parse_or_default(a).cmp(&ReleaseVersion::parse_or_default(b))
}

fn title_version_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"\d+\.\d+(?:\.\d+)*").expect("valid version regex"))
}

impl FromStr for ReleaseVersion {
    type Err = VersionError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = Self::normalize(input);
        if normalized.is_empty() {
            return Err(VersionError::Empty);
        }
        let parts: Vec<&str> = normalized.split('.').collect();
        if !(2..=4).contains(&parts.len()) {
            return Err(VersionError::ComponentCount(input.to_string()));
        }
        let components = parts
            .iter()
            .map(|part| {
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(VersionError::NonNumeric {
                        input: input.to_string(),
                        component: part.to_string(),
                    });
                }
                part.parse::<u64>().map_err(|_| VersionError::NonNumeric {
                    input: input.to_string(),
                    component: part.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { components })
    }
}

impl Ord for ReleaseVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for ReleaseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ReleaseVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ReleaseVersion {}

impl Default for ReleaseVersion {
    fn default() -> Self {
        Self::default_version()
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.components.iter().map(u64::to_string).collect();
        f.write_str(&parts.join("."))
    }
}

impl Serialize for ReleaseVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ReleaseVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
