//! Minimal `major.minor.patch` version type.
//!
//! Only the three numeric components are understood: no pre-release tags and
//! no build metadata. Strict parsing requires all three components; lenient
//! parsing also accepts `"X"` and `"X.Y"`, filling the missing parts with 0.
//!
//! # Example
//!
//! ```
//! use tpub_semver::Semver;
//!
//! let v = Semver::parse("1.2.3").expect("parse");
//! assert_eq!(v.to_string(), "1.2.3");
//!
//! let lenient = Semver::parse_lenient("4").expect("parse");
//! assert_eq!(lenient.to_string(), "4.0.0");
//! assert!(v < lenient);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A parsed `major.minor.patch` version.
///
/// Ordering is lexicographic over `(major, minor, patch)`, which is what the
/// derived `Ord` gives for this field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Semver {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

/// Failure to parse a version string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SemverError {
    #[error("unexpected semver: {0}")]
    Invalid(String),
}

impl Semver {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a strict `X.Y.Z` version.
    pub fn parse(s: &str) -> Result<Self, SemverError> {
        Self::try_parse(s).ok_or_else(|| SemverError::Invalid(s.to_string()))
    }

    /// Parse `X`, `X.Y` or `X.Y.Z`, defaulting missing components to 0.
    pub fn parse_lenient(s: &str) -> Result<Self, SemverError> {
        Self::try_parse_lenient(s).ok_or_else(|| SemverError::Invalid(s.to_string()))
    }

    pub fn try_parse(s: &str) -> Option<Self> {
        match parse_components(s)?.as_slice() {
            [major, minor, patch] => Some(Self::new(*major, *minor, *patch)),
            _ => None,
        }
    }

    pub fn try_parse_lenient(s: &str) -> Option<Self> {
        match parse_components(s)?.as_slice() {
            [major] => Some(Self::new(*major, 0, 0)),
            [major, minor] => Some(Self::new(*major, *minor, 0)),
            [major, minor, patch] => Some(Self::new(*major, *minor, *patch)),
            _ => None,
        }
    }

    /// The canonical `X.Y.Z` rendering.
    pub fn version_string(&self) -> String {
        self.to_string()
    }

    pub fn greater_than(&self, other: &Semver) -> bool {
        self > other
    }

    pub fn equals(&self, other: &Semver) -> bool {
        self == other
    }
}

fn parse_components(s: &str) -> Option<Vec<u64>> {
    s.split('.')
        .map(|part| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                None
            } else {
                part.parse::<u64>().ok()
            }
        })
        .collect()
}

impl fmt::Display for Semver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Semver {
    type Err = SemverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Semver {
    type Error = SemverError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Semver> for String {
    fn from(value: Semver) -> Self {
        value.to_string()
    }
}
