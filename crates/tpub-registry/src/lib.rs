//! Package registry for tpub.
//!
//! The registry is built once per run from the definition parser's output
//! (`typings.json`) and the deprecation list (`notNeededPackages.json`), then
//! only read. It answers "which concrete package does this reference mean?"
//! and "what does this package depend on?".
//!
//! # Version lookup
//!
//! Each package name owns a [`VersionedPackageSet`]. A lookup for
//!
//! - `*` returns the latest version,
//! - a bare major returns the highest minor under that major,
//! - a `major.minor` pair returns that exact entry.
//!
//! # Example
//!
//! ```
//! use tpub_registry::PackageRegistry;
//! use tpub_types::{PackageId, PackageMetadata};
//!
//! let registry = PackageRegistry::from_packages(
//!     vec![
//!         PackageMetadata::new("p", 1, 0, "a"),
//!         PackageMetadata::new("p", 2, 3, "b"),
//!     ],
//!     vec![],
//! )
//! .expect("registry");
//!
//! assert_eq!(registry.get(&PackageId::latest("p")).unwrap().major_version, 2);
//! assert_eq!(registry.resolve(&PackageId::latest("p")), PackageId::exact("p", 2));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tpub_types::{MajorVersion, NotNeededStub, PackageId, PackageMetadata, mangle_scoped_name};

/// File holding `{ [name]: { [versionKey]: PackageMetadata } }`.
pub const TYPINGS_FILE: &str = "typings.json";

/// File holding `{ packages: [NotNeededStub] }`.
pub const NOT_NEEDED_FILE: &str = "notNeededPackages.json";

pub fn typings_path(data_dir: &Path) -> PathBuf {
    data_dir.join(TYPINGS_FILE)
}

pub fn not_needed_path(data_dir: &Path) -> PathBuf {
    data_dir.join(NOT_NEEDED_FILE)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Could not find version {major}.*")]
    MajorNotFound { name: String, major: u32 },
    #[error("Could not find version {major}.{minor}")]
    VersionNotFound { name: String, major: u32, minor: u32 },
    #[error("no typings found for package {0}")]
    UnknownPackage(String),
    #[error("package {0} has no versions")]
    EmptyVersionSet(String),
    #[error("package {name} declares version {major}.{minor} more than once")]
    DuplicateVersion { name: String, major: u32, minor: u32 },
    #[error("package {name}: entry under key {key:?} is version {major}.{minor}")]
    VersionKeyMismatch {
        name: String,
        key: String,
        major: u32,
        minor: u32,
    },
    #[error("package {0} is listed as not needed but still has typings")]
    NotNeededHasTypings(String),
}

/// What to look up within one package name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionQuery {
    Latest,
    Major(u32),
    MajorMinor(u32, u32),
}

impl From<MajorVersion> for VersionQuery {
    fn from(value: MajorVersion) -> Self {
        match value {
            MajorVersion::Latest => VersionQuery::Latest,
            MajorVersion::Exact(major) => VersionQuery::Major(major),
        }
    }
}

impl fmt::Display for VersionQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionQuery::Latest => write!(f, "*"),
            VersionQuery::Major(major) => write!(f, "{major}.*"),
            VersionQuery::MajorMinor(major, minor) => write!(f, "{major}.{minor}"),
        }
    }
}

/// Every known version of one package name, keyed by `(major, minor)`.
#[derive(Debug, Clone)]
pub struct VersionedPackageSet {
    versions: BTreeMap<(u32, u32), PackageMetadata>,
    latest: PackageMetadata,
}

impl VersionedPackageSet {
    pub fn new(entries: impl IntoIterator<Item = PackageMetadata>) -> Result<Self, RegistryError> {
        let mut versions = BTreeMap::new();
        let mut name = None;
        for entry in entries {
            let key = (entry.major_version, entry.minor_version);
            name.get_or_insert_with(|| entry.name.clone());
            if let Some(previous) = versions.insert(key, entry) {
                return Err(RegistryError::DuplicateVersion {
                    name: previous.name,
                    major: key.0,
                    minor: key.1,
                });
            }
        }
        let Some(latest) = versions.values().next_back().cloned() else {
            return Err(RegistryError::EmptyVersionSet(name.unwrap_or_default()));
        };
        Ok(Self { versions, latest })
    }

    /// The entry with the highest `(major, minor)`.
    pub fn latest(&self) -> &PackageMetadata {
        &self.latest
    }

    pub fn name(&self) -> &str {
        &self.latest().name
    }

    pub fn try_get(&self, query: VersionQuery) -> Option<&PackageMetadata> {
        match query {
            VersionQuery::Latest => Some(self.latest()),
            VersionQuery::Major(major) => self
                .versions
                .range((major, 0)..=(major, u32::MAX))
                .next_back()
                .map(|(_, pkg)| pkg),
            VersionQuery::MajorMinor(major, minor) => self.versions.get(&(major, minor)),
        }
    }

    pub fn get(&self, query: VersionQuery) -> Result<&PackageMetadata, RegistryError> {
        self.try_get(query).ok_or_else(|| {
            let name = self.name().to_string();
            match query {
                VersionQuery::MajorMinor(major, minor) => {
                    RegistryError::VersionNotFound { name, major, minor }
                }
                VersionQuery::Major(major) => RegistryError::MajorNotFound { name, major },
                VersionQuery::Latest => RegistryError::UnknownPackage(name),
            }
        })
    }

    /// All versions, newest first.
    pub fn all(&self) -> impl Iterator<Item = &PackageMetadata> {
        self.versions.values().rev()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// Either a typings package or a not-needed stub.
#[derive(Debug, Clone, Copy)]
pub enum AnyPackage<'a> {
    Typings(&'a PackageMetadata),
    NotNeeded(&'a NotNeededStub),
}

impl AnyPackage<'_> {
    pub fn name(&self) -> &str {
        match self {
            AnyPackage::Typings(pkg) => &pkg.name,
            AnyPackage::NotNeeded(stub) => &stub.name,
        }
    }

    pub fn id(&self) -> PackageId {
        match self {
            AnyPackage::Typings(pkg) => pkg.id(),
            AnyPackage::NotNeeded(stub) => stub.id(),
        }
    }

    pub fn is_not_needed(&self) -> bool {
        matches!(self, AnyPackage::NotNeeded(_))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NotNeededFile {
    packages: Vec<NotNeededStub>,
}

/// Raw registry input: `{ [name]: { [versionKey]: PackageMetadata } }`.
pub type RawTypings = BTreeMap<String, BTreeMap<String, PackageMetadata>>;

/// Read-only index of all package versions and not-needed stubs.
#[derive(Debug, Clone, Default)]
pub struct PackageRegistry {
    versioned: BTreeMap<String, VersionedPackageSet>,
    not_needed: Vec<NotNeededStub>,
}

impl PackageRegistry {
    /// Build from the definition parser's per-name output. Each version key is
    /// `"{major}"` or `"{major}.{minor}"` and must agree with its entry.
    pub fn from_raw(
        typings: RawTypings,
        not_needed: Vec<NotNeededStub>,
    ) -> Result<Self, RegistryError> {
        let mut packages = Vec::new();
        for (name, versions) in typings {
            for (key, entry) in versions {
                if !version_key_matches(&key, &entry) {
                    return Err(RegistryError::VersionKeyMismatch {
                        name,
                        key,
                        major: entry.major_version,
                        minor: entry.minor_version,
                    });
                }
                packages.push(entry);
            }
        }
        Self::from_packages(packages, not_needed)
    }

    pub fn from_packages(
        packages: impl IntoIterator<Item = PackageMetadata>,
        not_needed: Vec<NotNeededStub>,
    ) -> Result<Self, RegistryError> {
        let mut by_name: BTreeMap<String, Vec<PackageMetadata>> = BTreeMap::new();
        for pkg in packages {
            by_name
                .entry(mangle_scoped_name(&pkg.name))
                .or_default()
                .push(pkg);
        }

        let mut versioned = BTreeMap::new();
        for (name, entries) in by_name {
            versioned.insert(name, VersionedPackageSet::new(entries)?);
        }

        if let Some(stub) = not_needed
            .iter()
            .find(|stub| versioned.contains_key(&mangle_scoped_name(&stub.name)))
        {
            return Err(RegistryError::NotNeededHasTypings(stub.name.clone()));
        }

        Ok(Self {
            versioned,
            not_needed,
        })
    }

    /// Load `typings.json` and, if present, `notNeededPackages.json` from
    /// `data_dir`.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = typings_path(data_dir);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read typings file {}", path.display()))?;
        let typings: RawTypings = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse typings JSON from {}", path.display()))?;

        let path = not_needed_path(data_dir);
        let not_needed = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read not-needed file {}", path.display()))?;
            serde_json::from_str::<NotNeededFile>(&content)
                .with_context(|| {
                    format!("failed to parse not-needed JSON from {}", path.display())
                })?
                .packages
        } else {
            Vec::new()
        };

        Self::from_raw(typings, not_needed)
            .with_context(|| format!("invalid registry data in {}", data_dir.display()))
    }

    fn versions_for(&self, name: &str) -> Option<&VersionedPackageSet> {
        self.versioned.get(&mangle_scoped_name(name))
    }

    pub fn has_typings(&self, name: &str) -> bool {
        self.versions_for(name).is_some()
    }

    /// Pin `id` to the concrete major it currently refers to. Unknown names and
    /// unknown majors come back unchanged.
    pub fn resolve(&self, id: &PackageId) -> PackageId {
        self.try_get(id).map_or_else(|| id.clone(), PackageMetadata::id)
    }

    /// Look up a package that is expected to exist.
    pub fn get(&self, id: &PackageId) -> Result<&PackageMetadata, RegistryError> {
        self.versions_for(&id.name)
            .ok_or_else(|| RegistryError::UnknownPackage(id.name.clone()))?
            .get(id.major_version.into())
    }

    pub fn try_get(&self, id: &PackageId) -> Option<&PackageMetadata> {
        self.versions_for(&id.name)?.try_get(id.major_version.into())
    }

    /// Look up with an explicit minor, e.g. to pin a path mapping.
    pub fn get_exact(
        &self,
        name: &str,
        major: u32,
        minor: u32,
    ) -> Result<&PackageMetadata, RegistryError> {
        self.versions_for(name)
            .ok_or_else(|| RegistryError::UnknownPackage(name.to_string()))?
            .get(VersionQuery::MajorMinor(major, minor))
    }

    /// The latest typings for `name`, or its not-needed stub.
    pub fn try_get_latest(&self, name: &str) -> Option<AnyPackage<'_>> {
        if let Some(versions) = self.versions_for(name) {
            return Some(AnyPackage::Typings(versions.latest()));
        }
        let mangled = mangle_scoped_name(name);
        self.not_needed
            .iter()
            .find(|stub| mangle_scoped_name(&stub.name) == mangled)
            .map(AnyPackage::NotNeeded)
    }

    /// One entry per name, its latest, sorted by name.
    pub fn all_latest_typings(&self) -> Vec<&PackageMetadata> {
        self.versioned.values().map(VersionedPackageSet::latest).collect()
    }

    /// Every version of every name, sorted by name then newest first.
    pub fn all_typings(&self) -> Vec<&PackageMetadata> {
        self.versioned.values().flat_map(|set| set.all()).collect()
    }

    pub fn all_not_needed(&self) -> &[NotNeededStub] {
        &self.not_needed
    }

    /// Latest typings followed by not-needed stubs.
    pub fn all_latest(&self) -> Vec<AnyPackage<'_>> {
        self.all_latest_typings()
            .into_iter()
            .map(AnyPackage::Typings)
            .chain(self.not_needed.iter().map(AnyPackage::NotNeeded))
            .collect()
    }

    /// Known packages `pkg` depends on, runtime dependencies first, then test
    /// dependencies at latest. References to packages without typings are
    /// skipped. Calling again restarts the sequence.
    pub fn dependency_closure_for<'a>(
        &'a self,
        pkg: &'a PackageMetadata,
    ) -> impl Iterator<Item = &'a PackageMetadata> + 'a {
        let runtime = pkg.dependencies.iter().filter_map(|dep| self.try_get(dep));
        let test = pkg
            .test_dependencies
            .iter()
            .filter_map(|name| self.try_get(&PackageId::latest(name.as_str())));
        runtime.chain(test)
    }

    pub fn len(&self) -> usize {
        self.versioned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versioned.is_empty()
    }
}

fn version_key_matches(key: &str, entry: &PackageMetadata) -> bool {
    let mut parts = key.split('.');
    let major = parts.next().and_then(|m| m.parse::<u32>().ok());
    let minor = parts.next().map(|m| m.parse::<u32>().ok());
    if parts.next().is_some() {
        return false;
    }
    match (major, minor) {
        (Some(major), None) => major == entry.major_version,
        (Some(major), Some(Some(minor))) => {
            major == entry.major_version && minor == entry.minor_version
        }
        _ => false,
    }
}
