//! Core domain types for tpub.
//!
//! This crate provides the value types shared by the registry, ledger,
//! affected-package calculator and worker pool: package references and
//! their canonical keys, externally supplied package metadata, not-needed
//! stubs, change records and structured events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tpub_semver::Semver;

/// Convert a scoped name (`@scope/name`) to the `scope__name` storage form.
///
/// Unscoped names are returned unchanged.
pub fn mangle_scoped_name(name: &str) -> String {
    match name.strip_prefix('@').and_then(|rest| rest.split_once('/')) {
        Some((scope, local)) => format!("{scope}__{local}"),
        None => name.to_string(),
    }
}

/// Inverse of [`mangle_scoped_name`].
pub fn unmangle_scoped_name(name: &str) -> String {
    match name.split_once("__") {
        Some((scope, local)) if !scope.is_empty() && !local.is_empty() => {
            format!("@{scope}/{local}")
        }
        _ => name.to_string(),
    }
}

/// A major version reference: either a concrete major or `"*"` (latest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MajorVersion {
    Latest,
    Exact(u32),
}

impl fmt::Display for MajorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MajorVersion::Latest => write!(f, "*"),
            MajorVersion::Exact(major) => write!(f, "{major}"),
        }
    }
}

impl Serialize for MajorVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MajorVersion::Latest => serializer.serialize_str("*"),
            MajorVersion::Exact(major) => serializer.serialize_u32(*major),
        }
    }
}

impl<'de> Deserialize<'de> for MajorVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u32),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(major) => Ok(MajorVersion::Exact(major)),
            Repr::Text(text) if text == "*" => Ok(MajorVersion::Latest),
            Repr::Text(text) => text
                .parse::<u32>()
                .map(MajorVersion::Exact)
                .map_err(|_| serde::de::Error::custom(format!("invalid major version: {text}"))),
        }
    }
}

/// Canonical map key for a [`PackageId`]: `mangledName + "/v" + majorVersion`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageKey(String);

impl PackageKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a package, possibly at "latest".
///
/// Equality and hashing go through [`PackageId::key`], so `@scope/name` and
/// `scope__name` refer to the same package.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageId {
    pub name: String,
    pub major_version: MajorVersion,
}

impl PackageId {
    pub fn new(name: impl Into<String>, major_version: MajorVersion) -> Self {
        Self {
            name: name.into(),
            major_version,
        }
    }

    pub fn latest(name: impl Into<String>) -> Self {
        Self::new(name, MajorVersion::Latest)
    }

    pub fn exact(name: impl Into<String>, major: u32) -> Self {
        Self::new(name, MajorVersion::Exact(major))
    }

    pub fn key(&self) -> PackageKey {
        PackageKey(format!(
            "{}/v{}",
            mangle_scoped_name(&self.name),
            self.major_version
        ))
    }
}

impl PartialEq for PackageId {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for PackageId {}

impl std::hash::Hash for PackageId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.major_version)
    }
}

/// Package metadata as produced by the definition parser.
///
/// Immutable once loaded into a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMetadata {
    pub name: String,
    pub major_version: u32,
    pub minor_version: u32,
    #[serde(default)]
    pub dependencies: Vec<PackageId>,
    /// Test-only dependencies, always resolved at latest.
    #[serde(default)]
    pub test_dependencies: Vec<String>,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_script_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub globals: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub declared_modules: Vec<String>,
}

impl PackageMetadata {
    /// Minimal metadata with no dependencies.
    pub fn new(
        name: impl Into<String>,
        major: u32,
        minor: u32,
        content_hash: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            major_version: major,
            minor_version: minor,
            dependencies: Vec::new(),
            test_dependencies: Vec::new(),
            content_hash: content_hash.into(),
            library_name: None,
            project_name: None,
            type_script_version: None,
            globals: Vec::new(),
            declared_modules: Vec::new(),
        }
    }

    pub fn id(&self) -> PackageId {
        PackageId::exact(self.name.clone(), self.major_version)
    }

    /// Published package name under `scope`, e.g. `@types/scope__name`.
    pub fn full_npm_name(&self, scope: &str) -> String {
        format!("@{scope}/{}", mangle_scoped_name(&self.name))
    }

    /// Human-readable `name v{major}.{minor}`.
    pub fn desc(&self) -> String {
        format!("{} v{}.{}", self.name, self.major_version, self.minor_version)
    }
}

/// Deprecation marker replacing a once-published package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotNeededStub {
    #[serde(rename = "typingsPackageName")]
    pub name: String,
    #[serde(rename = "libraryName")]
    pub library_name: String,
    #[serde(rename = "sourceRepoURL")]
    pub source_repo_url: String,
    #[serde(rename = "asOfVersion")]
    pub as_of_version: Semver,
}

impl NotNeededStub {
    /// The stubbed package at the major of `asOfVersion`.
    ///
    /// A major too large for [`MajorVersion::Exact`] falls back to latest.
    pub fn id(&self) -> PackageId {
        let major = u32::try_from(self.as_of_version.major)
            .map_or(MajorVersion::Latest, MajorVersion::Exact);
        PackageId::new(self.name.clone(), major)
    }
}

/// Diff status of a changed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeStatus {
    #[serde(rename = "A")]
    Added,
    #[serde(rename = "D")]
    Deleted,
    #[serde(rename = "M")]
    Modified,
}

/// One file-level diff record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub status: ChangeStatus,
    pub file: String,
}

impl ChangeRecord {
    pub fn new(status: ChangeStatus, file: impl Into<String>) -> Self {
        Self {
            status,
            file: file.into(),
        }
    }
}

/// Per-worker crash recovery progress for the item currently assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashRecoveryState {
    #[default]
    Normal,
    Retry,
    RetryWithMoreMemory,
    Crashed,
}

impl fmt::Display for CrashRecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrashRecoveryState::Normal => write!(f, "normal"),
            CrashRecoveryState::Retry => write!(f, "retry"),
            CrashRecoveryState::RetryWithMoreMemory => write!(f, "retry with more memory"),
            CrashRecoveryState::Crashed => write!(f, "crashed"),
        }
    }
}

/// Structured event recorded in the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    /// Package the event concerns, or `all` for run-wide events.
    pub package: String,
}

impl PublishEvent {
    pub fn now(event_type: EventType, package: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            package: package.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    VersionBumped { version: String },
    VersionUnchanged { version: String },
    AffectedComputed { changed: usize, dependents: usize },
    WorkerStarted { worker: usize, memory_ceiling_mb: Option<u64> },
    JobSucceeded { worker: usize },
    WorkerCrashed { worker: usize, state: CrashRecoveryState },
    JobCrashed { worker: usize },
    PoolFailed { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn mangles_scoped_names() {
        assert_eq!(mangle_scoped_name("@babel/core"), "babel__core");
        assert_eq!(mangle_scoped_name("lodash"), "lodash");
        assert_eq!(unmangle_scoped_name("babel__core"), "@babel/core");
        assert_eq!(unmangle_scoped_name("lodash"), "lodash");
    }

    #[test]
    fn key_uses_mangled_name_and_major() {
        assert_eq!(PackageId::exact("@babel/core", 7).key().as_str(), "babel__core/v7");
        assert_eq!(PackageId::latest("react").key().as_str(), "react/v*");
    }

    #[test]
    fn scoped_and_mangled_ids_are_equal() {
        let a = PackageId::exact("@babel/core", 7);
        let b = PackageId::exact("babel__core", 7);
        assert_eq!(a, b);
        assert_ne!(a, PackageId::latest("babel__core"));
    }

    #[test]
    fn major_version_json_forms() {
        let id: PackageId =
            serde_json::from_str(r#"{"name":"p","majorVersion":"*"}"#).expect("parse");
        assert_eq!(id.major_version, MajorVersion::Latest);
        let id: PackageId =
            serde_json::from_str(r#"{"name":"p","majorVersion":3}"#).expect("parse");
        assert_eq!(id.major_version, MajorVersion::Exact(3));
        let id: PackageId =
            serde_json::from_str(r#"{"name":"p","majorVersion":"4"}"#).expect("parse");
        assert_eq!(id.major_version, MajorVersion::Exact(4));
        assert!(serde_json::from_str::<PackageId>(r#"{"name":"p","majorVersion":"x"}"#).is_err());

        let json = serde_json::to_string(&PackageId::latest("p")).expect("serialize");
        assert_eq!(json, r#"{"name":"p","majorVersion":"*"}"#);
    }

    #[test]
    fn metadata_defaults_optional_fields() {
        let raw = r#"{
            "name": "jquery",
            "majorVersion": 3,
            "minorVersion": 5,
            "contentHash": "abc"
        }"#;
        let meta: PackageMetadata = serde_json::from_str(raw).expect("parse");
        assert_eq!(meta.id(), PackageId::exact("jquery", 3));
        assert!(meta.dependencies.is_empty());
        assert!(meta.test_dependencies.is_empty());
        assert_eq!(meta.desc(), "jquery v3.5");
        assert_eq!(meta.full_npm_name("types"), "@types/jquery");
    }

    #[test]
    fn not_needed_stub_uses_upstream_field_names() {
        let raw = r#"{
            "libraryName": "Moment",
            "typingsPackageName": "moment",
            "sourceRepoURL": "https://github.com/moment/moment",
            "asOfVersion": "2.10.5"
        }"#;
        let stub: NotNeededStub = serde_json::from_str(raw).expect("parse");
        assert_eq!(stub.name, "moment");
        assert_eq!(stub.as_of_version, Semver::new(2, 10, 5));
        assert_eq!(stub.id(), PackageId::exact("moment", 2));
    }

    #[test]
    fn not_needed_stub_with_oversized_major_is_latest() {
        let stub = NotNeededStub {
            name: "huge".to_string(),
            library_name: "Huge".to_string(),
            source_repo_url: String::new(),
            as_of_version: Semver::new(u64::from(u32::MAX) + 1, 0, 0),
        };
        assert_eq!(stub.id().major_version, MajorVersion::Latest);

        let stub = NotNeededStub {
            as_of_version: Semver::new(u64::from(u32::MAX), 0, 0),
            ..stub
        };
        assert_eq!(stub.id().major_version, MajorVersion::Exact(u32::MAX));
    }

    #[test]
    fn change_record_status_letters() {
        let rec: ChangeRecord =
            serde_json::from_str(r#"{"status":"D","file":"types/a/index.d.ts"}"#)
                .expect("parse");
        assert_eq!(rec.status, ChangeStatus::Deleted);
    }

    #[test]
    fn event_type_is_tagged() {
        let ev = EventType::WorkerCrashed {
            worker: 2,
            state: CrashRecoveryState::RetryWithMoreMemory,
        };
        let json = serde_json::to_string(&ev).expect("serialize");
        assert!(json.contains("\"type\":\"worker_crashed\""));
        assert!(json.contains("\"state\":\"retry_with_more_memory\""));
    }

    proptest! {
        #[test]
        fn mangled_scoped_names_unmangle_back(
            scope in "[a-z][a-z0-9-]{0,8}",
            local in "[a-z][a-z0-9.-]{0,8}",
        ) {
            let scoped = format!("@{scope}/{local}");
            let mangled = mangle_scoped_name(&scoped);
            prop_assert!(!mangled.contains('@'));
            prop_assert_eq!(unmangle_scoped_name(&mangled), scoped);
        }

        #[test]
        fn key_ignores_scoped_spelling(
            scope in "[a-z][a-z0-9]{0,8}",
            local in "[a-z][a-z0-9]{0,8}",
            major in proptest::option::of(0u32..100),
        ) {
            let major = major.map_or(MajorVersion::Latest, MajorVersion::Exact);
            let scoped = PackageId::new(format!("@{scope}/{local}"), major);
            let mangled = PackageId::new(format!("{scope}__{local}"), major);
            prop_assert_eq!(scoped.key(), mangled.key());
            let suffix = format!("/v{major}");
            prop_assert!(scoped.key().as_str().ends_with(&suffix));
        }
    }
}
