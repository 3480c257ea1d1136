//! Version ledger for tpub.
//!
//! The ledger remembers, per package name, the last published patch version
//! and the content hash it was cut from. A content hash change (or an explicit
//! force) is the only thing that bumps a version, so re-running the pipeline
//! over unchanged sources never mutates the ledger.
//!
//! # Example
//!
//! ```
//! use tpub_ledger::VersionLedger;
//! use tpub_types::PackageMetadata;
//!
//! let mut ledger = VersionLedger::new();
//! let pkg = PackageMetadata::new("jquery", 3, 5, "hash-1");
//!
//! assert!(ledger.record_update(&pkg, false));
//! assert!(!ledger.record_update(&pkg, false));
//! assert_eq!(ledger.get_version(&pkg), 1);
//! assert_eq!(ledger.version_for(&pkg).to_string(), "3.5.1");
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tpub_semver::Semver;
use tpub_types::{NotNeededStub, PackageMetadata, mangle_scoped_name};

/// Default ledger file name inside the data directory.
pub const LEDGER_FILE: &str = "versions.json";

/// Get the ledger file path for a data directory
pub fn ledger_path(data_dir: &Path) -> PathBuf {
    data_dir.join(LEDGER_FILE)
}

/// Last published state of one package name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionLedgerEntry {
    pub last_version: u64,
    pub last_content_hash: String,
    /// Full version emitted by the most recent bump. Absent in files written
    /// before this field existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<Semver>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("{name}: asOfVersion {as_of} must be newer than the last published version {published}")]
    NotNeededNotNewer {
        name: String,
        as_of: Semver,
        published: Semver,
    },
}

/// In-memory ledger keyed by mangled package name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionLedger {
    entries: BTreeMap<String, VersionLedgerEntry>,
}

impl VersionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the version of `pkg` if forced or if its content hash changed.
    ///
    /// Returns whether a bump happened. A missing entry counts as version 0
    /// with an empty hash.
    pub fn record_update(&mut self, pkg: &PackageMetadata, force_update: bool) -> bool {
        let key = mangle_scoped_name(&pkg.name);
        let current = self.entries.get(&key).cloned().unwrap_or_default();

        let should_bump = force_update || current.last_content_hash != pkg.content_hash;
        if should_bump {
            let last_version = current.last_version.saturating_add(1);
            self.entries.insert(
                key,
                VersionLedgerEntry {
                    last_version,
                    last_content_hash: pkg.content_hash.clone(),
                    latest_version: Some(Semver::new(
                        pkg.major_version.into(),
                        pkg.minor_version.into(),
                        last_version,
                    )),
                },
            );
        }
        should_bump
    }

    /// Current `lastVersion` for `pkg`, 0 if never recorded.
    pub fn get_version(&self, pkg: &PackageMetadata) -> u64 {
        self.last_version(&pkg.name)
    }

    pub fn last_version(&self, name: &str) -> u64 {
        self.entry(name).map_or(0, |e| e.last_version)
    }

    /// Full publishable version: `major.minor.lastVersion`.
    pub fn version_for(&self, pkg: &PackageMetadata) -> Semver {
        Semver::new(
            pkg.major_version.into(),
            pkg.minor_version.into(),
            self.get_version(pkg),
        )
    }

    pub fn entry(&self, name: &str) -> Option<&VersionLedgerEntry> {
        self.entries.get(&mangle_scoped_name(name))
    }

    pub fn entries(&self) -> &BTreeMap<String, VersionLedgerEntry> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A not-needed stub must deprecate strictly after the last version ever
    /// published for its name. Names with no recorded full version pass.
    pub fn check_not_needed(&self, stub: &NotNeededStub) -> Result<(), LedgerError> {
        let Some(published) = self.entry(&stub.name).and_then(|e| e.latest_version) else {
            return Ok(());
        };
        if stub.as_of_version.greater_than(&published) {
            Ok(())
        } else {
            Err(LedgerError::NotNeededNotNewer {
                name: stub.name.clone(),
                as_of: stub.as_of_version,
                published,
            })
        }
    }
}

/// File-backed persistence for a [`VersionLedger`].
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    /// Create a store for `versions.json` inside `data_dir`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: ledger_path(data_dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the ledger; a missing file is an empty ledger.
    pub fn load(&self) -> Result<VersionLedger> {
        if !self.path.exists() {
            return Ok(VersionLedger::new());
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read ledger file {}", self.path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse ledger JSON from {}", self.path.display()))
    }

    /// Save the ledger, writing to a temp file first and renaming over the
    /// destination.
    pub fn save(&self, ledger: &VersionLedger) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create ledger dir {}", parent.display()))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let json =
            serde_json::to_string_pretty(ledger).context("failed to serialize ledger to JSON")?;

        fs::write(&tmp_path, json)
            .with_context(|| format!("failed to write ledger file {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename ledger file to {}", self.path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn pkg(name: &str, hash: &str) -> PackageMetadata {
        PackageMetadata::new(name, 1, 2, hash)
    }

    #[test]
    fn unknown_package_is_version_zero() {
        let ledger = VersionLedger::new();
        assert_eq!(ledger.get_version(&pkg("nothing", "h")), 0);
        assert!(ledger.entry("nothing").is_none());
    }

    #[test]
    fn unchanged_hash_is_idempotent() {
        let mut ledger = VersionLedger::new();
        let p = pkg("a", "h1");
        assert!(ledger.record_update(&p, false));
        let before = ledger.clone();

        assert!(!ledger.record_update(&p, false));
        assert!(!ledger.record_update(&p, false));
        assert_eq!(ledger, before);
        assert_eq!(ledger.get_version(&p), 1);
    }

    #[test]
    fn changed_hash_bumps_by_one() {
        let mut ledger = VersionLedger::new();
        ledger.record_update(&pkg("a", "h1"), false);
        assert_eq!(ledger.last_version("a"), 1);

        assert!(ledger.record_update(&pkg("a", "h2"), false));
        assert_eq!(ledger.last_version("a"), 2);
        assert_eq!(ledger.entry("a").unwrap().last_content_hash, "h2");
    }

    #[test]
    fn bump_saturates_at_max_loaded_version() {
        let raw = format!(r#"{{"a":{{"lastVersion":{},"lastContentHash":"h1"}}}}"#, u64::MAX);
        let mut ledger: VersionLedger = serde_json::from_str(&raw).expect("parse");

        assert!(ledger.record_update(&pkg("a", "h2"), false));
        assert_eq!(ledger.last_version("a"), u64::MAX);
        assert_eq!(ledger.entry("a").unwrap().last_content_hash, "h2");
    }

    #[test]
    fn force_update_bumps_without_hash_change() {
        let mut ledger = VersionLedger::new();
        let p = pkg("a", "h1");
        ledger.record_update(&p, false);
        assert!(ledger.record_update(&p, true));
        assert_eq!(ledger.get_version(&p), 2);
    }

    #[test]
    fn version_for_combines_major_minor_and_patch() {
        let mut ledger = VersionLedger::new();
        let p = pkg("a", "h1");
        assert_eq!(ledger.version_for(&p), Semver::new(1, 2, 0));
        ledger.record_update(&p, false);
        assert_eq!(ledger.version_for(&p), Semver::new(1, 2, 1));
        assert_eq!(ledger.entry("a").unwrap().latest_version, Some(Semver::new(1, 2, 1)));
    }

    #[test]
    fn scoped_names_share_an_entry_with_mangled_form() {
        let mut ledger = VersionLedger::new();
        ledger.record_update(&pkg("@babel/core", "h"), false);
        assert_eq!(ledger.last_version("babel__core"), 1);
        assert!(ledger.entries().contains_key("babel__core"));
    }

    #[test]
    fn not_needed_must_be_newer_than_published() {
        let mut ledger = VersionLedger::new();
        ledger.record_update(&pkg("moment", "h"), false);

        let mut stub = NotNeededStub {
            name: "moment".to_string(),
            library_name: "Moment".to_string(),
            source_repo_url: "https://example.invalid/moment".to_string(),
            as_of_version: Semver::new(1, 2, 1),
        };
        let err = ledger.check_not_needed(&stub).unwrap_err();
        assert!(matches!(err, LedgerError::NotNeededNotNewer { .. }));

        stub.as_of_version = Semver::new(1, 2, 2);
        assert!(ledger.check_not_needed(&stub).is_ok());

        stub.name = "never-published".to_string();
        stub.as_of_version = Semver::new(0, 0, 0);
        assert!(ledger.check_not_needed(&stub).is_ok());
    }

    #[test]
    fn load_missing_file_is_empty() {
        let td = tempdir().expect("tempdir");
        let ledger = LedgerStore::new(td.path()).load().expect("load");
        assert!(ledger.is_empty());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let td = tempdir().expect("tempdir");
        let store = LedgerStore::new(&td.path().join("data"));

        let mut ledger = VersionLedger::new();
        ledger.record_update(&pkg("a", "h1"), false);
        ledger.record_update(&pkg("b", "h2"), false);
        store.save(&ledger).expect("save");

        let loaded = store.load().expect("load");
        assert_eq!(loaded, ledger);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn reads_files_without_latest_version() {
        let td = tempdir().expect("tempdir");
        fs::write(
            ledger_path(td.path()),
            r#"{ "jquery": { "lastVersion": 7, "lastContentHash": "abc" } }"#,
        )
        .expect("write");

        let ledger = LedgerStore::new(td.path()).load().expect("load");
        let entry = ledger.entry("jquery").expect("entry");
        assert_eq!(entry.last_version, 7);
        assert_eq!(entry.latest_version, None);
    }

    #[test]
    fn corrupt_file_reports_path() {
        let td = tempdir().expect("tempdir");
        fs::write(ledger_path(td.path()), "{ not json").expect("write");
        let err = LedgerStore::new(td.path()).load().unwrap_err();
        assert!(format!("{err:#}").contains(LEDGER_FILE));
    }

    proptest! {
        #[test]
        fn version_never_decreases(
            hashes in proptest::collection::vec("[a-c]", 1..30),
            force in any::<bool>(),
        ) {
            let mut ledger = VersionLedger::new();
            let mut previous = 0;
            for hash in &hashes {
                let bumped = ledger.record_update(&pkg("p", hash), force);
                let now = ledger.last_version("p");
                prop_assert!(now >= previous);
                prop_assert_eq!(now - previous, u64::from(bumped));
                previous = now;
            }
        }
    }
}
