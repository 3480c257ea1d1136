use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::affected::{self, AffectedSet};
use crate::config::Config;
use crate::events::{self, EventLog};
use crate::git;
use crate::jobs::{self, JobsReport};
use crate::ledger::{LedgerStore, VersionLedger};
use crate::pool::{PoolSettings, WorkerCommand};
use crate::registry::PackageRegistry;
use crate::semver::Semver;
use crate::types::{ChangeRecord, EventType, PackageId, PublishEvent};

/// Package label for events that concern the whole run.
pub const ALL_PACKAGES: &str = "all";

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);

    /// `done` of `total` items have reached a terminal outcome, the latest
    /// being `label`.
    fn progress(&mut self, _done: usize, _total: usize, _label: &str) {}
}

/// Immutable settings for one invocation, resolved against the repository root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub repo_root: PathBuf,
    /// Package root as it appears in diff paths (relative, `/`-separated).
    pub definitions_root: String,
    pub data_dir: PathBuf,
    pub state_dir: PathBuf,
    pub scope: String,
    pub pool: PoolSettings,
}

impl RunSettings {
    pub fn from_config(config: &Config, repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            definitions_root: config
                .definitions_root()
                .to_string_lossy()
                .replace('\\', "/")
                .trim_matches('/')
                .to_string(),
            data_dir: resolve_dir(repo_root, config.data_dir()),
            state_dir: resolve_dir(repo_root, config.state_dir()),
            scope: config.scope().to_string(),
            pool: pool_settings(config),
        }
    }

    pub fn events_path(&self) -> PathBuf {
        events::events_path(&self.state_dir)
    }
}

/// Pool settings carried by the `[pool]` config section.
pub fn pool_settings(config: &Config) -> PoolSettings {
    PoolSettings {
        processes: config.processes(),
        crash_recovery: config.crash_recovery(),
        memory_ceiling_mb: config.memory_ceiling_mb(),
        crash_recovery_memory_ceiling_mb: config.crash_recovery_memory_ceiling_mb(),
        oom_exit_code: config.oom_exit_code(),
        soft_timeout: config.soft_timeout(),
    }
}

fn resolve_dir(root: &Path, dir: &Path) -> PathBuf {
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        root.join(dir)
    }
}

pub fn load_registry(
    settings: &RunSettings,
    reporter: &mut dyn Reporter,
) -> Result<PackageRegistry> {
    let registry = PackageRegistry::load(&settings.data_dir)?;
    reporter.info(&format!(
        "loaded {} packages ({} not needed) from {}",
        registry.len(),
        registry.all_not_needed().len(),
        settings.data_dir.display()
    ));
    Ok(registry)
}

/// Where the file-level change list comes from.
#[derive(Debug, Clone)]
pub enum ChangeSource {
    /// `git diff --name-status <base>` in the repository root.
    Git { base: String },
    /// JSON array of `{ "status": "A"|"D"|"M", "file": "..." }`.
    File(PathBuf),
    Records(Vec<ChangeRecord>),
}

pub fn collect_changes(
    settings: &RunSettings,
    source: &ChangeSource,
    reporter: &mut dyn Reporter,
) -> Result<Vec<ChangeRecord>> {
    let records = match source {
        ChangeSource::Git { base } => {
            if !git::is_git_repo(&settings.repo_root) {
                bail!("{} is not inside a git repository", settings.repo_root.display());
            }
            git::diff_name_status(&settings.repo_root, base)?
        }
        ChangeSource::File(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read changes file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse changes JSON from {}", path.display()))?
        }
        ChangeSource::Records(records) => records.clone(),
    };
    reporter.info(&format!("{} changed files", records.len()));
    Ok(records)
}

/// Affected set for a change list, logged and recorded as an event.
pub fn affected_from_diff<'a>(
    registry: &'a PackageRegistry,
    records: &[ChangeRecord],
    definitions_root: &str,
    reporter: &mut dyn Reporter,
    event_log: &mut EventLog,
) -> Result<AffectedSet<'a>> {
    let set = affected::affected_from_changes(registry, records, definitions_root)
        .context("failed to compute affected packages")?;

    reporter.info(&format!(
        "{} changed packages, {} dependents",
        set.changed_packages.len(),
        set.dependent_packages.len()
    ));
    event_log.record(PublishEvent::now(
        EventType::AffectedComputed {
            changed: set.changed_packages.len(),
            dependents: set.dependent_packages.len(),
        },
        ALL_PACKAGES,
    ));
    Ok(set)
}

/// Owned view of an [`AffectedSet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AffectedReport {
    pub changed_packages: Vec<PackageId>,
    pub dependent_packages: Vec<PackageId>,
}

impl From<&AffectedSet<'_>> for AffectedReport {
    fn from(set: &AffectedSet<'_>) -> Self {
        Self {
            changed_packages: set.changed_packages.iter().map(|p| p.id()).collect(),
            dependent_packages: set.dependent_packages.iter().map(|p| p.id()).collect(),
        }
    }
}

/// Load the registry, collect changes and compute the affected set.
pub fn run_affected(
    settings: &RunSettings,
    source: &ChangeSource,
    reporter: &mut dyn Reporter,
) -> Result<AffectedReport> {
    let registry = load_registry(settings, reporter)?;
    let records = collect_changes(settings, source, reporter)?;

    let mut event_log = EventLog::new();
    let report = affected_from_diff(
        &registry,
        &records,
        &settings.definitions_root,
        reporter,
        &mut event_log,
    )
    .map(|set| AffectedReport::from(&set));
    event_log.write_to_file(&settings.events_path())?;
    report
}

/// Result of the version calculation phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionChanges {
    /// Names whose version was bumped, sorted.
    pub changed: Vec<String>,
    /// Publishable version of every latest package.
    pub full_versions: BTreeMap<String, Semver>,
}

/// Record every latest package in the ledger and check not-needed stubs.
///
/// Stubs are checked first so a failing stub leaves the ledger untouched.
pub fn calculate_versions(
    registry: &PackageRegistry,
    ledger: &mut VersionLedger,
    force_update: bool,
    reporter: &mut dyn Reporter,
    event_log: &mut EventLog,
) -> Result<VersionChanges> {
    for stub in registry.all_not_needed() {
        ledger.check_not_needed(stub)?;
    }

    let mut changes = VersionChanges::default();
    for pkg in registry.all_latest_typings() {
        let bumped = ledger.record_update(pkg, force_update);
        let version = ledger.version_for(pkg);
        let event_type = if bumped {
            changes.changed.push(pkg.name.clone());
            reporter.info(&format!("{} -> {version}", pkg.desc()));
            EventType::VersionBumped {
                version: version.to_string(),
            }
        } else {
            EventType::VersionUnchanged {
                version: version.to_string(),
            }
        };
        event_log.record(PublishEvent::now(event_type, pkg.id().to_string()));
        changes.full_versions.insert(pkg.name.clone(), version);
    }
    changes.changed.sort();

    reporter.info(&format!(
        "{} of {} packages need a new version",
        changes.changed.len(),
        changes.full_versions.len()
    ));
    Ok(changes)
}

/// Calculate versions and persist the ledger when anything moved.
pub fn run_versions(
    settings: &RunSettings,
    force_update: bool,
    reporter: &mut dyn Reporter,
) -> Result<VersionChanges> {
    let registry = load_registry(settings, reporter)?;
    let store = LedgerStore::new(&settings.data_dir);
    let mut ledger = store.load()?;

    let mut event_log = EventLog::new();
    let changes = calculate_versions(
        &registry,
        &mut ledger,
        force_update,
        reporter,
        &mut event_log,
    )?;

    if !changes.changed.is_empty() {
        store.save(&ledger)?;
        reporter.info(&format!("ledger written to {}", store.path().display()));
    }
    event_log.write_to_file(&settings.events_path())?;
    Ok(changes)
}

/// Run `command` over every affected package (changed first, then dependents).
pub fn run_worker_jobs(
    settings: &RunSettings,
    source: &ChangeSource,
    command: WorkerCommand,
    reporter: &mut dyn Reporter,
) -> Result<JobsReport> {
    let registry = load_registry(settings, reporter)?;
    let records = collect_changes(settings, source, reporter)?;

    let mut event_log = EventLog::new();
    let result = affected_from_diff(
        &registry,
        &records,
        &settings.definitions_root,
        reporter,
        &mut event_log,
    )
    .and_then(|set| {
        let packages: Vec<PackageId> = set.all().map(|p| p.id()).collect();
        jobs::run_jobs(&settings.pool, command, packages, reporter, &mut event_log)
    });

    event_log.write_to_file(&settings.events_path())?;
    result
}
