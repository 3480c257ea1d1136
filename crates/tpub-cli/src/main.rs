use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use tpub::config::{self, Config, PoolConfig};
use tpub::engine::{self, AffectedReport, ChangeSource, Reporter, RunSettings, VersionChanges};
use tpub::jobs::JobsReport;
use tpub::ledger::LedgerStore;
use tpub::pool::WorkerCommand;
use tpub::registry::{AnyPackage, PackageRegistry};
use tpub::types::{NotNeededStub, PackageId, PackageMetadata};

mod progress;

use progress::ProgressReporter;

#[derive(Parser, Debug)]
#[command(name = "tpub", version)]
#[command(about = "Versioning and rebuild orchestration for a monorepo of type definition packages")]
struct Cli {
    /// Repository root; relative paths in the config resolve against it.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Config file (default: nearest .tpub.toml at or above --root)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding typings.json, notNeededPackages.json and versions.json
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory for events.jsonl (default: .tpub)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Directory holding one sub-directory per package (default: types)
    #[arg(long)]
    definitions_root: Option<PathBuf>,

    /// Package scope for published names, without the `@` (default: types)
    #[arg(long)]
    scope: Option<String>,

    /// Print results as JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the packages touched by a diff plus everything depending on them.
    Affected {
        #[command(flatten)]
        changes: ChangeArgs,
    },
    /// Bump versions of packages whose content changed and persist the ledger.
    Versions {
        /// Bump every package, changed or not.
        #[arg(long)]
        force: bool,
    },
    /// Run a worker command over every affected package.
    Run {
        #[command(flatten)]
        changes: ChangeArgs,

        #[command(flatten)]
        pool: PoolArgs,

        /// Worker program and its arguments. Must come last.
        #[arg(
            long,
            num_args = 1..,
            required = true,
            allow_hyphen_values = true,
            value_name = "PROGRAM"
        )]
        worker: Vec<String>,
    },
    /// Print one package: metadata, ledger version and dependency closure.
    Show {
        name: String,

        /// Major version (default: latest)
        #[arg(long)]
        major: Option<u32>,
    },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct ChangeArgs {
    /// Diff the working tree against this git revision.
    #[arg(long)]
    base: Option<String>,

    /// JSON file of `{"status": "A"|"D"|"M", "file": "..."}` records.
    #[arg(long)]
    changes: Option<PathBuf>,
}

impl ChangeArgs {
    fn source(&self) -> Result<ChangeSource> {
        match (&self.base, &self.changes) {
            (Some(base), None) => Ok(ChangeSource::Git { base: base.clone() }),
            (None, Some(path)) => Ok(ChangeSource::File(path.clone())),
            _ => bail!("exactly one of --base or --changes is required"),
        }
    }
}

#[derive(Args, Debug, Default)]
struct PoolArgs {
    /// Number of worker processes (default: available parallelism)
    #[arg(long)]
    processes: Option<usize>,

    /// Give up on a package at its first out-of-memory exit.
    #[arg(long)]
    no_crash_recovery: bool,

    /// Memory ceiling handed to workers, in MB (default: unlimited)
    #[arg(long)]
    memory_ceiling_mb: Option<u64>,

    /// Memory ceiling for the last recovery attempt, in MB (default: 4096)
    #[arg(long)]
    crash_recovery_memory_ceiling_mb: Option<u64>,

    /// Exit code that marks a worker as out of memory (default: 134)
    #[arg(long)]
    oom_exit_code: Option<i32>,

    /// Abort the whole run after this long (e.g. 30m, 90s)
    #[arg(long)]
    soft_timeout: Option<String>,
}

struct CliReporter {
    progress: Option<ProgressReporter>,
}

impl CliReporter {
    fn new() -> Self {
        Self { progress: None }
    }

    fn emit(&self, line: String) {
        match &self.progress {
            Some(progress) => progress.suspend(|| eprintln!("{line}")),
            None => eprintln!("{line}"),
        }
    }
}

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        self.emit(format!("[info] {msg}"));
    }

    fn warn(&mut self, msg: &str) {
        self.emit(format!("[warn] {msg}"));
    }

    fn error(&mut self, msg: &str) {
        self.emit(format!("[error] {msg}"));
    }

    fn progress(&mut self, done: usize, total: usize, label: &str) {
        let progress = self
            .progress
            .get_or_insert_with(|| ProgressReporter::new(total));
        progress.update(done, label);
        if done >= total
            && let Some(progress) = self.progress.take()
        {
            let (done, total) = (progress.done(), progress.total());
            let elapsed = progress.finish();
            self.emit(format!(
                "[info] {done} of {total} packages done in {}",
                humanize(elapsed)
            ));
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut reporter = CliReporter::new();

    match &cli.cmd {
        Commands::Affected { changes } => {
            let settings = load_settings(&cli, None)?;
            let report = engine::run_affected(&settings, &changes.source()?, &mut reporter)?;
            if cli.json {
                print_json(&report)?;
            } else {
                print_affected(&report);
            }
        }
        Commands::Versions { force } => {
            let settings = load_settings(&cli, None)?;
            let changes = engine::run_versions(&settings, *force, &mut reporter)?;
            if cli.json {
                print_json(&changes)?;
            } else {
                print_versions(&changes);
            }
        }
        Commands::Run {
            changes,
            pool,
            worker,
        } => {
            let settings = load_settings(&cli, Some(pool))?;
            let command = worker_command(worker, &settings.repo_root)?;
            let report =
                engine::run_worker_jobs(&settings, &changes.source()?, command, &mut reporter)?;
            if cli.json {
                print_json(&report)?;
            } else {
                print_jobs(&report);
            }
        }
        Commands::Show { name, major } => {
            let settings = load_settings(&cli, None)?;
            run_show(&settings, name, *major, cli.json, &mut reporter)?;
        }
    }

    Ok(())
}

fn load_settings(cli: &Cli, pool: Option<&PoolArgs>) -> Result<RunSettings> {
    let file_config = match &cli.config {
        Some(path) => {
            if !path.exists() {
                bail!("config file not found: {}", path.display());
            }
            config::load_config_from_file(path)?
        }
        None => match config::find_config(&cli.root) {
            Some(path) => config::load_config_from_file(&path)?,
            None => Config::default(),
        },
    };

    let config = file_config.merge(&cli_overrides(cli, pool)?);
    Ok(RunSettings::from_config(&config, &cli.root))
}

/// Flags as a sparse [`Config`]; unset flags stay at their defaults so the
/// file's values survive the merge.
fn cli_overrides(cli: &Cli, pool: Option<&PoolArgs>) -> Result<Config> {
    let mut overrides = Config::default();
    if let Some(dir) = &cli.definitions_root {
        overrides.paths.definitions_root = dir.clone();
    }
    if let Some(dir) = &cli.data_dir {
        overrides.paths.data_dir = dir.clone();
    }
    if let Some(dir) = &cli.state_dir {
        overrides.paths.state_dir = dir.clone();
    }
    if let Some(scope) = &cli.scope {
        overrides.registry.scope = scope.trim_start_matches('@').to_string();
    }

    if let Some(pool) = pool {
        if pool.processes == Some(0) {
            bail!("--processes must be at least 1");
        }
        let defaults = PoolConfig::default();
        overrides.pool = PoolConfig {
            processes: pool.processes,
            crash_recovery: !pool.no_crash_recovery,
            memory_ceiling_mb: pool.memory_ceiling_mb,
            crash_recovery_memory_ceiling_mb: pool
                .crash_recovery_memory_ceiling_mb
                .unwrap_or(defaults.crash_recovery_memory_ceiling_mb),
            oom_exit_code: pool.oom_exit_code.unwrap_or(defaults.oom_exit_code),
            soft_timeout: pool.soft_timeout.as_deref().map(parse_duration).transpose()?,
        };
    }
    Ok(overrides)
}

fn worker_command(worker: &[String], root: &Path) -> Result<WorkerCommand> {
    let (program, args) = worker
        .split_first()
        .context("--worker needs a program")?;
    Ok(WorkerCommand::new(program)
        .args(args.iter().cloned())
        .current_dir(root))
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))
}

fn humanize(elapsed: Duration) -> String {
    humantime::format_duration(Duration::from_millis(elapsed.as_millis() as u64)).to_string()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_ids(label: &str, ids: &[PackageId]) {
    println!("{label}: {}", ids.len());
    for id in ids {
        println!("  {id}");
    }
}

fn print_affected(report: &AffectedReport) {
    print_ids("changed", &report.changed_packages);
    print_ids("dependents", &report.dependent_packages);
}

fn print_versions(changes: &VersionChanges) {
    println!("changed: {}", changes.changed.len());
    for (name, version) in &changes.full_versions {
        let marker = if changes.changed.contains(name) { " (new)" } else { "" };
        println!("  {name} {version}{marker}");
    }
}

fn print_jobs(report: &JobsReport) {
    println!("succeeded: {}", report.succeeded.len());
    for (id, output) in &report.succeeded {
        println!("  {id}: {output}");
    }
    print_ids("crashed", &report.crashed);
    println!("spawned: {}", report.spawned);
}

fn run_show(
    settings: &RunSettings,
    name: &str,
    major: Option<u32>,
    as_json: bool,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let registry = engine::load_registry(settings, reporter)?;
    let ledger = LedgerStore::new(&settings.data_dir).load()?;

    let package = match major {
        Some(major) => AnyPackage::Typings(registry.get(&PackageId::exact(name, major))?),
        None => registry
            .try_get_latest(name)
            .with_context(|| format!("unknown package: {name}"))?,
    };

    match package {
        AnyPackage::Typings(pkg) => {
            let version = ledger.version_for(pkg);
            let closure: Vec<PackageId> = registry
                .dependency_closure_for(pkg)
                .map(PackageMetadata::id)
                .collect();
            if as_json {
                print_json(&json!({
                    "package": pkg,
                    "npmName": pkg.full_npm_name(&settings.scope),
                    "version": version,
                    "dependencyClosure": closure,
                }))?;
            } else {
                print_package(&registry, pkg, &settings.scope, &version.to_string(), &closure);
            }
        }
        AnyPackage::NotNeeded(stub) => {
            if as_json {
                print_json(&json!({ "notNeeded": stub }))?;
            } else {
                print_stub(stub);
            }
        }
    }
    Ok(())
}

fn print_package(
    registry: &PackageRegistry,
    pkg: &PackageMetadata,
    scope: &str,
    version: &str,
    closure: &[PackageId],
) {
    let majors: Vec<String> = registry
        .all_typings()
        .into_iter()
        .filter(|p| p.name == pkg.name)
        .map(|p| p.major_version.to_string())
        .collect();

    println!("name: {}", pkg.name);
    println!("npm_name: {}", pkg.full_npm_name(scope));
    println!("version: {version}");
    println!("majors: {}", majors.join(", "));
    println!("content_hash: {}", pkg.content_hash);
    println!("dependencies: {}", join_or_none(pkg.dependencies.iter()));
    println!("test_dependencies: {}", join_or_none(pkg.test_dependencies.iter()));
    println!("dependency_closure: {}", join_or_none(closure.iter()));
}

fn print_stub(stub: &NotNeededStub) {
    println!("name: {}", stub.name);
    println!("not_needed: true");
    println!("library: {}", stub.library_name);
    println!("source_repo: {}", stub.source_repo_url);
    println!("as_of_version: {}", stub.as_of_version);
}

fn join_or_none<T: std::fmt::Display>(items: impl Iterator<Item = T>) -> String {
    let joined: Vec<String> = items.map(|item| item.to_string()).collect();
    if joined.is_empty() {
        "none".to_string()
    } else {
        joined.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn change_args_require_exactly_one_source() {
        let err = Cli::try_parse_from(["tpub", "affected"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);

        let err = Cli::try_parse_from(["tpub", "affected", "--base", "HEAD", "--changes", "c.json"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn worker_takes_trailing_arguments() {
        let cli = Cli::try_parse_from([
            "tpub", "run", "--base", "main", "--worker", "node", "build.js", "--fast",
        ])
        .expect("parse");
        let Commands::Run { worker, .. } = cli.cmd else {
            panic!("expected run");
        };
        assert_eq!(worker, vec!["node", "build.js", "--fast"]);
    }

    #[test]
    fn pool_flags_override_file_values() {
        let cli = Cli::try_parse_from([
            "tpub",
            "--data-dir",
            "/srv/data",
            "run",
            "--changes",
            "c.json",
            "--processes",
            "3",
            "--no-crash-recovery",
            "--soft-timeout",
            "90s",
            "--worker",
            "w",
        ])
        .expect("parse");
        let Commands::Run { pool, .. } = &cli.cmd else {
            panic!("expected run");
        };

        let mut file = Config::default();
        file.pool.memory_ceiling_mb = Some(1024);
        file.pool.processes = Some(8);
        let merged = file.merge(&cli_overrides(&cli, Some(pool)).expect("overrides"));

        assert_eq!(merged.processes(), 3);
        assert!(!merged.crash_recovery());
        assert_eq!(merged.memory_ceiling_mb(), Some(1024));
        assert_eq!(merged.soft_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(merged.data_dir(), Path::new("/srv/data"));
    }

    #[test]
    fn zero_processes_is_rejected() {
        let pool = PoolArgs {
            processes: Some(0),
            ..PoolArgs::default()
        };
        let cli = Cli::try_parse_from(["tpub", "versions"]).expect("parse");
        let err = cli_overrides(&cli, Some(&pool)).unwrap_err();
        assert!(err.to_string().contains("--processes"));
    }

    #[test]
    fn bad_duration_is_rejected() {
        let err = parse_duration("soon").unwrap_err();
        assert_eq!(err.to_string(), "invalid duration: soon");
    }

    #[test]
    fn worker_command_runs_in_root() {
        let program = ["sh".to_string(), "-c".to_string(), "true".to_string()];
        let command = worker_command(&program, Path::new("/repo")).expect("command");
        assert_eq!(command.display(), "sh -c true");
    }
}
