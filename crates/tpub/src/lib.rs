//! # tpub
//!
//! Versioning and rebuild orchestration for a monorepo of type definition
//! packages.
//!
//! Every package lives in its own directory under a definitions root, may
//! exist in several major versions side by side, and may depend on other
//! packages in the same repository. tpub answers three questions for such a
//! repository:
//!
//! - **What changed?** [`engine::affected_from_diff`] turns a file-level diff
//!   into the changed packages plus everything that transitively depends on
//!   them.
//! - **What version does it get?** [`engine::calculate_versions`] bumps the
//!   patch version of every package whose content hash moved, using the
//!   persisted [`ledger`].
//! - **Who does the work?** [`jobs::run_jobs`] hands the affected packages to
//!   a pool of long-lived worker processes that survives out-of-memory
//!   crashes.
//!
//! ## Pipeline
//!
//! 1. [`engine::load_registry`] reads `typings.json` and
//!    `notNeededPackages.json` from the data directory.
//! 2. [`engine::run_affected`] collects diff records (from git or a file)
//!    and computes the affected set.
//! 3. [`engine::run_versions`] updates and persists `versions.json`.
//! 4. [`engine::run_worker_jobs`] runs a worker command over the affected set.
//!
//! Each phase reports progress through a [`engine::Reporter`] and appends
//! structured entries to `events.jsonl` in the state directory.
//!
//! ## Modules
//!
//! - [`engine`]: Pipeline phases, settings and reporting
//! - [`jobs`]: Bridge between the worker pool and reporting
//! - [`semver`], [`types`], [`ledger`], [`registry`], [`affected`], [`git`],
//!   [`pool`], [`events`], [`config`]: re-exported microcrates

/// `major.minor.patch` versions.
pub use tpub_semver as semver;

/// Package ids, metadata, not-needed stubs, diff records and events.
pub use tpub_types as types;

/// Persisted version ledger.
pub use tpub_ledger as ledger;

/// In-memory package registry.
pub use tpub_registry as registry;

/// Affected-package calculation.
pub use tpub_affected as affected;

/// Git diff collection.
pub use tpub_git as git;

/// Crash-resilient subprocess worker pool.
pub use tpub_pool as pool;

/// Append-only JSONL event log.
pub use tpub_events as events;

/// Configuration file (`.tpub.toml`) loading and merging.
pub use tpub_config as config;

/// Pipeline phases: registry loading, affected set, versions, worker runs.
pub mod engine;

/// Worker pool runs over packages.
pub mod jobs;
