//! Affected-package calculation for tpub.
//!
//! Given a set of changed package references, compute every package that
//! must be rebuilt: the changed packages themselves plus everything that
//! depends on them, transitively.
//!
//! References that no longer resolve to a package (because it was deleted)
//! are dropped from the changed list but still seed the closure, so packages
//! that referenced a deleted package are reported as dependents.
//!
//! # Example
//!
//! ```
//! use tpub_affected::get_affected_packages;
//! use tpub_registry::PackageRegistry;
//! use tpub_types::{PackageId, PackageMetadata};
//!
//! let mut user = PackageMetadata::new("user", 1, 0, "u");
//! user.dependencies.push(PackageId::latest("lib"));
//! let registry = PackageRegistry::from_packages(
//!     vec![PackageMetadata::new("lib", 1, 0, "l"), user],
//!     vec![],
//! )
//! .expect("registry");
//!
//! let affected =
//!     get_affected_packages(&registry, &[PackageId::exact("lib", 1)]).expect("affected");
//! assert_eq!(affected.changed_packages.len(), 1);
//! assert_eq!(affected.dependent_packages[0].name, "user");
//! ```

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use tpub_registry::{PackageRegistry, RegistryError};
use tpub_types::{ChangeRecord, MajorVersion, PackageId, PackageKey, PackageMetadata};

/// Packages impacted by a change set.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AffectedSet<'a> {
    /// Seeds that still exist, deduplicated and sorted by name.
    pub changed_packages: Vec<&'a PackageMetadata>,
    /// Transitive dependents of the seeds, excluding the seeds themselves.
    pub dependent_packages: Vec<&'a PackageMetadata>,
}

impl<'a> AffectedSet<'a> {
    /// Changed packages followed by dependents.
    pub fn all(&self) -> impl Iterator<Item = &'a PackageMetadata> + '_ {
        self.changed_packages
            .iter()
            .chain(self.dependent_packages.iter())
            .copied()
    }

    pub fn is_empty(&self) -> bool {
        self.changed_packages.is_empty() && self.dependent_packages.is_empty()
    }
}

/// Reverse dependency edges over the whole registry: dependency -> dependents.
///
/// Every known package id has an entry, possibly empty. Dependencies are
/// recorded after resolution, so a reference to a package without typings
/// still produces an edge keyed by the unresolved id. Test dependencies
/// always resolve at latest, which means the graph follows whichever major
/// is latest at the time it is built.
#[derive(Debug, Clone, Default)]
pub struct ReverseDependencies {
    dependents: BTreeMap<PackageKey, BTreeMap<PackageKey, PackageId>>,
}

impl ReverseDependencies {
    pub fn build(registry: &PackageRegistry) -> Self {
        let mut dependents: BTreeMap<PackageKey, BTreeMap<PackageKey, PackageId>> =
            BTreeMap::new();
        for pkg in registry.all_typings() {
            dependents.entry(pkg.id().key()).or_default();
        }

        for pkg in registry.all_typings() {
            let id = pkg.id();
            let test_deps = pkg
                .test_dependencies
                .iter()
                .map(|name| PackageId::latest(name.as_str()));
            for dep in pkg.dependencies.iter().cloned().chain(test_deps) {
                let resolved = registry.resolve(&dep);
                dependents
                    .entry(resolved.key())
                    .or_default()
                    .insert(id.key(), id.clone());
            }
        }

        Self { dependents }
    }

    pub fn dependents_of(&self, id: &PackageId) -> impl Iterator<Item = &PackageId> {
        self.dependents.get(&id.key()).into_iter().flat_map(|m| m.values())
    }

    pub fn contains(&self, id: &PackageId) -> bool {
        self.dependents.contains_key(&id.key())
    }

    pub fn len(&self) -> usize {
        self.dependents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependents.is_empty()
    }
}

/// Every id reachable from `seeds` over `reverse`, seeds included.
pub fn transitive_closure(
    seeds: &[PackageId],
    reverse: &ReverseDependencies,
) -> BTreeMap<PackageKey, PackageId> {
    let mut all: BTreeMap<PackageKey, PackageId> =
        seeds.iter().map(|id| (id.key(), id.clone())).collect();
    let mut worklist: VecDeque<PackageId> = all.values().cloned().collect();

    while let Some(id) = worklist.pop_front() {
        for dependent in reverse.dependents_of(&id) {
            if !all.contains_key(&dependent.key()) {
                all.insert(dependent.key(), dependent.clone());
                worklist.push_back(dependent.clone());
            }
        }
    }

    all
}

/// Compute the changed and dependent packages for raw, unresolved ids.
///
/// Fails only if a dependent recorded in the registry's own graph cannot be
/// looked up again, which would mean the registry is inconsistent.
pub fn get_affected_packages<'a>(
    registry: &'a PackageRegistry,
    changed: &[PackageId],
) -> Result<AffectedSet<'a>, RegistryError> {
    let resolved: Vec<PackageId> = changed.iter().map(|id| registry.resolve(id)).collect();

    let mut changed_packages: BTreeMap<PackageKey, &PackageMetadata> = BTreeMap::new();
    for id in &resolved {
        if let Some(pkg) = registry.try_get(id) {
            changed_packages.insert(pkg.id().key(), pkg);
        }
    }

    let reverse = ReverseDependencies::build(registry);
    let mut closure = transitive_closure(&resolved, &reverse);
    for id in &resolved {
        closure.remove(&id.key());
    }

    let mut dependent_packages = closure
        .values()
        .map(|id| registry.get(id))
        .collect::<Result<Vec<_>, _>>()?;
    sort_packages(&mut dependent_packages);

    let mut changed_packages: Vec<_> = changed_packages.into_values().collect();
    sort_packages(&mut changed_packages);

    Ok(AffectedSet {
        changed_packages,
        dependent_packages,
    })
}

/// Combine the diff path rule with [`get_affected_packages`].
pub fn affected_from_changes<'a>(
    registry: &'a PackageRegistry,
    records: &[ChangeRecord],
    definitions_root: &str,
) -> Result<AffectedSet<'a>, RegistryError> {
    let ids = changed_ids_from_diff(records, definitions_root);
    get_affected_packages(registry, &ids)
}

fn sort_packages(packages: &mut [&PackageMetadata]) {
    packages.sort_by(|a, b| {
        a.name
            .cmp(&b.name)
            .then(a.major_version.cmp(&b.major_version))
    });
}

/// Map a changed file to the package it belongs to.
///
/// `root/name/v{N}/...` (or `v{N}.{M}`) is major `N`; any other file under
/// `root/name/` is the latest version. Files directly in `root`, or outside
/// it, belong to no package.
pub fn package_id_from_path(file: &str, definitions_root: &str) -> Option<PackageId> {
    let normalized = file.replace('\\', "/");
    let root = definitions_root.trim_matches('/');
    let rest = if root.is_empty() {
        normalized.as_str()
    } else {
        normalized.strip_prefix(root)?.strip_prefix('/')?
    };

    let mut parts = rest.split('/');
    let name = parts.next().filter(|n| !n.is_empty() && *n != "." && *n != "..")?;
    let sub = parts.next()?;

    let major_version = parse_version_directory(sub)
        .filter(|_| parts.next().is_some())
        .map_or(MajorVersion::Latest, MajorVersion::Exact);
    Some(PackageId::new(name, major_version))
}

/// `v3` or `v3.4` -> `3`.
fn parse_version_directory(dir: &str) -> Option<u32> {
    let version = dir.strip_prefix('v')?;
    let (major, minor) = match version.split_once('.') {
        Some((major, minor)) => (major, Some(minor)),
        None => (version, None),
    };
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(major) || minor.is_some_and(|m| !all_digits(m)) {
        return None;
    }
    major.parse().ok()
}

/// Distinct package ids touched by `records`, in first-seen order.
pub fn changed_ids_from_diff(records: &[ChangeRecord], definitions_root: &str) -> Vec<PackageId> {
    let mut seen = BTreeMap::new();
    let mut ids = Vec::new();
    for record in records {
        if let Some(id) = package_id_from_path(&record.file, definitions_root)
            && seen.insert(id.key(), ()).is_none()
        {
            ids.push(id);
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tpub_types::ChangeStatus;

    fn pkg(name: &str, major: u32) -> PackageMetadata {
        PackageMetadata::new(name, major, 0, format!("{name}-{major}"))
    }

    /// `p` has majors 1 and 2; `known` depends on p@1, `known-test` has a
    /// test dependency on p, `most-recent` depends on p@*, `unknown`
    /// depends on a package with no typings.
    fn fixture() -> PackageRegistry {
        let mut known = pkg("known", 1);
        known.dependencies.push(PackageId::exact("p", 1));

        let mut known_test = pkg("known-test", 1);
        known_test.test_dependencies.push("p".to_string());

        let mut most_recent = pkg("most-recent", 1);
        most_recent.dependencies.push(PackageId::latest("p"));

        let mut unknown = pkg("unknown", 1);
        unknown.dependencies.push(PackageId::latest("WAT"));

        PackageRegistry::from_packages(
            vec![pkg("p", 1), known, known_test, most_recent, unknown],
            vec![],
        )
        .expect("registry")
    }

    fn names(packages: &[&PackageMetadata]) -> Vec<String> {
        packages.iter().map(|p| p.name.clone()).collect()
    }

    #[test]
    fn updated_package_reports_all_dependents() {
        let registry = fixture();
        let affected =
            get_affected_packages(&registry, &[PackageId::exact("p", 1)]).expect("affected");

        assert_eq!(names(&affected.changed_packages), ["p"]);
        assert_eq!(affected.dependent_packages.len(), 3);
        assert_eq!(
            names(&affected.dependent_packages),
            ["known", "known-test", "most-recent"]
        );
    }

    #[test]
    fn deleted_package_still_finds_referrers() {
        let registry = fixture();
        let affected =
            get_affected_packages(&registry, &[PackageId::latest("WAT")]).expect("affected");

        assert!(affected.changed_packages.is_empty());
        assert_eq!(names(&affected.dependent_packages), ["unknown"]);
    }

    #[test]
    fn closure_is_transitive() {
        let mut b = pkg("b", 1);
        b.dependencies.push(PackageId::latest("a"));
        let mut c = pkg("c", 1);
        c.dependencies.push(PackageId::exact("b", 1));
        let mut d = pkg("d", 1);
        d.test_dependencies.push("c".to_string());
        let packages = vec![pkg("a", 1), b, c, d, pkg("e", 1)];
        let registry = PackageRegistry::from_packages(packages, vec![]).expect("registry");

        let affected =
            get_affected_packages(&registry, &[PackageId::latest("a")]).expect("affected");
        assert_eq!(names(&affected.changed_packages), ["a"]);
        assert_eq!(names(&affected.dependent_packages), ["b", "c", "d"]);
    }

    #[test]
    fn seeds_are_never_dependents() {
        let mut b = pkg("b", 1);
        b.dependencies.push(PackageId::latest("a"));
        let registry =
            PackageRegistry::from_packages(vec![pkg("a", 1), b], vec![]).expect("registry");

        let affected = get_affected_packages(
            &registry,
            &[PackageId::latest("a"), PackageId::exact("b", 1), PackageId::exact("a", 1)],
        )
        .expect("affected");
        assert_eq!(names(&affected.changed_packages), ["a", "b"]);
        assert!(affected.dependent_packages.is_empty());
    }

    #[test]
    fn cycles_terminate() {
        let mut a = pkg("a", 1);
        a.dependencies.push(PackageId::latest("b"));
        let mut b = pkg("b", 1);
        b.dependencies.push(PackageId::latest("a"));
        let registry = PackageRegistry::from_packages(vec![a, b], vec![]).expect("registry");

        let affected =
            get_affected_packages(&registry, &[PackageId::latest("a")]).expect("affected");
        assert_eq!(names(&affected.dependent_packages), ["b"]);
    }

    #[test]
    fn test_dependencies_follow_the_current_latest() {
        // `tester` only test-depends on `lib`, which resolves to whichever
        // major is latest. A change to the old major does not reach it.
        let mut tester = pkg("tester", 1);
        tester.test_dependencies.push("lib".to_string());
        let registry =
            PackageRegistry::from_packages(vec![pkg("lib", 1), pkg("lib", 2), tester], vec![])
                .expect("registry");

        let old =
            get_affected_packages(&registry, &[PackageId::exact("lib", 1)]).expect("affected");
        assert!(old.dependent_packages.is_empty());

        let new =
            get_affected_packages(&registry, &[PackageId::exact("lib", 2)]).expect("affected");
        assert_eq!(names(&new.dependent_packages), ["tester"]);
    }

    #[test]
    fn reverse_map_has_every_known_package() {
        let registry = fixture();
        let reverse = ReverseDependencies::build(&registry);
        for pkg in registry.all_typings() {
            assert!(reverse.contains(&pkg.id()), "{} missing", pkg.desc());
        }
        assert!(reverse.contains(&PackageId::latest("WAT")));
        assert_eq!(reverse.dependents_of(&PackageId::exact("known", 1)).count(), 0);
    }

    #[test]
    fn path_rule() {
        let root = "types";
        assert_eq!(
            package_id_from_path("types/jquery/index.d.ts", root),
            Some(PackageId::latest("jquery"))
        );
        assert_eq!(
            package_id_from_path("types/jquery/v2/index.d.ts", root),
            Some(PackageId::exact("jquery", 2))
        );
        assert_eq!(
            package_id_from_path("types/node/v0.12/index.d.ts", root),
            Some(PackageId::exact("node", 0))
        );
        // A directory that only looks like a version is an ordinary subdir.
        assert_eq!(
            package_id_from_path("types/jquery/vNext/index.d.ts", root),
            Some(PackageId::latest("jquery"))
        );
        assert_eq!(
            package_id_from_path("types\\react\\v16\\index.d.ts", root),
            Some(PackageId::exact("react", 16))
        );
        assert_eq!(package_id_from_path("types/README.md", root), None);
        assert_eq!(package_id_from_path("scripts/build.js", root), None);
        assert_eq!(package_id_from_path("typesafe/x/index.d.ts", root), None);
    }

    #[test]
    fn diff_records_are_deduplicated() {
        let records = vec![
            ChangeRecord::new(ChangeStatus::Modified, "types/a/index.d.ts"),
            ChangeRecord::new(ChangeStatus::Added, "types/a/a-tests.ts"),
            ChangeRecord::new(ChangeStatus::Deleted, "types/b/v1/index.d.ts"),
            ChangeRecord::new(ChangeStatus::Modified, "README.md"),
        ];
        let ids = changed_ids_from_diff(&records, "types");
        assert_eq!(ids, vec![PackageId::latest("a"), PackageId::exact("b", 1)]);
    }

    #[test]
    fn affected_from_diff_records() {
        let registry = fixture();
        let records = vec![ChangeRecord::new(ChangeStatus::Modified, "types/p/index.d.ts")];
        let affected = affected_from_changes(&registry, &records, "types").expect("affected");
        assert_eq!(names(&affected.changed_packages), ["p"]);
        assert_eq!(affected.all().count(), 4);
    }

    #[test]
    fn affected_set_serializes_camel_case() {
        let registry = fixture();
        let affected =
            get_affected_packages(&registry, &[PackageId::latest("WAT")]).expect("affected");
        let json = serde_json::to_value(&affected).expect("serialize");
        assert_eq!(json["changedPackages"].as_array().map(Vec::len), Some(0));
        assert_eq!(json["dependentPackages"][0]["name"], "unknown");
    }

    proptest! {
        #[test]
        fn dependents_exclude_seeds_and_are_sorted(
            edges in proptest::collection::vec((0usize..8, 0usize..8), 0..20),
            seeds in proptest::collection::vec(0usize..10, 1..4),
        ) {
            let mut packages: Vec<PackageMetadata> =
                (0..8).map(|i| pkg(&format!("n{i}"), 1)).collect();
            for (from, to) in edges {
                packages[from].dependencies.push(PackageId::latest(format!("n{to}")));
            }
            let registry = PackageRegistry::from_packages(packages, vec![]).unwrap();
            let seed_ids: Vec<PackageId> =
                seeds.iter().map(|i| PackageId::latest(format!("n{i}"))).collect();

            let affected = get_affected_packages(&registry, &seed_ids).unwrap();
            let resolved: Vec<PackageKey> =
                seed_ids.iter().map(|id| registry.resolve(id).key()).collect();
            for dep in &affected.dependent_packages {
                prop_assert!(!resolved.contains(&dep.id().key()));
            }
            let dep_names = names(&affected.dependent_packages);
            let mut sorted = dep_names.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(dep_names, sorted);
        }
    }
}
