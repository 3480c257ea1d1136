#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;
use tpub_registry::{PackageRegistry, typings_path};

fuzz_target!(|data: &[u8]| {
    let Ok(td) = tempdir() else {
        return;
    };
    if fs::write(typings_path(td.path()), data).is_err() {
        return;
    }

    if let Ok(registry) = PackageRegistry::load(td.path()) {
        for pkg in registry.all_typings() {
            assert!(registry.try_get(&pkg.id()).is_some());
            let _ = registry.dependency_closure_for(pkg).count();
        }
        let _ = tpub_affected::ReverseDependencies::build(&registry);
    }
});
