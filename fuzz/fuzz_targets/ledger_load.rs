#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;
use tpub_ledger::{LedgerStore, ledger_path};

fuzz_target!(|data: &[u8]| {
    let Ok(td) = tempdir() else {
        return;
    };

    if fs::write(ledger_path(td.path()), data).is_ok() {
        let _ = LedgerStore::new(td.path()).load();
    }
});
