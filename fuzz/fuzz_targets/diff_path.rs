#![no_main]

use libfuzzer_sys::fuzz_target;
use tpub_affected::package_id_from_path;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(records) = tpub_git::parse_name_status(text) {
        for record in records {
            assert!(!record.file.is_empty());
            if let Some(id) = package_id_from_path(&record.file, "types") {
                assert!(!id.name.is_empty());
            }
        }
    }
});
