#![no_main]

use libfuzzer_sys::fuzz_target;
use tpub_semver::Semver;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(version) = Semver::parse(text) {
        assert_eq!(Semver::parse(&version.to_string()).ok(), Some(version));
    }
    if let Ok(version) = Semver::parse_lenient(text) {
        assert_eq!(Semver::parse(&version.to_string()).ok(), Some(version));
    }
});
