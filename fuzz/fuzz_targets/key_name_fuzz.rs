//! Fuzz test for key name and reference key parsing
//!
//! Arbitrary strings must either be rejected or produce a key name whose
//! derived parts are consistent with the input.
//!
//! Run with: cargo +nightly fuzz run key_name_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use tessera_core::KeyName;
use tessera_storage::ContentReference;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(key) = KeyName::new(input) {
        assert_eq!(key.as_str(), input);
        assert!(key.depth() >= 1);
        assert!(key.is_within(key.directory()));
        let rebuilt = if key.directory().is_empty() {
            key.last_component().to_string()
        } else {
            format!("{}/{}", key.directory(), key.last_component())
        };
        assert_eq!(rebuilt, input);
    }

    if let Ok(reference) = ContentReference::parse(input) {
        assert_eq!(reference.storage_key(), input);
    }
});
