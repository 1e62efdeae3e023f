//! Fuzz test for stored container records
//!
//! Durable records come from older code and other writers. Decoding and
//! upgrading arbitrary JSON must never panic, and an upgraded container
//! must agree with any content it asked to store.
//!
//! Run with: cargo +nightly fuzz run container_record_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use tessera_core::{
    upgrade, Entity, Migratable, MigrationEffects, MigrationOutcome, Placement, StorageConfig,
    ValueContainer,
};

fuzz_target!(|data: &[u8]| {
    let Ok(mut container) = serde_json::from_slice::<ValueContainer>(data) else {
        return;
    };
    let config = StorageConfig::default();
    let mut effects = MigrationEffects::new();

    if let Ok(MigrationOutcome::Migrated { from, .. }) =
        upgrade(&mut container, &config, &mut effects)
    {
        assert_eq!(container.schema(), ValueContainer::CURRENT_SCHEMA);
        assert!(from >= 1);
        // A payload moved out of line is stored under the container's hash.
        assert!(effects.content_writes().len() <= 1);
        for pending in effects.content_writes() {
            assert_eq!(container.placement(), Placement::Addressed);
            assert_eq!(&pending.hash, container.content_hash());
            assert_eq!(pending.bytes.len(), container.size());
        }
    }
});
