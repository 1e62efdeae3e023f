//! Vacuum Reconciliation Tests
//!
//! **Property 7: Vacuum Safety**
//!
//! A confirmed vacuum run deletes only content no container points at, and
//! every container readable before the run is readable after it.

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;
use tessera_storage::reconcile;
use tessera_test_utils::fixtures::*;
use tessera_core::{Placement, ValueContainer};
use tessera_test_utils::{ContentHash, KeyName, TestHarness, VacuumConfig};

// ============================================================================
// HELPERS
// ============================================================================

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

/// One mutation against a small key space.
#[derive(Debug, Clone)]
enum Op {
    Put { slot: usize, size: usize },
    Delete { slot: usize },
    CloneTo { from: usize, to: usize },
}

fn slot_key(slot: usize) -> KeyName {
    key(&format!("app1/doc{slot}/body"))
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..6, prop_oneof![Just(10usize), Just(700), Just(900), Just(1200)])
            .prop_map(|(slot, size)| Op::Put { slot, size }),
        1 => (0usize..6).prop_map(|slot| Op::Delete { slot }),
        1 => (0usize..6, 0usize..6).prop_map(|(from, to)| Op::CloneTo { from, to }),
    ]
}

async fn apply(h: &TestHarness, op: &Op) {
    let ctx = h.ctx();
    match op {
        Op::Put { slot, size } => {
            h.store
                .put(&ctx, &slot_key(*slot), text_payload(*size), None)
                .await
                .unwrap();
        }
        Op::Delete { slot } => {
            h.store.delete(&ctx, &slot_key(*slot)).await.unwrap();
        }
        Op::CloneTo { from, to } => {
            // Cloning an absent container is a not-found error; skip it.
            if from != to && h.store.get(&ctx, &slot_key(*from)).await.is_ok() {
                h.store
                    .clone_container(&ctx, &slot_key(*from), &slot_key(*to))
                    .await
                    .unwrap();
            }
        }
    }
}

/// Every readable container and its payload.
async fn snapshot(h: &TestHarness) -> BTreeMap<String, Vec<u8>> {
    let mut values = BTreeMap::new();
    for slot in 0..6 {
        let k = slot_key(slot);
        if let Ok(value) = h.store.get_value(&h.ctx(), &k).await {
            values.insert(k.to_string(), value);
        }
    }
    values
}

/// Hashes an addressed container points at, in the cache or the durable
/// store. A throttled overwrite leaves the durable record on the old hash.
async fn referenced_hashes(h: &TestHarness) -> BTreeSet<ContentHash> {
    let mut hashes = BTreeSet::new();
    for slot in 0..6 {
        let k = slot_key(slot);
        let cached = h.coordinator.get_cached::<ValueContainer>(&k).await;
        let durable = h.coordinator.get_durable::<ValueContainer>(&k).await.unwrap();
        for container in cached.into_iter().chain(durable) {
            if container.placement() == Placement::Addressed {
                hashes.insert(container.content_hash().clone());
            }
        }
    }
    hashes
}

// ============================================================================
// EXAMPLE TESTS
// ============================================================================

#[tokio::test]
async fn test_lifecycle_leaves_only_live_content() {
    let h = TestHarness::new();
    let ctx = h.ctx();
    let report_key = key("app1/doc1/report");
    let copy_key = key("app1/doc2/report");
    let scratch_key = key("app1/doc3/scratch");

    h.store.put(&ctx, &report_key, text_payload(1000), None).await.unwrap();
    h.store.clone_container(&ctx, &report_key, &copy_key).await.unwrap();
    h.store.put(&ctx, &report_key, text_payload(1500), None).await.unwrap();
    h.store.put(&ctx, &scratch_key, text_payload(2000), None).await.unwrap();
    h.store.delete(&ctx, &scratch_key).await.unwrap();
    assert_eq!(h.content_entries(), 3);

    // Report-only first.
    let dry = reconcile(&h.coordinator, &VacuumConfig::default(), None).await.unwrap();
    assert_eq!(dry.orphans, vec![ContentHash::compute(&text_payload(2000))]);
    assert_eq!(dry.deleted, 0);
    assert_eq!(h.content_entries(), 3);

    let run = reconcile(&h.coordinator, &confirmed_vacuum(), None).await.unwrap();
    assert_eq!(run.deleted, 1);
    // The overwritten report's reference and the scratch reference.
    assert_eq!(run.references_pruned, 2);
    assert_eq!(h.content_entries(), 2);

    assert_eq!(h.store.get_value(&ctx, &report_key).await.unwrap(), text_payload(1500));
    assert_eq!(h.store.get_value(&ctx, &copy_key).await.unwrap(), text_payload(1000));

    let again = reconcile(&h.coordinator, &confirmed_vacuum(), None).await.unwrap();
    assert!(again.is_clean());
    assert_eq!(again.deleted, 0);
}

#[tokio::test]
async fn test_partitions_cover_the_store() {
    let h = TestHarness::new();
    let ctx = h.ctx();
    for i in 0..24 {
        let k = key(&format!("app1/doc{i}/body"));
        h.store.put(&ctx, &k, text_payload(700 + i), None).await.unwrap();
        h.store.delete(&ctx, &k).await.unwrap();
    }
    assert_eq!(h.content_entries(), 24);

    let mut deleted = 0;
    for digit in "0123456789abcdef".chars() {
        let config = VacuumConfig {
            partition: digit.to_string(),
            ..confirmed_vacuum()
        };
        deleted += reconcile(&h.coordinator, &config, None).await.unwrap().deleted;
    }
    assert_eq!(deleted, 24);
    assert_eq!(h.content_entries(), 0);
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// **Property 7: Vacuum Safety**
    #[test]
    fn prop_vacuum_never_breaks_a_container(
        ops in prop::collection::vec(arb_op(), 1..30),
        batch_size in prop_oneof![Just(2usize), Just(5), Just(100)],
    ) {
        block_on(async {
            let h = TestHarness::new();
            for op in &ops {
                apply(&h, op).await;
            }
            let before = snapshot(&h).await;

            let config = VacuumConfig {
                batch_size,
                ..confirmed_vacuum()
            };
            // Enough resumed runs for small batches to cover the store twice.
            let mut cursor = None;
            for _ in 0..100 {
                let report = reconcile(&h.coordinator, &config, cursor.as_ref()).await.unwrap();
                prop_assert!(report.missing.is_empty(), "missing content: {:?}", report.missing);
                cursor = report.next_cursor;
            }

            prop_assert_eq!(snapshot(&h).await, before);
            prop_assert_eq!(h.content_entries(), referenced_hashes(&h).await.len());
            Ok(())
        })?;
    }
}
