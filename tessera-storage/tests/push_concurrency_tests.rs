//! Concurrency Tests for Array Append
//!
//! **Property 5: No Lost Update**
//!
//! Concurrent PUSH calls against the same key each succeed and every pushed
//! value lands in the final array, which never exceeds its maximum length
//! and evicts the oldest values first.

use std::collections::BTreeSet;

use serde_json::{json, Value};
use tessera_test_utils::fixtures::*;
use tessera_test_utils::{init_test_tracing, KeyName, TestHarness};

// ============================================================================
// HELPERS
// ============================================================================

fn harness(retries: u32) -> TestHarness {
    let mut config = test_config();
    config.transaction_retries = retries;
    TestHarness::with_config(config)
}

/// Push every value from its own task and return the lengths reported.
async fn push_all(
    h: &TestHarness,
    log: &KeyName,
    values: Vec<Value>,
    max_length: i64,
) -> Vec<usize> {
    let handles: Vec<_> = values
        .into_iter()
        .map(|value| {
            let store = h.store.clone();
            let ctx = h.ctx();
            let log = log.clone();
            tokio::spawn(async move { store.push(&ctx, &log, value, Some(max_length)).await })
        })
        .collect();

    let mut lengths = Vec::new();
    for handle in handles {
        lengths.push(handle.await.unwrap().unwrap());
    }
    lengths
}

/// The array as the durable store has it.
async fn durable_array(h: &TestHarness, log: &KeyName) -> Vec<Value> {
    h.cache.clear();
    h.store.slice(&h.ctx(), log, None, None).await.unwrap()
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_pushers_on_absent_key_keep_both_values() {
    init_test_tracing();
    for round in 0..50 {
        let h = harness(5);
        let log = key("app1/doc1/log");

        let lengths = push_all(&h, &log, vec![json!("left"), json!("right")], 10).await;
        let mut sorted = lengths.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![1, 2], "round {round}: lengths {lengths:?}");

        let array = durable_array(&h, &log).await;
        let seen: BTreeSet<String> = array
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        assert_eq!(array.len(), 2, "round {round}: {array:?}");
        assert_eq!(
            seen,
            BTreeSet::from(["left".to_string(), "right".to_string()])
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_pushers_respect_max_length() {
    init_test_tracing();
    let h = harness(16);
    let log = key("app1/doc1/log");

    let values: Vec<Value> = (0..10).map(|i| json!(i)).collect();
    let lengths = push_all(&h, &log, values, 5).await;
    assert!(lengths.iter().all(|len| (1..=5).contains(len)));

    let array = durable_array(&h, &log).await;
    assert_eq!(array.len(), 5);
    let distinct: BTreeSet<i64> = array.iter().filter_map(Value::as_i64).collect();
    assert_eq!(distinct.len(), 5, "duplicated values in {array:?}");

    // Later pushes evict earlier ones: the survivors are the last five
    // committed, so one more push drops exactly the oldest of them.
    let oldest = array[0].clone();
    h.store
        .push(&h.ctx(), &log, json!("tail"), Some(5))
        .await
        .unwrap();
    let after = h.store.slice(&h.ctx(), &log, None, None).await.unwrap();
    assert_eq!(after.len(), 5);
    assert!(!after.contains(&oldest));
    assert_eq!(after.last(), Some(&json!("tail")));
    assert_eq!(&after[..4], &array[1..]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sequential_pushes_after_concurrency_refresh_cache() {
    let h = harness(16);
    let log = key("app1/doc1/log");
    push_all(&h, &log, (0..6).map(|i| json!(i)).collect(), 100).await;

    // Whatever order the concurrent cache refreshes landed in, a later push
    // builds on the durable record and leaves the cache current.
    h.store.push(&h.ctx(), &log, json!("last"), Some(100)).await.unwrap();
    let cached = h.store.slice(&h.ctx(), &log, None, None).await.unwrap();
    assert_eq!(cached.len(), 7);
    assert_eq!(cached, durable_array(&h, &log).await);
}
