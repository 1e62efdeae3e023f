//! Per-key write history and the durable-commit throttle.
//!
//! A key written many times per second is committed to the durable store
//! only every `commit_interval`; a rarely written key is committed on
//! (almost) every write. The history lives only in the volatile cache. When
//! it is evicted the next write commits, since "never committed" is the
//! only safe assumption.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_core::constants::UNKNOWN_WRITE_INTERVAL_SECS;
use tessera_core::{StorageConfig, Timestamp};

/// Recent cache writes and the last durable commit of one key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheHistory {
    pub last_commit: Option<Timestamp>,
    pub recent_writes: VecDeque<Timestamp>,
}

impl CacheHistory {
    /// Append a cache write, dropping the oldest beyond `capacity`.
    pub fn record_write(&mut self, now: Timestamp, capacity: usize) {
        self.recent_writes.push_back(now);
        while self.recent_writes.len() > capacity {
            self.recent_writes.pop_front();
        }
    }

    /// Mean spacing of the remembered writes, in seconds.
    ///
    /// Reports [`UNKNOWN_WRITE_INTERVAL_SECS`] until `min_samples` writes
    /// are remembered.
    pub fn average_interval(&self, min_samples: usize) -> f64 {
        let count = self.recent_writes.len();
        if count < min_samples.max(2) {
            return UNKNOWN_WRITE_INTERVAL_SECS;
        }
        match (self.recent_writes.iter().min(), self.recent_writes.iter().max()) {
            (Some(min), Some(max)) => seconds(*max - *min) / (count - 1) as f64,
            _ => UNKNOWN_WRITE_INTERVAL_SECS,
        }
    }

    /// Whether the write at `now` (already recorded) goes to the durable store.
    pub fn should_commit(&self, now: Timestamp, jitter: Duration, config: &StorageConfig) -> bool {
        let Some(last_commit) = self.last_commit else {
            return true;
        };
        let interval = config.commit_interval.as_secs_f64();
        let since_commit = seconds(now - last_commit) + jitter.as_secs_f64();
        since_commit > interval || self.average_interval(config.min_history_samples) > interval
    }

    pub fn mark_committed(&mut self, now: Timestamp) {
        self.last_commit = Some(now);
    }
}

fn seconds(delta: chrono::Duration) -> f64 {
    delta.num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn t(ms: i64) -> Timestamp {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn config() -> StorageConfig {
        StorageConfig::default()
    }

    #[test]
    fn test_empty_history_commits() {
        let history = CacheHistory::default();
        assert!(history.should_commit(t(0), Duration::ZERO, &config()));
    }

    #[test]
    fn test_record_write_caps_length() {
        let mut history = CacheHistory::default();
        for i in 0..25 {
            history.record_write(t(i), 10);
        }
        assert_eq!(history.recent_writes.len(), 10);
        assert_eq!(history.recent_writes.front(), Some(&t(15)));
    }

    #[test]
    fn test_average_needs_enough_samples() {
        let mut history = CacheHistory::default();
        for i in 0..5 {
            history.record_write(t(i * 100), 10);
        }
        assert_eq!(history.average_interval(6), UNKNOWN_WRITE_INTERVAL_SECS);
        history.record_write(t(500), 10);
        assert!((history.average_interval(6) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_rapid_writes_are_throttled() {
        let mut history = CacheHistory::default();
        history.mark_committed(t(0));
        for i in 0..6 {
            history.record_write(t(i * 50), 10);
        }
        assert!(!history.should_commit(t(250), Duration::ZERO, &config()));
        // Jitter alone cannot push a fresh commit over the interval.
        assert!(!history.should_commit(t(250), Duration::from_millis(500), &config()));
    }

    #[test]
    fn test_commit_after_interval_elapses() {
        let mut history = CacheHistory::default();
        history.mark_committed(t(0));
        for i in 0..6 {
            history.record_write(t(i * 50), 10);
        }
        assert!(history.should_commit(t(2001), Duration::ZERO, &config()));
        assert!(history.should_commit(t(1600), Duration::from_millis(500), &config()));
    }

    #[test]
    fn test_slow_writer_always_commits() {
        let mut history = CacheHistory::default();
        for i in 0..10 {
            history.record_write(t(i * 3000), 10);
        }
        history.mark_committed(t(27_000));
        // Average spacing of 3 s exceeds the 2 s interval.
        assert!(history.should_commit(t(27_001), Duration::ZERO, &config()));
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut history = CacheHistory::default();
        history.record_write(t(1), 10);
        history.mark_committed(t(1));
        let bytes = serde_json::to_vec(&history).unwrap();
        assert_eq!(serde_json::from_slice::<CacheHistory>(&bytes).unwrap(), history);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Once warmed up, writes spread over less than one commit interval
        /// produce at most two commits, whatever the jitter.
        #[test]
        fn prop_throttle_bound(
            gaps in proptest::collection::vec(0i64..40, 1..60),
            jitters in proptest::collection::vec(0u64..=500, 60),
        ) {
            let config = StorageConfig::default();
            let base = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
            let mut history = CacheHistory::default();
            let mut now = base;

            // Warm-up: fill the sample window with rapid writes.
            for _ in 0..config.min_history_samples {
                now += chrono::Duration::milliseconds(10);
                history.record_write(now, config.history_len);
                if history.should_commit(now, Duration::ZERO, &config) {
                    history.mark_committed(now);
                }
            }

            let start = now;
            let mut commits = 0u64;
            for (gap, jitter) in gaps.iter().zip(jitters.iter()) {
                now += chrono::Duration::milliseconds(*gap);
                history.record_write(now, config.history_len);
                if history.should_commit(now, Duration::from_millis(*jitter), &config) {
                    history.mark_committed(now);
                    commits += 1;
                }
            }
            let elapsed = seconds(now - start);
            prop_assume!(elapsed < config.commit_interval.as_secs_f64());
            let bound = (elapsed / config.commit_interval.as_secs_f64()).ceil() as u64 + 1;
            prop_assert!(commits <= bound, "{} commits over {}s", commits, elapsed);
        }

        /// An isolated write after a long gap always commits.
        #[test]
        fn prop_isolated_write_commits(gap_secs in 3i64..100_000, jitter in 0u64..=500) {
            let config = StorageConfig::default();
            let base = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
            let mut history = CacheHistory::default();
            for i in 0..10 {
                history.record_write(base + chrono::Duration::milliseconds(i), 10);
            }
            history.mark_committed(base);
            let now = base + chrono::Duration::seconds(gap_secs);
            history.record_write(now, 10);
            prop_assert!(history.should_commit(now, Duration::from_millis(jitter), &config));
        }
    }
}
