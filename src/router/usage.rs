//! Usage tracking
//!
//! Per-model call and token accounting for one router instance. Counters
//! are monotone for the life of the router; a single mutex makes each
//! tracking operation atomic relative to concurrent batched dispatches.

use crate::types::{ModelUsage, UsageSummary};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct UsageInner {
    per_model: UsageSummary,
    last: Option<ModelUsage>,
}

/// Monotone mapping from model name to (calls, input tokens, output tokens).
#[derive(Debug, Default)]
pub struct UsageTracker {
    inner: Mutex<UsageInner>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed call. Absent token counts are passed as zero.
    pub fn track(&self, model: &str, input_tokens: u64, output_tokens: u64) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.per_model.entry(model.to_string()).or_default();
        entry.calls += 1;
        entry.input_tokens += input_tokens;
        entry.output_tokens += output_tokens;
        inner.last = Some(ModelUsage {
            calls: 1,
            input_tokens,
            output_tokens,
        });
    }

    /// Consistent snapshot of all per-model counters.
    pub fn get_usage_summary(&self) -> UsageSummary {
        self.inner.lock().unwrap().per_model.clone()
    }

    /// The most recently tracked single call, regardless of model.
    pub fn get_last_usage(&self) -> Option<ModelUsage> {
        self.inner.lock().unwrap().last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotone() {
        let tracker = UsageTracker::new();
        tracker.track("m", 10, 5);
        tracker.track("m", 7, 3);
        tracker.track("other", 1, 1);

        let summary = tracker.get_usage_summary();
        assert_eq!(summary["m"].calls, 2);
        assert_eq!(summary["m"].input_tokens, 17);
        assert_eq!(summary["m"].output_tokens, 8);
        assert_eq!(summary["other"].calls, 1);
    }

    #[test]
    fn last_usage_is_per_call() {
        let tracker = UsageTracker::new();
        assert!(tracker.get_last_usage().is_none());

        tracker.track("a", 10, 5);
        tracker.track("b", 2, 1);

        let last = tracker.get_last_usage().unwrap();
        assert_eq!(last.calls, 1);
        assert_eq!(last.input_tokens, 2);
        assert_eq!(last.output_tokens, 1);
    }

    #[test]
    fn summary_is_a_snapshot() {
        let tracker = UsageTracker::new();
        tracker.track("m", 1, 1);
        let before = tracker.get_usage_summary();
        tracker.track("m", 1, 1);
        assert_eq!(before["m"].calls, 1);
        assert_eq!(tracker.get_usage_summary()["m"].calls, 2);
    }
}
