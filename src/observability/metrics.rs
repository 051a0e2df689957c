//! Counters for reconfiguration and rebuild activity
//!
//! Counters only, monotonic, process lifetime. Relaxed atomics: the values
//! are read for reporting, never used to order other memory.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    reconfigurations_started: AtomicU64,
    reconfigurations_completed: AtomicU64,
    change_configurations: AtomicU64,
    data_loss_reports: AtomicU64,
    message_resends: AtomicU64,
    stale_messages_dropped: AtomicU64,
    rebuilds_generated: AtomicU64,
    rebuilds_not_generated: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_reconfigurations_started(&self) {
        self.reconfigurations_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconfigurations_completed(&self) {
        self.reconfigurations_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_change_configurations(&self) {
        self.change_configurations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_data_loss_reports(&self) {
        self.data_loss_reports.fetch_add(1, Ordering::Relaxed);
    }

    /// Count of individual messages re-sent by the retry timer.
    pub fn add_message_resends(&self, count: u64) {
        self.message_resends.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_stale_messages_dropped(&self) {
        self.stale_messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rebuilds_generated(&self) {
        self.rebuilds_generated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rebuilds_not_generated(&self) {
        self.rebuilds_not_generated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reconfigurations_started: self.reconfigurations_started.load(Ordering::Relaxed),
            reconfigurations_completed: self.reconfigurations_completed.load(Ordering::Relaxed),
            change_configurations: self.change_configurations.load(Ordering::Relaxed),
            data_loss_reports: self.data_loss_reports.load(Ordering::Relaxed),
            message_resends: self.message_resends.load(Ordering::Relaxed),
            stale_messages_dropped: self.stale_messages_dropped.load(Ordering::Relaxed),
            rebuilds_generated: self.rebuilds_generated.load(Ordering::Relaxed),
            rebuilds_not_generated: self.rebuilds_not_generated.load(Ordering::Relaxed),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or(serde_json::Value::Null)
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub reconfigurations_started: u64,
    pub reconfigurations_completed: u64,
    pub change_configurations: u64,
    pub data_loss_reports: u64,
    pub message_resends: u64,
    pub stale_messages_dropped: u64,
    pub rebuilds_generated: u64,
    pub rebuilds_not_generated: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registry_is_zero() {
        let registry = MetricsRegistry::new();
        assert_eq!(registry.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_counters_accumulate() {
        let registry = MetricsRegistry::new();
        registry.increment_reconfigurations_started();
        registry.increment_reconfigurations_started();
        registry.increment_reconfigurations_completed();
        registry.add_message_resends(3);
        registry.add_message_resends(2);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.reconfigurations_started, 2);
        assert_eq!(snapshot.reconfigurations_completed, 1);
        assert_eq!(snapshot.message_resends, 5);
    }

    #[test]
    fn test_to_json() {
        let registry = MetricsRegistry::new();
        registry.increment_rebuilds_generated();
        let json = registry.to_json();
        assert_eq!(json["rebuilds_generated"], 1);
        assert_eq!(json["data_loss_reports"], 0);
    }
}
