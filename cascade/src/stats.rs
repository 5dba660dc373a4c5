//! Per-submission counters.
//!
//! Producers call [`Statistics::add_counter`] and move on; the
//! [`StatisticsCollector`] thread folds the updates into totals.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::sync::BoundedQueue;
use crate::trace::{debug, info, warn};
use crate::types::{PartitionId, SubmissionId};

/// Counter names maintained by the chain handler.
pub mod counters {
    pub const CHAINS_PROCESSED: &str = "Chains Processed";
    pub const CHAINS_FROM_CHAINS: &str = "Chains Generated From Chains";
    pub const CHAINS_FROM_CHAINS_TO_PROCESS: &str = "Chains Generated From Chains (To Process)";

    /// Name of the records-read counter for an input layer.
    #[must_use]
    pub fn records_input(layer: crate::types::InputLayerId) -> String {
        format!("Records input {layer}")
    }
}

/// Fire-and-forget counter sink.
pub trait Statistics: Send + Sync {
    fn add_counter(&self, node: PartitionId, submission: SubmissionId, name: &str, delta: i64);
}

struct Update {
    node: PartitionId,
    submission: SubmissionId,
    name: String,
    delta: i64,
}

type CounterKey = (PartitionId, SubmissionId, String);

/// Aggregates counter updates on a dedicated `statistics` thread.
pub struct StatisticsCollector {
    updates: BoundedQueue<Update>,
    totals: Mutex<HashMap<CounterKey, i64>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StatisticsCollector {
    /// Starts the collector thread.
    ///
    /// # Panics
    ///
    /// Panics if thread spawning fails.
    #[must_use]
    pub fn spawn(capacity: usize) -> Arc<Self> {
        let collector = Arc::new(Self {
            updates: BoundedQueue::new(capacity),
            totals: Mutex::new(HashMap::new()),
            handle: Mutex::new(None),
        });
        let worker = Arc::clone(&collector);
        let handle = thread::Builder::new()
            .name("statistics".into())
            .spawn(move || {
                debug!("statistics thread started");
                while let Some(update) = worker.updates.pop() {
                    let key = (update.node, update.submission, update.name);
                    *worker.totals.lock().entry(key).or_insert(0) += update.delta;
                }
                debug!("statistics thread exiting");
            })
            .expect("failed to spawn statistics thread");
        *collector.handle.lock() = Some(handle);
        collector
    }

    /// Total of `name` for `submission`, summed over all nodes.
    #[must_use]
    pub fn counter(&self, submission: SubmissionId, name: &str) -> i64 {
        self.totals
            .lock()
            .iter()
            .filter(|((_, sub, n), _)| *sub == submission && n == name)
            .map(|(_, v)| *v)
            .sum()
    }

    /// All counters of `submission`, summed over all nodes.
    #[must_use]
    pub fn snapshot(&self, submission: SubmissionId) -> BTreeMap<String, i64> {
        let mut out = BTreeMap::new();
        for ((_, sub, name), v) in self.totals.lock().iter() {
            if *sub == submission {
                *out.entry(name.clone()).or_insert(0) += *v;
            }
        }
        out
    }

    /// Drains pending updates and joins the thread. Later updates are dropped.
    pub fn stop(&self) {
        self.updates.close();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
            info!("statistics collector stopped");
        }
    }
}

impl Statistics for StatisticsCollector {
    fn add_counter(&self, node: PartitionId, submission: SubmissionId, name: &str, delta: i64) {
        let update = Update {
            node,
            submission,
            name: name.to_owned(),
            delta,
        };
        if self.updates.try_push(update).is_err() {
            warn!(
                node = %node,
                submission = %submission,
                counter = name,
                delta,
                "statistics queue full or closed, dropping update"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_across_nodes() {
        let stats = StatisticsCollector::spawn(64);
        let sub = SubmissionId::new(1);
        stats.add_counter(PartitionId::new(0), sub, counters::CHAINS_PROCESSED, 2);
        stats.add_counter(PartitionId::new(1), sub, counters::CHAINS_PROCESSED, 3);
        stats.add_counter(PartitionId::new(1), SubmissionId::new(2), counters::CHAINS_PROCESSED, 9);
        stats.stop();

        assert_eq!(stats.counter(sub, counters::CHAINS_PROCESSED), 5);
        let snap = stats.snapshot(sub);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[counters::CHAINS_PROCESSED], 5);
    }

    #[test]
    fn updates_after_stop_are_dropped() {
        let stats = StatisticsCollector::spawn(4);
        stats.stop();
        stats.add_counter(PartitionId::new(0), SubmissionId::new(1), "x", 1);
        assert_eq!(stats.counter(SubmissionId::new(1), "x"), 0);
    }

    #[test]
    fn records_input_name() {
        assert_eq!(
            counters::records_input(crate::types::InputLayerId::new(2)),
            "Records input 2"
        );
    }
}
