//! # Metrics Aggregator
//!
//! Append-then-aggregate counters for one simulation run. The engine
//! records raw observations as they happen; [`MetricsAggregator::snapshot`]
//! computes derived figures (block rate, latency percentiles) on
//! demand so the hot path stays counter increments.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::{sim_time_to_secs, MessageKind, SimTime};

#[derive(Debug, Default)]
pub struct MetricsAggregator {
    blocks_finalized: u64,
    rounds_completed: u64,
    view_changes: u64,
    quorum_failures: u64,
    sent: BTreeMap<MessageKind, u64>,
    delivered: BTreeMap<MessageKind, u64>,
    dropped: BTreeMap<MessageKind, u64>,
    stale: u64,
    /// Proposal-to-finalization latency per finalized block.
    latencies: Vec<SimTime>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self, kind: MessageKind) {
        *self.sent.entry(kind).or_default() += 1;
    }

    pub fn record_delivered(&mut self, kind: MessageKind) {
        *self.delivered.entry(kind).or_default() += 1;
    }

    pub fn record_dropped(&mut self, kind: MessageKind) {
        *self.dropped.entry(kind).or_default() += 1;
    }

    pub fn record_stale(&mut self) {
        self.stale += 1;
    }

    pub fn record_view_change(&mut self) {
        self.view_changes += 1;
    }

    pub fn record_quorum_failure(&mut self) {
        self.quorum_failures += 1;
        self.rounds_completed += 1;
    }

    pub fn record_finalized(&mut self, latency: SimTime) {
        self.blocks_finalized += 1;
        self.rounds_completed += 1;
        self.latencies.push(latency);
    }

    pub fn blocks_finalized(&self) -> u64 {
        self.blocks_finalized
    }

    /// Aggregate view over everything recorded so far. `now` is the
    /// current simulated time, used for the block rate denominator.
    pub fn snapshot(&self, now: SimTime) -> MetricsSnapshot {
        let elapsed = sim_time_to_secs(now);
        let block_rate = if elapsed > 0.0 {
            self.blocks_finalized as f64 / elapsed
        } else {
            0.0
        };

        let mut sorted = self.latencies.clone();
        sorted.sort_unstable();
        let avg_latency_secs = if sorted.is_empty() {
            0.0
        } else {
            sim_time_to_secs(sorted.iter().sum::<SimTime>() / sorted.len() as u64)
        };
        let p95_latency_secs = percentile(&sorted, 0.95).map(sim_time_to_secs).unwrap_or(0.0);

        MetricsSnapshot {
            blocks_finalized: self.blocks_finalized,
            rounds_completed: self.rounds_completed,
            view_changes: self.view_changes,
            quorum_failures: self.quorum_failures,
            block_rate,
            avg_latency_secs,
            p95_latency_secs,
            messages_sent: count_map(&self.sent),
            messages_delivered: count_map(&self.delivered),
            messages_dropped: count_map(&self.dropped),
            stale_messages: self.stale,
        }
    }
}

fn count_map(map: &BTreeMap<MessageKind, u64>) -> BTreeMap<String, u64> {
    map.iter().map(|(k, v)| (k.as_str().to_owned(), *v)).collect()
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[SimTime], q: f64) -> Option<SimTime> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((q * sorted.len() as f64).ceil() as usize).max(1) - 1;
    sorted.get(rank.min(sorted.len() - 1)).copied()
}

/// Point-in-time aggregate of a run, serialized into `status()`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub blocks_finalized: u64,
    pub rounds_completed: u64,
    pub view_changes: u64,
    pub quorum_failures: u64,
    /// Finalized blocks per simulated second.
    pub block_rate: f64,
    pub avg_latency_secs: f64,
    pub p95_latency_secs: f64,
    pub messages_sent: BTreeMap<String, u64>,
    pub messages_delivered: BTreeMap<String, u64>,
    pub messages_dropped: BTreeMap<String, u64>,
    pub stale_messages: u64,
}
