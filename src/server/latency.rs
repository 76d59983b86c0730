// # Per-Server Latency Tracking
//
// Rolling RTT samples keyed by server id. Writers are completion/logic
// threads recording pong round-trips; readers are status dumps.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;

const MAX_SAMPLES: usize = 100;

#[derive(Debug, Default)]
struct ServerSamples {
    rtts: VecDeque<u64>,
    last_rtt_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencySnapshot {
    pub samples: usize,
    pub last_rtt_ms: u64,
    pub avg_rtt_ms: u64,
    pub min_rtt_ms: u64,
    pub max_rtt_ms: u64,
}

#[derive(Default)]
pub struct LatencyTracker {
    servers: DashMap<u32, ServerSamples>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, server_id: u32, rtt_ms: u64) {
        let mut entry = self.servers.entry(server_id).or_default();
        if entry.rtts.len() == MAX_SAMPLES {
            entry.rtts.pop_front();
        }
        entry.rtts.push_back(rtt_ms);
        entry.last_rtt_ms = rtt_ms;
    }

    pub fn snapshot(&self, server_id: u32) -> Option<LatencySnapshot> {
        let entry = self.servers.get(&server_id)?;
        if entry.rtts.is_empty() {
            return None;
        }

        let sum: u64 = entry.rtts.iter().sum();
        Some(LatencySnapshot {
            samples: entry.rtts.len(),
            last_rtt_ms: entry.last_rtt_ms,
            avg_rtt_ms: sum / entry.rtts.len() as u64,
            min_rtt_ms: *entry.rtts.iter().min().unwrap_or(&0),
            max_rtt_ms: *entry.rtts.iter().max().unwrap_or(&0),
        })
    }

    pub fn server_ids(&self) -> Vec<u32> {
        self.servers.iter().map(|e| *e.key()).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let tracker = LatencyTracker::new();
        tracker.record(1, 10);
        tracker.record(1, 30);
        tracker.record(1, 20);

        let snap = tracker.snapshot(1).unwrap();
        assert_eq!(snap.samples, 3);
        assert_eq!(snap.last_rtt_ms, 20);
        assert_eq!(snap.avg_rtt_ms, 20);
        assert_eq!(snap.min_rtt_ms, 10);
        assert_eq!(snap.max_rtt_ms, 30);
    }

    #[test]
    fn test_rolling_window_caps_samples() {
        let tracker = LatencyTracker::new();
        for i in 0..(MAX_SAMPLES as u64 + 50) {
            tracker.record(2, i);
        }
        let snap = tracker.snapshot(2).unwrap();
        assert_eq!(snap.samples, MAX_SAMPLES);
        assert_eq!(snap.min_rtt_ms, 50);
    }

    #[test]
    fn test_unknown_server_none() {
        let tracker = LatencyTracker::new();
        assert!(tracker.snapshot(99).is_none());
    }
}
