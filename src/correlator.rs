//! Pending queue and event correlator
//!
//! Onsets arriving in localize mode wait here until one packet per
//! listener can be grouped into a coherent event. Grouping enumerates one
//! packet per listener in configured listener order, insertion order
//! within a listener, and accepts the first combination whose adjusted
//! timestamps span at most the event window. Packets that never find
//! peers are evicted once they age past ten event windows.

use std::collections::HashMap;
use tracing::debug;

/// Stale packets are evicted after this many event windows.
const STALE_EVICTION_FACTOR: f64 = 10.0;

/// An onset waiting to be grouped into an event.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPacket {
    pub listener_id: String,
    pub raw_ts_ms: f64,
    pub adjusted_ts_ms: f64,
    pub loudness: f64,
    pub received_at_ms: f64,
}

/// Outcome of a resolution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Correlation {
    /// Not every listener has reported yet, or no combination fits the
    /// window. `reported`/`waiting` reflect the queue after eviction.
    Pending {
        reported: Vec<String>,
        waiting: Vec<String>,
    },
    /// One packet per listener, in configured listener order.
    Grouped(Vec<PendingPacket>),
}

#[derive(Debug)]
pub struct PendingQueue {
    listener_ids: Vec<String>,
    event_window_ms: f64,
    packets: Vec<PendingPacket>,
}

impl PendingQueue {
    pub fn new(listener_ids: Vec<String>, event_window_ms: f64) -> Self {
        Self {
            listener_ids,
            event_window_ms,
            packets: Vec::new(),
        }
    }

    pub fn push(&mut self, packet: PendingPacket) {
        self.packets.push(packet);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Try to close a group. Called after every insertion.
    pub fn resolve(&mut self, now_ms: f64) -> Correlation {
        // Indices per listener, insertion order preserved
        let mut by_listener: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, packet) in self.packets.iter().enumerate() {
            by_listener
                .entry(packet.listener_id.clone())
                .or_default()
                .push(idx);
        }

        let complete = self
            .listener_ids
            .iter()
            .all(|id| by_listener.contains_key(id));
        if !complete {
            let (reported, waiting) = self.roster();
            return Correlation::Pending { reported, waiting };
        }

        let lists: Vec<&Vec<usize>> = self
            .listener_ids
            .iter()
            .map(|id| &by_listener[id])
            .collect();

        // First combination within the window wins
        for &i0 in lists[0] {
            for &i1 in lists[1] {
                for &i2 in lists[2] {
                    let triple = [i0, i1, i2];
                    let ts = triple.map(|i| self.packets[i].adjusted_ts_ms);
                    let span = ts.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b))
                        - ts.iter().fold(f64::INFINITY, |a, &b| a.min(b));
                    if span <= self.event_window_ms {
                        return Correlation::Grouped(self.take(triple));
                    }
                }
            }
        }

        // Nothing fits the window; age out packets that will never group
        self.evict_stale(now_ms);
        let (reported, waiting) = self.roster();
        Correlation::Pending { reported, waiting }
    }

    /// Remove exactly the grouped packets, returning them in the order of
    /// the indices given (configured listener order).
    fn take(&mut self, indices: [usize; 3]) -> Vec<PendingPacket> {
        let group: Vec<PendingPacket> = indices
            .iter()
            .map(|&i| self.packets[i].clone())
            .collect();
        let mut sorted = indices;
        sorted.sort_unstable();
        for &i in sorted.iter().rev() {
            self.packets.remove(i);
        }
        group
    }

    fn evict_stale(&mut self, now_ms: f64) {
        let horizon = STALE_EVICTION_FACTOR * self.event_window_ms;
        let before = self.packets.len();
        self.packets
            .retain(|p| now_ms - p.received_at_ms <= horizon);
        let evicted = before - self.packets.len();
        if evicted > 0 {
            debug!(evicted, "evicted stale pending packets");
        }
    }

    fn roster(&self) -> (Vec<String>, Vec<String>) {
        let reported: Vec<String> = self
            .listener_ids
            .iter()
            .filter(|id| self.packets.iter().any(|p| &p.listener_id == *id))
            .cloned()
            .collect();
        let waiting: Vec<String> = self
            .listener_ids
            .iter()
            .filter(|id| !reported.contains(id))
            .cloned()
            .collect();
        (reported, waiting)
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> Vec<String> {
        vec!["A".to_string(), "B".to_string(), "C".to_string()]
    }

    fn packet(id: &str, ts: f64, received_at: f64) -> PendingPacket {
        PendingPacket {
            listener_id: id.to_string(),
            raw_ts_ms: ts,
            adjusted_ts_ms: ts,
            loudness: 20_000.0,
            received_at_ms: received_at,
        }
    }

    #[test]
    fn reports_missing_listeners() {
        let mut queue = PendingQueue::new(ids(), 200.0);
        queue.push(packet("B", 100.0, 0.0));
        match queue.resolve(0.0) {
            Correlation::Pending { reported, waiting } => {
                assert_eq!(reported, vec!["B"]);
                assert_eq!(waiting, vec!["A", "C"]);
            }
            other => panic!("expected Pending, got {:?}", other),
        }
    }

    #[test]
    fn groups_one_packet_per_listener() {
        let mut queue = PendingQueue::new(ids(), 200.0);
        queue.push(packet("C", 110.0, 0.0));
        queue.push(packet("A", 100.0, 1.0));
        queue.push(packet("B", 130.0, 2.0));
        match queue.resolve(2.0) {
            Correlation::Grouped(group) => {
                // Configured listener order, not arrival order
                let order: Vec<&str> = group.iter().map(|p| p.listener_id.as_str()).collect();
                assert_eq!(order, vec!["A", "B", "C"]);
                assert!(queue.is_empty());
            }
            other => panic!("expected Grouped, got {:?}", other),
        }
    }

    #[test]
    fn wide_span_does_not_group() {
        let mut queue = PendingQueue::new(ids(), 200.0);
        queue.push(packet("A", 0.0, 0.0));
        queue.push(packet("B", 100.0, 1.0));
        queue.push(packet("C", 500.0, 2.0));
        assert!(matches!(queue.resolve(2.0), Correlation::Pending { .. }));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn earliest_insertion_wins_among_candidates() {
        let mut queue = PendingQueue::new(ids(), 200.0);
        // Two A packets could both close the group; the earlier one must
        queue.push(packet("A", 100.0, 0.0));
        queue.push(packet("A", 120.0, 1.0));
        queue.push(packet("B", 110.0, 2.0));
        match queue.resolve(3.0) {
            Correlation::Pending { waiting, .. } => assert_eq!(waiting, vec!["C"]),
            other => panic!("expected Pending, got {:?}", other),
        }
        queue.push(packet("C", 105.0, 3.0));
        match queue.resolve(3.0) {
            Correlation::Grouped(group) => {
                assert_eq!(group[0].adjusted_ts_ms, 100.0);
                // The second A packet stays queued
                assert_eq!(queue.len(), 1);
                assert_eq!(queue.packets[0].adjusted_ts_ms, 120.0);
            }
            other => panic!("expected Grouped, got {:?}", other),
        }
    }

    #[test]
    fn stale_packets_evicted_when_no_group_forms() {
        let mut queue = PendingQueue::new(ids(), 200.0);
        queue.push(packet("A", 0.0, 0.0));
        queue.push(packet("B", 5.0, 0.0));
        // C arrives much later; its onset cannot group with the old pair
        queue.push(packet("C", 5_000.0, 5_000.0));
        match queue.resolve(5_000.0) {
            Correlation::Pending { reported, waiting } => {
                assert_eq!(reported, vec!["C"]);
                assert_eq!(waiting, vec!["A", "B"]);
            }
            other => panic!("expected Pending, got {:?}", other),
        }
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn fresh_packets_survive_failed_resolution() {
        let mut queue = PendingQueue::new(ids(), 200.0);
        queue.push(packet("A", 0.0, 0.0));
        queue.push(packet("B", 1_000.0, 100.0));
        queue.resolve(100.0);
        assert_eq!(queue.len(), 2);
    }
}
