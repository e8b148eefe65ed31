//! Clock synchronization coordinator
//!
//! Listener clocks are free-running; localization only needs their
//! differences. A sync session collects rounds of simultaneous claps, one
//! onset per listener per round, references each round to its earliest
//! onset, and commits the per-listener median offset over all rounds.
//! The median survives a failed detection in a single round, and the
//! per-listener dispersion over rounds is reported as a quality signal.

use crate::detector::Onset;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Per-listener round-offset dispersion above this is reported (ms).
const DISPERSION_WARN_MS: f64 = 5.0;

#[derive(Debug, Clone, Copy)]
struct BufferEntry {
    onset_ts_ms: f64,
    received_at_ms: f64,
}

/// Progress of the sync session after one onset was recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncProgress {
    /// Round still missing listeners
    Waiting {
        reported: Vec<String>,
        waiting: Vec<String>,
        round: usize,
    },
    /// A round completed but more are needed
    RoundComplete {
        round: usize,
        offsets: HashMap<String, f64>,
    },
    /// The session completed; offsets were committed
    SessionComplete {
        offsets: HashMap<String, f64>,
        std_devs: HashMap<String, f64>,
        rounds: usize,
    },
}

/// Accumulates sync rounds and derives clock offsets.
#[derive(Debug)]
pub struct SyncTracker {
    listener_ids: Vec<String>,
    window_ms: f64,
    target_rounds: usize,
    buffer: HashMap<String, BufferEntry>,
    rounds: Vec<HashMap<String, f64>>,
}

impl SyncTracker {
    pub fn new(listener_ids: Vec<String>, window_ms: f64, target_rounds: usize) -> Self {
        Self {
            listener_ids,
            window_ms,
            target_rounds,
            buffer: HashMap::new(),
            rounds: Vec::new(),
        }
    }

    /// Record one onset. `active_offsets` is the committed offset map; it
    /// is cleared when a fresh session begins and written when the session
    /// completes. The caller switches mode on `SessionComplete`.
    pub fn record(
        &mut self,
        onset: &Onset,
        now_ms: f64,
        active_offsets: &mut HashMap<String, f64>,
    ) -> SyncProgress {
        // A partial round older than the window is stale
        let stale = self
            .buffer
            .values()
            .any(|e| now_ms - e.received_at_ms > self.window_ms);
        if stale {
            debug!("discarding stale partial sync round");
            self.buffer.clear();
        }

        // First onset of a fresh session invalidates previous offsets
        if self.rounds.is_empty() && self.buffer.is_empty() {
            active_offsets.clear();
        }

        self.buffer.insert(
            onset.listener_id.clone(),
            BufferEntry {
                onset_ts_ms: onset.onset_ts_ms,
                received_at_ms: now_ms,
            },
        );

        if self.buffer.len() < self.listener_ids.len() {
            let reported: Vec<String> = self
                .listener_ids
                .iter()
                .filter(|id| self.buffer.contains_key(*id))
                .cloned()
                .collect();
            let waiting: Vec<String> = self
                .listener_ids
                .iter()
                .filter(|id| !self.buffer.contains_key(*id))
                .cloned()
                .collect();
            return SyncProgress::Waiting {
                reported,
                waiting,
                round: self.rounds.len() + 1,
            };
        }

        let round_offsets = self.finalize_round();
        if self.rounds.len() < self.target_rounds {
            return SyncProgress::RoundComplete {
                round: self.rounds.len(),
                offsets: round_offsets,
            };
        }

        self.finalize_session(active_offsets)
    }

    /// Reference each listener to the earliest onset in the round.
    fn finalize_round(&mut self) -> HashMap<String, f64> {
        let t_min = self
            .buffer
            .values()
            .map(|e| e.onset_ts_ms)
            .fold(f64::INFINITY, f64::min);

        let offsets: HashMap<String, f64> = self
            .buffer
            .iter()
            .map(|(id, e)| (id.clone(), t_min - e.onset_ts_ms))
            .collect();

        self.rounds.push(offsets.clone());
        self.buffer.clear();
        offsets
    }

    fn finalize_session(&mut self, active_offsets: &mut HashMap<String, f64>) -> SyncProgress {
        let mut offsets = HashMap::new();
        let mut std_devs = HashMap::new();

        for id in &self.listener_ids {
            let per_round: Vec<f64> = self
                .rounds
                .iter()
                .filter_map(|round| round.get(id).copied())
                .collect();
            let med = median(&per_round);
            let sd = std_dev(&per_round);
            if sd > DISPERSION_WARN_MS {
                warn!(
                    listener_id = id.as_str(),
                    std_dev_ms = sd,
                    "sync offset dispersion above {} ms",
                    DISPERSION_WARN_MS
                );
            }
            offsets.insert(id.clone(), med);
            std_devs.insert(id.clone(), sd);
        }

        let rounds = self.rounds.len();
        *active_offsets = offsets.clone();
        self.rounds.clear();
        self.buffer.clear();

        SyncProgress::SessionComplete {
            offsets,
            std_devs,
            rounds,
        }
    }

    /// Drop the partial round and any accumulated rounds.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.rounds.clear();
    }

    pub fn rounds_collected(&self) -> usize {
        self.rounds.len()
    }
}

/// Median; an even-sized list yields the mean of the two central values.
fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Population standard deviation.
fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn onset(id: &str, ts: f64) -> Onset {
        Onset {
            listener_id: id.to_string(),
            onset_ts_ms: ts,
            peak_loudness: 20_000.0,
        }
    }

    fn ids() -> Vec<String> {
        vec!["A".to_string(), "B".to_string(), "C".to_string()]
    }

    #[test]
    fn round_offsets_reference_earliest_listener() {
        let mut tracker = SyncTracker::new(ids(), 5_000.0, 2);
        let mut offsets = HashMap::new();

        let p = tracker.record(&onset("A", 1_015.0), 0.0, &mut offsets);
        assert!(matches!(p, SyncProgress::Waiting { ref waiting, .. } if waiting == &["B", "C"]));
        let p = tracker.record(&onset("B", 992.0), 10.0, &mut offsets);
        assert!(matches!(p, SyncProgress::Waiting { .. }));
        let p = tracker.record(&onset("C", 1_000.0), 20.0, &mut offsets);

        match p {
            SyncProgress::RoundComplete { round, offsets } => {
                assert_eq!(round, 1);
                assert_eq!(offsets["A"], -23.0);
                assert_eq!(offsets["B"], 0.0);
                assert_eq!(offsets["C"], -8.0);
            }
            other => panic!("expected RoundComplete, got {:?}", other),
        }
    }

    #[test]
    fn session_commits_median_offsets() {
        let mut tracker = SyncTracker::new(ids(), 5_000.0, 3);
        let mut offsets = HashMap::new();

        // Two clean rounds and one outlier round for A
        let drifts = [(15.0, -8.0, 0.0), (15.0, -8.0, 0.0), (40.0, -8.0, 0.0)];
        let mut last = None;
        for (round, (da, db, dc)) in drifts.iter().enumerate() {
            let t = 10_000.0 * (round as f64 + 1.0);
            tracker.record(&onset("A", t + da), t, &mut offsets);
            tracker.record(&onset("B", t + db), t, &mut offsets);
            last = Some(tracker.record(&onset("C", t + dc), t, &mut offsets));
        }

        match last.unwrap() {
            SyncProgress::SessionComplete { offsets: committed, std_devs, rounds } => {
                assert_eq!(rounds, 3);
                // Median ignores the outlier round
                assert_eq!(committed["A"], -23.0);
                assert_eq!(committed["B"], 0.0);
                assert_eq!(committed["C"], -8.0);
                assert!(std_devs["B"] < 1e-9);
                assert!(std_devs["A"] > 5.0);
            }
            other => panic!("expected SessionComplete, got {:?}", other),
        }
        assert_eq!(offsets["A"], -23.0);
        assert_eq!(tracker.rounds_collected(), 0);
    }

    #[test]
    fn stale_partial_round_is_discarded() {
        let mut tracker = SyncTracker::new(ids(), 5_000.0, 2);
        let mut offsets = HashMap::new();

        tracker.record(&onset("A", 100.0), 0.0, &mut offsets);
        tracker.record(&onset("B", 100.0), 10.0, &mut offsets);
        // C arrives after the window; A and B are dropped first
        let p = tracker.record(&onset("C", 100.0), 6_000.0, &mut offsets);
        assert!(matches!(p, SyncProgress::Waiting { ref waiting, .. } if waiting == &["A", "B"]));
    }

    #[test]
    fn fresh_session_clears_previous_offsets() {
        let mut tracker = SyncTracker::new(ids(), 5_000.0, 2);
        let mut offsets = HashMap::from([("A".to_string(), -3.0)]);
        tracker.record(&onset("A", 100.0), 0.0, &mut offsets);
        assert!(offsets.is_empty());
    }

    #[test]
    fn repeat_onset_overwrites_within_round() {
        let mut tracker = SyncTracker::new(ids(), 5_000.0, 1);
        let mut offsets = HashMap::new();

        tracker.record(&onset("A", 500.0), 0.0, &mut offsets);
        tracker.record(&onset("A", 480.0), 5.0, &mut offsets);
        tracker.record(&onset("B", 470.0), 10.0, &mut offsets);
        let p = tracker.record(&onset("C", 490.0), 15.0, &mut offsets);

        match p {
            SyncProgress::SessionComplete { offsets, .. } => {
                // The later A report (480) replaced the first
                assert_eq!(offsets["A"], -10.0);
                assert_eq!(offsets["B"], 0.0);
                assert_eq!(offsets["C"], -20.0);
            }
            other => panic!("expected SessionComplete, got {:?}", other),
        }
    }

    #[test]
    fn median_of_even_list_averages_central_pair() {
        assert_eq!(median(&[1.0, 2.0, 10.0, 4.0]), 3.0);
        assert_eq!(median(&[5.0]), 5.0);
        assert_eq!(median(&[2.0, 1.0, 3.0]), 2.0);
    }

    #[test]
    fn population_std_dev() {
        assert_eq!(std_dev(&[2.0, 2.0, 2.0]), 0.0);
        assert!((std_dev(&[1.0, 3.0]) - 1.0).abs() < 1e-12);
    }
}
