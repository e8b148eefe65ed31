//! Clap onset detection
//!
//! Reconstructs a sub-sample event-arrival timestamp from a short, noisy
//! loudness trace. The biggest positive jump locates the clap region; a
//! backward walk to the last below-threshold sample removes the
//! distance-dependent lateness bias a fat rising edge would otherwise
//! introduce, and linear interpolation recovers resolution finer than the
//! inter-sample spacing.

use tracing::warn;

/// One loudness reading in listener-local time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp_ms: f64,
    pub loudness: f64,
}

/// A detected clap arrival for one listener.
#[derive(Debug, Clone, PartialEq)]
pub struct Onset {
    pub listener_id: String,
    /// May be fractional (sub-sample interpolation)
    pub onset_ts_ms: f64,
    pub peak_loudness: f64,
}

/// Detection outcome for one packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    Detected(Onset),
    NoClap,
}

/// Detect the clap onset in a single-listener packet.
///
/// Input order is not trusted; samples are sorted by timestamp first.
pub fn detect_onset(listener_id: &str, samples: &[Sample], clap_threshold: f64) -> Detection {
    if samples.is_empty() {
        return Detection::NoClap;
    }

    let mut samples: Vec<Sample> = samples.to_vec();
    samples.sort_by(|a, b| a.timestamp_ms.total_cmp(&b.timestamp_ms));

    if samples.len() == 1 {
        return Detection::Detected(Onset {
            listener_id: listener_id.to_string(),
            onset_ts_ms: samples[0].timestamp_ms,
            peak_loudness: samples[0].loudness,
        });
    }

    // Earliest index of the largest first difference. Ties keep the
    // earlier index.
    let mut jump_idx = 1;
    let mut jump = samples[1].loudness - samples[0].loudness;
    for i in 2..samples.len() {
        let diff = samples[i].loudness - samples[i - 1].loudness;
        if diff > jump {
            jump = diff;
            jump_idx = i;
        }
    }

    let peak_loudness = samples[jump_idx].loudness;
    if peak_loudness < clap_threshold {
        return Detection::NoClap;
    }

    // Walk backward from the jump to the first sample whose predecessor is
    // still below threshold. That predecessor/successor pair brackets the
    // true crossing.
    let mut crossing = None;
    for i in (1..=jump_idx).rev() {
        if samples[i - 1].loudness < clap_threshold {
            crossing = Some(i);
            break;
        }
    }

    let crossing = match crossing {
        Some(c) => c,
        None => {
            warn!(
                listener_id,
                "no below-threshold sample precedes the jump, using earliest sample"
            );
            return Detection::Detected(Onset {
                listener_id: listener_id.to_string(),
                onset_ts_ms: samples[0].timestamp_ms,
                peak_loudness: samples[0].loudness,
            });
        }
    };

    let below = samples[crossing - 1];
    let above = samples[crossing];

    if below.timestamp_ms == above.timestamp_ms {
        warn!(
            listener_id,
            timestamp_ms = below.timestamp_ms,
            "zero-width interpolation interval"
        );
        return Detection::Detected(Onset {
            listener_id: listener_id.to_string(),
            onset_ts_ms: below.timestamp_ms,
            peak_loudness,
        });
    }

    let delta = above.loudness - below.loudness;
    let fraction = if delta > 0.0 {
        ((clap_threshold - below.loudness) / delta).clamp(0.0, 1.0)
    } else {
        0.5
    };
    let onset_ts_ms = below.timestamp_ms + fraction * (above.timestamp_ms - below.timestamp_ms);

    Detection::Detected(Onset {
        listener_id: listener_id.to_string(),
        onset_ts_ms,
        peak_loudness,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: f64 = 10_000.0;

    fn trace(points: &[(f64, f64)]) -> Vec<Sample> {
        points
            .iter()
            .map(|&(timestamp_ms, loudness)| Sample { timestamp_ms, loudness })
            .collect()
    }

    fn detected(samples: &[Sample]) -> Onset {
        match detect_onset("A", samples, THRESHOLD) {
            Detection::Detected(onset) => onset,
            Detection::NoClap => panic!("expected a detection"),
        }
    }

    #[test]
    fn empty_packet_is_no_clap() {
        assert_eq!(detect_onset("A", &[], THRESHOLD), Detection::NoClap);
    }

    #[test]
    fn single_sample_returned_unchanged() {
        let onset = detected(&trace(&[(100.0, 42.0)]));
        assert_eq!(onset.onset_ts_ms, 100.0);
        assert_eq!(onset.peak_loudness, 42.0);
    }

    #[test]
    fn quiet_trace_is_no_clap() {
        let samples = trace(&[(0.0, 100.0), (36.0, 400.0), (72.0, 9_000.0)]);
        assert_eq!(detect_onset("A", &samples, THRESHOLD), Detection::NoClap);
    }

    #[test]
    fn interpolates_threshold_crossing() {
        // Crossing is halfway between 5_000 and 15_000
        let samples = trace(&[(0.0, 100.0), (36.0, 5_000.0), (72.0, 15_000.0)]);
        let onset = detected(&samples);
        assert!((onset.onset_ts_ms - 54.0).abs() < 1e-9);
        assert_eq!(onset.peak_loudness, 15_000.0);
    }

    #[test]
    fn backward_walk_skips_fat_rising_edge() {
        // The biggest jump lands late in the edge; the onset must come
        // from the earlier below-threshold crossing.
        let samples = trace(&[
            (0.0, 500.0),
            (36.0, 12_000.0),
            (72.0, 13_000.0),
            (108.0, 30_000.0),
        ]);
        let onset = detected(&samples);
        // Crossing bracketed by (0.0, 500) and (36.0, 12_000)
        let expected = 0.0 + (THRESHOLD - 500.0) / (12_000.0 - 500.0) * 36.0;
        assert!((onset.onset_ts_ms - expected).abs() < 1e-9);
        assert_eq!(onset.peak_loudness, 30_000.0);
    }

    #[test]
    fn unsorted_input_is_sorted_first() {
        let sorted = trace(&[(0.0, 100.0), (36.0, 5_000.0), (72.0, 15_000.0)]);
        let shuffled = trace(&[(72.0, 15_000.0), (0.0, 100.0), (36.0, 5_000.0)]);
        assert_eq!(detected(&sorted), detected(&shuffled));
    }

    #[test]
    fn flat_top_trace_returns_earliest_sample() {
        // Every sample at or above threshold, no crossing to walk back to
        let samples = trace(&[(0.0, 20_000.0), (36.0, 20_000.0), (72.0, 25_000.0)]);
        let onset = detected(&samples);
        assert_eq!(onset.onset_ts_ms, 0.0);
        assert_eq!(onset.peak_loudness, 20_000.0);
    }

    #[test]
    fn fraction_is_clamped_to_interval() {
        // below already above zero but crossing fraction would exceed 1
        let samples = trace(&[(0.0, 9_999.0), (36.0, 10_000.0), (72.0, 40_000.0)]);
        let onset = detected(&samples);
        assert!(onset.onset_ts_ms >= 0.0 && onset.onset_ts_ms <= 36.0);
    }

    #[test]
    fn onset_shifts_with_constant_time_offset() {
        let base = trace(&[(0.0, 100.0), (36.0, 5_000.0), (72.0, 15_000.0), (108.0, 9_000.0)]);
        let shifted: Vec<Sample> = base
            .iter()
            .map(|s| Sample { timestamp_ms: s.timestamp_ms + 123.456, loudness: s.loudness })
            .collect();
        let a = detected(&base);
        let b = detected(&shifted);
        assert!((b.onset_ts_ms - a.onset_ts_ms - 123.456).abs() < 1e-9);
        assert_eq!(a.peak_loudness, b.peak_loudness);
    }

    #[test]
    fn tie_on_jump_keeps_earliest_index() {
        // Two equal jumps of 10_000; the first one wins, putting the peak
        // at the earlier sample.
        let samples = trace(&[(0.0, 0.0), (36.0, 10_000.0), (72.0, 10_000.0), (108.0, 20_000.0)]);
        let onset = detected(&samples);
        assert_eq!(onset.peak_loudness, 10_000.0);
        // Crossing bracketed by (0.0, 0) and (36.0, 10_000)
        assert!((onset.onset_ts_ms - 36.0).abs() < 1e-9);
    }
}
