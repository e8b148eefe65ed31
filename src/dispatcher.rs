//! Mode dispatcher
//!
//! Runs the onset detector on a validated packet and routes the result to
//! the sync coordinator or the pending queue, depending on the current
//! mode. The whole state transition for one packet happens under a single
//! write lock, and a committed event is broadcast before the caller sees
//! the outcome.

use crate::config::Config;
use crate::detector::{self, Detection, Sample};
use crate::events::{BroadcastMessage, SoundEvent};
use crate::solver::{self, Receiver, Solve};
use crate::state::{Mode, SharedState};
use crate::sync::SyncProgress;
use crate::correlator::Correlation;
use tracing::{debug, info};

/// Why the solver rejected a grouped triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Infeasible,
    OutOfRoom,
}

impl RejectReason {
    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::Infeasible => {
                "time differences exceed the inter-listener distances"
            }
            RejectReason::OutOfRoom => "solution falls outside the room bounds",
        }
    }
}

/// Outcome of dispatching one packet, shaped into JSON by the server.
#[derive(Debug, Clone)]
pub enum PacketOutcome {
    NoClap { mode: Mode },
    Sync(SyncProgress),
    Pending { reported: Vec<String>, waiting: Vec<String> },
    Localized { event: SoundEvent },
    Rejected { event: SoundEvent, reason: RejectReason },
}

/// Detect an onset in the packet and advance the state machine.
pub async fn dispatch(
    state: &SharedState,
    config: &Config,
    listener_id: &str,
    samples: &[Sample],
) -> PacketOutcome {
    let detection = detector::detect_onset(listener_id, samples, config.clap_threshold);
    let now_ms = chrono::Utc::now().timestamp_millis() as f64;

    let mut core = state.core.write().await;

    let onset = match detection {
        Detection::NoClap => {
            debug!(listener_id, mode = %core.mode, "packet below clap threshold");
            return PacketOutcome::NoClap { mode: core.mode };
        }
        Detection::Detected(onset) => onset,
    };

    match core.mode {
        Mode::Sync => {
            let progress = core.record_sync(&onset, now_ms);
            if let SyncProgress::SessionComplete { ref offsets, .. } = progress {
                info!(?offsets, "sync session complete, switching to localize mode");
            }
            PacketOutcome::Sync(progress)
        }
        Mode::Localize => {
            core.push_pending(&onset, now_ms);
            match core.pending.resolve(now_ms) {
                Correlation::Pending { reported, waiting } => {
                    PacketOutcome::Pending { reported, waiting }
                }
                Correlation::Grouped(group) => {
                    // Receivers in configured listener order; the group
                    // already matches it.
                    let receivers: Vec<Receiver> = group
                        .iter()
                        .map(|p| {
                            let listener = config
                                .listener(&p.listener_id)
                                .expect("grouped packet from unknown listener");
                            Receiver {
                                x: listener.x,
                                y: listener.y,
                                t_ms: p.adjusted_ts_ms,
                            }
                        })
                        .collect();
                    let receivers: [Receiver; 3] =
                        [receivers[0], receivers[1], receivers[2]];

                    let solve = solver::solve(&receivers, config.speed_of_sound, &config.room);
                    let event = core.commit_event(&group, &solve);
                    state.broadcast(BroadcastMessage::SoundEvent { event: event.clone() });

                    match solve {
                        Solve::Solved { x, y, residual } => {
                            info!(event_id = event.id, x, y, residual, "event localized");
                            PacketOutcome::Localized { event }
                        }
                        Solve::Infeasible => {
                            info!(event_id = event.id, "group rejected, infeasible geometry");
                            PacketOutcome::Rejected { event, reason: RejectReason::Infeasible }
                        }
                        Solve::OutOfRoom => {
                            info!(event_id = event.id, "group rejected, outside room bounds");
                            PacketOutcome::Rejected { event, reason: RejectReason::OutOfRoom }
                        }
                    }
                }
            }
        }
    }
}
