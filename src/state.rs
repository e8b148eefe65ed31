//! Shared service state
//!
//! All mutable state (mode, clock offsets, sync progress, pending queue,
//! event log) lives behind one lock so multi-field transitions stay
//! atomic with respect to each other. The broadcast sender for WebSocket
//! fan-out lives beside the lock; a send never blocks and a dropped
//! client never stalls a commit.

use crate::config::Config;
use crate::correlator::{PendingPacket, PendingQueue};
use crate::detector::Onset;
use crate::events::{BroadcastMessage, DeviceReading, Position, SoundEvent};
use crate::solver::Solve;
use crate::sync::{SyncProgress, SyncTracker};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{broadcast, RwLock};

/// Oldest events beyond this are dropped in FIFO order.
const EVENT_RETENTION: usize = 100;

/// Operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Sync,
    Localize,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Sync => write!(f, "sync"),
            Mode::Localize => write!(f, "localize"),
        }
    }
}

/// Everything the dispatcher mutates, guarded by a single lock.
#[derive(Debug)]
pub struct CoreState {
    pub mode: Mode,
    pub offsets: HashMap<String, f64>,
    pub sync: SyncTracker,
    pub pending: PendingQueue,
    pub events: VecDeque<SoundEvent>,
    next_event_id: u64,
    listener_ids: Vec<String>,
}

impl CoreState {
    pub fn new(config: &Config) -> Self {
        let listener_ids = config.listener_ids();
        Self {
            mode: Mode::Localize,
            offsets: HashMap::new(),
            sync: SyncTracker::new(
                listener_ids.clone(),
                config.sync_window_ms,
                config.sync_rounds,
            ),
            pending: PendingQueue::new(listener_ids.clone(), config.event_window_ms),
            events: VecDeque::new(),
            next_event_id: 1,
            listener_ids,
        }
    }

    /// Switch mode. Entering sync invalidates the committed offsets; any
    /// switch abandons the sync session in progress.
    pub fn set_mode(&mut self, mode: Mode) {
        if mode == Mode::Sync {
            self.offsets.clear();
        }
        self.sync.reset();
        self.mode = mode;
    }

    /// Record a sync onset; flips to localize when the session completes.
    pub fn record_sync(&mut self, onset: &Onset, now_ms: f64) -> SyncProgress {
        let progress = self.sync.record(onset, now_ms, &mut self.offsets);
        if matches!(progress, SyncProgress::SessionComplete { .. }) {
            self.mode = Mode::Localize;
        }
        progress
    }

    /// Queue an onset for correlation with its clock correction applied.
    /// Missing offsets mean the operator bypassed sync; raw time is used.
    pub fn push_pending(&mut self, onset: &Onset, now_ms: f64) {
        let offset = self.offsets.get(&onset.listener_id).copied().unwrap_or(0.0);
        self.pending.push(PendingPacket {
            listener_id: onset.listener_id.clone(),
            raw_ts_ms: onset.onset_ts_ms,
            adjusted_ts_ms: onset.onset_ts_ms + offset,
            loudness: onset.peak_loudness,
            received_at_ms: now_ms,
        });
    }

    /// Commit an event for a grouped triple and the solver's verdict.
    pub fn commit_event(&mut self, group: &[PendingPacket], solve: &Solve) -> SoundEvent {
        let (position, residual) = match *solve {
            Solve::Solved { x, y, residual } => (Some(Position { x, y }), Some(residual)),
            Solve::Infeasible | Solve::OutOfRoom => (None, None),
        };

        let ts_max = group
            .iter()
            .map(|p| p.adjusted_ts_ms)
            .fold(f64::NEG_INFINITY, f64::max);
        let ts_min = group
            .iter()
            .map(|p| p.adjusted_ts_ms)
            .fold(f64::INFINITY, f64::min);

        let devices: HashMap<String, DeviceReading> = group
            .iter()
            .map(|p| {
                (
                    p.listener_id.clone(),
                    DeviceReading {
                        adjusted_ts: p.adjusted_ts_ms,
                        peak: p.loudness,
                    },
                )
            })
            .collect();

        let event = SoundEvent {
            id: self.next_event_id,
            position,
            residual,
            devices,
            timespan_ms: ts_max - ts_min,
            timestamp: chrono::Utc::now(),
        };
        self.next_event_id += 1;

        self.events.push_back(event.clone());
        while self.events.len() > EVENT_RETENTION {
            self.events.pop_front();
        }

        event
    }

    /// Whether every configured listener has a committed offset.
    pub fn is_synced(&self) -> bool {
        self.listener_ids
            .iter()
            .all(|id| self.offsets.contains_key(id))
    }

    /// All-time committed event count (retention does not reduce it).
    pub fn total_events(&self) -> u64 {
        self.next_event_id - 1
    }
}

/// Shared state accessible by all handlers.
pub struct SharedState {
    pub core: RwLock<CoreState>,
    event_tx: broadcast::Sender<BroadcastMessage>,
}

impl SharedState {
    pub fn new(config: &Config) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            core: RwLock::new(CoreState::new(config)),
            event_tx,
        }
    }

    /// Broadcast to all WebSocket listeners. No receivers is OK.
    pub fn broadcast(&self, message: BroadcastMessage) {
        let _ = self.event_tx.send(message);
    }

    /// Subscribe to the event stream for a WebSocket connection.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.event_tx.subscribe()
    }

    /// Number of connected WebSocket clients.
    pub fn client_count(&self) -> usize {
        self.event_tx.receiver_count()
    }

    pub async fn mode(&self) -> Mode {
        self.core.read().await.mode
    }

    pub async fn offsets(&self) -> HashMap<String, f64> {
        self.core.read().await.offsets.clone()
    }

    pub async fn events_snapshot(&self) -> Vec<SoundEvent> {
        self.core.read().await.events.iter().cloned().collect()
    }

    pub async fn latest_event(&self) -> Option<SoundEvent> {
        self.core.read().await.events.back().cloned()
    }
}
