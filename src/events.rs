//! Event records and WebSocket message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A localized (or rejected) position in meters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// One listener's contribution to an event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReading {
    /// Clock-corrected arrival timestamp (ms)
    pub adjusted_ts: f64,
    /// Peak loudness of the detected clap
    pub peak: f64,
}

/// A committed acoustic event.
///
/// `position` and `residual` are null when the solver rejected the group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SoundEvent {
    pub id: u64,
    pub position: Option<Position>,
    pub residual: Option<f64>,
    pub devices: HashMap<String, DeviceReading>,
    pub timespan_ms: f64,
    pub timestamp: DateTime<Utc>,
}

/// Messages pushed to WebSocket clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    /// Sent once on connect
    Connected { message: String },
    /// Pushed for every committed event
    SoundEvent { event: SoundEvent },
}
