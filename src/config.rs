//! Configuration loading and resolution
//!
//! Resolution priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`ECHOLOCATE_CONFIG`)
//! 3. TOML config file in the platform config directory
//! 4. Compiled defaults (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// A configured listener: stable id and immutable 2-D position in meters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listener {
    pub id: String,
    pub x: f64,
    pub y: f64,
}

/// Axis-aligned room extent in meters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomBounds {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl RoomBounds {
    /// Whether `(x, y)` lies inside the room extended by `margin` meters
    /// on each side.
    pub fn contains_with_margin(&self, x: f64, y: f64, margin: f64) -> bool {
        x >= self.x_min - margin
            && x <= self.x_max + margin
            && y >= self.y_min - margin
            && y <= self.y_max + margin
    }
}

/// Service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host address to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
    /// Speed of sound in m/s
    pub speed_of_sound: f64,
    /// Minimum peak loudness for a packet to count as a clap
    pub clap_threshold: f64,
    /// Maximum span of adjusted timestamps groupable into one event (ms)
    pub event_window_ms: f64,
    /// Maximum age of a partial sync round before it is discarded (ms)
    pub sync_window_ms: f64,
    /// Number of complete rounds in one sync session
    pub sync_rounds: usize,
    /// Listeners required to localize; must equal the listener count
    pub min_devices_for_localization: usize,
    /// The three listeners, in the order used for grouping and solving
    pub listeners: Vec<Listener>,
    /// Room extent used by the solver's out-of-room gate
    pub room: RoomBounds,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5750,
            speed_of_sound: 343.0,
            clap_threshold: 10_000.0,
            event_window_ms: 200.0,
            sync_window_ms: 5_000.0,
            sync_rounds: 10,
            min_devices_for_localization: 3,
            listeners: vec![
                Listener { id: "A".to_string(), x: -5.0, y: -3.0 },
                Listener { id: "B".to_string(), x: 5.0, y: -3.0 },
                Listener { id: "C".to_string(), x: 0.0, y: 3.5 },
            ],
            room: RoomBounds {
                x_min: -6.0,
                x_max: 6.0,
                y_min: -4.0,
                y_max: 10.0,
            },
        }
    }
}

impl Config {
    /// Look up a listener by id.
    pub fn listener(&self, id: &str) -> Option<&Listener> {
        self.listeners.iter().find(|l| l.id == id)
    }

    /// Listener ids in configured order.
    pub fn listener_ids(&self) -> Vec<String> {
        self.listeners.iter().map(|l| l.id.clone()).collect()
    }

    /// Validate invariants the rest of the service assumes.
    pub fn validate(&self) -> Result<()> {
        if self.listeners.len() != 3 {
            return Err(Error::Config(format!(
                "exactly 3 listeners required, got {}",
                self.listeners.len()
            )));
        }
        let ids = self.listener_ids();
        for (i, id) in ids.iter().enumerate() {
            if ids[..i].contains(id) {
                return Err(Error::Config(format!("duplicate listener id: {}", id)));
            }
        }
        if self.min_devices_for_localization != self.listeners.len() {
            return Err(Error::Config(format!(
                "min_devices_for_localization must equal the listener count ({})",
                self.listeners.len()
            )));
        }
        if self.room.x_min >= self.room.x_max || self.room.y_min >= self.room.y_max {
            return Err(Error::Config("room bounds must have positive extent".to_string()));
        }
        if self.speed_of_sound <= 0.0 {
            return Err(Error::Config("speed_of_sound must be positive".to_string()));
        }
        if self.event_window_ms <= 0.0 || self.sync_window_ms <= 0.0 {
            return Err(Error::Config("event and sync windows must be positive".to_string()));
        }
        if self.sync_rounds == 0 {
            return Err(Error::Config("sync_rounds must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Resolve configuration following the priority order.
pub fn resolve_config(cli_path: Option<&Path>) -> Result<Config> {
    // Priority 1: command-line argument
    if let Some(path) = cli_path {
        info!("Loading configuration from {} (command line)", path.display());
        return load_config_file(path);
    }

    // Priority 2: environment variable
    if let Ok(path) = std::env::var("ECHOLOCATE_CONFIG") {
        info!("Loading configuration from {} (environment)", path);
        return load_config_file(Path::new(&path));
    }

    // Priority 3: platform config directory
    if let Some(path) = default_config_path() {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            return load_config_file(&path);
        }
    }

    // Priority 4: compiled defaults
    info!("No configuration file found, using defaults");
    Ok(Config::default())
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("echolocate").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listener_ids(), vec!["A", "B", "C"]);
    }

    #[test]
    fn rejects_wrong_listener_count() {
        let mut config = Config::default();
        config.listeners.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_listener_ids() {
        let mut config = Config::default();
        config.listeners[2].id = "A".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_min_devices_mismatch() {
        let mut config = Config::default();
        config.min_devices_for_localization = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_room_bounds() {
        let mut config = Config::default();
        config.room.x_min = 7.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn room_margin_extends_bounds() {
        let room = Config::default().room;
        assert!(room.contains_with_margin(6.5, -4.5, 2.0));
        assert!(!room.contains_with_margin(8.5, 0.0, 2.0));
        assert!(!room.contains_with_margin(0.0, 12.5, 2.0));
    }

    #[test]
    fn parses_toml_overrides() {
        let toml_src = r#"
            port = 6000
            clap_threshold = 5000.0

            [[listeners]]
            id = "north"
            x = 0.0
            y = 4.0

            [[listeners]]
            id = "east"
            x = 4.0
            y = 0.0

            [[listeners]]
            id = "west"
            x = -4.0
            y = 0.0

            [room]
            x_min = -5.0
            x_max = 5.0
            y_min = -5.0
            y_max = 5.0
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.clap_threshold, 5000.0);
        assert_eq!(config.listener_ids(), vec!["north", "east", "west"]);
        // Unspecified fields keep their defaults
        assert_eq!(config.sync_rounds, 10);
        assert!(config.validate().is_ok());
    }
}
