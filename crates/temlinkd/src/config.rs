//! Daemon configuration.
//!
//! Sources, lowest priority first: built-in defaults, an optional TOML
//! file, the `TEMLINK_SOCKET` environment variable, command-line flags.
//! Every key is optional in the file.
//!
//! ```toml
//! socket_path = "/run/temlink.sock"
//! trans_tol = 60.0
//! rot_tol = 0.0034906585
//! beam_settle_ms = 200
//!
//! [magnification]
//! standard = [2000, 2500, 3000]
//! low = [50, 60, 80]
//!
//! [simulator]
//! stage_speed = 2000.0
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use temlink_core::{
    MagnificationTable, MagnificationTables, Tolerances, DEFAULT_ROT_TOL, DEFAULT_TRANS_TOL,
};
use tracing::debug;

use crate::bridge::{BridgeSettings, DEFAULT_MODE_SELECT_ATTEMPTS};
use crate::hardware::SimulatorSettings;
use crate::server::DEFAULT_SOCKET_PATH;

/// Environment variable overriding the gateway socket path.
pub const SOCKET_ENV_VAR: &str = "TEMLINK_SOCKET";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config file {path}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Ordered magnification tables; selector index = position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MagnificationConfig {
    pub standard: Vec<u32>,
    pub low: Vec<u32>,
}

impl Default for MagnificationConfig {
    fn default() -> Self {
        Self {
            standard: vec![2000],
            low: vec![50],
        }
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub socket_path: PathBuf,
    pub trans_tol: f64,
    pub rot_tol: f64,
    pub beam_settle_ms: u64,
    pub tick_ms: u64,
    pub fast_stage_period_ms: u64,
    pub slow_stage_period_ms: u64,
    pub scope_period_ms: u64,
    pub mode_select_attempts: u32,
    pub magnification: MagnificationConfig,
    pub simulator: SimulatorSettings,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            trans_tol: DEFAULT_TRANS_TOL,
            rot_tol: DEFAULT_ROT_TOL,
            beam_settle_ms: 200,
            tick_ms: 10,
            fast_stage_period_ms: 20,
            slow_stage_period_ms: 1000,
            scope_period_ms: 1000,
            mode_select_attempts: DEFAULT_MODE_SELECT_ATTEMPTS,
            magnification: MagnificationConfig::default(),
            simulator: SimulatorSettings::default(),
        }
    }
}

impl BridgeConfig {
    /// Parses a TOML document. Missing keys keep their defaults.
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Reads and parses a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Self::from_toml(&text, path)
    }

    /// Loads `path` if given, otherwise starts from defaults, then applies
    /// the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(std::env::var(SOCKET_ENV_VAR).ok());
        Ok(config)
    }

    /// Applies an environment override for the socket path.
    pub fn apply_env(&mut self, socket: Option<String>) {
        if let Some(socket) = socket.filter(|s| !s.is_empty()) {
            self.socket_path = PathBuf::from(socket);
        }
    }

    /// Rejects values the bridge cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("trans_tol", self.trans_tol)?;
        positive("rot_tol", self.rot_tol)?;

        for (field, value) in [
            ("tick_ms", self.tick_ms),
            ("fast_stage_period_ms", self.fast_stage_period_ms),
            ("slow_stage_period_ms", self.slow_stage_period_ms),
            ("scope_period_ms", self.scope_period_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than 0".to_string(),
                });
            }
        }

        if self.mode_select_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "mode_select_attempts",
                reason: "must be at least 1".to_string(),
            });
        }

        positive("simulator.stage_speed", self.simulator.stage_speed)?;
        positive("simulator.tilt_speed_deg", self.simulator.tilt_speed_deg)?;

        self.tables().map(|_| ())
    }

    /// Builds the magnification tables.
    pub fn tables(&self) -> Result<MagnificationTables, ConfigError> {
        Ok(MagnificationTables::new(
            table("magnification.standard", &self.magnification.standard)?,
            table("magnification.low", &self.magnification.low)?,
        ))
    }

    /// Validated bridge tunables.
    pub fn bridge_settings(&self) -> Result<BridgeSettings, ConfigError> {
        self.validate()?;
        let tolerances =
            Tolerances::new(self.trans_tol, self.rot_tol).map_err(|e| ConfigError::Invalid {
                field: "tolerances",
                reason: e.to_string(),
            })?;

        Ok(BridgeSettings {
            tolerances,
            tables: self.tables()?,
            beam_settle: Duration::from_millis(self.beam_settle_ms),
            fast_stage_period: Duration::from_millis(self.fast_stage_period_ms),
            slow_stage_period: Duration::from_millis(self.slow_stage_period_ms),
            scope_period: Duration::from_millis(self.scope_period_ms),
            mode_select_attempts: self.mode_select_attempts,
        })
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

fn table(field: &'static str, values: &[u32]) -> Result<MagnificationTable, ConfigError> {
    MagnificationTable::new(field, values.to_vec()).map_err(|e| ConfigError::Invalid {
        field,
        reason: e.to_string(),
    })
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("{value} is not a positive number"),
        })
    }
}
