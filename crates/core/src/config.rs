//! Engine and analysis configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Settings for launching the engine and for default analysis parameters.
///
/// Every field has a default, so a config file only needs the keys it
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path to the engine binary (or a name resolved through PATH)
    pub path: PathBuf,
    pub args: Vec<String>,
    /// Upper bound for `uci` → `readyok`
    pub handshake_timeout_ms: u64,
    /// How long `quit` is given before the process is killed
    pub quit_grace_ms: u64,
    pub multi_pv: u32,
    pub depth: u32,
    /// Selection strength in [0, 1]
    pub strength: f64,
    /// Capacity of every channel between the pipeline's tasks
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("stockfish"),
            args: Vec::new(),
            handshake_timeout_ms: 10_000,
            quit_grace_ms: 100,
            multi_pv: 10,
            depth: 15,
            strength: 1.0,
            channel_capacity: 64,
        }
    }
}

impl EngineConfig {
    /// Loads a JSON config file and validates it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.strength) {
            return Err(Error::InvalidStrength(self.strength));
        }
        if self.multi_pv == 0 {
            return Err(Error::InvalidRequest("multi_pv must be at least 1".into()));
        }
        if self.depth == 0 {
            return Err(Error::InvalidRequest("depth must be at least 1".into()));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(Error::InvalidRequest("handshake_timeout_ms must be positive".into()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::InvalidRequest("channel_capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn quit_grace(&self) -> Duration {
        Duration::from_millis(self.quit_grace_ms)
    }
}
