use anyhow::Result;
use bomberboy_net::SessionConfig;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/session.toml";

/// Settings read from `config/session.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct GameConfig {
    /// Simulation and network updates per second.
    pub tick_rate: u32,
    /// Seconds a hosted session runs before shutting down; 0 runs forever.
    pub run_seconds: u64,
    pub session: SessionConfig,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            tick_rate: 30,
            run_seconds: 0,
            session: SessionConfig::default(),
        }
    }
}

impl GameConfig {
    /// Load configuration from an explicit path, falling back to defaults on errors.
    pub fn load_from_path(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<GameConfig>(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}. Using defaults", path.display());
                    GameConfig::default()
                }
            },
            Err(err) => {
                if err.kind() == std::io::ErrorKind::NotFound {
                    warn!("Session config not found at {}. Using defaults", path.display());
                } else {
                    warn!("Failed to read {}: {err}. Using defaults", path.display());
                }
                GameConfig::default()
            }
        }
    }

    /// Save configuration to an explicit path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let toml = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml)?;
        Ok(())
    }

    /// Tick length in seconds.
    pub fn tick_seconds(&self) -> f32 {
        1.0 / self.tick_rate.clamp(1, 240) as f32
    }
}
