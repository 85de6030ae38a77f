// Run configuration: VIC-II model, how long to run, what to load.
// Stored as JSON in <config_dir>/phosphor-chipset/config.json

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::c64_emu::vic_ii::VicModel;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config: {e}"),
            ConfigError::Parse(e) => write!(f, "invalid config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// VIC-II revision ("mos6569"/"pal", "mos6567r8"/"ntsc",
    /// "mos6567r56a"/"old-ntsc").
    pub vic_model: VicModel,
    /// Frames to run before printing stats and exiting.
    pub frames: u32,
    /// .prg to load instead of the built-in demo.
    pub program: Option<PathBuf>,
    /// Log progress every N frames. 0 = quiet.
    pub report_interval: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vic_model: VicModel::Mos6569,
            frames: 50,
            program: None,
            report_interval: 50,
        }
    }
}

impl Config {
    /// Path to the config file.
    pub fn config_path() -> Option<PathBuf> {
        config_dir().map(|d| d.join("config.json"))
    }

    /// Load config from the default location, or return defaults if it is
    /// missing or unreadable.
    pub fn load() -> Self {
        let path = match Self::config_path() {
            Some(p) if p.exists() => p,
            _ => return Self::default(),
        };

        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("{}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json(&content)?;
        log::debug!("Config loaded from {}", path.display());
        Ok(config)
    }

    /// Parse config from a JSON string. Unknown fields are ignored,
    /// missing fields get defaults.
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()? + "\n")?;
        log::info!("Config saved to {}", path.display());
        Ok(())
    }
}

/// Get the application config directory.
fn config_dir() -> Option<PathBuf> {
    // macOS:   ~/Library/Application Support/phosphor-chipset/
    // Linux:   ~/.config/phosphor-chipset/
    // Windows: %APPDATA%/phosphor-chipset/

    #[cfg(target_os = "macos")]
    {
        let home = std::env::var("HOME").ok()?;
        Some(
            PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("phosphor-chipset"),
        )
    }

    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA").ok()?;
        Some(PathBuf::from(appdata).join("phosphor-chipset"))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
            return Some(PathBuf::from(xdg).join("phosphor-chipset"));
        }
        let home = std::env::var("HOME").ok()?;
        Some(PathBuf::from(home).join(".config").join("phosphor-chipset"))
    }
}
