//! Persisted configuration.
//!
//! Stored as TOML. Every field has a default so a partial file (or none at
//! all) is valid.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::Result;

const CONFIG_FILE: &str = "flashkit.toml";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "flashkit", "flashkit")
}

/// UI theme selector. Persisted for the front end, unused by the core.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    System,
    Light,
    Dark,
}

impl std::str::FromStr for Theme {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Ok(Theme::System),
            "light" => Ok(Theme::Light),
            "dark" => Ok(Theme::Dark),
            _ => Err(()),
        }
    }
}

/// User-configured tool locations.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub adb: Option<PathBuf>,
    pub fastboot: Option<PathBuf>,
    pub mask_rom: Option<PathBuf>,
}

/// Mask-ROM tool capability and invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskRomConfig {
    /// Whether mask-ROM support is present at all.
    pub enabled: bool,
    /// Executable name looked up on PATH and in install locations.
    pub executable: String,
    /// Arguments of the detect subcommand.
    pub detect_args: Vec<String>,
}

impl Default for MaskRomConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            executable: "bromtool".to_string(),
            detect_args: vec!["detect".to_string()],
        }
    }
}

/// Fixed timeouts per operation class, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub probe_secs: u64,
    pub device_list_secs: u64,
    pub reboot_secs: u64,
    pub mask_rom_detect_secs: u64,
    pub command_secs: u64,
    pub flash_secs: u64,
    pub backup_secs: u64,
    pub download_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            probe_secs: 2,
            device_list_secs: 10,
            reboot_secs: 15,
            mask_rom_detect_secs: 30,
            command_secs: 60,
            flash_secs: 300,
            backup_secs: 300,
            download_secs: 300,
        }
    }
}

impl Timeouts {
    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }

    pub fn device_list(&self) -> Duration {
        Duration::from_secs(self.device_list_secs)
    }

    pub fn reboot(&self) -> Duration {
        Duration::from_secs(self.reboot_secs)
    }

    pub fn mask_rom_detect(&self) -> Duration {
        Duration::from_secs(self.mask_rom_detect_secs)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn flash(&self) -> Duration {
        Duration::from_secs(self.flash_secs)
    }

    pub fn backup(&self) -> Duration {
        Duration::from_secs(self.backup_secs)
    }

    pub fn download(&self) -> Duration {
        Duration::from_secs(self.download_secs)
    }
}

/// Per-partition retry policy for flashing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 2000,
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub theme: Theme,
    /// Where downloaded tools are installed. Defaults to the data dir.
    pub tools_dir: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub tools: ToolPaths,
    /// Mirror overrides keyed by tool name.
    pub mirrors: HashMap<String, Vec<String>>,
    pub mask_rom: MaskRomConfig,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            theme: Theme::default(),
            tools_dir: None,
            poll_interval_ms: 3000,
            tools: ToolPaths::default(),
            mirrors: HashMap::new(),
            mask_rom: MaskRomConfig::default(),
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load from `path`, or return defaults when the file does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Platform config location, e.g. `~/.config/flashkit/flashkit.toml`.
    pub fn default_path() -> PathBuf {
        project_dirs()
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
    }

    /// Directory that downloaded tool packages are extracted into.
    pub fn tools_dir(&self) -> PathBuf {
        self.tools_dir.clone().unwrap_or_else(|| {
            project_dirs()
                .map(|dirs| dirs.data_dir().join("tools"))
                .unwrap_or_else(|| PathBuf::from("tools"))
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Set a single dotted key from the command line.
    pub fn set_key(&mut self, key: &str, value: &str) -> Result<()> {
        let path = || {
            if value.is_empty() {
                None
            } else {
                Some(PathBuf::from(value))
            }
        };
        match key {
            "theme" => self.theme = parse_value(key, value)?,
            "tools.adb" => self.tools.adb = path(),
            "tools.fastboot" => self.tools.fastboot = path(),
            "tools.mask_rom" => self.tools.mask_rom = path(),
            "tools_dir" => self.tools_dir = path(),
            "mask_rom.enabled" => self.mask_rom.enabled = parse_value(key, value)?,
            "mask_rom.executable" => self.mask_rom.executable = value.to_string(),
            "retry.max_attempts" => self.retry.max_attempts = parse_value(key, value)?,
            "retry.delay_ms" => self.retry.delay_ms = parse_value(key, value)?,
            "poll_interval_ms" => self.poll_interval_ms = parse_value(key, value)?,
            _ => {
                return Err(crate::error::FlashError::Config(format!(
                    "unknown key: {}",
                    key
                )));
            }
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        crate::error::FlashError::Config(format!("invalid value for {}: {}", key, value))
    })
}
