//! Configuration management for powerd.
//!
//! Loads settings from /etc/powerd/config.toml, then the add-on data dir,
//! or uses defaults. An unreadable or invalid file is never fatal.

use power_common::{Layout, PowerError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/powerd/config.toml";

/// Fallback config file path
pub const DEFAULT_CONFIG_PATH: &str = "/home/pi/.webthings/data/power-settings/config.toml";

/// Daemon behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Verbose logging
    #[serde(default)]
    pub debug: bool,

    /// Skip hardware clock detection and forget it was initialized
    #[serde(default)]
    pub do_not_use_hardware_clock: bool,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Deadline for one process-table listing
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Deadline for commands the daemon waits on
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Delay between staging a reboot update and rebooting
    #[serde(default = "default_reboot_grace")]
    pub reboot_grace_secs: u64,

    /// Prefix for privileged commands; empty when running as root
    #[serde(default = "default_privilege_wrapper")]
    pub privilege_wrapper: Vec<String>,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8089".to_string()
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_command_timeout() -> u64 {
    60
}

fn default_reboot_grace() -> u64 {
    5 // long enough for the response to flush
}

fn default_privilege_wrapper() -> Vec<String> {
    privilege_wrapper_for(running_as_root())
}

pub fn running_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

/// Commands run directly as root; anyone else goes through `sudo -n`.
pub fn privilege_wrapper_for(root: bool) -> Vec<String> {
    if root {
        Vec::new()
    } else {
        vec!["sudo".to_string(), "-n".to_string()]
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            debug: false,
            do_not_use_hardware_clock: false,
            listen_addr: default_listen_addr(),
            probe_timeout_secs: default_probe_timeout(),
            command_timeout_secs: default_command_timeout(),
            reboot_grace_secs: default_reboot_grace(),
            privilege_wrapper: default_privilege_wrapper(),
        }
    }
}

/// Where update scripts come from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default = "default_system_update_url")]
    pub system_update_url: String,

    #[serde(default = "default_live_update_url")]
    pub live_update_url: String,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

fn default_system_update_url() -> String {
    "https://raw.githubusercontent.com/createcandle/install-scripts/main/create_latest_candle.sh"
        .to_string()
}

fn default_live_update_url() -> String {
    "https://raw.githubusercontent.com/createcandle/install-scripts/main/live_system_update.sh"
        .to_string()
}

fn default_fetch_timeout() -> u64 {
    60
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            system_update_url: default_system_update_url(),
            live_update_url: default_live_update_url(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

/// Full daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub paths: Layout,

    #[serde(default)]
    pub update: UpdateConfig,
}

impl Config {
    pub fn debug(&self) -> bool {
        self.daemon.debug
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.probe_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.command_timeout_secs)
    }

    pub fn reboot_grace(&self) -> Duration {
        Duration::from_secs(self.daemon.reboot_grace_secs)
    }

    /// Load from `explicit` if given, else the standard locations, else defaults.
    pub fn load(explicit: Option<&Path>) -> Self {
        let candidates: Vec<PathBuf> = match explicit {
            Some(path) => vec![path.to_path_buf()],
            None => vec![PathBuf::from(CONFIG_PATH), PathBuf::from(DEFAULT_CONFIG_PATH)],
        };

        for path in &candidates {
            match Self::load_from_path(path) {
                Ok(config) => return config,
                Err(e) => warn!("{}", e),
            }
        }

        warn!("Config not found, using defaults");
        Config::default()
    }

    /// Load config from specific path
    pub fn load_from_path(path: &Path) -> Result<Self, PowerError> {
        let content = fs::read_to_string(path).map_err(|e| {
            PowerError::ConfigUnavailable(format!("{}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| {
            PowerError::ConfigUnavailable(format!("{}: {}", path.display(), e))
        })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }
}
