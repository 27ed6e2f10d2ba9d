//! Configuration file support for stkflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (STKFLASH_*)
//! 3. Local config file (./stkflash.toml)
//! 4. Global config file (~/.config/stkflash/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use stkflash::BoardProfile;

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "stkflash.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Baud rate override (defaults to the board's baud rate).
    pub baud: Option<u32>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Default board name.
    pub board: Option<String>,
    /// Fail when the device signature does not match the board.
    #[serde(default)]
    pub check_signature: bool,
    /// Do not pulse DTR/RTS before flashing.
    #[serde(default)]
    pub no_reset: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
    /// User-defined boards, keyed by name.
    #[serde(default)]
    pub boards: BTreeMap<String, BoardProfile>,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "stkflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        // Connection config
        if other.connection.serial.is_some() {
            self.connection.serial = other.connection.serial;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }

        // Flash config
        if other.flash.board.is_some() {
            self.flash.board = other.flash.board;
        }
        if other.flash.check_signature {
            self.flash.check_signature = true;
        }
        if other.flash.no_reset {
            self.flash.no_reset = true;
        }

        self.boards.extend(other.boards);
    }

    /// Find a configured board by table key or profile name (case-insensitive).
    pub fn find_board(&self, name: &str) -> Option<BoardProfile> {
        self.boards
            .iter()
            .find(|(key, board)| key.eq_ignore_ascii_case(name) || board.name.eq_ignore_ascii_case(name))
            .map(|(_, board)| board.clone())
    }

    /// Resolve a board name against configured boards, then built-in boards.
    pub fn resolve_board(&self, name: &str) -> stkflash::Result<BoardProfile> {
        match self.find_board(name) {
            Some(board) => Ok(board),
            None => stkflash::find_board(name),
        }
    }

    /// Built-in boards followed by configured boards.
    ///
    /// A configured board replaces a built-in board of the same name.
    pub fn all_boards(&self) -> Vec<(BoardProfile, bool)> {
        let mut boards: Vec<(BoardProfile, bool)> = stkflash::builtin_boards()
            .into_iter()
            .filter(|builtin| self.find_board(&builtin.name).is_none())
            .map(|board| (board, false))
            .collect();
        boards.extend(self.boards.values().cloned().map(|board| (board, true)));
        boards
    }
}
