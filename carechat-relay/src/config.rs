//! Relay settings.
//!
//! Resolved from, in order of precedence: command-line flags (with
//! `RELAY_*` environment fallbacks), the TOML file at
//! `<config_dir>/carechat-relay/config.toml`, then built-in defaults.
//!
//! ```toml
//! [listen]
//! addr = "127.0.0.1:9000"
//!
//! [messages]
//! max_content_len = 32768
//!
//! [rooms]
//! open = false
//! ```

use std::path::{Path, PathBuf};

use crate::relay::RelayPolicy;

/// Default listen address.
pub const DEFAULT_ADDR: &str = "0.0.0.0:9000";

/// A config file that could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists (or was named explicitly) but could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// File that was tried.
        path: PathBuf,
        /// I/O failure.
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("invalid relay config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileSettings {
    listen: ListenSection,
    messages: MessagesSection,
    rooms: RoomsSection,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ListenSection {
    addr: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct MessagesSection {
    max_content_len: Option<usize>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RoomsSection {
    open: Option<bool>,
}

/// Command-line flags.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "CareChat development relay")]
pub struct RelayCliArgs {
    /// Listen address.
    #[arg(short, long, env = "RELAY_ADDR")]
    pub bind: Option<String>,

    /// Config file; must exist when given.
    #[arg(short, long, env = "RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Reject message content above this many bytes.
    #[arg(long)]
    pub max_content_len: Option<usize>,

    /// Let authenticated parties join rooms that are not theirs.
    #[arg(long)]
    pub open_rooms: bool,

    /// Tracing filter, e.g. `info` or `carechat_relay=debug`.
    #[arg(long, default_value = "info", env = "RELAY_LOG")]
    pub log_level: String,
}

/// Effective relay settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Listen address.
    pub bind_addr: String,
    /// Rules handed to [`crate::relay::RelayState`].
    pub policy: RelayPolicy,
    /// Tracing filter.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_ADDR.to_string(),
            policy: RelayPolicy::default(),
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Read the config file (if any) and merge it under the flags.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] when an explicit file is missing, or any file is
    /// unreadable or malformed.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => read_settings(path)?,
            None => match default_path() {
                Some(path) if path.exists() => read_settings(&path)?,
                _ => FileSettings::default(),
            },
        };
        Ok(Self::merge(cli, file))
    }

    fn merge(cli: &RelayCliArgs, file: FileSettings) -> Self {
        let fallback = RelayPolicy::default();
        Self {
            bind_addr: cli
                .bind
                .clone()
                .or(file.listen.addr)
                .unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            policy: RelayPolicy {
                max_content_len: cli
                    .max_content_len
                    .or(file.messages.max_content_len)
                    .unwrap_or(fallback.max_content_len),
                open_rooms: cli.open_rooms || file.rooms.open.unwrap_or(fallback.open_rooms),
            },
            log_level: cli.log_level.clone(),
        }
    }
}

fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("carechat-relay").join("config.toml"))
}

fn read_settings(path: &Path) -> Result<FileSettings, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&text)?)
}
