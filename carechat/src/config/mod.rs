//! Configuration system for the CareChat client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/carechat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use carechat_proto::contact::ContactResolver;
use carechat_proto::identity::DEFAULT_PRECEDENCE;
use carechat_proto::party::PartyType;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A value parsed but cannot be used.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Config key, e.g. `chat.event_buffer`.
        key: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    chat: ChatFileConfig,
    identity: IdentityFileConfig,
    notifications: NotificationFileConfig,
    storage: StorageFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    socket_url: Option<String>,
    api_url: Option<String>,
    connect_timeout_secs: Option<u64>,
    reconnect_base_delay_ms: Option<u64>,
    max_retries: Option<u32>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    history_page_size: Option<usize>,
    typing_timeout_secs: Option<u64>,
    ack_timeout_secs: Option<u64>,
    event_buffer: Option<usize>,
    timestamp_format: Option<String>,
}

/// `[identity]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct IdentityFileConfig {
    party_precedence: Option<Vec<PartyType>>,
    bare_id_type: Option<PartyType>,
    fallback_type: Option<PartyType>,
}

/// `[notifications]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NotificationFileConfig {
    toast_duration_ms: Option<u64>,
    system_toast_duration_ms: Option<u64>,
    vibration_pattern: Option<Vec<u32>>,
    tone_frequencies_hz: Option<Vec<u32>>,
    tone_step_ms: Option<u64>,
}

/// `[storage]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Reconnect policy for the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay: Duration,
    /// Retries allowed after a failure before giving up.
    pub max_retries: u32,
    /// Timeout for a single connect attempt.
    pub connect_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_retries: 5,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

/// Chat session tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Messages requested per history page.
    pub history_page_size: usize,
    /// Quiet period after the last keystroke before `stop_typing` is sent.
    pub typing_timeout: Duration,
    /// How long a sent message may stay unconfirmed before it is failed.
    pub ack_timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_page_size: 20,
            typing_timeout: Duration::from_secs(3),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

/// Identity rules: who "we" are and how bare contact tokens are typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConfig {
    /// Order in which cached profiles are tried for the local party.
    pub party_precedence: Vec<PartyType>,
    /// Type given to bare numeric contact ids.
    pub bare_id_type: PartyType,
    /// Type given to unrecognised contact tokens.
    pub fallback_type: PartyType,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            party_precedence: DEFAULT_PRECEDENCE.to_vec(),
            bare_id_type: PartyType::Caregiver,
            fallback_type: PartyType::User,
        }
    }
}

impl IdentityConfig {
    /// Contact resolver using these defaults.
    #[must_use]
    pub const fn resolver(&self) -> ContactResolver {
        ContactResolver::new(self.bare_id_type, self.fallback_type)
    }
}

/// Notification presentation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationConfig {
    /// How long a message toast stays up.
    pub toast_duration: Duration,
    /// How long a system or error toast stays up.
    pub system_toast_duration: Duration,
    /// Vibration pattern in milliseconds (on, off, on, ...).
    pub vibration_pattern: Vec<u32>,
    /// Tone frequencies in Hz, played in sequence.
    pub tone_frequencies_hz: Vec<u32>,
    /// Duration of each tone step.
    pub tone_step: Duration,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            toast_duration: Duration::from_millis(5000),
            system_toast_duration: Duration::from_millis(8000),
            vibration_pattern: vec![200, 100, 200],
            tone_frequencies_hz: vec![800, 600, 800],
            tone_step: Duration::from_millis(100),
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Server --
    /// Chat server WebSocket URL.
    pub socket_url: String,
    /// REST API base URL.
    pub api_url: String,
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,

    // -- Chat --
    /// Chat session tuning.
    pub chat: ChatConfig,
    /// Buffer size for event channels.
    pub event_buffer: usize,
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,

    // -- Identity / notifications / storage --
    /// Identity rules.
    pub identity: IdentityConfig,
    /// Notification settings.
    pub notifications: NotificationConfig,
    /// Local store path; `None` uses the platform data directory.
    pub storage_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_url: "ws://127.0.0.1:9000/ws".to_string(),
            api_url: "http://127.0.0.1:8000".to_string(),
            reconnect: ReconnectConfig::default(),
            chat: ChatConfig::default(),
            event_buffer: 64,
            timestamp_format: "%H:%M".to_string(),
            identity: IdentityConfig::default(),
            notifications: NotificationConfig::default(),
            storage_path: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path
    /// (`~/.config/carechat/config.toml`) is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or holds a value that cannot be used.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid {
                key: "chat.event_buffer",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            socket_url: cli
                .socket_url
                .clone()
                .or_else(|| file.server.socket_url.clone())
                .unwrap_or(defaults.socket_url),
            api_url: cli
                .api_url
                .clone()
                .or_else(|| file.server.api_url.clone())
                .unwrap_or(defaults.api_url),
            reconnect: ReconnectConfig {
                base_delay: file
                    .server
                    .reconnect_base_delay_ms
                    .map_or(defaults.reconnect.base_delay, Duration::from_millis),
                max_retries: file
                    .server
                    .max_retries
                    .unwrap_or(defaults.reconnect.max_retries),
                connect_timeout: file
                    .server
                    .connect_timeout_secs
                    .map_or(defaults.reconnect.connect_timeout, Duration::from_secs),
            },
            chat: ChatConfig {
                history_page_size: file
                    .chat
                    .history_page_size
                    .unwrap_or(defaults.chat.history_page_size),
                typing_timeout: file
                    .chat
                    .typing_timeout_secs
                    .map_or(defaults.chat.typing_timeout, Duration::from_secs),
                ack_timeout: file
                    .chat
                    .ack_timeout_secs
                    .map_or(defaults.chat.ack_timeout, Duration::from_secs),
            },
            event_buffer: file.chat.event_buffer.unwrap_or(defaults.event_buffer),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.chat.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
            identity: IdentityConfig {
                party_precedence: file
                    .identity
                    .party_precedence
                    .clone()
                    .filter(|p| !p.is_empty())
                    .unwrap_or(defaults.identity.party_precedence),
                bare_id_type: file
                    .identity
                    .bare_id_type
                    .unwrap_or(defaults.identity.bare_id_type),
                fallback_type: file
                    .identity
                    .fallback_type
                    .unwrap_or(defaults.identity.fallback_type),
            },
            notifications: NotificationConfig {
                toast_duration: file
                    .notifications
                    .toast_duration_ms
                    .map_or(defaults.notifications.toast_duration, Duration::from_millis),
                system_toast_duration: file
                    .notifications
                    .system_toast_duration_ms
                    .map_or(defaults.notifications.system_toast_duration, Duration::from_millis),
                vibration_pattern: file
                    .notifications
                    .vibration_pattern
                    .clone()
                    .unwrap_or(defaults.notifications.vibration_pattern),
                tone_frequencies_hz: file
                    .notifications
                    .tone_frequencies_hz
                    .clone()
                    .unwrap_or(defaults.notifications.tone_frequencies_hz),
                tone_step: file
                    .notifications
                    .tone_step_ms
                    .map_or(defaults.notifications.tone_step, Duration::from_millis),
            },
            storage_path: cli
                .storage
                .clone()
                .or_else(|| file.storage.path.clone()),
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Caregiver marketplace chat client")]
pub struct CliArgs {
    /// WebSocket URL of the chat server.
    #[arg(long, env = "CARECHAT_SOCKET_URL")]
    pub socket_url: Option<String>,

    /// Base URL of the REST API.
    #[arg(long, env = "CARECHAT_API_URL")]
    pub api_url: Option<String>,

    /// Contact to open on startup (`caregiver_42`, `42`, ...).
    #[arg(long)]
    pub contact: Option<String>,

    /// Sign in as `<type>_<id>` before connecting (requires `--token`).
    #[arg(long, requires = "token")]
    pub sign_in: Option<String>,

    /// Bearer credential stored with `--sign-in`.
    #[arg(long, env = "CARECHAT_TOKEN")]
    pub token: Option<String>,

    /// Display name stored with `--sign-in`.
    #[arg(long)]
    pub name: Option<String>,

    /// Path to config file (default: `~/.config/carechat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path to the local store (default: `<data dir>/carechat/storage.json`).
    #[arg(long)]
    pub storage: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CARECHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/carechat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("carechat").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(1000));
        assert_eq!(config.reconnect.max_retries, 5);
        assert_eq!(config.chat.history_page_size, 20);
        assert_eq!(config.chat.typing_timeout, Duration::from_secs(3));
        assert_eq!(config.chat.ack_timeout, Duration::from_secs(10));
        assert_eq!(
            config.identity.party_precedence,
            vec![PartyType::User, PartyType::Caregiver, PartyType::Admin]
        );
        assert_eq!(config.identity.bare_id_type, PartyType::Caregiver);
        assert_eq!(config.identity.fallback_type, PartyType::User);
        assert_eq!(config.notifications.toast_duration, Duration::from_millis(5000));
        assert_eq!(config.notifications.vibration_pattern, vec![200, 100, 200]);
        assert_eq!(config.notifications.tone_frequencies_hz, vec![800, 600, 800]);
        assert_eq!(config.timestamp_format, "%H:%M");
    }

    #[test]
    fn backoff_doubles_from_base() {
        let rc = ReconnectConfig::default();
        let delays: Vec<u64> = (1..=5)
            .map(|a| u64::try_from(rc.delay_for(a).as_millis()).unwrap())
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(rc.delay_for(0), Duration::from_millis(1000));
        // Saturates instead of overflowing.
        assert!(rc.delay_for(200) >= rc.delay_for(31));
    }

    #[test]
    fn toml_parsing_full() {
        let toml_str = r#"
[server]
socket_url = "wss://chat.example.com/ws"
api_url = "https://api.example.com"
connect_timeout_secs = 30
reconnect_base_delay_ms = 500
max_retries = 3

[chat]
history_page_size = 50
typing_timeout_secs = 5
ack_timeout_secs = 20
event_buffer = 128
timestamp_format = "%H:%M:%S"

[identity]
party_precedence = ["caregiver", "user"]
bare_id_type = "user"
fallback_type = "admin"

[notifications]
toast_duration_ms = 8000
vibration_pattern = [100]
tone_frequencies_hz = [440]
tone_step_ms = 250

[storage]
path = "/var/lib/carechat/store.json"
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let cli = CliArgs::default();
        let config = ClientConfig::resolve(&cli, &file);

        assert_eq!(config.socket_url, "wss://chat.example.com/ws");
        assert_eq!(config.api_url, "https://api.example.com");
        assert_eq!(config.reconnect.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(500));
        assert_eq!(config.reconnect.max_retries, 3);
        assert_eq!(config.chat.history_page_size, 50);
        assert_eq!(config.chat.typing_timeout, Duration::from_secs(5));
        assert_eq!(config.chat.ack_timeout, Duration::from_secs(20));
        assert_eq!(config.event_buffer, 128);
        assert_eq!(config.timestamp_format, "%H:%M:%S");
        assert_eq!(
            config.identity.party_precedence,
            vec![PartyType::Caregiver, PartyType::User]
        );
        assert_eq!(config.identity.bare_id_type, PartyType::User);
        assert_eq!(config.identity.fallback_type, PartyType::Admin);
        assert_eq!(config.notifications.toast_duration, Duration::from_millis(8000));
        assert_eq!(config.notifications.vibration_pattern, vec![100]);
        assert_eq!(config.notifications.tone_frequencies_hz, vec![440]);
        assert_eq!(config.notifications.tone_step, Duration::from_millis(250));
        assert_eq!(
            config.storage_path,
            Some(PathBuf::from("/var/lib/carechat/store.json"))
        );
    }

    #[test]
    fn zero_event_buffer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[chat]\nevent_buffer = 0\n").unwrap();
        let cli = CliArgs {
            config: Some(path),
            ..CliArgs::default()
        };

        let err = ClientConfig::load(&cli).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "chat.event_buffer",
                ..
            }
        ));
    }

    #[test]
    fn toml_parsing_partial() {
        let toml_str = r#"
[server]
max_retries = 8
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let config = ClientConfig::resolve(&CliArgs::default(), &file);

        assert_eq!(config.reconnect.max_retries, 8);
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(1000));
        assert_eq!(config.socket_url, "ws://127.0.0.1:9000/ws");
        assert_eq!(config.chat.history_page_size, 20);
    }

    #[test]
    fn empty_precedence_falls_back_to_default() {
        let file: ConfigFile = toml::from_str("[identity]\nparty_precedence = []\n").unwrap();
        let config = ClientConfig::resolve(&CliArgs::default(), &file);
        assert_eq!(config.identity.party_precedence, DEFAULT_PRECEDENCE.to_vec());
    }

    #[test]
    fn unknown_party_type_is_a_parse_error() {
        let result: Result<ConfigFile, _> = toml::from_str("[identity]\nbare_id_type = \"guest\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn cli_overrides_file() {
        let toml_str = r#"
[server]
socket_url = "ws://file:9000/ws"
api_url = "http://file:8000"

[storage]
path = "/file/store.json"
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let cli = CliArgs {
            socket_url: Some("ws://cli:9000/ws".to_string()),
            storage: Some(PathBuf::from("/cli/store.json")),
            ..Default::default()
        };
        let config = ClientConfig::resolve(&cli, &file);

        assert_eq!(config.socket_url, "ws://cli:9000/ws");
        assert_eq!(config.api_url, "http://file:8000");
        assert_eq!(config.storage_path, Some(PathBuf::from("/cli/store.json")));
    }

    #[test]
    fn explicit_missing_config_file_returns_error() {
        let result = load_config_file(Some(std::path::Path::new("/nonexistent/config.toml")));
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }

    #[test]
    fn resolver_uses_identity_defaults() {
        let identity = IdentityConfig {
            bare_id_type: PartyType::Admin,
            ..IdentityConfig::default()
        };
        let party = identity.resolver().resolve("5", None).unwrap();
        assert_eq!(party.kind, PartyType::Admin);
    }
}
