//! Configuration for the chat client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/blindly/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;
use std::time::Duration;

use crate::session::{ReconnectPolicy, SessionConfig};

/// Errors that can occur when loading client configuration.
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
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the client.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ClientConfigFile {
    server: ServerFileConfig,
    chat: ChatFileConfig,
    typing: TypingFileConfig,
    reconnect: ReconnectFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    url: Option<String>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    history_page_size: Option<usize>,
}

/// `[typing]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TypingFileConfig {
    quiet_ms: Option<u64>,
    remote_timeout_ms: Option<u64>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the chat client.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Blindly chat client")]
pub struct CliArgs {
    /// Chat server base URL.
    #[arg(short, long, env = "BLINDLY_SERVER")]
    pub server: Option<String>,

    /// Conversation to open.
    #[arg(long)]
    pub conversation: Option<String>,

    /// User id to connect as.
    #[arg(long, env = "BLINDLY_USER")]
    pub user: Option<String>,

    /// Path to config file (default: `~/.config/blindly/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Messages per history page.
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "BLINDLY_LOG")]
    pub log_level: String,

    /// Log file path (default: `$TMPDIR/blindly-chat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Chat server base URL (e.g., `ws://127.0.0.1:4000`).
    pub server_url: String,
    /// Messages per history page.
    pub history_page_size: usize,
    /// Quiet interval after the last keystroke, in milliseconds.
    pub typing_quiet_ms: u64,
    /// Remote typing display timeout, in milliseconds.
    pub remote_typing_timeout_ms: u64,
    /// Delay before the first reconnect attempt, in milliseconds.
    pub reconnect_initial_delay_ms: u64,
    /// Upper bound on the reconnect delay, in milliseconds.
    pub reconnect_max_delay_ms: u64,
    /// Reconnect attempt cap; `0` retries forever.
    pub reconnect_max_attempts: u32,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:4000".to_string(),
            history_page_size: 50,
            typing_quiet_ms: 2_000,
            remote_typing_timeout_ms: 6_000,
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            reconnect_max_attempts: 0,
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and a missing
    /// file is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ClientConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            server_url: cli
                .server
                .clone()
                .or_else(|| file.server.url.clone())
                .unwrap_or(defaults.server_url),
            history_page_size: cli
                .page_size
                .or(file.chat.history_page_size)
                .unwrap_or(defaults.history_page_size),
            typing_quiet_ms: file.typing.quiet_ms.unwrap_or(defaults.typing_quiet_ms),
            remote_typing_timeout_ms: file
                .typing
                .remote_timeout_ms
                .unwrap_or(defaults.remote_typing_timeout_ms),
            reconnect_initial_delay_ms: file
                .reconnect
                .initial_delay_ms
                .unwrap_or(defaults.reconnect_initial_delay_ms),
            reconnect_max_delay_ms: file
                .reconnect
                .max_delay_ms
                .unwrap_or(defaults.reconnect_max_delay_ms),
            reconnect_max_attempts: file
                .reconnect
                .max_attempts
                .unwrap_or(defaults.reconnect_max_attempts),
            log_level: cli.log_level.clone(),
        }
    }

    /// Session tunables derived from this configuration.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            history_page_size: self.history_page_size,
            typing_quiet: Duration::from_millis(self.typing_quiet_ms),
            remote_typing_timeout: Duration::from_millis(self.remote_typing_timeout_ms),
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
                max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
                max_attempts: self.reconnect_max_attempts,
            },
            ..SessionConfig::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the client.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<ClientConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ClientConfigFile::default());
        };
        config_dir.join("blindly").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ClientConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
