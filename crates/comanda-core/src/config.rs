use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ComandaError;

/// Top-level Comanda configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub comanda: ComandaConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub menu: MenuConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComandaConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ComandaConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

/// Upstream agent service config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_base_url")]
    pub base_url: String,
    /// Value forwarded as `restaurant_name` on every chat request.
    #[serde(default = "default_restaurant")]
    pub restaurant_name: String,
    /// Reply relayed when the agent response carries no text.
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
    /// HTTP request timeout in seconds.
    #[serde(default = "default_agent_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: default_agent_base_url(),
            restaurant_name: default_restaurant(),
            fallback_reply: default_fallback_reply(),
            request_timeout_secs: default_agent_timeout_secs(),
        }
    }
}

/// Conversation history store config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_db_path")]
    pub db_path: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            db_path: default_history_db_path(),
        }
    }
}

/// Onboarding menu document config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuConfig {
    /// Path to the menu file sent on first contact.
    #[serde(default = "default_menu_path")]
    pub path: String,
    #[serde(default = "default_menu_caption")]
    pub caption: String,
    /// Re-send the menu once a conversation has been idle this long.
    #[serde(default = "default_resend_after_hours")]
    pub resend_after_hours: i64,
}

impl Default for MenuConfig {
    fn default() -> Self {
        Self {
            path: default_menu_path(),
            caption: default_menu_caption(),
            resend_after_hours: default_resend_after_hours(),
        }
    }
}

/// Batching and delivery tuning.
///
/// The defaults mirror the values the system has always run with; both are
/// kept configurable rather than hardcoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Quiescence window before an inbound batch is flushed.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Wall-clock ceiling on any single outbound send.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

/// Operator control channel (HTTP + WebSocket) config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_control_host")]
    pub host: String,
    #[serde(default = "default_control_port")]
    pub port: u16,
    /// How many recent inbound messages `/api/messages` retains.
    #[serde(default = "default_recent_buffer")]
    pub recent_buffer: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            host: default_control_host(),
            port: default_control_port(),
            recent_buffer: default_recent_buffer(),
        }
    }
}

// --- Default value functions ---

fn default_data_dir() -> String {
    "~/.comanda".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_agent_base_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_restaurant() -> String {
    "go_papa".to_string()
}
fn default_fallback_reply() -> String {
    "Estamos experimentando problemas, por favor intente más tarde".to_string()
}
fn default_agent_timeout_secs() -> u64 {
    30
}
fn default_history_db_path() -> String {
    "~/.comanda/history.db".to_string()
}
fn default_menu_path() -> String {
    "menu.pdf".to_string()
}
fn default_menu_caption() -> String {
    "MENU".to_string()
}
fn default_resend_after_hours() -> i64 {
    24
}
fn default_debounce_ms() -> u64 {
    5000
}
fn default_send_timeout_secs() -> u64 {
    25
}
fn default_control_host() -> String {
    "0.0.0.0".to_string()
}
fn default_control_port() -> u16 {
    3000
}
fn default_recent_buffer() -> usize {
    100
}

/// Expand `~` to home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

/// Load configuration from a TOML file.
///
/// Falls back to defaults if the file does not exist.
pub fn load(path: &str) -> Result<Config, ComandaError> {
    let path = Path::new(path);
    if !path.exists() {
        tracing::info!("Config file not found at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ComandaError::Config(format!("failed to read {}: {e}", path.display())))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| ComandaError::Config(format!("failed to parse config: {e}")))?;

    Ok(config)
}
