//! Arena configuration
//!
//! Loaded from `arena.toml`. Every field has a default, so an absent file
//! or an empty document yields a working setup.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{CardCatalog, CardDefinition};

/// Top-level configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub battle: BattleRules,
    #[serde(default)]
    pub client: ClientTiming,
    /// Card catalog; the built-in deck when empty
    #[serde(default)]
    pub cards: Vec<CardDefinition>,
}

impl Config {
    /// Load from a file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.client.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig("client.poll_interval_ms must be positive".into()));
        }
        if self.client.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig("client.request_timeout_ms must be positive".into()));
        }
        if self.battle.max_health == 0 {
            return Err(Error::InvalidConfig("battle.max_health must be positive".into()));
        }
        Ok(())
    }

    pub fn catalog(&self) -> CardCatalog {
        if self.cards.is_empty() {
            CardCatalog::default()
        } else {
            CardCatalog::from_definitions(self.cards.iter().cloned())
        }
    }
}

/// `[server]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Ended sessions are pruned this long after archival
    #[serde(default = "default_archive_retention")]
    pub archive_retention_hours: u32,
}

impl ServerSettings {
    pub fn archive_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.archive_retention_hours))
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            archive_retention_hours: default_archive_retention(),
        }
    }
}

/// What an incorrect answer costs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncorrectAnswerPolicy {
    /// Turn passes, nobody is damaged
    #[default]
    NoDamage,
    /// The answering player takes `self_damage_amount`
    SelfDamage,
}

/// `[battle]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleRules {
    #[serde(default = "default_max_health")]
    pub max_health: u32,
    #[serde(default = "default_base_damage")]
    pub base_damage: u32,
    #[serde(default)]
    pub incorrect_answer: IncorrectAnswerPolicy,
    #[serde(default = "default_self_damage")]
    pub self_damage_amount: u32,
    #[serde(default = "default_answer_window")]
    pub answer_window_secs: u64,
    #[serde(default = "default_time_extension")]
    pub time_extension_secs: u64,
    #[serde(default = "default_disconnect_grace")]
    pub disconnect_grace_secs: u64,
}

impl BattleRules {
    pub fn answer_window(&self) -> Duration {
        Duration::from_secs(self.answer_window_secs)
    }

    pub fn time_extension(&self) -> Duration {
        Duration::from_secs(self.time_extension_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }
}

impl Default for BattleRules {
    fn default() -> Self {
        Self {
            max_health: default_max_health(),
            base_damage: default_base_damage(),
            incorrect_answer: IncorrectAnswerPolicy::default(),
            self_damage_amount: default_self_damage(),
            answer_window_secs: default_answer_window(),
            time_extension_secs: default_time_extension(),
            disconnect_grace_secs: default_disconnect_grace(),
        }
    }
}

/// `[client]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTiming {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

impl ClientTiming {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ClientTiming {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7341
}

fn default_archive_retention() -> u32 {
    24 * 7
}

fn default_max_health() -> u32 {
    100
}

fn default_base_damage() -> u32 {
    20
}

fn default_self_damage() -> u32 {
    10
}

fn default_answer_window() -> u64 {
    30
}

fn default_time_extension() -> u64 {
    15
}

fn default_disconnect_grace() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_request_timeout() -> u64 {
    5000
}
