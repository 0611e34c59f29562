//! Engine configuration.
//!
//! Config file: ~/.config/gallus/config.toml or /etc/gallus/config.toml,
//! with `GALLUS_*` environment overrides applied on top. Every option has a
//! default; a missing file is not an error.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

use crate::llm_client::LlmConfig;

/// Extraction cache tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Master switch; disabled also suppresses the LLM sign fallback tier
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    /// Entry cap, deliberately conservative
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Entry lifetime
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Circuit-breaker ceiling, independent of `max_entries`
    #[serde(default = "default_emergency_ceiling")]
    pub emergency_ceiling: usize,
}

fn default_cache_enabled() -> bool {
    true
}

fn default_max_entries() -> usize {
    50
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_emergency_ceiling() -> usize {
    200
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            max_entries: default_max_entries(),
            ttl_secs: default_ttl_secs(),
            emergency_ceiling: default_emergency_ceiling(),
        }
    }
}

/// Conversation-state store tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// A session silent for longer than this has expired
    #[serde(default = "default_inactivity_secs")]
    pub inactivity_secs: u64,

    /// Explicit database path; `None` resolves to the user data directory
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// SQLite busy timeout, the deadline for durable-state calls
    #[serde(default = "default_db_busy_timeout_ms")]
    pub db_busy_timeout_ms: u64,
}

fn default_inactivity_secs() -> u64 {
    600
}

fn default_db_busy_timeout_ms() -> u64 {
    500
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_secs: default_inactivity_secs(),
            db_path: None,
            db_busy_timeout_ms: default_db_busy_timeout_ms(),
        }
    }
}

/// Main engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub llm: LlmConfig,
}

impl EngineConfig {
    /// Get default user config path: ~/.config/gallus/config.toml
    pub fn user_config_path() -> Result<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            if !xdg_config.is_empty() {
                return Ok(PathBuf::from(xdg_config).join("gallus").join("config.toml"));
            }
        }
        let home = std::env::var("HOME").context("Cannot determine home directory")?;
        Ok(Path::new(&home).join(".config").join("gallus").join("config.toml"))
    }

    /// Get system config path: /etc/gallus/config.toml
    pub fn system_config_path() -> PathBuf {
        PathBuf::from("/etc/gallus/config.toml")
    }

    /// Load configuration.
    ///
    /// Priority:
    /// 1. User config (~/.config/gallus/config.toml)
    /// 2. System config (/etc/gallus/config.toml)
    /// 3. Defaults
    ///
    /// `GALLUS_*` environment overrides apply on top of whichever source won,
    /// then limits are normalized.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_file()?;
        config.apply_env_overrides();
        Ok(config.normalized())
    }

    fn load_file() -> Result<Self> {
        if let Ok(user_path) = Self::user_config_path() {
            if user_path.exists() {
                return Self::from_path(&user_path);
            }
        }

        let system_path = Self::system_config_path();
        if system_path.exists() {
            return Self::from_path(&system_path);
        }

        Ok(Self::default())
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Apply `GALLUS_*` environment overrides. Malformed values are ignored
    /// with a warning rather than failing startup.
    pub fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_bool("GALLUS_CACHE_ENABLED") {
            self.cache.enabled = enabled;
        }
        if let Some(max_entries) = env_parse("GALLUS_CACHE_MAX_ENTRIES") {
            self.cache.max_entries = max_entries;
        }
        if let Some(ttl_secs) = env_parse("GALLUS_CACHE_TTL_SECS") {
            self.cache.ttl_secs = ttl_secs;
        }
        if let Some(ceiling) = env_parse("GALLUS_CACHE_EMERGENCY_CEILING") {
            self.cache.emergency_ceiling = ceiling;
        }
        if let Some(inactivity_secs) = env_parse("GALLUS_SESSION_INACTIVITY_SECS") {
            self.session.inactivity_secs = inactivity_secs;
        }
        if let Ok(db_path) = std::env::var("GALLUS_SESSION_DB") {
            if !db_path.is_empty() {
                self.session.db_path = Some(PathBuf::from(db_path));
            }
        }
        if let Some(enabled) = env_bool("GALLUS_LLM_ENABLED") {
            self.llm.enabled = enabled;
        }
        if let Ok(endpoint) = std::env::var("GALLUS_LLM_ENDPOINT") {
            if !endpoint.is_empty() {
                self.llm.endpoint = endpoint;
            }
        }
        if let Ok(model) = std::env::var("GALLUS_LLM_MODEL") {
            if !model.is_empty() {
                self.llm.model = model;
            }
        }
        if let Some(timeout_secs) = env_parse("GALLUS_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = timeout_secs;
        }
        if let Ok(api_key) = std::env::var("GALLUS_LLM_API_KEY") {
            if !api_key.is_empty() {
                self.llm.api_key = Some(api_key);
            }
        }
    }

    /// Clamp limits into coherent ranges.
    ///
    /// The cleanup retention floor is 5 entries, so `max_entries` below 10
    /// would let a sweep leave the cache above its own cap.
    pub fn normalized(mut self) -> Self {
        if self.cache.max_entries < 10 {
            warn!(
                requested = self.cache.max_entries,
                "cache.max_entries below 10, clamping"
            );
            self.cache.max_entries = 10;
        }
        if self.cache.emergency_ceiling < self.cache.max_entries {
            warn!(
                requested = self.cache.emergency_ceiling,
                "cache.emergency_ceiling below max_entries, raising"
            );
            self.cache.emergency_ceiling = self.cache.max_entries;
        }
        self
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            warn!(name, value = other, "Ignoring unrecognized boolean");
            None
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(name, value = raw.as_str(), "Ignoring unparsable value");
            None
        }
    }
}
