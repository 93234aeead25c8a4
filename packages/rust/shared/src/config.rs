//! Application configuration for NeuraMemory.
//!
//! User config lives at `~/.neuramemory/neuramemory.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{NeuraMemoryError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "neuramemory.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".neuramemory";

// ---------------------------------------------------------------------------
// Config structs (matching neuramemory.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Database location.
    #[serde(default)]
    pub storage: StorageConfig,

    /// LLM provider settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Semantic recall and profile limits.
    #[serde(default)]
    pub recall: RecallConfig,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the libSQL database file. `~` expands to the home directory.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "~/.neuramemory/memory.db".into()
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Provider REST endpoint.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model used for classification.
    #[serde(default = "default_model")]
    pub model: String,

    /// Model used for embeddings.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Optional file overriding the built-in classifier prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier_prompt_path: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_model(),
            embedding_model: default_embedding_model(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            classifier_prompt_path: None,
        }
    }
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".into()
}
fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".into()
}
fn default_model() -> String {
    "gemini-2.5-flash".into()
}
fn default_embedding_model() -> String {
    "text-embedding-004".into()
}
fn default_temperature() -> f32 {
    0.4
}
fn default_timeout_secs() -> u64 {
    30
}

/// `[recall]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallConfig {
    /// Maximum memories returned by semantic recall.
    #[serde(default = "default_recall_limit")]
    pub limit: usize,

    /// Minimum cosine similarity for a recalled memory.
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f32,

    /// Maximum facts per category when building a profile.
    #[serde(default = "default_profile_limit")]
    pub profile_limit: usize,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            limit: default_recall_limit(),
            match_threshold: default_match_threshold(),
            profile_limit: default_profile_limit(),
        }
    }
}

fn default_recall_limit() -> usize {
    5
}
fn default_match_threshold() -> f32 {
    0.6
}
fn default_profile_limit() -> usize {
    50
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.neuramemory/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| NeuraMemoryError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.neuramemory/neuramemory.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| NeuraMemoryError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        NeuraMemoryError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| NeuraMemoryError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| NeuraMemoryError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| NeuraMemoryError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the LLM API key from the configured env var.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.llm.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(NeuraMemoryError::config(format!(
            "LLM API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| NeuraMemoryError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}
