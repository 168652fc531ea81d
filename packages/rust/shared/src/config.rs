//! Application configuration for DesignLens.
//!
//! User config lives at `~/.designlens/designlens.toml`.
//! CLI flags override environment overrides, which override the config file,
//! which overrides defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{DesignLensError, Result};
use crate::types::Implementation;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "designlens.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".designlens";

/// Environment variables consulted after the config file.
pub const ENV_MODEL: &str = "DESIGNLENS_MODEL";
pub const ENV_TEMPERATURE: &str = "DESIGNLENS_TEMPERATURE";
pub const ENV_BASE_URL: &str = "DESIGNLENS_BASE_URL";

// ---------------------------------------------------------------------------
// Config structs (matching designlens.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Text-generation backend.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Object store and tracking table layout.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Executor used when a request does not name one.
    #[serde(default)]
    pub implementation: Implementation,

    /// Root for the tracking database and the object store.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Attach provenance metadata to persisted results.
    #[serde(default = "default_true")]
    pub include_metadata: bool,

    /// Deadline for each stage's text-generation call.
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            implementation: Implementation::default(),
            data_dir: default_data_dir(),
            include_metadata: true,
            stage_timeout_secs: default_stage_timeout(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.designlens/data".into()
}
fn default_true() -> bool {
    true
}
fn default_stage_timeout() -> u64 {
    180
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// OpenAI-compatible API root (`.../v1`).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model id sent with every request.
    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature, in `[0, 1]`.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// HTTP timeout for a single chat-completions call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Transport retries for rate limits and 5xx responses.
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout(),
            max_retries: 0,
        }
    }
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4-turbo-preview".into()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_request_timeout() -> u64 {
    120
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Key prefix for persisted analysis results.
    #[serde(default = "default_results_prefix")]
    pub results_prefix: String,

    /// Key prefix for uploaded research files.
    #[serde(default = "default_research_prefix")]
    pub research_prefix: String,

    /// Tracking database file, relative to `data_dir` unless absolute.
    #[serde(default = "default_tracking_db")]
    pub tracking_db: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            results_prefix: default_results_prefix(),
            research_prefix: default_research_prefix(),
            tracking_db: default_tracking_db(),
        }
    }
}

fn default_results_prefix() -> String {
    "analysis".into()
}
fn default_research_prefix() -> String {
    "research-data".into()
}
fn default_tracking_db() -> String {
    "tracking.db".into()
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.llm.temperature) {
            return Err(DesignLensError::config(format!(
                "llm.temperature must be between 0 and 1, got {}",
                self.llm.temperature
            )));
        }
        if self.defaults.stage_timeout_secs == 0 {
            return Err(DesignLensError::config(
                "defaults.stage_timeout_secs must be greater than 0",
            ));
        }
        if self.llm.model.trim().is_empty() {
            return Err(DesignLensError::config("llm.model must not be empty"));
        }
        Url::parse(&self.llm.base_url).map_err(|e| {
            DesignLensError::config(format!("llm.base_url '{}' is invalid: {e}", self.llm.base_url))
        })?;
        for (name, prefix) in [
            ("storage.results_prefix", &self.storage.results_prefix),
            ("storage.research_prefix", &self.storage.research_prefix),
        ] {
            if prefix.is_empty() || prefix.contains("..") || prefix.starts_with('/') {
                return Err(DesignLensError::config(format!(
                    "{name} must be a non-empty relative key prefix"
                )));
            }
        }
        Ok(())
    }

    /// Apply `DESIGNLENS_*` overrides using `lookup` to read variables.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(model) = lookup(ENV_MODEL).filter(|v| !v.is_empty()) {
            self.llm.model = model;
        }
        if let Some(raw) = lookup(ENV_TEMPERATURE).filter(|v| !v.is_empty()) {
            self.llm.temperature = raw.parse().map_err(|_| {
                DesignLensError::config(format!("{ENV_TEMPERATURE}='{raw}' is not a number"))
            })?;
        }
        if let Some(base_url) = lookup(ENV_BASE_URL).filter(|v| !v.is_empty()) {
            self.llm.base_url = base_url;
        }
        Ok(())
    }

    /// Resolved data directory with `~` expanded.
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.defaults.data_dir)
    }

    /// Path of the libSQL tracking database.
    pub fn tracking_db_path(&self) -> PathBuf {
        let db = Path::new(&self.storage.tracking_db);
        if db.is_absolute() {
            db.to_path_buf()
        } else {
            self.data_dir().join(db)
        }
    }

    /// Root directory of the local object store.
    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir().join("objects")
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.defaults.stage_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.request_timeout_secs)
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches(['/', '\\'])),
            None => PathBuf::from(path),
        },
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.designlens/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| DesignLensError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.designlens/designlens.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk, then apply environment overrides.
/// Uses defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    let mut config = if path.exists() {
        load_config_from(&path)?
    } else {
        tracing::debug!(?path, "config file not found, using defaults");
        AppConfig::default()
    };

    config.apply_overrides(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DesignLensError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        DesignLensError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DesignLensError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DesignLensError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DesignLensError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the API key from the env var named in the config.
pub fn api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.llm.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(DesignLensError::config(format!(
            "API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Check that the API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    api_key(config).map(|_| ())
}
