use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

const ENV_MODEL_API_KEY: &str = "PATCHRUN_MODEL_API_KEY";
const ENV_GITHUB_TOKEN: &str = "PATCHRUN_GITHUB_TOKEN";
const ENV_MODEL: &str = "PATCHRUN_MODEL";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub model: ModelConfig,
    pub retry: RetryConfig,
    pub github: GithubConfig,
    pub guardrails: GuardrailConfig,
    pub pipeline: PipelineConfig,
    pub runs: RunDefaults,
    pub git: GitConfig,
    pub storage: StorageConfig,
    pub workers: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub api_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
    /// Per-role model override, keyed by role name ("planner", "patcher", "reviewer")
    pub role_models: HashMap<String, String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "google/gemini-3-flash-preview".to_string(),
            api_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            api_key: String::new(),
            timeout_ms: 20000,
            role_models: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_jitter_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    pub api_url: String,
    pub token: String,
    pub timeout_ms: u64,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            token: String::new(),
            timeout_ms: 20000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    pub max_patch_files: usize,
    pub max_patch_lines: usize,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            max_patch_files: 20,
            max_patch_lines: 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_patch_attempts: u32,
    pub max_relevant_files: usize,
    pub snippet_bytes: usize,
    pub max_listed_files: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_patch_attempts: 2,
            max_relevant_files: 5,
            snippet_bytes: 2000,
            max_listed_files: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunDefaults {
    pub max_iterations: u32,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self { max_iterations: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub remote: String,
    pub committer_name: String,
    pub committer_email: String,
    /// Parent directory for per-run working copies (system temp dir when unset)
    pub workspace_root: Option<PathBuf>,
    pub keep_workdirs: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            committer_name: "patchrun".to_string(),
            committer_email: "patchrun@users.noreply.github.com".to_string(),
            workspace_root: None,
            keep_workdirs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    /// Seconds after which an issue lock counts as abandoned
    pub lock_ttl_secs: u64,
}

impl StorageConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("patchrun")
                .join("patchrun.db"),
            lock_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub count: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { count: 2 }
    }
}

impl Config {
    /// Load configuration with fallback chain, then apply environment overrides
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_file_chain(config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_file_chain(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, it must load
        if let Some(path) = config_path {
            return Self::load_from_file(path);
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).map_err(|e| {
            EngineError::Config(format!("Failed to read {}: {}", path.as_ref().display(), e))
        })?;
        let config = Self::from_yaml(&content)?;
        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Credentials come from the environment when set there
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(ENV_MODEL_API_KEY).filter(|v| !v.is_empty()) {
            self.model.api_key = key;
        }
        if let Some(token) = lookup(ENV_GITHUB_TOKEN).filter(|v| !v.is_empty()) {
            self.github.token = token;
        }
        if let Some(model) = lookup(ENV_MODEL).filter(|v| !v.is_empty()) {
            self.model.name = model;
        }
    }
}
