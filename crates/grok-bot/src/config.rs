use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_PREFIX: &str = "GROK_";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant on Bilibili.
Respond naturally in Chinese to comments that @mention the user.
Keep your responses concise and friendly.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bilibili: BilibiliConfig,
    pub monitor: MonitorConfig,
    pub reply: ReplyConfig,
    pub agent: AgentConfig,
    pub logging: LoggingConfig,
    pub health: HealthConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BilibiliConfig {
    pub credential_path: PathBuf,
    pub api_base: String,
    pub request_timeout_seconds: u64,
}

impl Default for BilibiliConfig {
    fn default() -> Self {
        Self {
            credential_path: PathBuf::from("data/credentials.json"),
            api_base: "https://api.bilibili.com".to_string(),
            request_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval: u64,
    pub batch_size: usize,
    pub max_pages: usize,
    pub processing_interval_seconds: u64,
    pub processing_timeout_minutes: i64,
    pub reaper_interval_seconds: u64,
    pub shutdown_grace_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: 60,
            batch_size: 20,
            max_pages: 1,
            processing_interval_seconds: 20,
            processing_timeout_minutes: 20,
            reaper_interval_seconds: 60,
            shutdown_grace_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyConfig {
    pub rate_limit_seconds: u64,
    pub max_retries: u32,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            rate_limit_seconds: 3,
            max_retries: 3,
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub model: String,
    pub api_base: String,
    pub api_key: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: String,
    pub generation_timeout_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o-mini".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            max_tokens: 500,
            temperature: 0.7,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            generation_timeout_seconds: 60,
        }
    }
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("model", &self.model)
            .field("api_base", &self.api_base)
            .field("api_key", &redacted(&self.api_key))
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("generation_timeout_seconds", &self.generation_timeout_seconds)
            .finish_non_exhaustive()
    }
}

pub(crate) fn redacted(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Empty disables the log file.
    pub file: String,
    /// Size at which the log file is rotated; 0 never rotates.
    pub max_bytes: u64,
    pub backup_count: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: "data/grok.log".to_string(),
            max_bytes: 10 * 1024 * 1024,
            backup_count: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/grok.db"),
        }
    }
}

/// Reads the YAML file, applies `GROK_*` overrides from the process
/// environment and validates the result.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&contents, std::env::vars())?;
    validate_config(&config)?;
    Ok(config)
}

/// File values are layered over the defaults, then environment overrides over
/// both. Keys not present in the defaults are ignored.
pub fn parse_config<I>(contents: &str, vars: I) -> Result<Config, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut tree = serde_yaml::to_value(Config::default())?;
    let file: Value = serde_yaml::from_str(contents)?;
    if !file.is_null() {
        merge(&mut tree, file);
    }
    apply_env_overrides(&mut tree, vars);
    Ok(serde_yaml::from_value(tree)?)
}

fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// `GROK_MONITOR_POLL_INTERVAL=30` sets `monitor.poll_interval`: underscores
/// are joined greedily, longest known key first.
pub fn apply_env_overrides<I>(tree: &mut Value, vars: I) -> Vec<String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut applied = Vec::new();
    for (key, raw) in vars {
        let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let parts = rest
            .to_lowercase()
            .split('_')
            .map(str::to_string)
            .collect::<Vec<_>>();
        if let Value::Mapping(root) = tree {
            if set_path(root, &parts, &raw) {
                applied.push(key);
            }
        }
    }
    applied
}

fn set_path(current: &mut Mapping, parts: &[String], raw: &str) -> bool {
    for split in (1..=parts.len()).rev() {
        let key = Value::String(parts[..split].join("_"));
        let Some(slot) = current.get_mut(&key) else {
            continue;
        };
        if split == parts.len() {
            *slot = parse_env_value(raw, slot);
            return true;
        }
        return match slot {
            Value::Mapping(child) => set_path(child, &parts[split..], raw),
            _ => false,
        };
    }
    false
}

/// String-typed keys keep the raw text so a numeric-looking secret stays a string.
fn parse_env_value(raw: &str, existing: &Value) -> Value {
    if existing.is_string() {
        return Value::String(raw.to_string());
    }
    match raw.to_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if !raw.is_empty() && raw.chars().all(|ch| ch.is_ascii_digit()) {
        if let Ok(value) = raw.parse::<u64>() {
            return Value::Number(value.into());
        }
    }
    if let Ok(value) = raw.parse::<f64>() {
        return Value::Number(value.into());
    }
    Value::String(raw.to_string())
}

/// One year.
const MAX_PROCESSING_TIMEOUT_MINUTES: i64 = 525_600;
const MAX_GENERATION_TIMEOUT_SECONDS: u64 = 3_600;

/// Longest a full batch can take when every mention uses its whole generation
/// timeout, throttle window and request timeout.
pub fn worst_case_batch_seconds(config: &Config) -> u64 {
    let per_mention = config
        .agent
        .generation_timeout_seconds
        .saturating_add(config.reply.rate_limit_seconds)
        .saturating_add(config.bilibili.request_timeout_seconds);
    u64::try_from(config.monitor.batch_size)
        .unwrap_or(u64::MAX)
        .saturating_mul(per_mention)
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let invalid = |message: &str| Err(ConfigError::Invalid(message.to_string()));

    if config.agent.api_key.trim().is_empty() {
        return invalid("agent.api_key is required");
    }
    if config.health.enabled && config.health.port == 0 {
        return invalid("health.port must be positive");
    }
    if config.monitor.poll_interval < 10 {
        return invalid("monitor.poll_interval must be at least 10 seconds");
    }
    if config.reply.rate_limit_seconds < 1 {
        return invalid("reply.rate_limit_seconds must be at least 1");
    }
    if config.monitor.processing_interval_seconds < 1 {
        return invalid("monitor.processing_interval_seconds must be at least 1");
    }
    if !(1..=MAX_PROCESSING_TIMEOUT_MINUTES).contains(&config.monitor.processing_timeout_minutes) {
        return invalid("monitor.processing_timeout_minutes must be between 1 and 525600");
    }
    if config.monitor.reaper_interval_seconds < 1 {
        return invalid("monitor.reaper_interval_seconds must be at least 1");
    }
    if !(1..=MAX_GENERATION_TIMEOUT_SECONDS).contains(&config.agent.generation_timeout_seconds) {
        return invalid("agent.generation_timeout_seconds must be between 1 and 3600");
    }
    if config.bilibili.request_timeout_seconds < 1 {
        return invalid("bilibili.request_timeout_seconds must be at least 1");
    }
    if config.reply.max_retries < 1 {
        return invalid("reply.max_retries must be at least 1");
    }
    if config.monitor.batch_size < 1 {
        return invalid("monitor.batch_size must be at least 1");
    }
    Ok(())
}
