//! Configuration loading
//!
//! Reads a JSON5 file with `${VAR}` environment substitution and resolves it
//! into a typed [`RelayConfig`]. A missing file yields the defaults.

use regex::Regex;
use serde_json::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use crate::logging::targets;

/// Default control bridge port.
pub const DEFAULT_PORT: u16 = 8000;

/// Default control bridge bind host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default sidecar transport URL.
pub const DEFAULT_TRANSPORT_URL: &str = "ws://127.0.0.1:8765/session";

pub const DEFAULT_AI_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_AI_MAX_TOKENS: u32 = 1000;
pub const DEFAULT_AI_TEMPERATURE: f32 = 0.7;

/// Default upload size cap (64 MiB).
pub const DEFAULT_UPLOAD_MAX_BYTES: u64 = 64 * 1024 * 1024;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse JSON5 at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("Missing environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Validation error at {path}: {message}")]
    ValidationError { path: String, message: String },
}

/// Get the config file path.
/// Priority: WA_RELAY_CONFIG_PATH > WA_RELAY_STATE_DIR/wa-relay.json5 > ~/.wa-relay/wa-relay.json5
/// Falls back to the .json extension if the .json5 file doesn't exist.
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var("WA_RELAY_CONFIG_PATH") {
        return PathBuf::from(path);
    }

    let dir = resolve_state_dir();
    let json5 = dir.join("wa-relay.json5");
    if json5.exists() {
        return json5;
    }
    dir.join("wa-relay.json")
}

/// State directory: WA_RELAY_STATE_DIR or `~/.wa-relay`.
pub fn resolve_state_dir() -> PathBuf {
    if let Ok(dir) = env::var("WA_RELAY_STATE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".wa-relay")
}

/// Load the raw configuration value.
/// Returns an empty object if the file doesn't exist.
pub fn load_config_value(path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        return Ok(Value::Object(serde_json::Map::new()));
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut value = parse_json5(&content, path)?;
    substitute_env_vars(&mut value)?;
    Ok(value)
}

/// Load and resolve the configuration from the default path.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    let path = get_config_path();
    tracing::debug!(target: targets::CONFIG, path = %path.display(), "loading config");
    let value = load_config_value(&path)?;
    RelayConfig::from_value(&value)
}

fn parse_json5(content: &str, path: &Path) -> Result<Value, ConfigError> {
    json5::from_str(content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Substitute environment variables in string values.
/// Pattern: ${VAR} where VAR matches [A-Z_][A-Z0-9_]*
/// Escape with $${VAR} to get literal ${VAR}
fn substitute_env_vars(value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            *s = substitute_env_in_string(s)?;
        }
        Value::Object(obj) => {
            for (_, v) in obj.iter_mut() {
                substitute_env_vars(v)?;
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                substitute_env_vars(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

static ENV_VAR_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\$\$?\{([A-Z_][A-Z0-9_]*)\}"));

fn substitute_env_in_string(s: &str) -> Result<String, ConfigError> {
    let pattern = ENV_VAR_PATTERN
        .as_ref()
        .map_err(|e| ConfigError::ValidationError {
            path: ".".to_string(),
            message: format!("env pattern: {e}"),
        })?;

    let mut result = String::with_capacity(s.len());
    let mut last_end = 0;

    for caps in pattern.captures_iter(s) {
        let (Some(full_match), Some(var)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let var_name = var.as_str();

        result.push_str(&s[last_end..full_match.start()]);

        if full_match.as_str().starts_with("$$") {
            result.push_str(&format!("${{{}}}", var_name));
        } else {
            let value = env::var(var_name).map_err(|_| ConfigError::MissingEnvVar {
                var: var_name.to_string(),
            })?;
            result.push_str(&value);
        }

        last_end = full_match.end();
    }

    result.push_str(&s[last_end..]);
    Ok(result)
}

// ============================================================================
// Typed configuration
// ============================================================================

/// Fully resolved relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub profile: String,
    pub state_dir: PathBuf,
    pub server: ServerSection,
    pub transport_url: String,
    pub ai: AiSection,
    pub reconnect: ReconnectSection,
    pub upload: UploadSection,
    /// Where the pairing artifact is written while pairing is pending.
    pub pairing_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct AiSection {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectSection {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSection {
    pub max_bytes: u64,
    pub timeout: Duration,
    pub allow_private_hosts: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let state_dir = resolve_state_dir();
        RelayConfig {
            profile: "default".to_string(),
            pairing_path: state_dir.join("qr.svg"),
            state_dir,
            server: ServerSection {
                host: DEFAULT_HOST.to_string(),
                port: DEFAULT_PORT,
            },
            transport_url: DEFAULT_TRANSPORT_URL.to_string(),
            ai: AiSection {
                api_key: None,
                base_url: None,
                model: DEFAULT_AI_MODEL.to_string(),
                max_tokens: DEFAULT_AI_MAX_TOKENS,
                temperature: DEFAULT_AI_TEMPERATURE,
            },
            reconnect: ReconnectSection {
                initial_delay: Duration::from_millis(1000),
                max_delay: Duration::from_millis(30_000),
                max_attempts: None,
            },
            upload: UploadSection {
                max_bytes: DEFAULT_UPLOAD_MAX_BYTES,
                timeout: Duration::from_millis(30_000),
                allow_private_hosts: false,
            },
        }
    }
}

impl RelayConfig {
    /// Resolve a typed config from a raw JSON value, applying env overrides.
    pub fn from_value(cfg: &Value) -> Result<Self, ConfigError> {
        if !cfg.is_object() {
            return Err(ConfigError::ValidationError {
                path: ".".to_string(),
                message: "config root must be an object".to_string(),
            });
        }

        let mut out = RelayConfig::default();

        if let Some(profile) = get_str(cfg, &["profile"]) {
            out.profile = profile.to_string();
        }
        if let Some(dir) = get_str(cfg, &["stateDir"]) {
            out.state_dir = PathBuf::from(dir);
        }
        out.pairing_path = get_str(cfg, &["pairing", "path"])
            .map(PathBuf::from)
            .unwrap_or_else(|| out.state_dir.join("qr.svg"));

        if let Some(host) = get_str(cfg, &["server", "host"]) {
            out.server.host = host.to_string();
        }
        if let Some(port) = get_u64(cfg, &["server", "port"], ".server.port")? {
            out.server.port = u16::try_from(port).map_err(|_| ConfigError::ValidationError {
                path: ".server.port".to_string(),
                message: format!("port {port} out of range"),
            })?;
        }

        out.transport_url = env::var("WA_RELAY_TRANSPORT_URL")
            .ok()
            .or_else(|| get_str(cfg, &["transport", "url"]).map(String::from))
            .unwrap_or(out.transport_url);

        out.ai.api_key = get_str(cfg, &["ai", "apiKey"])
            .map(String::from)
            .or_else(|| env::var("OPENAI_API_KEY").ok())
            .or_else(|| env::var("key").ok())
            .filter(|k| !k.trim().is_empty());
        out.ai.base_url = get_str(cfg, &["ai", "baseUrl"]).map(String::from);
        if let Some(model) = get_str(cfg, &["ai", "model"]) {
            out.ai.model = model.to_string();
        }
        if let Some(max_tokens) = get_u64(cfg, &["ai", "maxTokens"], ".ai.maxTokens")? {
            out.ai.max_tokens = max_tokens.min(u32::MAX as u64) as u32;
        }
        if let Some(temp) = get_path(cfg, &["ai", "temperature"]) {
            let temp = temp.as_f64().ok_or_else(|| ConfigError::ValidationError {
                path: ".ai.temperature".to_string(),
                message: "temperature must be a number".to_string(),
            })?;
            if !(0.0..=2.0).contains(&temp) {
                return Err(ConfigError::ValidationError {
                    path: ".ai.temperature".to_string(),
                    message: "temperature must be between 0 and 2".to_string(),
                });
            }
            out.ai.temperature = temp as f32;
        }

        if let Some(ms) = get_u64(cfg, &["reconnect", "initialDelayMs"], ".reconnect.initialDelayMs")? {
            out.reconnect.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = get_u64(cfg, &["reconnect", "maxDelayMs"], ".reconnect.maxDelayMs")? {
            out.reconnect.max_delay = Duration::from_millis(ms);
        }
        if out.reconnect.max_delay < out.reconnect.initial_delay {
            return Err(ConfigError::ValidationError {
                path: ".reconnect.maxDelayMs".to_string(),
                message: "maxDelayMs must not be smaller than initialDelayMs".to_string(),
            });
        }
        if let Some(n) = get_u64(cfg, &["reconnect", "maxAttempts"], ".reconnect.maxAttempts")? {
            out.reconnect.max_attempts = Some(n.min(u32::MAX as u64) as u32);
        }

        if let Some(max) = get_u64(cfg, &["upload", "maxBytes"], ".upload.maxBytes")? {
            out.upload.max_bytes = max;
        }
        if let Some(ms) = get_u64(cfg, &["upload", "timeoutMs"], ".upload.timeoutMs")? {
            out.upload.timeout = Duration::from_millis(ms);
        }
        if let Some(allow) = get_path(cfg, &["upload", "allowPrivateHosts"]).and_then(Value::as_bool) {
            out.upload.allow_private_hosts = allow;
        }

        Ok(out)
    }

    /// Directory holding per-profile credential blobs.
    pub fn credentials_dir(&self) -> PathBuf {
        self.state_dir.join("credentials")
    }
}

fn get_path<'a>(cfg: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(cfg, |v, key| v.get(*key))
}

fn get_str<'a>(cfg: &'a Value, path: &[&str]) -> Option<&'a str> {
    get_path(cfg, path).and_then(Value::as_str)
}

fn get_u64(cfg: &Value, path: &[&str], display: &str) -> Result<Option<u64>, ConfigError> {
    match get_path(cfg, path) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| ConfigError::ValidationError {
                path: display.to_string(),
                message: "must be a non-negative integer".to_string(),
            }),
    }
}
