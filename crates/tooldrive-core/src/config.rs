//! Configuration loading, environment overrides, and validation.
//!
//! Settings come from an optional JSON5 file and are then overridden by the
//! `UAGENT_*` environment variables, so a deployment can run from the
//! environment alone.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ToolDriveError};

/// Top-level tooldrive configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Azure,
    OpenAi,
    OpenRouter,
    Gemini,
    Grok,
    Claude,
    Nvidia,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 7] = [
        ProviderKind::Azure,
        ProviderKind::OpenAi,
        ProviderKind::OpenRouter,
        ProviderKind::Gemini,
        ProviderKind::Grok,
        ProviderKind::Claude,
        ProviderKind::Nvidia,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Azure => "azure",
            ProviderKind::OpenAi => "openai",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Grok => "grok",
            ProviderKind::Claude => "claude",
            ProviderKind::Nvidia => "nvidia",
        }
    }

    /// Infix of the per-provider environment variables (`UAGENT_<INFIX>_API_KEY`).
    pub fn env_infix(&self) -> &'static str {
        match self {
            ProviderKind::Azure => "AZURE",
            ProviderKind::OpenAi => "OPENAI",
            ProviderKind::OpenRouter => "OPENROUTER",
            ProviderKind::Gemini => "GEMINI",
            ProviderKind::Grok => "GROK",
            ProviderKind::Claude => "CLAUDE",
            ProviderKind::Nvidia => "NVIDIA",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::Azure | ProviderKind::OpenAi | ProviderKind::OpenRouter => "gpt-5.2",
            ProviderKind::Grok => "grok-4-1-fast-reasoning",
            ProviderKind::Gemini => "gemini-1.5-flash",
            ProviderKind::Claude => "claude-sonnet-4.5",
            ProviderKind::Nvidia => "nvidia/nemotron-3-nano-30b-a3b",
        }
    }

    /// Default endpoint; Azure has none and must be configured.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            ProviderKind::Azure => None,
            ProviderKind::OpenAi => Some("https://api.openai.com/v1"),
            ProviderKind::OpenRouter => Some("https://openrouter.ai/api/v1"),
            ProviderKind::Gemini => Some("https://generativelanguage.googleapis.com/v1beta"),
            ProviderKind::Grok => Some("https://api.x.ai/v1"),
            ProviderKind::Claude => Some("https://api.anthropic.com/v1"),
            ProviderKind::Nvidia => Some("https://integrate.api.nvidia.com/v1"),
        }
    }

    /// Backends speaking the OpenAI chat-completions / responses dialect.
    pub fn is_openai_family(&self) -> bool {
        !matches!(self, ProviderKind::Gemini | ProviderKind::Claude)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ToolDriveError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        ProviderKind::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| ToolDriveError::Config(format!("Unknown provider: {s}")))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ProviderKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Azure `api-version` query parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Use the Responses API instead of chat completions (OpenAI family only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responses: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
    /// Dump every streaming event to `./outputs/responses_stream_events.jsonl`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming_debug: Option<bool>,
    /// OpenRouter fallback models, used when the model is `openrouter/auto`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_models: Vec<String>,
}

impl ProviderConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rounds: Option<u32>,
    /// Attach tool specs to each backend request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_tools: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tool_output_chars: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_base_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_cap_secs: Option<f64>,
}

/// Gemini server-side context cache settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clear_on_start: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "tooldrive_providers=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ToolDriveError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

/// Interpret an on/off environment value. Unknown spellings yield `None`.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ToolDriveError::Config(format!("{name} must be a number, got '{value}'")))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw)?;

        json5::from_str(&substituted).map_err(|e| ToolDriveError::Config(e.to_string()))
    }

    /// Load the file at `path` (if any), then apply the process environment.
    pub fn load_with_env(path: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_with(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Override settings from `UAGENT_*` variables resolved through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| non_empty(lookup(name));
        let flag = |name: &str| {
            let raw = get(name)?;
            let parsed = parse_flag(&raw);
            if parsed.is_none() {
                tracing::warn!(var = name, value = %raw, "Ignoring unrecognised on/off value");
            }
            parsed
        };

        if let Some(kind) = get("UAGENT_PROVIDER") {
            self.provider.get_or_insert_with(Default::default).kind = Some(kind.parse()?);
        }

        if let Some(kind) = self.provider_kind() {
            let infix = kind.env_infix();
            let provider = self.provider.get_or_insert_with(Default::default);
            if let Some(v) = get(&format!("UAGENT_{infix}_DEPNAME")) {
                provider.model = Some(v);
            }
            if let Some(v) = get(&format!("UAGENT_{infix}_API_KEY")) {
                provider.api_key = Some(v);
            }
            if let Some(v) = get(&format!("UAGENT_{infix}_BASE_URL")) {
                provider.base_url = Some(v);
            }
            if kind == ProviderKind::Azure {
                if let Some(v) = get("UAGENT_AZURE_API_VERSION") {
                    provider.api_version = Some(v);
                }
            }
        }

        if let Some(v) = flag("UAGENT_RESPONSES") {
            self.provider.get_or_insert_with(Default::default).responses = Some(v);
        }
        if let Some(v) = flag("UAGENT_STREAMING") {
            self.provider.get_or_insert_with(Default::default).streaming = Some(v);
        }
        if let Some(v) = flag("UAGENT_STREAMING_DEBUG") {
            self.provider.get_or_insert_with(Default::default).streaming_debug = Some(v);
        }
        if let Some(v) = get("UAGENT_OPENROUTER_FALLBACK_MODELS") {
            self.provider.get_or_insert_with(Default::default).fallback_models = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(v) = get("UAGENT_429_MAX_RETRIES") {
            self.retry.get_or_insert_with(Default::default).max_retries =
                Some(parse_number("UAGENT_429_MAX_RETRIES", &v)?);
        }
        if let Some(v) = get("UAGENT_429_BACKOFF_BASE") {
            self.retry.get_or_insert_with(Default::default).backoff_base_secs =
                Some(parse_number("UAGENT_429_BACKOFF_BASE", &v)?);
        }
        if let Some(v) = get("UAGENT_429_BACKOFF_CAP") {
            self.retry.get_or_insert_with(Default::default).backoff_cap_secs =
                Some(parse_number("UAGENT_429_BACKOFF_CAP", &v)?);
        }

        if let Some(v) = get("UAGENT_MAX_TOOL_ROUNDS") {
            self.agent.get_or_insert_with(Default::default).max_rounds =
                Some(parse_number("UAGENT_MAX_TOOL_ROUNDS", &v)?);
        }
        if let Some(v) = flag("UAGENT_SEND_TOOLS") {
            self.agent.get_or_insert_with(Default::default).send_tools = Some(v);
        }
        if let Some(v) = get("UAGENT_MAX_TOOL_OUTPUT_CHARS") {
            self.agent.get_or_insert_with(Default::default).max_tool_output_chars =
                Some(parse_number("UAGENT_MAX_TOOL_OUTPUT_CHARS", &v)?);
        }

        if let Some(v) = flag("UAGENT_GEMINI_CACHE") {
            self.cache.get_or_insert_with(Default::default).enabled = Some(v);
        }
        if let Some(v) = flag("UAGENT_GEMINI_CACHE_CLEAR_ON_START") {
            self.cache.get_or_insert_with(Default::default).clear_on_start = Some(v);
        }
        if let Some(v) = get("UAGENT_GEMINI_CACHE_MIN_FILE_SIZE") {
            self.cache.get_or_insert_with(Default::default).min_file_size =
                Some(parse_number("UAGENT_GEMINI_CACHE_MIN_FILE_SIZE", &v)?);
        }
        if let Some(v) = get("UAGENT_CACHE_DIR") {
            self.cache.get_or_insert_with(Default::default).dir = Some(v);
        }

        if let Some(v) = get("UAGENT_LOG_DIR") {
            self.storage.get_or_insert_with(Default::default).log_dir = Some(v);
        }
        if let Some(v) = get("UAGENT_LOG_FILE") {
            self.storage.get_or_insert_with(Default::default).log_file = Some(v);
        }

        Ok(())
    }

    pub fn provider_kind(&self) -> Option<ProviderKind> {
        self.provider.as_ref().and_then(|p| p.kind)
    }

    /// Model name for the selected provider.
    pub fn model(&self) -> String {
        self.provider
            .as_ref()
            .and_then(|p| p.model.clone())
            .or_else(|| self.provider_kind().map(|k| k.default_model().to_string()))
            .unwrap_or_else(|| ProviderKind::OpenAi.default_model().to_string())
    }

    pub fn api_key(&self) -> Option<String> {
        self.provider.as_ref().and_then(|p| p.resolve_api_key())
    }

    /// Endpoint with any trailing slash removed.
    pub fn base_url(&self) -> Option<String> {
        self.provider
            .as_ref()
            .and_then(|p| p.base_url.clone())
            .or_else(|| {
                self.provider_kind()
                    .and_then(|k| k.default_base_url())
                    .map(String::from)
            })
            .map(|u| u.trim().trim_end_matches('/').to_string())
    }

    pub fn api_version(&self) -> Option<String> {
        self.provider.as_ref().and_then(|p| p.api_version.clone())
    }

    pub fn use_responses(&self) -> bool {
        self.provider
            .as_ref()
            .and_then(|p| p.responses)
            .unwrap_or(false)
    }

    pub fn streaming(&self) -> bool {
        self.provider
            .as_ref()
            .and_then(|p| p.streaming)
            .unwrap_or(true)
    }

    pub fn streaming_debug(&self) -> bool {
        self.provider
            .as_ref()
            .and_then(|p| p.streaming_debug)
            .unwrap_or(false)
    }

    pub fn fallback_models(&self) -> Vec<String> {
        self.provider
            .as_ref()
            .map(|p| p.fallback_models.clone())
            .unwrap_or_default()
    }

    pub fn max_rounds(&self) -> u32 {
        self.agent
            .as_ref()
            .and_then(|a| a.max_rounds)
            .unwrap_or(200)
    }

    pub fn send_tools(&self) -> bool {
        self.agent
            .as_ref()
            .and_then(|a| a.send_tools)
            .unwrap_or(true)
    }

    pub fn max_tool_output_chars(&self) -> usize {
        self.agent
            .as_ref()
            .and_then(|a| a.max_tool_output_chars)
            .unwrap_or(400_000)
    }

    pub fn max_retries(&self) -> u32 {
        self.retry
            .as_ref()
            .and_then(|r| r.max_retries)
            .unwrap_or(20)
    }

    pub fn backoff_base_secs(&self) -> f64 {
        self.retry
            .as_ref()
            .and_then(|r| r.backoff_base_secs)
            .unwrap_or(2.0)
    }

    pub fn backoff_cap_secs(&self) -> f64 {
        self.retry
            .as_ref()
            .and_then(|r| r.backoff_cap_secs)
            .unwrap_or(65.0)
    }

    pub fn gemini_cache_enabled(&self) -> bool {
        self.cache.as_ref().and_then(|c| c.enabled).unwrap_or(true)
    }

    pub fn cache_clear_on_start(&self) -> bool {
        self.cache
            .as_ref()
            .and_then(|c| c.clear_on_start)
            .unwrap_or(true)
    }

    pub fn cache_min_file_size(&self) -> u64 {
        self.cache
            .as_ref()
            .and_then(|c| c.min_file_size)
            .unwrap_or(32_768)
    }

    /// Log directory: configured value, else `<data dir>/logs`.
    pub fn log_dir(&self) -> PathBuf {
        self.storage
            .as_ref()
            .and_then(|s| s.log_dir.as_deref())
            .map(expand_path)
            .unwrap_or_else(|| data_dir().join("logs"))
    }

    /// Explicit transcript file, if configured.
    pub fn log_file(&self) -> Option<PathBuf> {
        self.storage
            .as_ref()
            .and_then(|s| s.log_file.as_deref())
            .map(expand_path)
    }

    /// Cache metadata directory: cache dir, else an explicit log dir, else `<data dir>/cache`.
    pub fn cache_dir(&self) -> PathBuf {
        if let Some(dir) = self.cache.as_ref().and_then(|c| c.dir.as_deref()) {
            return expand_path(dir);
        }
        if let Some(dir) = self.storage.as_ref().and_then(|s| s.log_dir.as_deref()) {
            return expand_path(dir);
        }
        data_dir().join("cache")
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        match self.provider_kind() {
            None => errors.push("No provider selected (set UAGENT_PROVIDER)".to_string()),
            Some(kind) => {
                if self.api_key().is_none() {
                    errors.push(format!(
                        "Provider '{kind}' has no API key configured (UAGENT_{}_API_KEY)",
                        kind.env_infix()
                    ));
                }
                if self.base_url().is_none() {
                    errors.push(format!("Provider '{kind}' has no base URL configured"));
                }
                if kind == ProviderKind::Azure && self.api_version().is_none() {
                    errors.push("Azure requires UAGENT_AZURE_API_VERSION".to_string());
                }
                if self.use_responses() && !kind.is_openai_family() {
                    warnings.push(format!(
                        "Responses API is not available for '{kind}'; using its native API"
                    ));
                }
            }
        }

        if self.backoff_cap_secs() < self.backoff_base_secs() {
            warnings.push("Backoff cap is smaller than the backoff base".to_string());
        }
        if self.max_rounds() == 0 {
            errors.push("max_rounds cannot be 0".to_string());
        }

        (warnings, errors)
    }
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

/// Base directory for tooldrive data: `~/.tooldrive/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tooldrive")
}
