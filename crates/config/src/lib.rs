//! Configuration loading, validation, and model selection for replychain.
//!
//! Loads configuration from `~/.replychain/config.toml` with environment
//! variable overrides. Validates all settings at startup. The loaded
//! [`AppConfig`] is plain data: the driver owns it and passes what the
//! assembler and streamer need as explicit parameters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Substrings of a `provider/model` selection that indicate vision support.
pub const VISION_MODEL_TAGS: &[&str] = &[
    "claude", "gemini", "gemma", "gpt-4", "gpt-5", "grok-4", "llama", "llava", "mistral", "o3",
    "o4", "vision", "vl",
];

/// Providers whose chat API accepts a per-turn `name`.
pub const PROVIDERS_SUPPORTING_USERNAMES: &[&str] = &["openai"];

/// Extra request body fields, as written in the config file.
pub type BodyParams = serde_json::Map<String, serde_json::Value>;

/// The root configuration structure.
///
/// Maps directly to `~/.replychain/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Discord bot token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,

    /// Application id, used to print the invite URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Custom status shown under the bot's name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,

    /// Maximum characters kept per message
    #[serde(default = "default_max_text")]
    pub max_text: usize,

    /// Maximum images kept per message (vision models only)
    #[serde(default = "default_max_images")]
    pub max_images: usize,

    /// Maximum messages in one conversation
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Node cache ceiling before the oldest entries are evicted
    #[serde(default = "default_max_message_nodes")]
    pub max_message_nodes: usize,

    /// Reply with plain messages instead of streamed embeds
    #[serde(default)]
    pub use_plain_responses: bool,

    #[serde(default = "default_true")]
    pub allow_dms: bool,

    /// Prefix user turns with "display name: "
    #[serde(default)]
    pub experimental_message_formatting: bool,

    /// System prompt template (`{date}`, `{time}`, `{users}`)
    #[serde(default)]
    pub system_prompt: String,

    /// Abort replies whose text matches this pattern
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_response_regex: Option<String>,

    /// Abort replies longer than this many characters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_length_cap: Option<usize>,

    /// Selected `provider/model`; defaults to the first entry of `models`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default)]
    pub permissions: PermissionsConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,

    /// `provider/model` → extra body parameters
    #[serde(default)]
    pub models: BTreeMap<String, BodyParams>,
}

fn default_max_text() -> usize {
    100_000
}
fn default_max_images() -> usize {
    5
}
fn default_max_messages() -> usize {
    25
}
fn default_max_message_nodes() -> usize {
    500
}
fn default_true() -> bool {
    true
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("bot_token", &redact(&self.bot_token))
            .field("client_id", &self.client_id)
            .field("status_message", &self.status_message)
            .field("max_text", &self.max_text)
            .field("max_images", &self.max_images)
            .field("max_messages", &self.max_messages)
            .field("max_message_nodes", &self.max_message_nodes)
            .field("use_plain_responses", &self.use_plain_responses)
            .field("allow_dms", &self.allow_dms)
            .field(
                "experimental_message_formatting",
                &self.experimental_message_formatting,
            )
            .field("system_prompt", &self.system_prompt)
            .field("block_response_regex", &self.block_response_regex)
            .field("reply_length_cap", &self.reply_length_cap)
            .field("model", &self.model)
            .field("permissions", &self.permissions)
            .field("providers", &self.providers)
            .field("models", &self.models)
            .finish()
    }
}

/// Connection details for one OpenAI-compatible endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_headers: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_query: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra_body: BodyParams,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("extra_headers", &self.extra_headers.keys().collect::<Vec<_>>())
            .field("extra_query", &self.extra_query)
            .field("extra_body", &self.extra_body)
            .finish()
    }
}

impl ProviderConfig {
    /// Local servers accept any key.
    pub fn api_key_or_default(&self) -> &str {
        self.api_key.as_deref().unwrap_or("sk-no-key-required")
    }
}

/// Who may talk to the bot, and where.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionsConfig {
    #[serde(default)]
    pub users: UserPermissions,

    #[serde(default)]
    pub roles: IdPermissions,

    #[serde(default)]
    pub channels: IdPermissions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPermissions {
    /// Always allowed, may switch models
    #[serde(default)]
    pub admin_ids: Vec<u64>,

    #[serde(default)]
    pub allowed_ids: Vec<u64>,

    #[serde(default)]
    pub blocked_ids: Vec<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdPermissions {
    #[serde(default)]
    pub allowed_ids: Vec<u64>,

    #[serde(default)]
    pub blocked_ids: Vec<u64>,
}

/// A parsed `provider/model` selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    /// The selection as configured, including any `:vision` suffix
    pub raw: String,
    pub provider: String,
    pub model: String,
}

impl ModelSelection {
    /// Split `provider/model[:vision]` on the first `/`.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let stripped = raw.strip_suffix(":vision").unwrap_or(raw);
        match stripped.split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => Ok(Self {
                raw: raw.to_string(),
                provider: provider.to_string(),
                model: model.to_string(),
            }),
            _ => Err(ConfigError::ValidationError(format!(
                "model '{raw}' must be written as provider/model"
            ))),
        }
    }

    pub fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities::detect(&self.raw)
    }
}

impl std::fmt::Display for ModelSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// What the selected model can take as input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelCapabilities {
    pub accept_images: bool,
    pub accept_usernames: bool,
}

impl ModelCapabilities {
    pub fn detect(provider_slash_model: &str) -> Self {
        let lower = provider_slash_model.to_lowercase();
        Self {
            accept_images: VISION_MODEL_TAGS.iter().any(|tag| lower.contains(tag)),
            accept_usernames: PROVIDERS_SUPPORTING_USERNAMES
                .iter()
                .any(|p| lower.contains(p)),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.replychain/config.toml).
    ///
    /// Environment overrides:
    /// - `REPLYCHAIN_BOT_TOKEN`, then `DISCORD_BOT_TOKEN` (when no token is configured)
    /// - `REPLYCHAIN_MODEL` (replaces the selected model)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_overrides(&Self::config_dir().join("config.toml"))
    }

    /// Load from `path`, then apply environment overrides and re-validate.
    pub fn load_with_overrides(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;

        if config.bot_token.is_none() {
            config.bot_token = std::env::var("REPLYCHAIN_BOT_TOKEN")
                .ok()
                .or_else(|| std::env::var("DISCORD_BOT_TOKEN").ok());
        }

        if let Ok(model) = std::env::var("REPLYCHAIN_MODEL") {
            config.model = Some(model);
            config.validate()?;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".replychain")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_messages == 0 {
            return Err(ConfigError::ValidationError(
                "max_messages must be at least 1".into(),
            ));
        }

        if self.reply_length_cap == Some(0) {
            return Err(ConfigError::ValidationError(
                "reply_length_cap must be positive when set".into(),
            ));
        }

        if let Some(raw) = &self.model {
            let selection = ModelSelection::parse(raw)?;
            if !self.models.is_empty() && !self.models.contains_key(raw) {
                return Err(ConfigError::ValidationError(format!(
                    "model '{raw}' is not listed under [models]"
                )));
            }
            if !self.providers.is_empty() && !self.providers.contains_key(&selection.provider) {
                return Err(ConfigError::ValidationError(format!(
                    "provider '{}' is not configured under [providers]",
                    selection.provider
                )));
            }
        }

        for name in self.models.keys() {
            ModelSelection::parse(name)?;
        }

        Ok(())
    }

    /// The model replies should use: `model`, else the first `[models]` entry.
    pub fn selected_model(&self) -> Result<ModelSelection, ConfigError> {
        let raw = self
            .model
            .as_deref()
            .or_else(|| self.models.keys().next().map(String::as_str))
            .ok_or_else(|| ConfigError::ValidationError("no model configured".into()))?;
        ModelSelection::parse(raw)
    }

    pub fn provider(&self, selection: &ModelSelection) -> Result<&ProviderConfig, ConfigError> {
        self.providers.get(&selection.provider).ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "provider '{}' is not configured under [providers]",
                selection.provider
            ))
        })
    }

    /// Provider `extra_body` overlaid with the model's own parameters.
    pub fn request_body(&self, selection: &ModelSelection) -> BodyParams {
        let mut body = self
            .providers
            .get(&selection.provider)
            .map(|p| p.extra_body.clone())
            .unwrap_or_default();
        if let Some(params) = self.models.get(&selection.raw) {
            for (key, value) in params {
                body.insert(key.clone(), value.clone());
            }
        }
        body
    }

    /// Images are only kept for models that can see them.
    pub fn effective_max_images(&self, capabilities: ModelCapabilities) -> usize {
        if capabilities.accept_images {
            self.max_images
        } else {
            0
        }
    }

    /// Generate a default config TOML string (for `config --init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            client_id: None,
            status_message: None,
            max_text: default_max_text(),
            max_images: default_max_images(),
            max_messages: default_max_messages(),
            max_message_nodes: default_max_message_nodes(),
            use_plain_responses: false,
            allow_dms: true,
            experimental_message_formatting: false,
            system_prompt: String::new(),
            block_response_regex: None,
            reply_length_cap: None,
            model: None,
            permissions: PermissionsConfig::default(),
            providers: BTreeMap::new(),
            models: BTreeMap::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
