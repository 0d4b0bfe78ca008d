use crate::providers::{GenerationOptions, RetryPolicy};
use crate::sessions::DEFAULT_MAX_TURNS;
use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub const CONFIG_DIR_ENV: &str = "POSITRONIC_CONFIG_DIR";
const CONFIG_FILE_NAME: &str = "config.toml";

// ── Top-level config ──────────────────────────────────────────────

/// Top-level configuration, loaded from `config.toml`.
///
/// Resolution order: `POSITRONIC_CONFIG_DIR` env → `~/.positronic/config.toml`.
/// Environment variables override file values (see [`Config::apply_env_overrides`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to config.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,
    /// Backend API key. Overridden by `POSITRONIC_API_KEY` or `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    /// Base URL override for the backend (e.g. `"http://localhost:8080/v1"`).
    pub api_url: Option<String>,
    /// `"openai"` or `"custom:<URL>"`. Default: `"openai"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model name sent with every request. Default: `"gpt-4"`.
    #[serde(default = "default_model")]
    pub model: String,
    /// File whose contents replace the built-in system prompt. `~` is expanded.
    #[serde(default)]
    pub system_prompt_file: Option<String>,
    /// Append logs to this file in addition to stderr. `~` is expanded.
    #[serde(default)]
    pub log_file: Option<String>,

    /// Generation parameters and retry policy (`[backend]`).
    #[serde(default)]
    pub backend: BackendConfig,

    /// History bounds (`[session]`).
    #[serde(default)]
    pub session: SessionConfig,

    /// Turn orchestration (`[pipeline]`).
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Transports (`[channels]`).
    #[serde(default)]
    pub channels: ChannelsConfig,
}

fn default_provider() -> String {
    "openai".into()
}

fn default_model() -> String {
    "gpt-4".into()
}

/// Backend call configuration (`[backend]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Sampling temperature (0.0–2.0). Default: `0.7`.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Completion token limit. Default: `2048`.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Whole-request timeout in seconds; expiry counts as a transient failure. Default: `60`.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Retries for transient failures only. Default: `2`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay in milliseconds, doubled per retry. Default: `500`.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Cap for a single retry delay in milliseconds. Default: `10000`.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl BackendConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms.max(self.base_backoff_ms)),
        }
    }
}

/// Conversation history bounds (`[session]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Turns kept per user; must be positive and even. Default: `40` (20 exchanges).
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

fn default_max_turns() -> usize {
    DEFAULT_MAX_TURNS
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
        }
    }
}

/// Turn orchestration (`[pipeline]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Process one user's messages strictly one at a time, in arrival order. Default: `true`.
    #[serde(default = "default_true")]
    pub serialize_user_turns: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            serialize_user_turns: true,
        }
    }
}

/// Transport configuration (`[channels]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Upper bound on messages processed concurrently. Default: `64`.
    #[serde(default = "default_max_in_flight_messages")]
    pub max_in_flight_messages: usize,
    /// Telegram bot (`[channels.telegram]`).
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
}

fn default_max_in_flight_messages() -> usize {
    64
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            max_in_flight_messages: default_max_in_flight_messages(),
            telegram: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot API token. Overridden by `TELEGRAM_BOT_TOKEN`.
    pub bot_token: String,
    /// Usernames (without `@`) or numeric user ids allowed to talk to the bot. `"*"` allows everyone.
    #[serde(default = "default_allowed_users")]
    pub allowed_users: Vec<String>,
}

fn default_allowed_users() -> Vec<String> {
    vec!["*".into()]
}

// ── Config impl ──────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());

        Self {
            config_path: home.join(".positronic").join(CONFIG_FILE_NAME),
            api_key: None,
            api_url: None,
            provider: default_provider(),
            model: default_model(),
            system_prompt_file: None,
            log_file: None,
            backend: BackendConfig::default(),
            session: SessionConfig::default(),
            pipeline: PipelineConfig::default(),
            channels: ChannelsConfig::default(),
        }
    }
}

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".positronic"))
}

fn resolve_config_dir() -> Result<PathBuf> {
    if let Ok(custom) = std::env::var(CONFIG_DIR_ENV) {
        let custom = custom.trim();
        if !custom.is_empty() {
            return Ok(PathBuf::from(custom));
        }
    }
    default_config_dir()
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw.trim()).into_owned())
}

fn env_nonempty(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

impl Config {
    /// Load `config.toml` from the resolved config directory, creating it with
    /// defaults on first run, then apply env overrides and validate.
    pub async fn load_or_init() -> Result<Self> {
        let config_dir = resolve_config_dir()?;
        Self::load_or_init_in(&config_dir).await
    }

    pub async fn load_or_init_in(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        fs::create_dir_all(config_dir).await.with_context(|| {
            format!("Failed to create config directory: {}", config_dir.display())
        })?;

        let initialized = !config_path.exists();
        let mut config = if initialized {
            let mut config = Config::default();
            config.config_path = config_path.clone();
            config.save().await?;

            // Restrict permissions on newly created config file (may contain API keys)
            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(&config_path, Permissions::from_mode(0o600)).await;
            }
            config
        } else {
            // Warn if config file is world-readable (may contain API keys)
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = fs::metadata(&config_path).await {
                    if meta.permissions().mode() & 0o004 != 0 {
                        tracing::warn!(
                            "Config file {:?} is world-readable (mode {:o}). \
                             Consider restricting with: chmod 600 {:?}",
                            config_path,
                            meta.permissions().mode() & 0o777,
                            config_path,
                        );
                    }
                }
            }

            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path.clone();
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            initialized,
            "Config loaded"
        );
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let serialized = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&self.config_path, serialized)
            .await
            .with_context(|| format!("Failed to write config: {}", self.config_path.display()))
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            anyhow::bail!("model must not be empty");
        }
        if !(0.0..=2.0).contains(&self.backend.temperature) {
            anyhow::bail!(
                "backend.temperature must be between 0.0 and 2.0 (got {})",
                self.backend.temperature
            );
        }
        if self.backend.max_tokens == 0 {
            anyhow::bail!("backend.max_tokens must be greater than 0");
        }
        if self.backend.request_timeout_secs == 0 {
            anyhow::bail!("backend.request_timeout_secs must be greater than 0");
        }
        if self.session.max_turns == 0 || self.session.max_turns % 2 != 0 {
            anyhow::bail!(
                "session.max_turns must be a positive even number (got {}); each exchange stores two turns",
                self.session.max_turns
            );
        }
        if self.channels.max_in_flight_messages == 0 {
            anyhow::bail!("channels.max_in_flight_messages must be greater than 0");
        }
        if let Some(telegram) = &self.channels.telegram {
            if telegram.allowed_users.is_empty() {
                anyhow::bail!(
                    "channels.telegram.allowed_users is empty; use [\"*\"] to allow everyone"
                );
            }
        }
        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        // API key: POSITRONIC_API_KEY wins over OPENAI_API_KEY
        if let Some(key) = env_nonempty(&["POSITRONIC_API_KEY", "OPENAI_API_KEY"]) {
            self.api_key = Some(key);
        }

        if let Some(provider) = env_nonempty(&["POSITRONIC_PROVIDER"]) {
            self.provider = provider;
        }

        if let Some(url) = env_nonempty(&["POSITRONIC_API_URL"]) {
            self.api_url = Some(url);
        }

        // Model: POSITRONIC_MODEL or OPENAI_MODEL
        if let Some(model) = env_nonempty(&["POSITRONIC_MODEL", "OPENAI_MODEL"]) {
            self.model = model;
        }

        // Temperature: only values in range are honored
        if let Some(temp) = env_nonempty(&["POSITRONIC_TEMPERATURE"]) {
            if let Ok(temp) = temp.parse::<f64>() {
                if (0.0..=2.0).contains(&temp) {
                    self.backend.temperature = temp;
                }
            }
        }

        if let Some(turns) = env_nonempty(&["POSITRONIC_MAX_TURNS"]) {
            if let Ok(turns) = turns.parse::<usize>() {
                self.session.max_turns = turns;
            }
        }

        if let Some(path) = env_nonempty(&["POSITRONIC_LOG_FILE"]) {
            self.log_file = Some(path);
        }

        if let Some(token) = env_nonempty(&["TELEGRAM_BOT_TOKEN"]) {
            match self.channels.telegram.as_mut() {
                Some(telegram) => telegram.bot_token = token,
                None => {
                    self.channels.telegram = Some(TelegramConfig {
                        bot_token: token,
                        allowed_users: default_allowed_users(),
                    });
                }
            }
        }

        if let Some(users) = env_nonempty(&["POSITRONIC_ALLOWED_USERS"]) {
            if let Some(telegram) = self.channels.telegram.as_mut() {
                telegram.allowed_users = users
                    .split(',')
                    .map(|u| u.trim().trim_start_matches('@').to_string())
                    .filter(|u| !u.is_empty())
                    .collect();
            }
        }
    }

    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            model: self.model.clone(),
            temperature: self.backend.temperature,
            max_tokens: self.backend.max_tokens,
        }
    }

    pub fn log_file_path(&self) -> Option<PathBuf> {
        self.log_file
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(expand_path)
    }

    /// The system prompt: the configured file's contents, or the built-in prompt.
    pub async fn system_prompt(&self) -> Result<String> {
        let Some(raw) = self
            .system_prompt_file
            .as_deref()
            .filter(|p| !p.trim().is_empty())
        else {
            return Ok(crate::prompt::DEFAULT_SYSTEM_PROMPT.to_string());
        };

        let path = expand_path(raw);
        let contents = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read system prompt file {}", path.display()))?;
        let contents = contents.trim();
        if contents.is_empty() {
            anyhow::bail!("System prompt file {} is empty", path.display());
        }
        Ok(contents.to_string())
    }
}
