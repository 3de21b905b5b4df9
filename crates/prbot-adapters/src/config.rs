//! Configuration management for prbot
//!
//! Settings come from compiled defaults, then an optional TOML file, then
//! environment variables. Later sources win.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_LLM_API_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TRIGGER: &str = "/prbot";
pub const DEFAULT_BIND: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub github: GithubSettings,
    pub llm: LlmSettings,
    pub retry: RetrySettings,
    pub scope: ScopeSettings,
    pub server: ServerSettings,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubSettings {
    pub api_url: String,
    pub token: Option<String>,
    pub webhook_secret: Option<String>,
    /// Comment prefix that addresses the bot.
    pub trigger: String,
    pub user_agent: String,
}

impl Default for GithubSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_GITHUB_API_URL.to_string(),
            token: None,
            webhook_secret: None,
            trigger: DEFAULT_TRIGGER.to_string(),
            user_agent: concat!("prbot/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Character budget of the full prompt.
    pub max_prompt_chars: usize,
    /// Character budget of the compact prompt used after a timeout.
    pub fallback_prompt_chars: usize,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_LLM_API_URL.to_string(),
            api_key: None,
            model: DEFAULT_LLM_MODEL.to_string(),
            temperature: 0.2,
            max_tokens: 1500,
            max_prompt_chars: 24_000,
            fallback_prompt_chars: 8_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_timeout_ms: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_timeout_ms: 60_000,
            max_retries: 3,
            base_delay_ms: 1_000,
            max_jitter_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeSettings {
    pub max_file_lines: usize,
    /// Context lines around an explicit target.
    pub window_size: usize,
    /// Context lines around each changed range in a large file.
    pub sliding_window: usize,
    pub max_windows: usize,
    pub max_search_lines: usize,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            max_file_lines: 10_000,
            window_size: 15,
            sliding_window: 40,
            max_windows: 3,
            max_search_lines: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

fn redact(value: &Option<String>) -> &'static str {
    if value.as_deref().is_some_and(|v| !v.is_empty()) {
        "<redacted>"
    } else {
        "<unset>"
    }
}

impl std::fmt::Debug for GithubSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubSettings")
            .field("api_url", &self.api_url)
            .field("token", &redact(&self.token))
            .field("webhook_secret", &redact(&self.webhook_secret))
            .field("trigger", &self.trigger)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl std::fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("api_url", &self.api_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_prompt_chars", &self.max_prompt_chars)
            .field("fallback_prompt_chars", &self.fallback_prompt_chars)
            .finish()
    }
}

impl Settings {
    /// Load settings from an optional TOML file and the process environment.
    ///
    /// A file that was named explicitly must exist and parse.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env_with(|key| std::env::var(key).ok());
        settings.sanitize();
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Path from `PRBOT_CONFIG`, when set.
    pub fn env_config_path() -> Option<PathBuf> {
        std::env::var_os("PRBOT_CONFIG")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    }

    /// Overlay environment variables. `lookup` returns the value of a variable.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("GITHUB_API_URL") {
            self.github.api_url = v;
        }
        if let Some(v) = get("GITHUB_TOKEN") {
            self.github.token = Some(v);
        }
        if let Some(v) = get("PRBOT_WEBHOOK_SECRET") {
            self.github.webhook_secret = Some(v);
        }
        if let Some(v) = get("PRBOT_TRIGGER") {
            self.github.trigger = v;
        }
        if let Some(v) = get("PRBOT_LLM_API_KEY").or_else(|| get("OPENAI_API_KEY")) {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = get("PRBOT_LLM_API_URL") {
            self.llm.api_url = v;
        }
        if let Some(v) = get("PRBOT_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = get("PRBOT_BIND") {
            self.server.bind = v;
        }
    }

    /// Clamp values that would make scoping or retrying degenerate.
    fn sanitize(&mut self) {
        self.github.api_url = self.github.api_url.trim_end_matches('/').to_string();
        self.github.trigger = self.github.trigger.trim().to_string();
        if self.github.trigger.is_empty() {
            self.github.trigger = DEFAULT_TRIGGER.to_string();
        }
        self.scope.max_windows = self.scope.max_windows.max(1);
        self.scope.max_file_lines = self.scope.max_file_lines.max(1);
        self.llm.fallback_prompt_chars = self.llm.fallback_prompt_chars.min(self.llm.max_prompt_chars);
    }

    fn validate(&self) -> Result<()> {
        url::Url::parse(&self.github.api_url)
            .with_context(|| format!("Invalid GitHub API URL '{}'", self.github.api_url))?;
        url::Url::parse(&self.llm.api_url)
            .with_context(|| format!("Invalid LLM API URL '{}'", self.llm.api_url))?;
        Ok(())
    }

    pub fn github_token(&self) -> Result<&str> {
        self.github
            .token
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("GITHUB_TOKEN is not set"))
    }

    pub fn llm_api_key(&self) -> Result<&str> {
        self.llm
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("PRBOT_LLM_API_KEY (or OPENAI_API_KEY) is not set"))
    }
}
