//! Configuration for the orchestrator and its collaborators
//!
//! Values come from defaults, an optional TOML file and `BRIEF_*`
//! environment variables, applied in that order.

use crate::identity::FileCredentialStore;
use crate::utils::RetryPolicy;
use crate::{BriefError, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3000";
pub const PRODUCTION_API_BASE_URL: &str = "https://brief-backend-v8w9.onrender.com";

/// Configuration for a complete Brief client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BriefConfig {
    /// Base URL of the REST API
    pub api_base_url: String,

    /// Base URL of the WebSocket endpoint; derived from `api_base_url`
    /// when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_base_url: Option<String>,

    /// Silence after a final transcript before the turn is sent
    pub turn_debounce_ms: u64,

    /// Backoff for opening the channel
    pub retry: RetryPolicy,

    /// Capacity of the UI event channel
    pub event_buffer_size: usize,

    /// Credential file; defaults to the platform data directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_path: Option<PathBuf>,
}

impl Default for BriefConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            ws_base_url: None,
            turn_debounce_ms: 800,
            retry: RetryPolicy::default(),
            event_buffer_size: 100,
            identity_path: None,
        }
    }
}

impl BriefConfig {
    /// Configuration pointing at the hosted backend
    pub fn production() -> Self {
        Self::default().with_api_base_url(PRODUCTION_API_BASE_URL)
    }

    /// Load a configuration from a TOML file; missing keys keep defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            BriefError::ConfigError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config: BriefConfig = toml::from_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Override fields from `BRIEF_*` environment variables
    pub fn apply_env(self) -> Result<Self> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if var("BRIEF_ENV").as_deref() == Some("production") {
            debug!("Using production backend");
            self.api_base_url = PRODUCTION_API_BASE_URL.to_string();
        }
        if let Some(url) = var("BRIEF_API_BASE_URL") {
            self.api_base_url = url;
        }
        if let Some(url) = var("BRIEF_WS_BASE_URL") {
            self.ws_base_url = Some(url);
        }
        if let Some(ms) = var("BRIEF_TURN_DEBOUNCE_MS") {
            self.turn_debounce_ms = ms.trim().parse().map_err(|_| {
                BriefError::ConfigError(format!("BRIEF_TURN_DEBOUNCE_MS is not a number: {}", ms))
            })?;
        }
        Ok(self)
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    pub fn with_ws_base_url(mut self, url: impl Into<String>) -> Self {
        self.ws_base_url = Some(url.into());
        self
    }

    pub fn with_turn_debounce(mut self, debounce: Duration) -> Self {
        self.turn_debounce_ms = u64::try_from(debounce.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    pub fn with_identity_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_path = Some(path.into());
        self
    }

    pub fn turn_debounce(&self) -> Duration {
        Duration::from_millis(self.turn_debounce_ms)
    }

    /// WebSocket base URL, explicit or derived from the API base
    pub fn ws_base(&self) -> String {
        if let Some(url) = &self.ws_base_url {
            return url.trim_end_matches('/').to_string();
        }
        let api = self.api_base_url.trim_end_matches('/');
        if let Some(rest) = api.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = api.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            api.to_string()
        }
    }

    /// Credential file location, if one can be determined
    pub fn identity_file(&self) -> Option<PathBuf> {
        self.identity_path
            .clone()
            .or_else(FileCredentialStore::default_path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let api = Url::parse(&self.api_base_url).map_err(|e| {
            BriefError::ConfigError(format!("Invalid API URL {}: {}", self.api_base_url, e))
        })?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(BriefError::ConfigError(format!(
                "API URL must be http or https: {}",
                self.api_base_url
            )));
        }

        let ws = self.ws_base();
        let ws_url = Url::parse(&ws)
            .map_err(|e| BriefError::ConfigError(format!("Invalid WebSocket URL {}: {}", ws, e)))?;
        if !matches!(ws_url.scheme(), "ws" | "wss") {
            return Err(BriefError::ConfigError(format!(
                "WebSocket URL must be ws or wss: {}",
                ws
            )));
        }

        if self.turn_debounce_ms == 0 {
            return Err(BriefError::ConfigError(
                "Turn debounce must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(BriefError::ConfigError(
                "Retry policy needs at least one attempt".to_string(),
            ));
        }
        if self.event_buffer_size == 0 {
            return Err(BriefError::ConfigError(
                "Event buffer size must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
