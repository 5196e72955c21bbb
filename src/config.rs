use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use url::Url;

use crate::error::ConfigError;

const CONFIG_FILE_NAME: &str = "config.toml";

/// Connection and behaviour settings for the client.
///
/// Values come from `<config_dir>/promptlib/config.toml` when present and are
/// then overridden by `SUPABASE_URL`, `SUPABASE_ANON_KEY` and `SITE_URL`
/// (a `.env` file in the working directory is honoured).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    /// Origin used to build checkout/portal return URLs.
    pub site_url: String,
    /// Limit assumed for a month with no usage row yet.
    pub default_prompt_limit: i64,
    pub desktop_notifications: bool,
    pub realtime_heartbeat_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            site_url: "http://localhost:5173".to_string(),
            default_prompt_limit: 10,
            desktop_notifications: false,
            realtime_heartbeat_secs: 30,
        }
    }
}

impl ClientConfig {
    /// Load from the default file location and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML config file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Reading client config from {:?}", path);
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// `<config dir>/promptlib/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("promptlib").join(CONFIG_FILE_NAME))
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("SUPABASE_URL") {
            self.supabase_url = url;
        }
        if let Ok(key) = std::env::var("SUPABASE_ANON_KEY") {
            self.supabase_anon_key = key;
        }
        if let Ok(site) = std::env::var("SITE_URL") {
            self.site_url = site;
        }
    }

    /// Reject missing keys and malformed URLs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supabase_url.trim().is_empty() {
            return Err(ConfigError::Missing("supabase_url"));
        }
        if self.supabase_anon_key.trim().is_empty() {
            return Err(ConfigError::Missing("supabase_anon_key"));
        }
        Url::parse(&self.supabase_url).map_err(|source| ConfigError::InvalidUrl {
            field: "supabase_url",
            source,
        })?;
        Url::parse(&self.site_url).map_err(|source| ConfigError::InvalidUrl {
            field: "site_url",
            source,
        })?;
        info!("Client configured for {}", self.supabase_url);
        Ok(())
    }

    /// Site origin without a trailing slash.
    pub fn origin(&self) -> &str {
        self.site_url.trim_end_matches('/')
    }

    /// Base of the table API.
    pub fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.supabase_url.trim_end_matches('/'))
    }

    /// Base of the serverless functions.
    pub fn functions_url(&self) -> String {
        format!("{}/functions/v1", self.supabase_url.trim_end_matches('/'))
    }

    pub fn auth_url(&self) -> String {
        format!("{}/auth/v1", self.supabase_url.trim_end_matches('/'))
    }

    /// Websocket endpoint of the realtime service.
    pub fn realtime_url(&self) -> String {
        let base = self
            .supabase_url
            .trim_end_matches('/')
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            base, self.supabase_anon_key
        )
    }
}
