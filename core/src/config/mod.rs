//! Client configuration
//!
//! Loaded from `nodetool.toml` with `NODETOOL_*` environment overrides.
//! The socket endpoint has no default: a config without `ws_url` fails
//! validation.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::NodetoolError;
use crate::transport::Credentials;


const CONFIG_FILE: &str = "nodetool.toml";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid URL for {field}: {reason}")]
    InvalidUrl { field: &'static str, reason: String },
}

impl From<ConfigError> for NodetoolError {
    fn from(error: ConfigError) -> Self {
        NodetoolError::configuration(error.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Worker socket endpoint, e.g. `ws://localhost:7777/ws`
    pub ws_url: Option<String>,
    /// HTTP API base for discovery, assets and job cancel
    pub api_base_url: Option<String>,
    pub auth_token: Option<String>,
    pub user_id: Option<String>,
    /// Forwarded to the worker with each run request
    pub api_url: Option<String>,
    /// Hint only; the server may ignore it
    pub execution_strategy: String,
    pub explicit_types: bool,
    pub connect_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: None,
            api_base_url: None,
            auth_token: None,
            user_id: None,
            api_url: None,
            execution_strategy: "threaded".to_string(),
            explicit_types: true,
            connect_timeout_secs: 10,
        }
    }
}

impl ClientConfig {
    pub fn with_ws_url(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: Some(ws_url.into()),
            ..Self::default()
        }
    }

    /// Load configuration from file
    ///
    /// Searches `explicit` first, then `./nodetool.toml`, then
    /// `~/.config/nodetool/nodetool.toml`. With no file found the defaults
    /// are returned. Environment overrides are applied on top.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::load_from(path)?,
            None => {
                let local = Path::new(CONFIG_FILE);
                let user = Self::user_config_path();
                if local.exists() {
                    Self::load_from(local)?
                } else if let Some(user) = user.filter(|p| p.exists()) {
                    Self::load_from(&user)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    fn user_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config").join("nodetool").join(CONFIG_FILE))
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    /// Apply `NODETOOL_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("NODETOOL_WS_URL") {
            self.ws_url = Some(v);
        }
        if let Some(v) = get("NODETOOL_API_BASE_URL") {
            self.api_base_url = Some(v);
        }
        if let Some(v) = get("NODETOOL_AUTH_TOKEN") {
            self.auth_token = Some(v);
        }
        if let Some(v) = get("NODETOOL_USER_ID") {
            self.user_id = Some(v);
        }
        if let Some(v) = get("NODETOOL_API_URL") {
            self.api_url = Some(v);
        }
        if let Some(v) = get("NODETOOL_EXECUTION_STRATEGY") {
            self.execution_strategy = v;
        }
        if let Some(v) = get("NODETOOL_EXPLICIT_TYPES") {
            match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.explicit_types = true,
                "0" | "false" | "no" | "off" => self.explicit_types = false,
                _ => {
                    crate::warn_log!("ignoring invalid NODETOOL_EXPLICIT_TYPES value: {}", v);
                }
            }
        }
        if let Some(v) = get("NODETOOL_CONNECT_TIMEOUT_SECS") {
            match v.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => self.connect_timeout_secs = secs,
                _ => {
                    crate::warn_log!("ignoring invalid NODETOOL_CONNECT_TIMEOUT_SECS value: {}", v);
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.normalized_ws_url()?;
        if let Some(base) = &self.api_base_url {
            Url::parse(base).map_err(|e| ConfigError::InvalidUrl {
                field: "api_base_url",
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Socket endpoint with `http(s)` mapped to `ws(s)` and the conventional
    /// `/ws` path appended when the URL has no path
    pub fn normalized_ws_url(&self) -> Result<String, ConfigError> {
        let raw = self
            .ws_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("ws_url"))?;
        let invalid = |reason: String| ConfigError::InvalidUrl {
            field: "ws_url",
            reason,
        };

        let mut url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(invalid(format!("unsupported scheme '{}'", other))),
        };
        url.set_scheme(scheme)
            .map_err(|_| invalid(format!("cannot use scheme '{}'", scheme)))?;
        if url.path().is_empty() || url.path() == "/" {
            url.set_path("/ws");
        }
        Ok(url.to_string())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.auth_token.clone(), self.user_id.clone())
    }
}
