//! Start-up configuration, read from environment variables.
//!
//! `main` loads a `.env` file first, so everything here can also come from
//! that file during local development.

use std::{fmt, net::SocketAddr, time::Duration};

pub const DEFAULT_WORKFLOW_API_URL: &str = "https://api.coze.cn/v1/workflow/stream_run";
pub const DEFAULT_WORKFLOW_ID: &str = "7552456285649453102";
pub const DEFAULT_UPLOAD_PRESET: &str = "ml_default";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub workflow_api_url: String,
    pub workflow_api_token: String,
    pub workflow_id: String,
    pub upload_api_url: String,
    pub upload_preset: String,
    pub upload_timeout: Duration,
    pub max_request_body: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Blank values
    /// count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |key: &str| get(key).ok_or_else(|| ConfigError::MissingVar(key.to_string()));

        let port: u16 = parse_or(get("PORT"), "PORT", 8080)?;
        let bind_address = SocketAddr::from(([0, 0, 0, 0], port));

        let workflow_api_url = get("WORKFLOW_API_URL").unwrap_or_else(|| DEFAULT_WORKFLOW_API_URL.to_string());
        let workflow_api_token = require("WORKFLOW_API_TOKEN")?;
        let workflow_id = get("WORKFLOW_ID").unwrap_or_else(|| DEFAULT_WORKFLOW_ID.to_string());

        let upload_api_url = match get("UPLOAD_API_URL") {
            Some(url) => url,
            None => {
                let cloud = require("CLOUDINARY_CLOUD_NAME")?;
                format!("https://api.cloudinary.com/v1_1/{cloud}/image/upload")
            }
        };
        let upload_preset = get("CLOUDINARY_UPLOAD_PRESET").unwrap_or_else(|| DEFAULT_UPLOAD_PRESET.to_string());
        let upload_timeout = Duration::from_secs(parse_or(get("UPLOAD_TIMEOUT_SECS"), "UPLOAD_TIMEOUT_SECS", 30)?);
        let max_body_mb: usize = parse_or(get("MAX_REQUEST_BODY_MB"), "MAX_REQUEST_BODY_MB", 64)?;

        Ok(Self {
            bind_address,
            workflow_api_url,
            workflow_api_token,
            workflow_id,
            upload_api_url,
            upload_preset,
            upload_timeout,
            max_request_body: max_body_mb * 1024 * 1024,
        })
    }

    /// First few characters of the bearer token, for logs.
    pub fn token_preview(&self) -> String {
        let shown: String = self.workflow_api_token.chars().take(10).collect();
        format!("{shown}...")
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("workflow_api_url", &self.workflow_api_url)
            .field("workflow_api_token", &self.token_preview())
            .field("workflow_id", &self.workflow_id)
            .field("upload_api_url", &self.upload_api_url)
            .field("upload_preset", &self.upload_preset)
            .field("upload_timeout", &self.upload_timeout)
            .field("max_request_body", &self.max_request_body)
            .finish()
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match raw {
        Some(value) => value
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        None => Ok(default),
    }
}
