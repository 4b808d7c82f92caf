//! Server configuration, read from the environment

use std::time::Duration;

use thiserror::Error;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_REWRITE_API_URL: &str = "https://api.deepseek.com/v1/chat/completions";
const DEFAULT_REWRITE_MODEL: &str = "deepseek-chat";
const DEFAULT_REWRITE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} is not a valid number: {value}")]
    InvalidNumber { name: &'static str, value: String },
}

/// Settings for the rewrite-generation collaborator
#[derive(Debug, Clone)]
pub struct RewriteConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// HS256 secret shared with the identity provider
    pub identity_jwt_secret: String,
    /// Expected `aud` claim, unchecked when unset
    pub identity_jwt_audience: Option<String>,
    pub rewrite: RewriteConfig,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let timeout_secs = match std::env::var("REWRITE_TIMEOUT_SECS") {
            Ok(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidNumber {
                    name: "REWRITE_TIMEOUT_SECS",
                    value: raw.clone(),
                })?,
            Err(_) => DEFAULT_REWRITE_TIMEOUT_SECS,
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            bind_address: optional("BIND_ADDRESS", DEFAULT_BIND_ADDRESS),
            identity_jwt_secret: required("IDENTITY_JWT_SECRET")?,
            identity_jwt_audience: required("IDENTITY_JWT_AUDIENCE").ok(),
            rewrite: RewriteConfig {
                api_url: optional("REWRITE_API_URL", DEFAULT_REWRITE_API_URL),
                api_key: required("REWRITE_API_KEY")?,
                model: optional("REWRITE_MODEL", DEFAULT_REWRITE_MODEL),
                timeout: Duration::from_secs(timeout_secs),
            },
            allowed_origins: parse_origins(&optional("ALLOWED_ORIGINS", DEFAULT_ALLOWED_ORIGINS)),
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn optional(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
