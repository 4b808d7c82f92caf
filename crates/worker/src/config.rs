//! Worker configuration

use thiserror::Error;

const DEFAULT_USAGE_RETENTION_DAYS: u32 = 90;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DATABASE_URL must be set")]
    MissingDatabaseUrl,
    #[error("USAGE_RETENTION_DAYS is not a valid number of days: {0}")]
    InvalidRetention(String),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub usage_retention_days: u32,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::MissingDatabaseUrl)?;

        let usage_retention_days = match std::env::var("USAGE_RETENTION_DAYS") {
            Ok(raw) => raw
                .trim()
                .parse::<u32>()
                .map_err(|_| ConfigError::InvalidRetention(raw.clone()))?,
            Err(_) => DEFAULT_USAGE_RETENTION_DAYS,
        };

        Ok(Self {
            database_url,
            usage_retention_days,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("DATABASE_URL", "postgres://localhost/rewritely");
        std::env::remove_var("USAGE_RETENTION_DAYS");
        assert_eq!(WorkerConfig::from_env().unwrap().usage_retention_days, 90);

        std::env::set_var("USAGE_RETENTION_DAYS", "30");
        assert_eq!(WorkerConfig::from_env().unwrap().usage_retention_days, 30);

        std::env::set_var("USAGE_RETENTION_DAYS", "-1");
        assert!(matches!(
            WorkerConfig::from_env(),
            Err(ConfigError::InvalidRetention(_))
        ));

        std::env::remove_var("USAGE_RETENTION_DAYS");
        std::env::remove_var("DATABASE_URL");
        assert!(matches!(
            WorkerConfig::from_env(),
            Err(ConfigError::MissingDatabaseUrl)
        ));
    }
}
