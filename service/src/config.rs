use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_JWT_SECRET: &str = "change-this-secret-in-production";
const DEFAULT_JWT_ALGORITHM: &str = "HS256";
const DEFAULT_JWT_TTL_MINUTES: u64 = 1440;
const DEFAULT_STORAGE_ROOT: &str = "./storage";
const DEFAULT_WORKFLOW_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_CORS_ORIGINS: &str = "http://localhost:5173";
const DEFAULT_APP_ENV: &str = "development";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    /// JSON snapshot path for the backing store. `None` keeps state in memory.
    pub store_path: Option<PathBuf>,
    pub jwt_secret: String,
    pub jwt_ttl_minutes: u64,
    pub storage_root: PathBuf,
    pub workflow_webhook_url: Option<String>,
    pub workflow_api_key: Option<String>,
    pub workflow_timeout_seconds: u64,
    pub cors_origins: Vec<String>,
    pub app_env: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid TITULOS_BIND_ADDR value '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid TITULOS_JWT_TTL_MINUTES value '{value}'")]
    InvalidJwtTtl { value: String },
    #[error("unsupported TITULOS_JWT_ALGORITHM '{value}': only HS256 is supported")]
    UnsupportedJwtAlgorithm { value: String },
    #[error("invalid TITULOS_WORKFLOW_TIMEOUT_SECONDS value '{value}'")]
    InvalidWorkflowTimeout { value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr_raw = env_string("TITULOS_BIND_ADDR", DEFAULT_BIND_ADDR);
        let bind_addr = bind_addr_raw
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_addr_raw,
                source,
            })?;

        let jwt_algorithm = env_string("TITULOS_JWT_ALGORITHM", DEFAULT_JWT_ALGORITHM);
        if jwt_algorithm != DEFAULT_JWT_ALGORITHM {
            return Err(ConfigError::UnsupportedJwtAlgorithm {
                value: jwt_algorithm,
            });
        }

        let jwt_ttl_raw = env_string(
            "TITULOS_JWT_TTL_MINUTES",
            &DEFAULT_JWT_TTL_MINUTES.to_string(),
        );
        let jwt_ttl_minutes = jwt_ttl_raw
            .parse::<u64>()
            .ok()
            .filter(|value| *value > 0)
            .ok_or(ConfigError::InvalidJwtTtl { value: jwt_ttl_raw })?;

        let workflow_timeout_raw = env_string(
            "TITULOS_WORKFLOW_TIMEOUT_SECONDS",
            &DEFAULT_WORKFLOW_TIMEOUT_SECONDS.to_string(),
        );
        let workflow_timeout_seconds = workflow_timeout_raw
            .parse::<u64>()
            .ok()
            .filter(|value| *value > 0)
            .ok_or(ConfigError::InvalidWorkflowTimeout {
                value: workflow_timeout_raw,
            })?;

        Ok(Self {
            bind_addr,
            log_filter: env_string("TITULOS_LOG_FILTER", DEFAULT_LOG_FILTER),
            store_path: env_optional("TITULOS_STORE_PATH").map(PathBuf::from),
            jwt_secret: env_string("TITULOS_JWT_SECRET", DEFAULT_JWT_SECRET),
            jwt_ttl_minutes,
            storage_root: PathBuf::from(env_string("TITULOS_STORAGE_ROOT", DEFAULT_STORAGE_ROOT)),
            workflow_webhook_url: env_optional("TITULOS_WORKFLOW_WEBHOOK_URL"),
            workflow_api_key: env_optional("TITULOS_WORKFLOW_API_KEY"),
            workflow_timeout_seconds,
            cors_origins: split_csv(&env_string("TITULOS_CORS_ORIGINS", DEFAULT_CORS_ORIGINS)),
            app_env: env_string("TITULOS_APP_ENV", DEFAULT_APP_ENV),
        })
    }

    pub fn is_production(&self) -> bool {
        self.app_env == "production"
    }

    #[cfg(test)]
    pub fn for_tests(storage_root: PathBuf) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".parse().expect("test bind addr"),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            store_path: None,
            jwt_secret: "test-signing-secret".to_string(),
            jwt_ttl_minutes: DEFAULT_JWT_TTL_MINUTES,
            storage_root,
            workflow_webhook_url: None,
            workflow_api_key: Some("test-workflow-key".to_string()),
            workflow_timeout_seconds: DEFAULT_WORKFLOW_TIMEOUT_SECONDS,
            cors_origins: split_csv(DEFAULT_CORS_ORIGINS),
            app_env: DEFAULT_APP_ENV.to_string(),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_origins_are_trimmed() {
        let origins = split_csv(" http://localhost:5173 , https://app.example.pe ,");
        assert_eq!(
            origins,
            vec![
                "http://localhost:5173".to_string(),
                "https://app.example.pe".to_string()
            ]
        );
    }

    #[test]
    fn test_config_is_not_production() {
        let config = Config::for_tests(PathBuf::from("."));
        assert!(!config.is_production());
    }
}
