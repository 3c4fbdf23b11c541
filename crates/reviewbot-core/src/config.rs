//! Configuration loading: TOML file, overridable by environment
//! variables, with credentials kept out of `Debug` output via `secrecy`.

use std::path::Path;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::resilience::{CircuitBreakerConfig, RetryConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub azure_devops: AzureDevOpsConfig,
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default = "default_concurrency")]
    pub analysis_concurrency: usize,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_concurrency() -> usize {
    8
}

fn default_agent_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind_addr: String,
    pub webhook_secret: SecretString,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "reviewbot.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AzureDevOpsConfig {
    pub organization_url: String,
    pub personal_access_token: SecretString,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzerConfig {
    pub endpoint: String,
    pub api_key: SecretString,
    #[serde(default = "default_analyzer_model")]
    pub model: String,
}

fn default_analyzer_model() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Config {
    /// Loads configuration from a TOML file, then applies `REVIEWBOT_*`
    /// environment overrides for the values operators rotate most often
    /// (secrets and the bind address).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.as_ref().display())))?;
        let mut config: Config =
            toml::from_str(&raw).map_err(|e| Error::Config(format!("parsing config: {e}")))?;

        if let Ok(bind) = std::env::var("REVIEWBOT_BIND_ADDR") {
            config.server.bind_addr = bind;
        }
        if let Ok(secret) = std::env::var("REVIEWBOT_WEBHOOK_SECRET") {
            config.server.webhook_secret = SecretString::from(secret);
        }
        if let Ok(pat) = std::env::var("REVIEWBOT_AZURE_DEVOPS_PAT") {
            config.azure_devops.personal_access_token = SecretString::from(pat);
        }
        if let Ok(key) = std::env::var("REVIEWBOT_ANALYZER_API_KEY") {
            config.analyzer.api_key = SecretString::from(key);
        }
        if let Ok(db_path) = std::env::var("REVIEWBOT_DATABASE_PATH") {
            config.database.path = db_path;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_config_and_applies_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [server]
            webhook_secret = "s3cr3t"

            [database]
            path = "test.db"

            [azure_devops]
            organization_url = "https://dev.azure.com/org"
            personal_access_token = "pat-token"

            [analyzer]
            endpoint = "https://analyzer.example.com"
            api_key = "analyzer-key"
            "#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.analysis_concurrency, 8);
        assert_eq!(config.agent_timeout_secs, 600);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn env_override_replaces_bind_addr() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [server]
            webhook_secret = "s3cr3t"
            bind_addr = "127.0.0.1:9000"

            [database]
            path = "test.db"

            [azure_devops]
            organization_url = "https://dev.azure.com/org"
            personal_access_token = "pat-token"

            [analyzer]
            endpoint = "https://analyzer.example.com"
            api_key = "analyzer-key"
            "#
        )
        .unwrap();

        std::env::set_var("REVIEWBOT_BIND_ADDR", "0.0.0.0:7777");
        let config = Config::load(file.path()).unwrap();
        std::env::remove_var("REVIEWBOT_BIND_ADDR");
        assert_eq!(config.server.bind_addr, "0.0.0.0:7777");
    }
}
