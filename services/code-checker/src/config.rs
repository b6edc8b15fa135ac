//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Credentials are loaded from the CHECKER_TOKENS env var or tokens_file,
//! never stored in the TOML directly to avoid leaking secrets.

use check_client::ClientConfig;
use common::Secret;
use orchestrator::EngineConfig;
use retry_policy::RetryConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Env var holding credentials, separated by newlines or commas.
pub const TOKENS_ENV: &str = "CHECKER_TOKENS";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub input: InputConfig,
    #[serde(default)]
    pub admin: Option<AdminConfig>,
}

/// Where codes and credentials come from, and where results go
#[derive(Debug, Deserialize)]
pub struct InputConfig {
    /// One code per line. Blank lines and `#` comments are ignored.
    pub codes_file: PathBuf,
    /// Credential file, one per line (alternative to CHECKER_TOKENS)
    #[serde(default)]
    pub tokens_file: Option<PathBuf>,
    /// Finalized results are appended here as JSON lines.
    #[serde(default)]
    pub results_file: Option<PathBuf>,
    #[serde(skip)]
    pub tokens: Vec<Secret<String>>,
}

/// Optional introspection listener
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_connections() -> usize {
    64
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Credential resolution order:
    /// 1. CHECKER_TOKENS env var
    /// 2. tokens_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        config
            .engine
            .validate()
            .map_err(|e| common::Error::Config(e.to_string()))?;
        config
            .client
            .validate()
            .map_err(|e| common::Error::Config(e.to_string()))?;
        config.retry.validate()?;

        if config.admin.as_ref().is_some_and(|a| a.max_connections == 0) {
            return Err(common::Error::Config(
                "admin.max_connections must be greater than 0".into(),
            ));
        }

        // Env var takes precedence over file
        if let Ok(raw) = std::env::var(TOKENS_ENV) {
            config.input.tokens = parse_tokens(&raw);
        } else if let Some(ref tokens_file) = config.input.tokens_file {
            let raw = std::fs::read_to_string(tokens_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read tokens_file {}: {e}",
                    tokens_file.display()
                ))
            })?;
            config.input.tokens = parse_tokens(&raw);
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("code-checker.toml")
    }
}

/// Split a credential list on newlines and commas, dropping blanks.
pub fn parse_tokens(raw: &str) -> Vec<Secret<String>> {
    raw.split(['\n', ','])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| Secret::new(t.to_owned()))
        .collect()
}
