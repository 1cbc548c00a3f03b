//! Service configuration
//!
//! Everything is read once at startup, validated, and then passed by value
//! into the pipeline. Nothing here is mutated per request.

use crate::error::{QueryError, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// SSH tunnel settings
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
    pub private_key_password: Option<String>,
    /// Forward target as seen from the SSH host
    pub remote_host: String,
    pub remote_port: u16,
    pub local_host: String,
    /// 0 lets the OS pick a free port
    pub local_port: u16,
    pub connect_timeout: Duration,
}

/// Warehouse credentials; host and port come from the tunnel
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    pub search_path: String,
    pub period_table: String,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub tunnel: TunnelConfig,
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub dictionary_path: PathBuf,
    pub max_concurrent_queries: usize,
}

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| QueryError::Configuration(format!("{} must be set", key)))
        };

        // The API key is checked first so a missing key fails before anything else
        let api_key = required("OPENAI_API_KEY")?;

        let llm = LlmConfig {
            api_key,
            model: get("OPENAI_MODEL").unwrap_or_else(|| "gpt-3.5-turbo".to_string()),
            base_url: get("OPENAI_BASE_URL").unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            timeout: Duration::from_secs(parse_or(&get, "LLM_TIMEOUT_SECS", 120)?),
        };

        let password = get("SSH_PASSWORD");
        let private_key = get("SSH_PRIVATE_KEY").map(PathBuf::from);
        if password.is_none() && private_key.is_none() {
            return Err(QueryError::Configuration(
                "one of SSH_PASSWORD or SSH_PRIVATE_KEY must be set".to_string(),
            ));
        }

        let tunnel = TunnelConfig {
            ssh_host: required("DB_HOST")?,
            ssh_port: parse_or(&get, "SSH_PORT", 2422)?,
            username: required("SSH_USERNAME")?,
            password,
            private_key,
            private_key_password: get("SSH_PRIVATE_KEY_PASSWORD"),
            remote_host: get("REMOTE_BIND_HOST").unwrap_or_else(|| "localhost".to_string()),
            remote_port: parse_or(&get, "REMOTE_BIND_PORT", 5432)?,
            local_host: get("LOCAL_BIND_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            local_port: parse_or(&get, "LOCAL_BIND_PORT", 0)?,
            connect_timeout: Duration::from_secs(parse_or(&get, "SSH_CONNECT_TIMEOUT_SECS", 30)?),
        };

        let database = DatabaseConfig {
            user: required("DB_USER")?,
            password: get("DB_PASSWORD"),
            database: get("DB_NAME").unwrap_or_else(|| "lamisplus_ods_dwh".to_string()),
            search_path: get("DB_SEARCH_PATH").unwrap_or_else(|| "expanded_hts_prep,public".to_string()),
            period_table: get("PERIOD_TABLE").unwrap_or_else(|| "expanded_hts_prep.period".to_string()),
            acquire_timeout: Duration::from_secs(30),
        };

        let max_concurrent_queries: usize = parse_or(&get, "MAX_CONCURRENT_QUERIES", 4)?;
        if max_concurrent_queries == 0 {
            return Err(QueryError::Configuration(
                "MAX_CONCURRENT_QUERIES must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            tunnel,
            database,
            llm,
            dictionary_path: get("DICTIONARY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("Nigeria_Text2Code_DataDictionary.csv")),
            max_concurrent_queries,
        })
    }
}

impl DatabaseConfig {
    /// Named schemas on the search path, lowercased, without `$user`
    pub fn schemas(&self) -> Vec<String> {
        self.search_path
            .split(',')
            .map(|schema| schema.trim().trim_matches('"').to_lowercase())
            .filter(|schema| !schema.is_empty() && schema != "$user")
            .collect()
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| QueryError::Configuration(format!("{} has invalid value {:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}
