use std::{str::FromStr, time::Duration};

use anyhow::{Context, Result, bail};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => bail!("Unknown log format `{other}`, expected `text` or `json`"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub consumers: usize,
    pub lock_timeout: Duration,
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, applying defaults for
    /// everything except `DATABASE_URL`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL is not set")?;
        let config = Self {
            database_url,
            max_connections: parse_or(&lookup, "ENGINE_MAX_CONNECTIONS", 10)?,
            consumers: parse_or(&lookup, "ENGINE_CONSUMERS", 1)?,
            lock_timeout: Duration::from_millis(parse_or(&lookup, "ENGINE_LOCK_TIMEOUT_MS", 5000)?),
            max_attempts: parse_or(&lookup, "ENGINE_MAX_ATTEMPTS", 5)?,
            poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "ENGINE_POLL_INTERVAL_MS",
                250,
            )?),
            lease: Duration::from_secs(parse_or(&lookup, "ENGINE_LEASE_SECS", 30)?),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
            log_format: parse_or(&lookup, "LOG_FORMAT", LogFormat::Text)?,
        };
        if config.consumers == 0 {
            bail!("ENGINE_CONSUMERS must be at least 1");
        }
        // Postgres reads a zero lock_timeout as no timeout at all
        if config.lock_timeout.is_zero() {
            bail!("ENGINE_LOCK_TIMEOUT_MS must be at least 1");
        }
        if config.max_attempts == 0 {
            bail!("ENGINE_MAX_ATTEMPTS must be at least 1");
        }
        Ok(config)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("Invalid {key}=`{raw}`: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<EngineConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply() {
        let config = config(&[("DATABASE_URL", "postgres://localhost/ledger")]).unwrap();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.consumers, 1);
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.lease, Duration::from_secs(30));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("DATABASE_URL", "postgres://db/ledger"),
            ("ENGINE_CONSUMERS", "4"),
            ("ENGINE_LOCK_TIMEOUT_MS", "150"),
            ("LOG_FORMAT", "JSON"),
        ])
        .unwrap();
        assert_eq!(config.consumers, 4);
        assert_eq!(config.lock_timeout, Duration::from_millis(150));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn rejects_missing_url_and_bad_values() {
        assert!(config(&[]).is_err());

        let err = config(&[("DATABASE_URL", "x"), ("ENGINE_MAX_ATTEMPTS", "many")]).unwrap_err();
        assert!(err.to_string().contains("ENGINE_MAX_ATTEMPTS"));

        assert!(config(&[("DATABASE_URL", "x"), ("ENGINE_CONSUMERS", "0")]).is_err());
        assert!(config(&[("DATABASE_URL", "x"), ("LOG_FORMAT", "xml")]).is_err());

        let err = config(&[("DATABASE_URL", "x"), ("ENGINE_LOCK_TIMEOUT_MS", "0")]).unwrap_err();
        assert!(err.to_string().contains("ENGINE_LOCK_TIMEOUT_MS"));
    }
}
