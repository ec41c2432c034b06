use std::env;
use std::str::FromStr;

use thiserror::Error;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DATA_DIR: &str = "data/blockchain";
const DEFAULT_MINING_REWARD: u64 = 50;

/// Errors that can occur while reading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

/// Node configuration, read from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// Directory of the block store; `None` keeps the chain in memory
    pub data_dir: Option<String>,

    /// Coinbase reward paid by the `/mine` endpoint and the auto-miner
    pub mining_reward: u64,

    /// Interval of the auto-miner; `None` disables it
    pub auto_mine_secs: Option<u64>,
}

impl Config {
    /// Loads `.env` if present, then reads the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = parse_or("PORT", lookup("PORT"), DEFAULT_PORT)?;

        let data_dir = match lookup("DATA_DIR") {
            Some(dir) if dir.trim().is_empty() => None,
            Some(dir) => Some(dir),
            None => Some(DEFAULT_DATA_DIR.to_string()),
        };

        let mining_reward = parse_or(
            "MINING_REWARD",
            lookup("MINING_REWARD"),
            DEFAULT_MINING_REWARD,
        )?;

        let auto_mine_secs = match lookup("AUTO_MINE_SECS") {
            Some(value) => Some(parse::<u64>("AUTO_MINE_SECS", value)?).filter(|secs| *secs > 0),
            None => None,
        };

        Ok(Config {
            host,
            port,
            data_dir,
            mining_reward,
            auto_mine_secs,
        })
    }
}

fn parse<T: FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { name, value })
}

fn parse_or<T: FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    value.map_or(Ok(default), |value| parse(name, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.data_dir.as_deref(), Some("data/blockchain"));
        assert_eq!(config.mining_reward, 50);
        assert_eq!(config.auto_mine_secs, None);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("HOST", "0.0.0.0"),
            ("PORT", "9000"),
            ("DATA_DIR", "/tmp/ledger"),
            ("MINING_REWARD", "25"),
            ("AUTO_MINE_SECS", "10"),
        ])
        .unwrap();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.data_dir.as_deref(), Some("/tmp/ledger"));
        assert_eq!(config.mining_reward, 25);
        assert_eq!(config.auto_mine_secs, Some(10));
    }

    #[test]
    fn test_empty_data_dir_means_in_memory() {
        let config = config_from(&[("DATA_DIR", ""), ("AUTO_MINE_SECS", "0")]).unwrap();

        assert_eq!(config.data_dir, None);
        assert_eq!(config.auto_mine_secs, None);
    }

    #[test]
    fn test_invalid_number() {
        let err = config_from(&[("PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "PORT", .. }));
    }
}
