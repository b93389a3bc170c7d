//! Environment-backed runtime configuration for `nestchat-smoke`.

use std::{env, error::Error, fmt};

const DEFAULT_USER_ID: &str = "demo-buyer";
const DEFAULT_PEER_ID: &str = "demo-broker";
const DEFAULT_CONVERSATION_ID: &str = "demo-conversation";
const DEFAULT_CACHE_CAP: usize = 50;
const DEFAULT_FETCH_LIMIT: usize = 50;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 30_000;

/// Runtime configuration used by the smoke app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeConfig {
    /// Current user id.
    pub user_id: String,
    /// Conversation peer id.
    pub peer_id: String,
    /// Conversation to open.
    pub conversation_id: String,
    /// Cache retention cap per conversation.
    pub cache_cap: usize,
    /// Initial fetch limit.
    pub fetch_limit: usize,
    /// Interval of the periodic status sweep.
    pub sweep_interval_ms: u64,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let user_id = trimmed_or("NESTCHAT_USER", DEFAULT_USER_ID, &mut lookup);
        let peer_id = trimmed_or("NESTCHAT_PEER", DEFAULT_PEER_ID, &mut lookup);
        let conversation_id =
            trimmed_or("NESTCHAT_CONVERSATION", DEFAULT_CONVERSATION_ID, &mut lookup);

        let cache_cap = parse_usize("NESTCHAT_CACHE_CAP", DEFAULT_CACHE_CAP, &mut lookup)?;
        let fetch_limit = parse_usize("NESTCHAT_FETCH_LIMIT", DEFAULT_FETCH_LIMIT, &mut lookup)?;
        let sweep_interval_ms = parse_u64(
            "NESTCHAT_SWEEP_INTERVAL_MS",
            DEFAULT_SWEEP_INTERVAL_MS,
            &mut lookup,
        )?;

        if cache_cap == 0 {
            return Err(ConfigError::InvalidValue {
                key: "NESTCHAT_CACHE_CAP",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if fetch_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "NESTCHAT_FETCH_LIMIT",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "NESTCHAT_SWEEP_INTERVAL_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            user_id,
            peer_id,
            conversation_id,
            cache_cap,
            fetch_limit,
            sweep_interval_ms,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn trimmed_or<F>(key: &'static str, default: &str, lookup: &mut F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_owned())
}

fn parse_usize<F>(key: &'static str, default: usize, lookup: &mut F) -> Result<usize, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .parse::<usize>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_u64<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SmokeConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SmokeConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let cfg = config_from_pairs(&[]).expect("empty env should parse");
        assert_eq!(cfg.user_id, DEFAULT_USER_ID);
        assert_eq!(cfg.peer_id, DEFAULT_PEER_ID);
        assert_eq!(cfg.cache_cap, DEFAULT_CACHE_CAP);
        assert_eq!(cfg.fetch_limit, DEFAULT_FETCH_LIMIT);
        assert_eq!(cfg.sweep_interval_ms, DEFAULT_SWEEP_INTERVAL_MS);
    }

    #[test]
    fn parses_overrides_and_trims_ids() {
        let cfg = config_from_pairs(&[
            ("NESTCHAT_USER", "  buyer-7 "),
            ("NESTCHAT_CACHE_CAP", "20"),
            ("NESTCHAT_SWEEP_INTERVAL_MS", "5000"),
        ])
        .expect("overrides should parse");

        assert_eq!(cfg.user_id, "buyer-7");
        assert_eq!(cfg.cache_cap, 20);
        assert_eq!(cfg.sweep_interval_ms, 5_000);
    }

    #[test]
    fn rejects_invalid_and_zero_values() {
        let err = config_from_pairs(&[("NESTCHAT_FETCH_LIMIT", "abc")])
            .expect_err("non-numeric limit should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "NESTCHAT_FETCH_LIMIT",
                ..
            }
        ));

        let err = config_from_pairs(&[("NESTCHAT_CACHE_CAP", "0")])
            .expect_err("zero cache cap should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "NESTCHAT_CACHE_CAP",
                ..
            }
        ));
    }
}
