//! Environment variable parsing shared by every `*Config::from_env()`.
//!
//! Configs read through a lookup function instead of `std::env` directly, so
//! the parsing rules can be exercised without touching the process environment.

use std::env;

use thiserror::Error;

/// Error raised while reading configuration from the environment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvError {
    /// Missing required environment variable.
    #[error("missing required env var: {0}")]
    Missing(&'static str),
    /// Invalid environment variable value.
    #[error("invalid env var {key}={value:?}: {reason}")]
    Invalid {
        /// The environment variable key.
        key: &'static str,
        /// The offending value.
        value: String,
        /// The reason for invalidity.
        reason: &'static str,
    },
}

/// Lookup reading the real process environment, after loading `.env` if present.
pub(crate) fn process_env() -> impl Fn(&str) -> Option<String> {
    let _ = dotenvy::dotenv();
    |key: &str| env::var(key).ok()
}

/// Reader over a key lookup, with typed accessors and defaults.
pub(crate) struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    pub(crate) const fn new(lookup: F) -> Self {
        Self { lookup }
    }

    /// Raw value, with blank strings treated as unset.
    pub(crate) fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    pub(crate) fn required(&self, key: &'static str) -> Result<String, EnvError> {
        self.get(key).ok_or(EnvError::Missing(key))
    }

    pub(crate) fn string_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    pub(crate) fn u32_or(&self, key: &'static str, default: u32) -> Result<u32, EnvError> {
        self.get(key).map_or(Ok(default), |v| {
            v.trim().parse::<u32>().map_err(|_| EnvError::Invalid {
                key,
                value: v,
                reason: "expected an unsigned integer",
            })
        })
    }

    pub(crate) fn u64_or(&self, key: &'static str, default: u64) -> Result<u64, EnvError> {
        self.get(key).map_or(Ok(default), |v| {
            v.trim().parse::<u64>().map_err(|_| EnvError::Invalid {
                key,
                value: v,
                reason: "expected an unsigned integer",
            })
        })
    }

    pub(crate) fn csv_or(&self, key: &str, default: &str) -> Vec<String> {
        self.string_or(key, default)
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}
