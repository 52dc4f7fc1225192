//! Server configuration from environment variables.
//!
//! `.env` is loaded by `main` through dotenvy before this runs. Unset
//! variables fall back to defaults; set but unparsable ones are errors.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::storage::{BackendKind, StorageConfig};
use crate::sync::{CodecConfig, SyncConfig};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the binary needs to start
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            storage: StorageConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl AppConfig {
    /// Create from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let host: IpAddr = parse_var(&lookup, "BIND_ADDR")?.unwrap_or(config.bind_addr.ip());
        let port: u16 = parse_var(&lookup, "PORT")?.unwrap_or(config.bind_addr.port());
        config.bind_addr = SocketAddr::new(host, port);

        if let Some(backend) = parse_var::<BackendKind>(&lookup, "STORAGE_BACKEND")? {
            config.storage = config.storage.with_backend(backend);
        }
        if let Some(path) = lookup("STORAGE_PATH") {
            config.storage.path = path;
        }
        if let Some(max) = parse_var(&lookup, "MAX_DOCUMENT_SIZE")? {
            config.storage = config.storage.with_max_document_size(max);
        }
        if let Some(bytes) = parse_var(&lookup, "STORAGE_CACHE_SIZE")? {
            config.storage = config.storage.with_cache_size(bytes);
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "SAVE_INTERVAL_MS")? {
            if ms == 0 {
                return Err(invalid("SAVE_INTERVAL_MS", "0", "must be positive"));
            }
            config.sync = config.sync.with_save_interval(Duration::from_millis(ms));
        }
        if let Some(strict) = parse_var(&lookup, "STRICT_VERSIONING")? {
            config.sync.strict_versioning = strict;
        }

        let mut codec = CodecConfig::default();
        if let Some(threshold) = parse_var::<f32>(&lookup, "MATCH_THRESHOLD")? {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(invalid(
                    "MATCH_THRESHOLD",
                    &threshold.to_string(),
                    "must be between 0 and 1",
                ));
            }
            codec = codec.with_match_threshold(threshold);
        }
        if let Some(distance) = parse_var(&lookup, "MATCH_DISTANCE")? {
            codec = codec.with_match_distance(distance);
        }
        // 0 disables the diff deadline
        if let Some(ms) = parse_var::<u64>(&lookup, "DIFF_TIMEOUT_MS")? {
            codec = codec.with_diff_timeout((ms > 0).then(|| Duration::from_millis(ms)));
        }
        config.sync = config.sync.with_codec(codec);

        Ok(config)
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(var, &raw, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.bind_addr.port(), 5000);
        assert_eq!(config.storage.backend, BackendKind::Sled);
        assert!(!config.sync.strict_versioning);
        assert_eq!(config.sync.codec.match_distance, 1000);
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("BIND_ADDR", "127.0.0.1"),
            ("PORT", "8080"),
            ("STORAGE_BACKEND", "memory"),
            ("STORAGE_PATH", "/tmp/docs.sled"),
            ("SAVE_INTERVAL_MS", "250"),
            ("MAX_DOCUMENT_SIZE", "4096"),
            ("MATCH_THRESHOLD", "0.3"),
            ("MATCH_DISTANCE", "200"),
            ("STRICT_VERSIONING", "true"),
            ("STORAGE_CACHE_SIZE", "1048576"),
            ("DIFF_TIMEOUT_MS", "0"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.storage.backend, BackendKind::Memory);
        assert_eq!(config.storage.path, "/tmp/docs.sled");
        assert_eq!(config.storage.max_document_size, 4096);
        assert_eq!(config.sync.save_interval, Duration::from_millis(250));
        assert!(config.sync.strict_versioning);
        assert_eq!(config.sync.codec.match_threshold, 0.3);
        assert_eq!(config.sync.codec.match_distance, 200);
        assert_eq!(config.storage.cache_size, 1048576);
        assert_eq!(config.sync.codec.diff_timeout, None);
    }

    #[test]
    fn test_invalid_values() {
        let err = AppConfig::from_lookup(lookup(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "PORT", .. }));

        assert!(AppConfig::from_lookup(lookup(&[("MATCH_THRESHOLD", "1.5")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("SAVE_INTERVAL_MS", "0")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("STORAGE_BACKEND", "redis")])).is_err());
    }
}
