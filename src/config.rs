//! Environment-driven server configuration.
//!
//! Values are read once at startup, after `dotenvy` has merged any `.env`
//! file into the process environment.

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::storage::StorageConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("{0}")]
    Inconsistent(String),
}

/// Which persistence gateway backs the rooms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Sled,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sled" => Ok(StorageBackend::Sled),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(()),
        }
    }
}

/// Timing and sizing for each connection's pump pair
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// A peer silent for this long is considered dead
    pub read_deadline: Duration,
    /// Period of the write pump's liveness probe; must be below `read_deadline`
    pub ping_interval: Duration,
    /// Upper bound for a single transport write
    pub write_deadline: Duration,
    /// Capacity of the per-connection outbound queue
    pub outbound_capacity: usize,
    /// Largest inbound frame accepted by the transport
    pub max_frame_bytes: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            read_deadline: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
            write_deadline: Duration::from_secs(10),
            outbound_capacity: 256,
            max_frame_bytes: 64 * 1024,
        }
    }
}

/// Settings shared by every room actor
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Capacity of each control queue (register, unregister, broadcast, requests)
    pub control_capacity: usize,
    /// Create the backing document when a room key has none
    pub auto_create: bool,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            control_capacity: 256,
            auto_create: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub backend: StorageBackend,
    pub storage: StorageConfig,
    pub room: RoomConfig,
    pub pump: PumpConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            backend: StorageBackend::Sled,
            storage: StorageConfig::default(),
            room: RoomConfig::default(),
            pump: PumpConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build the configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            parse_or(&lookup, key, default.as_secs()).map(Duration::from_secs)
        };

        let pump = PumpConfig {
            read_deadline: secs("READ_DEADLINE_SECS", defaults.pump.read_deadline)?,
            ping_interval: secs("PING_INTERVAL_SECS", defaults.pump.ping_interval)?,
            write_deadline: secs("WRITE_DEADLINE_SECS", defaults.pump.write_deadline)?,
            outbound_capacity: parse_or(
                &lookup,
                "OUTBOUND_CAPACITY",
                defaults.pump.outbound_capacity,
            )?,
            max_frame_bytes: parse_or(&lookup, "MAX_FRAME_BYTES", defaults.pump.max_frame_bytes)?,
        };

        // Both drive timers that cannot take a zero period
        for (key, value) in [
            ("PING_INTERVAL_SECS", pump.ping_interval),
            ("WRITE_DEADLINE_SECS", pump.write_deadline),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: "0".to_string(),
                });
            }
        }
        if pump.ping_interval >= pump.read_deadline {
            return Err(ConfigError::Inconsistent(format!(
                "PING_INTERVAL_SECS ({}s) must be shorter than READ_DEADLINE_SECS ({}s)",
                pump.ping_interval.as_secs(),
                pump.read_deadline.as_secs()
            )));
        }
        if pump.outbound_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "OUTBOUND_CAPACITY",
                value: "0".to_string(),
            });
        }

        let room = RoomConfig {
            control_capacity: parse_or(
                &lookup,
                "CONTROL_CAPACITY",
                defaults.room.control_capacity,
            )?,
            auto_create: parse_or(&lookup, "AUTO_CREATE_ROOMS", defaults.room.auto_create)?,
        };
        if room.control_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CONTROL_CAPACITY",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "PORT", defaults.port)?,
            backend: parse_or(&lookup, "STORAGE_BACKEND", defaults.backend)?,
            storage: lookup("STORAGE_PATH")
                .map(StorageConfig::new)
                .unwrap_or(defaults.storage),
            room,
            pump,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.port, 5000);
        assert_eq!(config.backend, StorageBackend::Sled);
        assert_eq!(config.pump.read_deadline, Duration::from_secs(60));
        assert_eq!(config.pump.ping_interval, Duration::from_secs(54));
        assert_eq!(config.pump.write_deadline, Duration::from_secs(10));
        assert_eq!(config.pump.outbound_capacity, 256);
        assert!(config.room.auto_create);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("PORT", "8080"),
            ("STORAGE_BACKEND", "memory"),
            ("AUTO_CREATE_ROOMS", "false"),
            ("STORAGE_PATH", "/tmp/docs.sled"),
        ])
        .unwrap();

        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.backend, StorageBackend::Memory);
        assert!(!config.room.auto_create);
        assert_eq!(config.storage.path, "/tmp/docs.sled");
    }

    #[test]
    fn test_invalid_number() {
        let err = config_from(&[("PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "PORT", .. }));
    }

    #[test]
    fn test_ping_must_beat_deadline() {
        let err = config_from(&[("READ_DEADLINE_SECS", "10"), ("PING_INTERVAL_SECS", "10")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }

    #[test]
    fn test_zero_timers_are_rejected() {
        let err = config_from(&[("PING_INTERVAL_SECS", "0")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "PING_INTERVAL_SECS",
                ..
            }
        ));

        let err = config_from(&[("WRITE_DEADLINE_SECS", "0")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "WRITE_DEADLINE_SECS",
                ..
            }
        ));
    }
}
