//! Gateway configuration schema.
//!
//! Only the schema and defaults live here; discovering and reading the
//! configuration file belongs to the process bootstrap.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Maximum lifetime of a lease.
    #[serde(default = "default_max_lease_time", with = "duration_secs")]
    pub max_lease_time: Duration,

    /// Path to the receiver worker executable.
    #[serde(default = "default_receiver_path")]
    pub receiver_path: PathBuf,

    /// Path to the lease database file.
    #[serde(default = "default_lease_db_path")]
    pub lease_db_path: PathBuf,

    /// Path to the repository access configuration.
    #[serde(default = "default_access_config_path")]
    pub access_config_path: PathBuf,
}

fn default_max_lease_time() -> Duration {
    Duration::from_secs(7200)
}

fn default_receiver_path() -> PathBuf {
    PathBuf::from("/usr/bin/cvmfs_receiver")
}

fn default_lease_db_path() -> PathBuf {
    PathBuf::from("/var/lib/cvmfs-gateway/leases.db")
}

fn default_access_config_path() -> PathBuf {
    PathBuf::from("/etc/cvmfs/gateway/repo.json")
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_lease_time: default_max_lease_time(),
            receiver_path: default_receiver_path(),
            lease_db_path: default_lease_db_path(),
            access_config_path: default_access_config_path(),
        }
    }
}

/// Serializes durations as whole seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_lease_time, Duration::from_secs(7200));
        assert_eq!(
            config.receiver_path,
            PathBuf::from("/usr/bin/cvmfs_receiver")
        );
    }

    #[test]
    fn test_max_lease_time_in_seconds() {
        let config: GatewayConfig =
            serde_json::from_str(r#"{"max_lease_time": 900}"#).unwrap();
        assert_eq!(config.max_lease_time, Duration::from_secs(900));
    }

    #[test]
    fn test_round_trip() {
        let config = GatewayConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: GatewayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_lease_time, config.max_lease_time);
        assert_eq!(back.lease_db_path, config.lease_db_path);
    }
}
