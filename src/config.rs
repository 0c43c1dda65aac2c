//! Coordinator configuration
//!
//! Loaded from TOML. Every field has a default so a partial file (or no file
//! at all) is valid.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ClusterError, ClusterResult};

/// Configuration for the cluster coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Attempts made by the reconnection workflow
    pub reconnect_attempts: u32,
    /// Delay between reconnection attempts in milliseconds
    pub reconnect_retry_delay_ms: u64,
    /// Attempts made by the disconnection workflow
    pub disconnect_attempts: u32,
    /// Delay between disconnection attempts in milliseconds
    pub disconnect_retry_delay_ms: u64,
    /// Poll interval while waiting for the flow service to initialize
    pub flow_service_poll_interval_ms: u64,
    /// Poll interval while waiting for a coordinator to be elected
    pub coordinator_poll_interval_ms: u64,
    /// Upper bound for a single outbound protocol exchange
    pub request_timeout_ms: u64,
    /// Returned to connecting nodes when the flow is unavailable
    pub try_again_seconds: u32,
    /// Events retained per node
    pub event_history_capacity: usize,
    /// Workflows allowed to run concurrently
    pub max_workflow_workers: usize,
    /// Path prefix of the counters resource
    pub counters_path_prefix: String,
    /// Identifier of this cluster instance, generated when absent
    pub cluster_instance_id: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: 10,
            reconnect_retry_delay_ms: 5_000,
            disconnect_attempts: 10,
            disconnect_retry_delay_ms: 5_000,
            flow_service_poll_interval_ms: 100,
            coordinator_poll_interval_ms: 100,
            request_timeout_ms: 10_000,
            try_again_seconds: 5,
            event_history_capacity: 10,
            max_workflow_workers: num_cpus::get(),
            counters_path_prefix: "/flow-api/counters/".to_string(),
            cluster_instance_id: None,
        }
    }
}

impl ClusterConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ClusterResult<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ClusterError::Configuration(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> ClusterResult<Self> {
        let config: ClusterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the workflows cannot run with
    pub fn validate(&self) -> ClusterResult<()> {
        if self.reconnect_attempts == 0 {
            return Err(ClusterError::Configuration(
                "reconnect_attempts must be at least 1".to_string(),
            ));
        }
        if self.disconnect_attempts == 0 {
            return Err(ClusterError::Configuration(
                "disconnect_attempts must be at least 1".to_string(),
            ));
        }
        if self.event_history_capacity == 0 {
            return Err(ClusterError::Configuration(
                "event_history_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_workflow_workers == 0 {
            return Err(ClusterError::Configuration(
                "max_workflow_workers must be at least 1".to_string(),
            ));
        }
        if self.flow_service_poll_interval_ms == 0 || self.coordinator_poll_interval_ms == 0 {
            return Err(ClusterError::Configuration(
                "poll intervals must be non-zero".to_string(),
            ));
        }
        if !self.counters_path_prefix.starts_with('/') || !self.counters_path_prefix.ends_with('/') {
            return Err(ClusterError::Configuration(format!(
                "counters_path_prefix must start and end with '/': {}",
                self.counters_path_prefix
            )));
        }
        Ok(())
    }

    pub fn reconnect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_retry_delay_ms)
    }

    pub fn disconnect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.disconnect_retry_delay_ms)
    }

    pub fn flow_service_poll_interval(&self) -> Duration {
        Duration::from_millis(self.flow_service_poll_interval_ms)
    }

    pub fn coordinator_poll_interval(&self) -> Duration {
        Duration::from_millis(self.coordinator_poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Configured instance id, or a fresh one
    pub fn resolve_instance_id(&self) -> String {
        self.cluster_instance_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClusterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reconnect_attempts, 10);
        assert_eq!(config.reconnect_retry_delay(), Duration::from_secs(5));
        assert_eq!(config.event_history_capacity, 10);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ClusterConfig::from_toml_str(
            r#"
            reconnect_attempts = 3
            reconnect_retry_delay_ms = 250
            cluster_instance_id = "cluster-1"
            "#,
        )
        .unwrap();
        assert_eq!(config.reconnect_attempts, 3);
        assert_eq!(config.reconnect_retry_delay(), Duration::from_millis(250));
        assert_eq!(config.disconnect_attempts, 10);
        assert_eq!(config.resolve_instance_id(), "cluster-1");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ClusterConfig::from_toml_str("disconnect_attempts = 0").is_err());
        assert!(ClusterConfig::from_toml_str("event_history_capacity = 0").is_err());
        assert!(ClusterConfig::from_toml_str("counters_path_prefix = \"counters\"").is_err());
        assert!(ClusterConfig::from_toml_str("reconnect_attempts = \"many\"").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_workflow_workers = 2").unwrap();
        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_workflow_workers, 2);

        assert!(ClusterConfig::from_file("/definitely/not/here.toml").is_err());
    }
}
