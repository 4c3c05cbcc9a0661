// Broker configuration, read from CONDUCTOR_* environment variables

use std::time::Duration;

use conductor_engine::operation::OperationsConfig;
use conductor_engine::{BatchSchedulerConfig, PartitionConfig};
use serde::{Deserialize, Serialize};

/// Configuration for one broker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub partition: PartitionConfig,
    pub operations: OperationsConfig,
    /// Shared by the partition and the operation executor schedulers
    pub scheduler: BatchSchedulerConfig,
    /// Stream id stamped on requests sent by the operation executor
    pub request_stream_id: i32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            partition: PartitionConfig::default(),
            operations: OperationsConfig::default(),
            scheduler: BatchSchedulerConfig::default(),
            request_stream_id: 1,
        }
    }
}

impl BrokerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create configuration from any variable source; unset or unparsable
    /// values keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            name: &str,
        ) -> Option<T> {
            lookup(name).and_then(|s| s.trim().parse().ok())
        }

        let defaults = Self::default();

        let mut partition = defaults.partition;
        if let Some(id) = parsed(&lookup, "CONDUCTOR_PARTITION_ID") {
            partition = partition.with_partition_id(id);
        }
        if let Some(max) = parsed(&lookup, "CONDUCTOR_MAX_COMMANDS_PER_ROUND") {
            partition = partition.with_max_commands_per_round(max);
        }

        let mut scheduler = defaults.scheduler;
        if let Some(size) = parsed(&lookup, "CONDUCTOR_MAX_BATCH_SIZE") {
            scheduler = scheduler.with_max_batch_size(size);
        }
        if let Some(ms) = parsed(&lookup, "CONDUCTOR_IDLE_BACKOFF_MS") {
            scheduler = scheduler.with_idle_backoff(Duration::from_millis(ms));
        }

        let mut operations = defaults.operations;
        if let Some(max) = parsed(&lookup, "CONDUCTOR_BATCH_OPERATION_MAX_SIZE") {
            operations = operations.with_batch_operation_max_size(max);
        }
        if let Some(retries) = parsed(&lookup, "CONDUCTOR_OPERATION_RETRIES") {
            operations = operations.with_update_retries_value(retries);
        }

        Self {
            partition,
            operations,
            scheduler,
            request_stream_id: parsed(&lookup, "CONDUCTOR_REQUEST_STREAM_ID")
                .unwrap_or(defaults.request_stream_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> BrokerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BrokerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = config_from(&[]);
        assert_eq!(config.partition.partition_id, 1);
        assert_eq!(config.operations.batch_operation_max_size, 1000);
        assert_eq!(config.operations.update_retries_value, 1);
        assert_eq!(config.scheduler, BatchSchedulerConfig::default());
        assert_eq!(config.request_stream_id, 1);
    }

    #[test]
    fn test_reads_variables() {
        let config = config_from(&[
            ("CONDUCTOR_PARTITION_ID", "3"),
            ("CONDUCTOR_MAX_BATCH_SIZE", "25"),
            ("CONDUCTOR_IDLE_BACKOFF_MS", "250"),
            ("CONDUCTOR_BATCH_OPERATION_MAX_SIZE", "50"),
            ("CONDUCTOR_OPERATION_RETRIES", "4"),
            ("CONDUCTOR_REQUEST_STREAM_ID", "7"),
        ]);

        assert_eq!(config.partition.partition_id, 3);
        assert_eq!(config.scheduler.max_batch_size, 25);
        assert_eq!(config.scheduler.idle_backoff, Duration::from_millis(250));
        assert_eq!(config.operations.batch_operation_max_size, 50);
        assert_eq!(config.operations.update_retries_value, 4);
        assert_eq!(config.request_stream_id, 7);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = config_from(&[
            ("CONDUCTOR_MAX_BATCH_SIZE", "lots"),
            ("CONDUCTOR_OPERATION_RETRIES", "0"),
        ]);

        assert_eq!(config.scheduler.max_batch_size, 100);
        // Zero retries would leave the incident unresolved
        assert_eq!(config.operations.update_retries_value, 1);
    }
}
