//! DHT tuning parameters.
//!
//! Passed by value into [`DhtNode::start`](crate::node::DhtNode::start); every
//! component reads what it needs from here rather than from shared globals.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DhtError, Result};

/// DHT configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtConfig {
    /// Bucket size, and the number of neighbours returned by lookups.
    #[serde(default = "default_ksize")]
    pub ksize: usize,
    /// Lookup parallelism.
    #[serde(default = "default_alpha")]
    pub alpha: usize,
    /// How long an outbound RPC waits for its reply.
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    /// Poll interval while waiting for the transport to come up.
    #[serde(default = "default_transport_retry_secs")]
    pub transport_retry_secs: u64,
    /// Maximum ordinary (non-append) stores issued per key transfer.
    /// 0 transfers every eligible key.
    #[serde(default = "default_transfer_batch_limit")]
    pub transfer_batch_limit: usize,
    /// Lifetime of stored values. Certificates never expire.
    #[serde(default = "default_value_ttl_secs")]
    pub value_ttl_secs: u64,
    /// Bucket refresh and value expiry period.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Logical partition tag carried on every datagram.
    #[serde(default = "default_network")]
    pub network: String,
}

fn default_ksize() -> usize {
    20
}

fn default_alpha() -> usize {
    3
}

fn default_rpc_timeout_secs() -> u64 {
    5
}

fn default_transport_retry_secs() -> u64 {
    1
}

fn default_transfer_batch_limit() -> usize {
    1
}

fn default_value_ttl_secs() -> u64 {
    7 * 24 * 3600
}

fn default_refresh_interval_secs() -> u64 {
    3600
}

fn default_network() -> String {
    "ALL".to_string()
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            ksize: default_ksize(),
            alpha: default_alpha(),
            rpc_timeout_secs: default_rpc_timeout_secs(),
            transport_retry_secs: default_transport_retry_secs(),
            transfer_batch_limit: default_transfer_batch_limit(),
            value_ttl_secs: default_value_ttl_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
            network: default_network(),
        }
    }
}

impl DhtConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn transport_retry(&self) -> Duration {
        Duration::from_secs(self.transport_retry_secs)
    }

    pub fn value_ttl(&self) -> Duration {
        Duration::from_secs(self.value_ttl_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// The key-transfer store limit, `None` when unlimited.
    pub fn transfer_limit(&self) -> Option<usize> {
        (self.transfer_batch_limit > 0).then_some(self.transfer_batch_limit)
    }

    /// Reject values the routing code cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.ksize == 0 {
            return Err(DhtError::Config("ksize must be at least 1".into()));
        }
        if self.alpha == 0 {
            return Err(DhtError::Config("alpha must be at least 1".into()));
        }
        if self.rpc_timeout_secs == 0 {
            return Err(DhtError::Config("rpc_timeout_secs must be at least 1".into()));
        }
        if self.refresh_interval_secs == 0 {
            return Err(DhtError::Config(
                "refresh_interval_secs must be at least 1".into(),
            ));
        }
        if self.network.is_empty() {
            return Err(DhtError::Config("network tag must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = DhtConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ksize, 20);
        assert_eq!(config.alpha, 3);
        assert_eq!(config.transfer_limit(), Some(1));
        assert_eq!(config.rpc_timeout(), Duration::from_secs(5));
        assert_eq!(config.network, "ALL");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: DhtConfig = toml::from_str("ksize = 8\nnetwork = \"lab\"").expect("parse");
        assert_eq!(config.ksize, 8);
        assert_eq!(config.network, "lab");
        assert_eq!(config.alpha, 3);
        assert_eq!(config.value_ttl_secs, 604_800);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = DhtConfig {
            ksize: 0,
            ..DhtConfig::default()
        };
        assert!(matches!(config.validate(), Err(DhtError::Config(_))));
        config.ksize = 20;
        config.network.clear();
        assert!(config.validate().is_err());
        config.network = "ALL".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_batch_limit_is_unlimited() {
        let config = DhtConfig {
            transfer_batch_limit: 0,
            ..DhtConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.transfer_limit(), None);
    }
}
