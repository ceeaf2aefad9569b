//! Overlay configuration

use std::time::Duration;

use ringmesh_dht::{DEFAULT_DIGIT_BITS, DEFAULT_LEAF_SET_HALF_SIZE, DEFAULT_ROUTE_SET_SIZE};
use ringmesh_protocol::types::check_digit_bits;
use ringmesh_protocol::Id;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RoutingError};

/// Per-node overlay parameters, fixed at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Leaf set entries on each side
    #[serde(default = "default_leaf_set_half_size")]
    pub leaf_set_half_size: usize,

    /// Bits per routing digit (1 to 8)
    #[serde(default = "default_digit_bits")]
    pub digit_bits: u32,

    /// Handles kept per routing table slot
    #[serde(default = "default_route_set_size")]
    pub route_set_size: usize,

    /// How long `join` waits for the terminal node
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// Period of the maintenance task, disabled when unset
    #[serde(default)]
    pub maintenance_interval_secs: Option<u64>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig {
            leaf_set_half_size: default_leaf_set_half_size(),
            digit_bits: default_digit_bits(),
            route_set_size: default_route_set_size(),
            join_timeout_ms: default_join_timeout_ms(),
            maintenance_interval_secs: None,
        }
    }
}

impl OverlayConfig {
    /// Check the parameters before a node is built from them
    pub fn validate(&self) -> Result<()> {
        if self.leaf_set_half_size == 0 {
            return Err(RoutingError::InvalidConfig(
                "leaf_set_half_size must be at least 1".to_string(),
            ));
        }
        if check_digit_bits(self.digit_bits).is_err() {
            return Err(RoutingError::InvalidConfig(format!(
                "digit_bits must be between 1 and 8, got {}",
                self.digit_bits
            )));
        }
        if self.route_set_size == 0 {
            return Err(RoutingError::InvalidConfig(
                "route_set_size must be at least 1".to_string(),
            ));
        }
        if self.join_timeout_ms == 0 {
            return Err(RoutingError::InvalidConfig(
                "join_timeout_ms must be positive".to_string(),
            ));
        }
        if self.maintenance_interval_secs == Some(0) {
            return Err(RoutingError::InvalidConfig(
                "maintenance_interval_secs must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Routing table rows
    pub fn num_rows(&self) -> usize {
        Id::num_digits(self.digit_bits)
    }

    /// Hops after which a routed message is dropped
    ///
    /// Routing table hops lengthen the shared prefix and fallback hops get
    /// numerically closer, so a healthy path stays well below this.
    pub fn max_hops(&self) -> u32 {
        (2 * self.num_rows() + 2 * self.leaf_set_half_size) as u32
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Option<Duration> {
        self.maintenance_interval_secs.map(Duration::from_secs)
    }
}

fn default_leaf_set_half_size() -> usize {
    DEFAULT_LEAF_SET_HALF_SIZE
}

fn default_digit_bits() -> u32 {
    DEFAULT_DIGIT_BITS
}

fn default_route_set_size() -> usize {
    DEFAULT_ROUTE_SET_SIZE
}

fn default_join_timeout_ms() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OverlayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_rows(), 32);
        assert_eq!(config.join_timeout(), Duration::from_secs(10));
        assert!(config.maintenance_interval().is_none());
    }

    #[test]
    fn test_invalid_values() {
        let mut config = OverlayConfig {
            leaf_set_half_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RoutingError::InvalidConfig(_))));

        config.leaf_set_half_size = 4;
        config.digit_bits = 9;
        assert!(matches!(config.validate(), Err(RoutingError::InvalidConfig(_))));

        config.digit_bits = 2;
        config.maintenance_interval_secs = Some(0);
        assert!(config.validate().is_err());

        config.maintenance_interval_secs = Some(30);
        assert!(config.validate().is_ok());
        assert_eq!(config.num_rows(), 64);
    }

    #[test]
    fn test_partial_deserialization() {
        let config: OverlayConfig = serde_json::from_str(r#"{"digit_bits": 2}"#).unwrap();
        assert_eq!(config.digit_bits, 2);
        assert_eq!(config.leaf_set_half_size, DEFAULT_LEAF_SET_HALF_SIZE);
        assert_eq!(config.join_timeout_ms, 10_000);
    }
}
