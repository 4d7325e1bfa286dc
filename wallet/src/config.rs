//! Wallet engine configuration.
//!
//! Configuration is plain serde data so hosts can ship it as JSON. Every field
//! has a default, so an empty document (`{}`) is a valid configuration.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WalletError;
use crate::network::Network;

pub const DEFAULT_GAP_LIMIT: u32 = 20;
pub const DEFAULT_LATEST_HISTORY_WINDOW: u32 = 20;
pub const DEFAULT_FEE_RATE: f64 = 0.1;

/// Configuration for one Electrum WebSocket chain source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSourceConfig {
    /// WebSocket endpoint URL (e.g., "wss://blockstream.info/liquid/electrum-websocket/api")
    pub endpoint: String,
    /// Connection timeout
    #[serde(with = "duration_secs")]
    pub connection_timeout: Duration,
    /// Request timeout
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Maximum number of reconnection attempts
    pub max_reconnect_attempts: u32,
    /// Delay between reconnection attempts
    #[serde(with = "duration_secs")]
    pub reconnect_delay: Duration,
}

impl Default for ChainSourceConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:1234".to_string(),
            connection_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

impl ChainSourceConfig {
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Public Electrum WebSocket endpoint for `network`.
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Liquid => {
                Self::with_endpoint("wss://blockstream.info/liquid/electrum-websocket/api")
            }
            Network::Testnet => {
                Self::with_endpoint("wss://blockstream.info/liquidtestnet/electrum-websocket/api")
            }
            Network::Regtest => Self::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Consecutive unused scripts that end a scan.
    pub gap_limit: u32,
    /// How many of the most recently used indices per chain are refreshed
    /// after a network switch.
    pub latest_history_window: u32,
    /// Fee rate in sat/vB used when the chain source cannot estimate one.
    pub default_fee_rate: f64,
    pub chain_sources: BTreeMap<Network, ChainSourceConfig>,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            gap_limit: DEFAULT_GAP_LIMIT,
            latest_history_window: DEFAULT_LATEST_HISTORY_WINDOW,
            default_fee_rate: DEFAULT_FEE_RATE,
            chain_sources: Network::ALL
                .into_iter()
                .map(|network| (network, ChainSourceConfig::for_network(network)))
                .collect(),
        }
    }
}

impl WalletConfig {
    pub fn from_json_str(json: &str) -> Result<Self, WalletError> {
        let config: WalletConfig =
            serde_json::from_str(json).map_err(|err| WalletError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, WalletError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), WalletError> {
        if self.gap_limit == 0 {
            return Err(WalletError::Config("gap_limit must be at least 1".into()));
        }
        if !(self.default_fee_rate.is_finite() && self.default_fee_rate > 0.0) {
            return Err(WalletError::Config(
                "default_fee_rate must be a positive number".into(),
            ));
        }
        Ok(())
    }

    pub fn chain_source(&self, network: Network) -> ChainSourceConfig {
        self.chain_sources
            .get(&network)
            .cloned()
            .unwrap_or_else(|| ChainSourceConfig::for_network(network))
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ChainSourceConfig::default();
        assert_eq!(config.endpoint, "ws://127.0.0.1:1234");
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.connection_timeout.as_secs(), 30);
    }

    #[test]
    fn empty_document_is_default() {
        let config = WalletConfig::from_json_str("{}").unwrap();
        assert_eq!(config, WalletConfig::default());
        assert_eq!(config.gap_limit, DEFAULT_GAP_LIMIT);
        assert!(config
            .chain_source(Network::Liquid)
            .endpoint
            .starts_with("wss://"));
    }

    #[test]
    fn partial_document_overrides_fields() {
        let json = r#"{
            "gap_limit": 5,
            "chain_sources": {
                "regtest": { "endpoint": "ws://10.0.0.2:50001", "request_timeout": 5 }
            }
        }"#;
        let config = WalletConfig::from_json_str(json).unwrap();
        assert_eq!(config.gap_limit, 5);
        let regtest = config.chain_source(Network::Regtest);
        assert_eq!(regtest.endpoint, "ws://10.0.0.2:50001");
        assert_eq!(regtest.request_timeout, Duration::from_secs(5));
        assert_eq!(regtest.max_reconnect_attempts, 5);
        // networks missing from the map fall back to the public endpoints
        assert!(config.chain_source(Network::Testnet).endpoint.contains("liquidtestnet"));
    }

    #[test]
    fn zero_gap_limit_is_rejected() {
        assert!(WalletConfig::from_json_str(r#"{"gap_limit": 0}"#).is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");
        fs::write(&path, r#"{"latest_history_window": 3}"#).unwrap();
        let config = WalletConfig::from_json_file(&path).unwrap();
        assert_eq!(config.latest_history_window, 3);
    }
}
