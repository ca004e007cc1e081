use mesh_core::{parse_address_list, AddressParseError, HeartbeatConfig, NodeConfig};
use std::time::Duration;

/// Validated node configuration, consumed once at startup.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// Address to listen on and to advertise to peers
    pub address: String,
    /// First port to try; the node moves up while ports are taken
    pub port: u16,
    /// Initial advisory node id
    pub node_id: u64,
    /// Peers dialed once the listener is up
    pub seeds: Vec<NodeConfig>,
    pub heartbeat: HeartbeatConfig,
}

impl NodeSettings {
    /// Build settings from raw option values.
    ///
    /// `nodes` is a whitespace-separated `host:port` list and may be empty.
    pub fn new(
        address: impl Into<String>,
        port: u16,
        node_id: u64,
        nodes: &str,
        heartbeat_ms: u64,
        epoch_window_ms: u64,
    ) -> Result<Self, ConfigError> {
        let address = address.into();
        if address.trim().is_empty() {
            return Err(ConfigError::EmptyAddress);
        }

        let seeds = parse_address_list(nodes)?;

        let settings = Self {
            address,
            port,
            node_id,
            seeds,
            heartbeat: HeartbeatConfig {
                interval: Duration::from_millis(heartbeat_ms),
                epoch_window: Duration::from_millis(epoch_window_ms),
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Loopback defaults with no seeds, mostly for tests.
    pub fn local(port: u16) -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port,
            node_id: 0,
            seeds: Vec::new(),
            heartbeat: HeartbeatConfig::default(),
        }
    }

    pub fn with_seeds(mut self, seeds: Vec<NodeConfig>) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let HeartbeatConfig {
            interval,
            epoch_window,
        } = &self.heartbeat;

        if interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if epoch_window.is_zero() || epoch_window >= interval {
            return Err(ConfigError::EpochWindow {
                window_ms: epoch_window.as_millis() as u64,
                interval_ms: interval.as_millis() as u64,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Listen address must not be empty")]
    EmptyAddress,
    #[error("Invalid NODES list: {0}")]
    Seeds(#[from] AddressParseError),
    #[error("Heartbeat interval must be greater than zero")]
    ZeroInterval,
    #[error("Epoch window ({window_ms}ms) must be non-zero and shorter than the heartbeat interval ({interval_ms}ms)")]
    EpochWindow { window_ms: u64, interval_ms: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = NodeSettings::new("127.0.0.1", 20000, 0, "", 1000, 200).unwrap();
        assert!(settings.seeds.is_empty());
        assert_eq!(settings.heartbeat.interval, Duration::from_secs(1));
        assert_eq!(settings.heartbeat.epoch_window, Duration::from_millis(200));
    }

    #[test]
    fn test_seeds_parsed() {
        let settings =
            NodeSettings::new("0.0.0.0", 20000, 4, "10.0.0.2:20000 10.0.0.3:20001", 1000, 200)
                .unwrap();
        assert_eq!(
            settings.seeds,
            vec![
                NodeConfig::new("10.0.0.2", 20000),
                NodeConfig::new("10.0.0.3", 20001),
            ]
        );
        assert_eq!(settings.node_id, 4);
    }

    #[test]
    fn test_bad_seed_rejected() {
        let err = NodeSettings::new("127.0.0.1", 20000, 0, "10.0.0.2", 1000, 200).unwrap_err();
        assert!(matches!(err, ConfigError::Seeds(AddressParseError::MissingPort(_))));
    }

    #[test]
    fn test_epoch_window_must_fit_interval() {
        assert!(matches!(
            NodeSettings::new("127.0.0.1", 20000, 0, "", 1000, 1000),
            Err(ConfigError::EpochWindow { .. })
        ));
        assert!(matches!(
            NodeSettings::new("127.0.0.1", 20000, 0, "", 1000, 0),
            Err(ConfigError::EpochWindow { .. })
        ));
        assert!(matches!(
            NodeSettings::new("127.0.0.1", 20000, 0, "", 0, 0),
            Err(ConfigError::ZeroInterval)
        ));
    }

    #[test]
    fn test_empty_address_rejected() {
        assert!(matches!(
            NodeSettings::new(" ", 20000, 0, "", 1000, 200),
            Err(ConfigError::EmptyAddress)
        ));
    }
}
