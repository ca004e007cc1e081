//! NodeConfig: the endpoint a node listens on, plus its advisory node id.
//!
//! Two configs name the same peer when their `(address, port)` match; the
//! `node_id` is only a collision-avoidance hint and never part of identity.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("Invalid address '{0}': expected host:port")]
    MissingPort(String),
    #[error("Invalid port in '{0}'")]
    InvalidPort(String),
    #[error("Empty host in '{0}'")]
    EmptyHost(String),
}

/// Endpoint of a mesh node.
///
/// Wire format: `{"nodeId":1,"address":"10.0.0.1","port":20000}`. The
/// `nodeId` field is optional on the wire and defaults to 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    #[serde(default)]
    pub node_id: u64,
    pub address: String,
    pub port: u16,
}

impl NodeConfig {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: 0,
            address: address.into(),
            port,
        }
    }

    pub fn with_node_id(mut self, node_id: u64) -> Self {
        self.node_id = node_id;
        self
    }

    /// True when both configs point at the same `(address, port)`.
    pub fn same_endpoint(&self, other: &NodeConfig) -> bool {
        self.is_endpoint(&other.address, other.port)
    }

    pub fn is_endpoint(&self, address: &str, port: u16) -> bool {
        self.address == address && self.port == port
    }

    /// URL used to dial this node.
    pub fn websocket_url(&self) -> String {
        format!("ws://{}:{}", self.address, self.port)
    }
}

impl Display for NodeConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl FromStr for NodeConfig {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressParseError::MissingPort(s.to_string()))?;

        if host.is_empty() {
            return Err(AddressParseError::EmptyHost(s.to_string()));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| AddressParseError::InvalidPort(s.to_string()))?;

        Ok(Self::new(host, port))
    }
}

/// Parse a whitespace-separated `"host:port host:port ..."` seed list.
///
/// Blank input yields an empty list. Any malformed entry fails the whole
/// list so a typo in the seed configuration is reported at startup.
pub fn parse_address_list(input: &str) -> Result<Vec<NodeConfig>, AddressParseError> {
    input.split_whitespace().map(str::parse).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_address() {
        let config: NodeConfig = "127.0.0.1:20000".parse().unwrap();
        assert_eq!(config.address, "127.0.0.1");
        assert_eq!(config.port, 20000);
        assert_eq!(config.node_id, 0);
    }

    #[test]
    fn test_parse_address_list() {
        let list = parse_address_list("127.0.0.1:20000   10.0.0.2:20001\n").unwrap();
        assert_eq!(
            list,
            vec![
                NodeConfig::new("127.0.0.1", 20000),
                NodeConfig::new("10.0.0.2", 20001),
            ]
        );
    }

    #[test]
    fn test_parse_empty_list() {
        assert!(parse_address_list("").unwrap().is_empty());
        assert!(parse_address_list("   ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(
            parse_address_list("localhost"),
            Err(AddressParseError::MissingPort("localhost".into()))
        );
        assert_eq!(
            parse_address_list("localhost:http"),
            Err(AddressParseError::InvalidPort("localhost:http".into()))
        );
        assert_eq!(
            parse_address_list(":20000"),
            Err(AddressParseError::EmptyHost(":20000".into()))
        );
    }

    #[test]
    fn test_same_endpoint_ignores_node_id() {
        let a = NodeConfig::new("10.0.0.1", 20000).with_node_id(3);
        let b = NodeConfig::new("10.0.0.1", 20000).with_node_id(9);
        let c = NodeConfig::new("10.0.0.1", 20001).with_node_id(3);

        assert!(a.same_endpoint(&b));
        assert!(!a.same_endpoint(&c));
    }

    #[test]
    fn test_wire_format() {
        let config = NodeConfig::new("10.0.0.1", 20000).with_node_id(1);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"nodeId":1,"address":"10.0.0.1","port":20000}"#);
    }

    #[test]
    fn test_node_id_defaults_when_absent() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"address":"10.0.0.1","port":20000}"#).unwrap();
        assert_eq!(config.node_id, 0);
    }

    #[test]
    fn test_websocket_url() {
        let config = NodeConfig::new("127.0.0.1", 20001);
        assert_eq!(config.websocket_url(), "ws://127.0.0.1:20001");
    }
}
