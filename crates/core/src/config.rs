//! Configuration types

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::{TransportDescriptor, TunnelProtocolType, WanPortKind, WanPortProtocolType, WanPortServer};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub tunnel: TunnelSettings,

    #[serde(default)]
    pub relay: RelaySettings,

    #[serde(default)]
    pub proxy: ProxySettings,
}

/// Identity of this machine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Id assigned by the sign-in server
    #[serde(default)]
    pub machine_id: String,

    #[serde(default)]
    pub machine_name: String,
}

/// Direct tunnel negotiation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Persisted transport list, reconciled with the registered transports
    #[serde(default)]
    pub transports: Vec<TransportDescriptor>,

    /// WAN-port discovery servers
    #[serde(default = "default_wan_ports")]
    pub wan_ports: Vec<WanPortServer>,

    /// Local interface addresses advertised to peers
    #[serde(default)]
    pub local_ips: Vec<IpAddr>,

    /// NAT layers between us and the public network
    #[serde(default)]
    pub route_level: u8,

    /// Manually forwarded port on the LAN side (0 = none)
    #[serde(default)]
    pub port_map_lan: u16,

    /// Manually forwarded port on the WAN side (0 = none)
    #[serde(default)]
    pub port_map_wan: u16,

    /// Attempts made by a background retry loop
    #[serde(default = "default_background_retry_times")]
    pub background_retry_times: u32,

    /// Delay before each background attempt
    #[serde(default = "default_background_retry_delay_ms")]
    pub background_retry_delay_ms: u64,
}

fn default_wan_ports() -> Vec<WanPortServer> {
    vec![WanPortServer {
        name: "default".to_string(),
        kind: WanPortKind::Link,
        protocol: WanPortProtocolType::UDP,
        host: "127.0.0.1:1802".to_string(),
        disabled: false,
    }]
}

fn default_background_retry_times() -> u32 {
    10
}

fn default_background_retry_delay_ms() -> u64 {
    3000
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            transports: Vec::new(),
            wan_ports: default_wan_ports(),
            local_ips: Vec::new(),
            route_level: 0,
            port_map_lan: 0,
            port_map_wan: 0,
            background_retry_times: default_background_retry_times(),
            background_retry_delay_ms: default_background_retry_delay_ms(),
        }
    }
}

/// Relay fallback settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default)]
    pub server: RelayServerSettings,
}

/// Which relay protocol to ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelayType {
    /// Relayed through the sign-in server
    #[default]
    Server,
    /// Relayed through a volunteer relay node
    Node,
}

/// The rendezvous relay in use
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayServerSettings {
    #[serde(default)]
    pub host: String,

    /// Shared secret presented to the relay
    #[serde(default)]
    pub secret_key: String,

    #[serde(default = "default_relay_ssl")]
    pub ssl: bool,

    #[serde(default)]
    pub relay_type: RelayType,

    #[serde(default)]
    pub disabled: bool,
}

fn default_relay_ssl() -> bool {
    true
}

impl Default for RelayServerSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            secret_key: String::new(),
            ssl: default_relay_ssl(),
            relay_type: RelayType::default(),
            disabled: false,
        }
    }
}

/// Local proxy listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// TCP and UDP listen port (0 = ephemeral)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Transports that must not carry proxy traffic
    #[serde(default = "default_deny_protocols")]
    pub deny_protocols: TunnelProtocolType,

    /// Remote UDP flows without traffic for this long are closed
    #[serde(default = "default_udp_idle_timeout_secs")]
    pub udp_idle_timeout_secs: u64,

    /// Timeout for dialing a target on behalf of a peer
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_listen_port() -> u16 {
    1080
}

fn default_deny_protocols() -> TunnelProtocolType {
    TunnelProtocolType::QUIC
}

fn default_udp_idle_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            deny_protocols: default_deny_protocols(),
            udp_idle_timeout_secs: default_udp_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_settings_defaults() {
        let settings = TunnelSettings::default();
        assert_eq!(settings.background_retry_times, 10);
        assert_eq!(settings.background_retry_delay_ms, 3000);
        assert_eq!(settings.wan_ports.len(), 1);
        assert!(settings.wan_ports[0].is_usable());
    }

    #[test]
    fn test_proxy_settings_defaults() {
        let settings = ProxySettings::default();
        assert_eq!(settings.listen_port, 1080);
        assert_eq!(settings.deny_protocols, TunnelProtocolType::QUIC);
        assert_eq!(settings.udp_idle_timeout_secs, 60);
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: MeshConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.tunnel.background_retry_times, 10);
        assert!(config.relay.server.ssl);
        assert_eq!(config.relay.server.relay_type, RelayType::Server);
        assert_eq!(config.proxy.connect_timeout_secs, 5);
    }

    #[test]
    fn test_partial_json() {
        let json = r#"{
            "node": { "machine_id": "m-1" },
            "relay": { "server": { "relay_type": "node", "secret_key": "s3cret" } }
        }"#;
        let config: MeshConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.node.machine_id, "m-1");
        assert_eq!(config.relay.server.relay_type, RelayType::Node);
        assert_eq!(config.relay.server.secret_key, "s3cret");
        assert!(config.relay.server.ssl);
    }

    #[test]
    fn test_config_round_trip() {
        let mut config = MeshConfig::default();
        config.tunnel.transports.push(TransportDescriptor {
            name: "UdpP2PNAT".to_string(),
            label: "UDP hole punch".to_string(),
            protocol_type: TunnelProtocolType::UDP,
            reverse: true,
            disable_reverse: false,
            ssl: true,
            disable_ssl: false,
            order: 1,
            disabled: false,
        });
        config.tunnel.local_ips.push("192.168.1.20".parse().unwrap());

        let json = serde_json::to_string(&config).unwrap();
        let back: MeshConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tunnel.transports, config.tunnel.transports);
        assert_eq!(back.tunnel.local_ips, config.tunnel.local_ips);
    }
}
