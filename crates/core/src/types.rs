//! Negotiation data model

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Opaque machine identifier assigned by the sign-in server
pub type MachineId = String;

/// Reserved transaction id whose callbacks receive every connection
pub const GLOBAL_TRANSACTION: &str = "*";

bitflags! {
    /// Protocols a transport rides on, also used as a deny mask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct TunnelProtocolType: u8 {
        const TCP = 1;
        const UDP = 2;
        const QUIC = 4;
    }
}

bitflags! {
    /// Protocols a WAN-port probe can be performed over
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct WanPortProtocolType: u8 {
        const TCP = 1;
        const UDP = 2;
    }
}

impl Default for TunnelProtocolType {
    fn default() -> Self {
        TunnelProtocolType::empty()
    }
}

impl Default for WanPortProtocolType {
    fn default() -> Self {
        WanPortProtocolType::UDP
    }
}

/// Which side initiates the transport's connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunnelDirection {
    /// We dial the peer
    #[default]
    Forward,
    /// We ask the peer to dial us
    Reverse,
}

impl TunnelDirection {
    /// Direction for the `attempt`-th try of one transport/resolver pair
    pub fn from_attempt(attempt: usize) -> Self {
        if attempt == 0 {
            TunnelDirection::Forward
        } else {
            TunnelDirection::Reverse
        }
    }
}

/// Persisted description of one transport, as shown to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportDescriptor {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub protocol_type: TunnelProtocolType,
    /// Retry once in the reverse direction after a forward failure
    #[serde(default)]
    pub reverse: bool,
    /// The transport fixes `reverse`, operators cannot change it
    #[serde(default)]
    pub disable_reverse: bool,
    #[serde(default)]
    pub ssl: bool,
    /// The transport fixes `ssl`, operators cannot change it
    #[serde(default)]
    pub disable_ssl: bool,
    /// Lower runs first
    #[serde(default)]
    pub order: u8,
    #[serde(default)]
    pub disabled: bool,
}

/// Kind of WAN-port discovery server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WanPortKind {
    /// Our own sign-in server echoes the observed endpoint
    #[default]
    Link,
    /// A public STUN server
    Stun,
}

/// One configured WAN-port discovery server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WanPortServer {
    pub name: String,
    #[serde(default)]
    pub kind: WanPortKind,
    #[serde(default)]
    pub protocol: WanPortProtocolType,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub disabled: bool,
}

impl WanPortServer {
    /// Disabled entries and entries without a host are never used
    pub fn is_usable(&self) -> bool {
        !self.disabled && !self.host.trim().is_empty()
    }
}

/// Query for one machine's WAN endpoint over a given discovery method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WanPortRequest {
    pub machine_id: MachineId,
    pub kind: WanPortKind,
    pub protocol: WanPortProtocolType,
}

/// Endpoint pair returned by a WAN-port probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WanPortEndpoint {
    /// Locally bound socket used for the probe
    pub local: SocketAddr,
    /// The same socket as seen from outside the NAT
    pub remote: SocketAddr,
}

/// One side's view of itself for a single negotiation attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WanEndpointInfo {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    #[serde(default)]
    pub local_ips: Vec<IpAddr>,
    /// Number of NAT layers between the machine and the public network
    #[serde(default)]
    pub route_level: u8,
    pub machine_id: MachineId,
    #[serde(default)]
    pub machine_name: String,
    #[serde(default)]
    pub port_map_lan: u16,
    #[serde(default)]
    pub port_map_wan: u16,
}

impl WanEndpointInfo {
    /// Placeholder with unspecified addresses, mostly for tests and builders
    pub fn unspecified(machine_id: impl Into<MachineId>) -> Self {
        let any = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        Self {
            local: any,
            remote: any,
            local_ips: Vec::new(),
            route_level: 0,
            machine_id: machine_id.into(),
            machine_name: String::new(),
            port_map_lan: 0,
            port_map_wan: 0,
        }
    }

    pub fn has_ipv6(&self) -> bool {
        self.local_ips.iter().any(|ip| ip.is_ipv6())
    }
}

/// A single negotiation attempt, created per (transport, resolver, direction)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelNegotiation {
    pub transaction_id: String,
    pub direction: TunnelDirection,
    pub transport_name: String,
    pub transport_type: TunnelProtocolType,
    /// Our side
    pub local: WanEndpointInfo,
    /// The peer's side
    pub remote: WanEndpointInfo,
    pub ssl: bool,
    pub flow_id: u32,
    /// Addresses to try on the peer, recomputed by each receiver
    #[serde(skip)]
    pub remote_endpoints: Vec<SocketAddr>,
}

impl TunnelNegotiation {
    /// The same negotiation as seen by the peer
    pub fn mirrored(&self) -> Self {
        Self {
            transaction_id: self.transaction_id.clone(),
            direction: self.direction,
            transport_name: self.transport_name.clone(),
            transport_type: self.transport_type,
            local: self.remote.clone(),
            remote: self.local.clone(),
            ssl: self.ssl,
            flow_id: self.flow_id,
            remote_endpoints: Vec::new(),
        }
    }

    pub fn remote_machine_id(&self) -> &str {
        &self.remote.machine_id
    }
}
