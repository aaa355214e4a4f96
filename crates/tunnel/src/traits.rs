//! Capabilities consumed by the orchestrator
//!
//! Concrete transports, the WAN-port probe and the signaling channel live
//! outside this crate and are handed to `TunnelTransfer` at startup.

use std::sync::Arc;

use async_trait::async_trait;
use meshlink_core::{
    Result, TunnelNegotiation, TunnelProtocolType, WanEndpointInfo, WanPortEndpoint,
    WanPortProtocolType, WanPortRequest, WanPortServer,
};

use crate::TunnelConnection;

/// One NAT traversal strategy
#[async_trait]
pub trait Transport: Send + Sync {
    /// Unique registration name
    fn name(&self) -> &str;

    fn label(&self) -> &str;

    fn protocol_type(&self) -> TunnelProtocolType;

    /// WAN-port probe protocols this transport can work from
    fn allowed_wan_port_protocols(&self) -> WanPortProtocolType;

    fn reverse(&self) -> bool;

    fn disable_reverse(&self) -> bool;

    fn ssl(&self) -> bool;

    fn disable_ssl(&self) -> bool;

    fn order(&self) -> u8;

    /// Outbound attempt. `Ok(None)` is an ordinary failure.
    ///
    /// The transport owns the attempt's timeout.
    async fn connect(
        &self,
        negotiation: &TunnelNegotiation,
    ) -> Result<Option<Arc<dyn TunnelConnection>>>;

    /// A peer announced it is attempting to reach us
    async fn on_begin(
        &self,
        negotiation: &TunnelNegotiation,
    ) -> Result<Option<Arc<dyn TunnelConnection>>>;

    fn on_fail(&self, negotiation: &TunnelNegotiation);

    fn on_success(&self, negotiation: &TunnelNegotiation);
}

/// Discovers how our socket looks from outside the NAT
#[async_trait]
pub trait WanPortResolver: Send + Sync {
    async fn resolve(&self, server: &WanPortServer) -> Result<Option<WanPortEndpoint>>;
}

/// Message path to other machines through the sign-in server
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Ask a peer for its WAN endpoint
    async fn remote_wan_port(&self, request: &WanPortRequest) -> Result<Option<WanEndpointInfo>>;

    async fn send_begin(&self, negotiation: &TunnelNegotiation) -> Result<()>;

    async fn send_fail(&self, negotiation: &TunnelNegotiation) -> Result<()>;

    async fn send_success(&self, negotiation: &TunnelNegotiation) -> Result<()>;

    async fn is_online(&self, machine_id: &str) -> bool;
}
