//! Relay request and the relay capability

use std::sync::Arc;

use async_trait::async_trait;
use meshlink_core::{MachineId, RelayType, Result};
use meshlink_tunnel::TunnelConnection;
use serde::{Deserialize, Serialize};

/// A relay request, sent through the relay node to the remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayInfo {
    #[serde(default)]
    pub flow_id: u32,
    pub from_machine_id: MachineId,
    #[serde(default)]
    pub from_machine_name: String,
    pub remote_machine_id: MachineId,
    #[serde(default)]
    pub remote_machine_name: String,
    /// Shared secret presented to the relay node
    #[serde(default)]
    pub secret_key: String,
    pub transaction_id: String,
    pub transport_name: String,
    #[serde(default)]
    pub ssl: bool,
    /// Pin a specific relay node instead of letting the server choose
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// A way of reaching a peer through a relay node
#[async_trait]
pub trait RelayTransport: Send + Sync {
    fn name(&self) -> &str;

    fn relay_type(&self) -> RelayType;

    /// Ask the relay to connect us to `info.remote_machine_id`
    async fn relay(&self, info: &RelayInfo) -> Result<Option<Arc<dyn TunnelConnection>>>;

    /// Answer a relay request that a peer started
    async fn on_begin(&self, info: &RelayInfo) -> Result<Option<Arc<dyn TunnelConnection>>>;
}
