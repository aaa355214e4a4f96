//! In-process tunnel stack for the proxy tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use meshlink_core::{
    MeshError, NodeSettings, RelayServerSettings, RelayType, Result, TunnelNegotiation, TunnelProtocolType,
    TunnelSettings, WanEndpointInfo, WanPortEndpoint, WanPortKind, WanPortProtocolType, WanPortRequest,
    WanPortServer,
};
use meshlink_relay::{RelayInfo, RelayTransfer, RelayTransport};
use meshlink_tunnel::{
    CallbackRegistry, ConnectionKind, MemoryConnection, Signaling, Transport, TunnelConnection, TunnelTransfer,
    WanPortResolver,
};
use tokio::sync::mpsc;

pub type FarEnds = mpsc::UnboundedReceiver<Arc<dyn TunnelConnection>>;

struct PairTransport {
    works: bool,
    attempts: Arc<AtomicUsize>,
    far: mpsc::UnboundedSender<Arc<dyn TunnelConnection>>,
}

#[async_trait]
impl Transport for PairTransport {
    fn name(&self) -> &str {
        "pair"
    }
    fn label(&self) -> &str {
        "in-memory pair"
    }
    fn protocol_type(&self) -> TunnelProtocolType {
        TunnelProtocolType::UDP
    }
    fn allowed_wan_port_protocols(&self) -> WanPortProtocolType {
        WanPortProtocolType::UDP
    }
    fn reverse(&self) -> bool {
        false
    }
    fn disable_reverse(&self) -> bool {
        true
    }
    fn ssl(&self) -> bool {
        false
    }
    fn disable_ssl(&self) -> bool {
        true
    }
    fn order(&self) -> u8 {
        1
    }
    async fn connect(&self, negotiation: &TunnelNegotiation) -> Result<Option<Arc<dyn TunnelConnection>>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.works {
            return Err(MeshError::Negotiation("no path".to_string()));
        }
        let (near, far) = MemoryConnection::pair(
            &negotiation.local.machine_id,
            &negotiation.remote.machine_id,
            &negotiation.transaction_id,
            ConnectionKind::Direct,
        );
        let _ = self.far.send(far);
        Ok(Some(near))
    }
    async fn on_begin(&self, _: &TunnelNegotiation) -> Result<Option<Arc<dyn TunnelConnection>>> {
        Ok(None)
    }
    fn on_fail(&self, _: &TunnelNegotiation) {}
    fn on_success(&self, _: &TunnelNegotiation) {}
}

struct PairRelay {
    works: bool,
    far: mpsc::UnboundedSender<Arc<dyn TunnelConnection>>,
}

#[async_trait]
impl RelayTransport for PairRelay {
    fn name(&self) -> &str {
        "pair-relay"
    }
    fn relay_type(&self) -> RelayType {
        RelayType::Server
    }
    async fn relay(&self, info: &RelayInfo) -> Result<Option<Arc<dyn TunnelConnection>>> {
        if !self.works {
            return Ok(None);
        }
        let (near, far) = MemoryConnection::pair(
            &info.from_machine_id,
            &info.remote_machine_id,
            &info.transaction_id,
            ConnectionKind::Relay,
        );
        let _ = self.far.send(far);
        Ok(Some(near))
    }
    async fn on_begin(&self, _: &RelayInfo) -> Result<Option<Arc<dyn TunnelConnection>>> {
        Ok(None)
    }
}

struct LoopbackResolver;

#[async_trait]
impl WanPortResolver for LoopbackResolver {
    async fn resolve(&self, _: &WanPortServer) -> Result<Option<WanPortEndpoint>> {
        Ok(Some(WanPortEndpoint {
            local: "0.0.0.0:4000".parse().unwrap(),
            remote: "203.0.113.1:4000".parse().unwrap(),
        }))
    }
}

pub struct OnlineSet(pub HashSet<String>);

#[async_trait]
impl Signaling for OnlineSet {
    async fn remote_wan_port(&self, request: &WanPortRequest) -> Result<Option<WanEndpointInfo>> {
        let mut info = WanEndpointInfo::unspecified(request.machine_id.clone());
        info.remote = "198.51.100.9:5000".parse().unwrap();
        Ok(Some(info))
    }
    async fn send_begin(&self, _: &TunnelNegotiation) -> Result<()> {
        Ok(())
    }
    async fn send_fail(&self, _: &TunnelNegotiation) -> Result<()> {
        Ok(())
    }
    async fn send_success(&self, _: &TunnelNegotiation) -> Result<()> {
        Ok(())
    }
    async fn is_online(&self, machine_id: &str) -> bool {
        self.0.contains(machine_id)
    }
}

pub struct Stack {
    pub tunnel: Arc<TunnelTransfer>,
    pub relay: Arc<RelayTransfer>,
    pub signaling: Arc<dyn Signaling>,
    pub callbacks: Arc<CallbackRegistry>,
    pub direct_attempts: Arc<AtomicUsize>,
    pub far_ends: FarEnds,
}

/// A tunnel and relay pair whose far ends come out of `far_ends`
pub fn stack(self_id: &str, online: &[&str], direct: bool, relay: bool) -> Stack {
    let (far, far_ends) = mpsc::unbounded_channel();
    let callbacks = Arc::new(CallbackRegistry::new());
    let signaling: Arc<dyn Signaling> = Arc::new(OnlineSet(online.iter().map(|s| s.to_string()).collect()));
    let direct_attempts = Arc::new(AtomicUsize::new(0));

    let settings = TunnelSettings {
        wan_ports: vec![WanPortServer {
            name: "link".to_string(),
            kind: WanPortKind::Link,
            protocol: WanPortProtocolType::UDP,
            host: "signin.example.net:1802".to_string(),
            disabled: false,
        }],
        ..TunnelSettings::default()
    };
    let tunnel = Arc::new(TunnelTransfer::new(
        NodeSettings {
            machine_id: self_id.to_string(),
            machine_name: self_id.to_string(),
        },
        settings,
        vec![Arc::new(PairTransport {
            works: direct,
            attempts: direct_attempts.clone(),
            far: far.clone(),
        })],
        Arc::new(LoopbackResolver),
        signaling.clone(),
        callbacks.clone(),
    ));
    let relay = Arc::new(RelayTransfer::new(
        RelayServerSettings::default(),
        vec![Arc::new(PairRelay { works: relay, far })],
        callbacks.clone(),
    ));

    Stack {
        tunnel,
        relay,
        signaling,
        callbacks,
        direct_attempts,
        far_ends,
    }
}
