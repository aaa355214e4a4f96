//! In-process mesh shared by the integration tests
//!
//! Every node gets the same two hole-punch transports and one relay
//! transport. They meet through a switchboard: the initiator parks one end
//! of a connection pair and asks the peer's orchestrator to accept it, the
//! peer's transport picks the parked end up.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use meshlink_core::{
    MeshError, NodeSettings, RelayServerSettings, RelayType, Result, TunnelNegotiation, TunnelProtocolType,
    TunnelSettings, WanEndpointInfo, WanPortEndpoint, WanPortProtocolType, WanPortRequest, WanPortServer,
};
use meshlink_relay::{RelayInfo, RelayTransfer, RelayTransport};
use meshlink_tunnel::{
    CallbackRegistry, ConnectionKind, MemoryConnection, Signaling, Transport, TunnelConnection, TunnelTransfer,
    WanPortResolver,
};
use parking_lot::Mutex;

pub const PUNCH_TCP: &str = "punch-tcp";
pub const PUNCH_UDP: &str = "punch-udp";
pub const SWITCH_RELAY: &str = "switch-relay";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Node {
    pub id: String,
    pub tunnel: Arc<TunnelTransfer>,
    pub relay: Arc<RelayTransfer>,
    pub signaling: Arc<dyn Signaling>,
    pub callbacks: Arc<CallbackRegistry>,
}

#[derive(Default)]
pub struct Mesh {
    nodes: Mutex<HashMap<String, Arc<Node>>>,
    offline: Mutex<HashSet<String>>,
    parked: Mutex<HashMap<String, Arc<dyn TunnelConnection>>>,
    /// Direct transport attempts across all nodes
    pub direct_attempts: AtomicUsize,
}

impl Mesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join a node. `direct` decides whether UDP hole punching works for
    /// it; TCP punching never does. `relay` enables its relay fallback.
    pub fn add_node(self: &Arc<Self>, id: &str, direct: bool, relay: bool) -> Arc<Node> {
        let index = self.nodes.lock().len() as u8 + 1;
        let callbacks = Arc::new(CallbackRegistry::new());
        let signaling: Arc<dyn Signaling> = Arc::new(MeshSignaling {
            mesh: Arc::downgrade(self),
        });

        let transports: Vec<Arc<dyn Transport>> = vec![
            Arc::new(SwitchTransport {
                mesh: Arc::downgrade(self),
                name: PUNCH_TCP,
                protocol: TunnelProtocolType::TCP,
                order: 1,
                works: false,
            }),
            Arc::new(SwitchTransport {
                mesh: Arc::downgrade(self),
                name: PUNCH_UDP,
                protocol: TunnelProtocolType::UDP,
                order: 2,
                works: direct,
            }),
        ];
        let settings = TunnelSettings {
            background_retry_delay_ms: 20,
            ..TunnelSettings::default()
        };
        let tunnel = Arc::new(TunnelTransfer::new(
            NodeSettings {
                machine_id: id.to_string(),
                machine_name: format!("host-{}", id),
            },
            settings,
            transports,
            Arc::new(NatResolver { index }),
            signaling.clone(),
            callbacks.clone(),
        ));
        let relay = Arc::new(RelayTransfer::new(
            RelayServerSettings {
                host: "relay.example.net:1803".to_string(),
                disabled: !relay,
                ..RelayServerSettings::default()
            },
            vec![Arc::new(SwitchRelay {
                mesh: Arc::downgrade(self),
            })],
            callbacks.clone(),
        ));

        let node = Arc::new(Node {
            id: id.to_string(),
            tunnel,
            relay,
            signaling,
            callbacks,
        });
        self.nodes.lock().insert(id.to_string(), node.clone());
        node
    }

    pub fn node(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.lock().get(id).cloned()
    }

    pub fn set_online(&self, id: &str, online: bool) {
        let mut offline = self.offline.lock();
        if online {
            offline.remove(id);
        } else {
            offline.insert(id.to_string());
        }
    }

    pub fn is_online(&self, id: &str) -> bool {
        self.nodes.lock().contains_key(id) && !self.offline.lock().contains(id)
    }

    fn park(&self, key: String, connection: Arc<dyn TunnelConnection>) {
        self.parked.lock().insert(key, connection);
    }

    fn take(&self, key: &str) -> Option<Arc<dyn TunnelConnection>> {
        self.parked.lock().remove(key)
    }
}

fn flow_key(from: &str, to: &str, flow_id: u32, transport: &str) -> String {
    format!("{}>{}#{}@{}", from, to, flow_id, transport)
}

struct SwitchTransport {
    mesh: Weak<Mesh>,
    name: &'static str,
    protocol: TunnelProtocolType,
    order: u8,
    works: bool,
}

#[async_trait]
impl Transport for SwitchTransport {
    fn name(&self) -> &str {
        self.name
    }
    fn label(&self) -> &str {
        self.name
    }
    fn protocol_type(&self) -> TunnelProtocolType {
        self.protocol
    }
    fn allowed_wan_port_protocols(&self) -> WanPortProtocolType {
        WanPortProtocolType::TCP | WanPortProtocolType::UDP
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
        self.order
    }

    async fn connect(&self, negotiation: &TunnelNegotiation) -> Result<Option<Arc<dyn TunnelConnection>>> {
        let mesh = self.mesh.upgrade().ok_or(MeshError::ConnectionClosed)?;
        mesh.direct_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.works {
            return Err(MeshError::Negotiation(format!("{} blocked", self.name)));
        }
        let peer = mesh
            .node(negotiation.remote_machine_id())
            .ok_or_else(|| MeshError::PeerNotFound(negotiation.remote_machine_id().to_string()))?;

        let key = flow_key(
            &negotiation.local.machine_id,
            &negotiation.remote.machine_id,
            negotiation.flow_id,
            self.name,
        );
        let (near, far) = MemoryConnection::pair(
            &negotiation.local.machine_id,
            &negotiation.remote.machine_id,
            &negotiation.transaction_id,
            ConnectionKind::Direct,
        );
        mesh.park(key.clone(), far);

        let accepted = match peer.tunnel.on_begin(negotiation.mirrored()) {
            Some(task) => matches!(task.await, Ok(Some(_))),
            None => false,
        };
        mesh.take(&key);
        Ok(accepted.then(|| near as Arc<dyn TunnelConnection>))
    }

    async fn on_begin(&self, negotiation: &TunnelNegotiation) -> Result<Option<Arc<dyn TunnelConnection>>> {
        let mesh = self.mesh.upgrade().ok_or(MeshError::ConnectionClosed)?;
        let key = flow_key(
            &negotiation.remote.machine_id,
            &negotiation.local.machine_id,
            negotiation.flow_id,
            self.name,
        );
        Ok(mesh.take(&key))
    }

    fn on_fail(&self, _: &TunnelNegotiation) {}

    fn on_success(&self, _: &TunnelNegotiation) {}
}

struct SwitchRelay {
    mesh: Weak<Mesh>,
}

fn relay_key(info: &RelayInfo) -> String {
    format!("relay:{}>{}@{}", info.from_machine_id, info.remote_machine_id, info.transaction_id)
}

#[async_trait]
impl RelayTransport for SwitchRelay {
    fn name(&self) -> &str {
        SWITCH_RELAY
    }

    fn relay_type(&self) -> RelayType {
        RelayType::Server
    }

    async fn relay(&self, info: &RelayInfo) -> Result<Option<Arc<dyn TunnelConnection>>> {
        let mesh = self.mesh.upgrade().ok_or(MeshError::ConnectionClosed)?;
        let Some(peer) = mesh.node(&info.remote_machine_id) else {
            return Ok(None);
        };

        let (near, far) = MemoryConnection::pair(
            &info.from_machine_id,
            &info.remote_machine_id,
            &info.transaction_id,
            ConnectionKind::Relay,
        );
        let key = relay_key(info);
        mesh.park(key.clone(), far);

        let established = Arc::new(AtomicBool::new(false));
        let flag = established.clone();
        peer.relay
            .on_begin(info, move |connection| flag.store(connection.is_some(), Ordering::SeqCst))
            .await;
        mesh.take(&key);
        Ok(established.load(Ordering::SeqCst).then(|| near as Arc<dyn TunnelConnection>))
    }

    async fn on_begin(&self, info: &RelayInfo) -> Result<Option<Arc<dyn TunnelConnection>>> {
        let mesh = self.mesh.upgrade().ok_or(MeshError::ConnectionClosed)?;
        Ok(mesh.take(&relay_key(info)))
    }
}

/// Each node sits behind its own NAT
struct NatResolver {
    index: u8,
}

#[async_trait]
impl WanPortResolver for NatResolver {
    async fn resolve(&self, _: &WanPortServer) -> Result<Option<WanPortEndpoint>> {
        Ok(Some(WanPortEndpoint {
            local: SocketAddr::from(([192, 168, self.index, 10], 40000)),
            remote: SocketAddr::from(([203, 0, 113, self.index], 50000 + self.index as u16)),
        }))
    }
}

struct MeshSignaling {
    mesh: Weak<Mesh>,
}

#[async_trait]
impl Signaling for MeshSignaling {
    async fn remote_wan_port(&self, request: &WanPortRequest) -> Result<Option<WanEndpointInfo>> {
        let mesh = self.mesh.upgrade().ok_or(MeshError::ConnectionClosed)?;
        if !mesh.is_online(&request.machine_id) {
            return Ok(None);
        }
        let Some(peer) = mesh.node(&request.machine_id) else {
            return Ok(None);
        };
        Ok(peer.tunnel.local_wan_port(request).await)
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
        self.mesh.upgrade().map(|m| m.is_online(machine_id)).unwrap_or(false)
    }
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
