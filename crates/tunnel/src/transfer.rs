//! Tunnel orchestrator
//!
//! `TunnelTransfer` owns the transport catalog and drives negotiations in
//! both directions. Outbound attempts are single-flight per peer; inbound
//! attempts are single-flight per `peer@transaction`, so a mutual connect
//! can succeed from both ends.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use meshlink_core::{
    MeshError, NodeSettings, Result, TransportDescriptor, TunnelDirection, TunnelNegotiation,
    TunnelProtocolType, TunnelSettings, WanEndpointInfo, WanPortRequest, WanPortServer,
};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    candidate_endpoints, CallbackRegistry, Signaling, SingleFlight, Transport, TransportCatalog,
    TunnelConnection, WanPortResolver,
};

/// Local facts copied into every `WanEndpointInfo` we produce
#[derive(Debug, Clone)]
struct LocalFacts {
    node: NodeSettings,
    local_ips: Vec<std::net::IpAddr>,
    route_level: u8,
    port_map_lan: u16,
    port_map_wan: u16,
    background_retry_times: u32,
    background_retry_delay: Duration,
}

impl LocalFacts {
    fn new(node: NodeSettings, settings: &TunnelSettings) -> Self {
        Self {
            node,
            local_ips: settings.local_ips.clone(),
            route_level: settings.route_level,
            port_map_lan: settings.port_map_lan,
            port_map_wan: settings.port_map_wan,
            background_retry_times: settings.background_retry_times,
            background_retry_delay: Duration::from_millis(settings.background_retry_delay_ms),
        }
    }
}

pub struct TunnelTransfer {
    local: RwLock<LocalFacts>,
    catalog: TransportCatalog,
    resolver: Arc<dyn WanPortResolver>,
    signaling: Arc<dyn Signaling>,
    callbacks: Arc<CallbackRegistry>,
    outbound: SingleFlight,
    inbound: SingleFlight,
    background: SingleFlight,
    flow_id: AtomicU32,
}

impl TunnelTransfer {
    pub fn new(
        node: NodeSettings,
        settings: TunnelSettings,
        transports: Vec<Arc<dyn Transport>>,
        resolver: Arc<dyn WanPortResolver>,
        signaling: Arc<dyn Signaling>,
        callbacks: Arc<CallbackRegistry>,
    ) -> Self {
        let local = LocalFacts::new(node, &settings);
        let catalog = TransportCatalog::new(transports, settings.transports, settings.wan_ports);
        Self {
            local: RwLock::new(local),
            catalog,
            resolver,
            signaling,
            callbacks,
            outbound: SingleFlight::new(),
            inbound: SingleFlight::new(),
            background: SingleFlight::new(),
            flow_id: AtomicU32::new(0),
        }
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    pub fn catalog(&self) -> &TransportCatalog {
        &self.catalog
    }

    /// Current settings, including the reconciled transport list
    pub fn settings(&self) -> TunnelSettings {
        let local = self.local.read();
        TunnelSettings {
            transports: self.catalog.descriptors(),
            wan_ports: self.catalog.wan_ports(),
            local_ips: local.local_ips.clone(),
            route_level: local.route_level,
            port_map_lan: local.port_map_lan,
            port_map_wan: local.port_map_wan,
            background_retry_times: local.background_retry_times,
            background_retry_delay_ms: local.background_retry_delay.as_millis() as u64,
        }
    }

    pub fn set_transports(&self, descriptors: Vec<TransportDescriptor>) {
        self.catalog.set_descriptors(descriptors);
    }

    pub fn set_wan_ports(&self, wan_ports: Vec<WanPortServer>) {
        self.catalog.set_wan_ports(wan_ports);
    }

    /// Refresh interface addresses and NAT depth after a network change
    pub fn set_local_network(&self, local_ips: Vec<std::net::IpAddr>, route_level: u8) {
        let mut local = self.local.write();
        local.local_ips = local_ips;
        local.route_level = route_level;
    }

    pub fn is_connecting(&self, peer: &str) -> bool {
        self.outbound.contains(peer)
    }

    fn next_flow_id(&self) -> u32 {
        self.flow_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Negotiate a direct tunnel to `peer` for `transaction_id`.
    ///
    /// Returns `None` when another negotiation to `peer` is in flight or
    /// when every transport failed. Transports whose protocols are all in
    /// `deny` are skipped.
    pub async fn connect(
        &self,
        peer: &str,
        transaction_id: &str,
        deny: TunnelProtocolType,
    ) -> Option<Arc<dyn TunnelConnection>> {
        let Some(_guard) = self.outbound.try_acquire(peer) else {
            debug!("Tunnel to {} already negotiating, skipping", peer);
            return None;
        };

        for (item, transport) in self.catalog.ordered_enabled() {
            if deny.contains(transport.protocol_type()) {
                continue;
            }

            for server in self.catalog.usable_wan_ports() {
                if !transport.allowed_wan_port_protocols().contains(server.protocol) {
                    continue;
                }

                let attempts = if item.reverse { 2 } else { 1 };
                let mut negotiated = false;
                for attempt in 0..attempts {
                    let direction = TunnelDirection::from_attempt(attempt);
                    let result = AssertUnwindSafe(self.attempt(
                        peer,
                        transaction_id,
                        &item,
                        transport.as_ref(),
                        &server,
                        direction,
                    ))
                    .catch_unwind()
                    .await;

                    match result {
                        Ok(Ok(Some(connection))) => {
                            info!(
                                "Tunnel to {} via {} established ({:?})",
                                peer,
                                transport.name(),
                                direction
                            );
                            self.callbacks.notify(&connection);
                            return Some(connection);
                        }
                        Ok(Ok(None)) => {
                            negotiated = true;
                            debug!("Tunnel {} to {} {:?} attempt failed", transport.name(), peer, direction);
                        }
                        Ok(Err(MeshError::Resolution(reason))) => {
                            warn!("Tunnel {} to {}: {}", transport.name(), peer, reason);
                            break;
                        }
                        Ok(Err(e)) => {
                            negotiated = true;
                            debug!("Tunnel {} to {} {:?} attempt error: {}", transport.name(), peer, direction, e);
                        }
                        Err(_) => {
                            negotiated = true;
                            debug!("Tunnel {} to {} {:?} attempt panicked", transport.name(), peer, direction);
                        }
                    }
                }

                if negotiated {
                    error!("Tunnel connect {} via {} failed", peer, transport.name());
                }
            }
        }
        None
    }

    async fn attempt(
        &self,
        peer: &str,
        transaction_id: &str,
        item: &TransportDescriptor,
        transport: &dyn Transport,
        server: &WanPortServer,
        direction: TunnelDirection,
    ) -> Result<Option<Arc<dyn TunnelConnection>>> {
        let request = WanPortRequest {
            machine_id: peer.to_string(),
            kind: server.kind,
            protocol: server.protocol,
        };
        let (local, remote) = tokio::join!(
            self.local_info(server),
            self.signaling.remote_wan_port(&request)
        );

        let local = local
            .map_err(|e| MeshError::Resolution(format!("local external address: {}", e)))?
            .ok_or_else(|| MeshError::Resolution("local external address unavailable".to_string()))?;
        let remote = remote
            .map_err(|e| MeshError::Resolution(format!("remote {} external address: {}", peer, e)))?
            .ok_or_else(|| {
                MeshError::Resolution(format!("remote {} external address unavailable", peer))
            })?;
        debug!(
            "Tunnel {} local {} / {}, remote {} / {}",
            transport.name(),
            local.local,
            local.remote,
            remote.local,
            remote.remote
        );

        let mut negotiation = TunnelNegotiation {
            transaction_id: transaction_id.to_string(),
            direction,
            transport_name: transport.name().to_string(),
            transport_type: transport.protocol_type(),
            local,
            remote,
            ssl: item.ssl,
            flow_id: self.next_flow_id(),
            remote_endpoints: Vec::new(),
        };
        negotiation.remote_endpoints = candidate_endpoints(&negotiation.local, &negotiation.remote);
        info!(
            "Tunnel connecting {} ({}) via {} flow {}",
            negotiation.remote.machine_id,
            negotiation.remote.machine_name,
            transport.name(),
            negotiation.flow_id
        );

        transport.connect(&negotiation).await
    }

    /// A peer began negotiating with us.
    ///
    /// `negotiation` must already be seen from our side (see
    /// [`TunnelNegotiation::mirrored`]): `local` is us and `remote` is the
    /// peer that started it. The peer's id keys the duplicate guard and
    /// names the connection handed to the callbacks.
    ///
    /// Returns the task driving the transport, or `None` when the message
    /// was dropped (duplicate or unknown transport).
    pub fn on_begin(
        &self,
        mut negotiation: TunnelNegotiation,
    ) -> Option<JoinHandle<Option<Arc<dyn TunnelConnection>>>> {
        let key = format!("{}@{}", negotiation.remote.machine_id, negotiation.transaction_id);
        let Some(guard) = self.inbound.try_acquire(key) else {
            debug!("Inbound tunnel from {} already in progress", negotiation.remote.machine_id);
            return None;
        };
        let Some(transport) = self
            .catalog
            .find_typed(&negotiation.transport_name, negotiation.transport_type)
        else {
            warn!(
                "Inbound tunnel from {} names unknown transport {}",
                negotiation.remote.machine_id, negotiation.transport_name
            );
            return None;
        };

        info!(
            "Tunnel connecting from {} ({}) via {}",
            negotiation.remote.machine_id,
            negotiation.remote.machine_name,
            transport.name()
        );
        negotiation.remote_endpoints = candidate_endpoints(&negotiation.local, &negotiation.remote);

        let callbacks = self.callbacks.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            let result = AssertUnwindSafe(transport.on_begin(&negotiation))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(Some(connection))) => {
                    callbacks.notify(&connection);
                    Some(connection)
                }
                Ok(Ok(None)) => {
                    debug!("Inbound tunnel from {} not established", negotiation.remote.machine_id);
                    None
                }
                Ok(Err(e)) => {
                    debug!("Inbound tunnel from {} error: {}", negotiation.remote.machine_id, e);
                    None
                }
                Err(_) => {
                    error!("Inbound tunnel from {} panicked", negotiation.remote.machine_id);
                    None
                }
            }
        }))
    }

    pub fn on_fail(&self, negotiation: &TunnelNegotiation) {
        if let Some(transport) = self
            .catalog
            .find_typed(&negotiation.transport_name, negotiation.transport_type)
        {
            transport.on_fail(negotiation);
        }
    }

    pub fn on_success(&self, negotiation: &TunnelNegotiation) {
        if let Some(transport) = self
            .catalog
            .find_typed(&negotiation.transport_name, negotiation.transport_type)
        {
            transport.on_success(negotiation);
        }
    }

    /// Our WAN endpoint, answered to a peer that asked for it
    pub async fn local_wan_port(&self, request: &WanPortRequest) -> Option<WanEndpointInfo> {
        let server = self.catalog.find_wan_port(request.kind, request.protocol)?;
        match self.local_info(&server).await {
            Ok(info) => info,
            Err(e) => {
                warn!("WAN port lookup via {} failed: {}", server.name, e);
                None
            }
        }
    }

    async fn local_info(&self, server: &WanPortServer) -> Result<Option<WanEndpointInfo>> {
        let Some(endpoint) = self.resolver.resolve(server).await? else {
            return Ok(None);
        };
        let local = self.local.read().clone();
        Ok(Some(WanEndpointInfo {
            local: endpoint.local,
            remote: endpoint.remote,
            local_ips: local.local_ips,
            route_level: local.route_level,
            machine_id: local.node.machine_id,
            machine_name: local.node.machine_name,
            port_map_lan: local.port_map_lan,
            port_map_wan: local.port_map_wan,
        }))
    }

    /// Keep trying `peer` in the background until one attempt succeeds.
    ///
    /// Each attempt waits the configured delay first. `times` defaults to
    /// the configured retry count. Returns `None` if a loop for
    /// `peer@transaction_id` is already running.
    pub fn start_background(
        self: &Arc<Self>,
        peer: &str,
        transaction_id: &str,
        deny: TunnelProtocolType,
        times: Option<u32>,
    ) -> Option<JoinHandle<Option<Arc<dyn TunnelConnection>>>> {
        let key = format!("{}@{}", peer, transaction_id);
        let Some(guard) = self.background.try_acquire(key.clone()) else {
            error!("Tunnel background {} already exists", key);
            return None;
        };

        let (times, delay) = {
            let local = self.local.read();
            (times.unwrap_or(local.background_retry_times), local.background_retry_delay)
        };
        let this = Arc::clone(self);
        let peer = peer.to_string();
        let transaction_id = transaction_id.to_string();

        Some(tokio::spawn(async move {
            let _guard = guard;
            for attempt in 1..=times {
                tokio::time::sleep(delay).await;
                if let Some(connection) = this.connect(&peer, &transaction_id, deny).await {
                    return Some(connection);
                }
                debug!("Tunnel background {}@{} attempt {}/{} failed", peer, transaction_id, attempt, times);
            }
            None
        }))
    }

    pub fn is_background(&self, peer: &str, transaction_id: &str) -> bool {
        self.background.contains(&format!("{}@{}", peer, transaction_id))
    }
}
