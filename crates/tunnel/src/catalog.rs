//! Registered transports and their persisted descriptors

use std::sync::Arc;

use meshlink_core::{TransportDescriptor, TunnelProtocolType, WanPortKind, WanPortProtocolType, WanPortServer};
use parking_lot::RwLock;
use tracing::info;

use crate::Transport;

/// Merge the persisted transport list with what is actually registered.
///
/// New transports are appended, vanished ones dropped. Fields a transport
/// pins (label, disable flags and the values they pin) are forced; an
/// unset order takes the transport's default.
pub fn reconcile_transports(
    transports: &[Arc<dyn Transport>],
    persisted: Vec<TransportDescriptor>,
) -> Vec<TransportDescriptor> {
    let mut items: Vec<TransportDescriptor> = persisted
        .into_iter()
        .filter(|item| transports.iter().any(|t| t.name() == item.name))
        .collect();

    for transport in transports {
        if !items.iter().any(|item| item.name == transport.name()) {
            items.push(TransportDescriptor {
                name: transport.name().to_string(),
                label: transport.label().to_string(),
                protocol_type: transport.protocol_type(),
                reverse: transport.reverse(),
                disable_reverse: transport.disable_reverse(),
                ssl: transport.ssl(),
                disable_ssl: transport.disable_ssl(),
                order: transport.order(),
                disabled: false,
            });
        }
    }

    for item in &mut items {
        let Some(transport) = transports.iter().find(|t| t.name() == item.name) else {
            continue;
        };
        item.label = transport.label().to_string();
        item.protocol_type = transport.protocol_type();
        item.disable_reverse = transport.disable_reverse();
        item.disable_ssl = transport.disable_ssl();
        if transport.disable_reverse() {
            item.reverse = transport.reverse();
        }
        if transport.disable_ssl() {
            item.ssl = transport.ssl();
        }
        if item.order == 0 {
            item.order = transport.order();
        }
    }
    items
}

pub struct TransportCatalog {
    transports: Vec<Arc<dyn Transport>>,
    descriptors: RwLock<Vec<TransportDescriptor>>,
    wan_ports: RwLock<Vec<WanPortServer>>,
}

impl TransportCatalog {
    pub fn new(
        transports: Vec<Arc<dyn Transport>>,
        persisted: Vec<TransportDescriptor>,
        wan_ports: Vec<WanPortServer>,
    ) -> Self {
        let descriptors = reconcile_transports(&transports, persisted);
        info!(
            "Loaded tunnel transports: {}",
            transports.iter().map(|t| t.name()).collect::<Vec<_>>().join(",")
        );
        Self {
            transports,
            descriptors: RwLock::new(descriptors),
            wan_ports: RwLock::new(wan_ports),
        }
    }

    pub fn descriptors(&self) -> Vec<TransportDescriptor> {
        self.descriptors.read().clone()
    }

    /// Replace the descriptor list (enable/disable, reorder)
    pub fn set_descriptors(&self, descriptors: Vec<TransportDescriptor>) {
        let reconciled = reconcile_transports(&self.transports, descriptors);
        *self.descriptors.write() = reconciled;
    }

    /// Enabled transports by ascending order, each with its descriptor
    pub fn ordered_enabled(&self) -> Vec<(TransportDescriptor, Arc<dyn Transport>)> {
        let mut items: Vec<TransportDescriptor> = self
            .descriptors
            .read()
            .iter()
            .filter(|item| !item.disabled)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.order);
        items
            .into_iter()
            .filter_map(|item| {
                let transport = self.find(&item.name)?;
                Some((item, transport))
            })
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports.iter().find(|t| t.name() == name).cloned()
    }

    /// Lookup used for inbound messages, which name the protocol too
    pub fn find_typed(&self, name: &str, protocol: TunnelProtocolType) -> Option<Arc<dyn Transport>> {
        self.transports
            .iter()
            .find(|t| t.name() == name && t.protocol_type() == protocol)
            .cloned()
    }

    pub fn wan_ports(&self) -> Vec<WanPortServer> {
        self.wan_ports.read().clone()
    }

    pub fn set_wan_ports(&self, wan_ports: Vec<WanPortServer>) {
        *self.wan_ports.write() = wan_ports;
    }

    pub fn usable_wan_ports(&self) -> Vec<WanPortServer> {
        self.wan_ports
            .read()
            .iter()
            .filter(|server| server.is_usable())
            .cloned()
            .collect()
    }

    pub fn find_wan_port(&self, kind: WanPortKind, protocol: WanPortProtocolType) -> Option<WanPortServer> {
        self.wan_ports
            .read()
            .iter()
            .find(|server| server.kind == kind && server.protocol == protocol)
            .cloned()
    }
}
