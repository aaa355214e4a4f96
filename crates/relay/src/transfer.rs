//! Relay fallback

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use meshlink_core::RelayServerSettings;
use meshlink_tunnel::{CallbackRegistry, SingleFlight, TunnelConnection};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::{RelayInfo, RelayTransport};

pub struct RelayTransfer {
    settings: RwLock<RelayServerSettings>,
    transports: Vec<Arc<dyn RelayTransport>>,
    connecting: SingleFlight,
    callbacks: Arc<CallbackRegistry>,
}

impl RelayTransfer {
    /// `callbacks` should be the registry the tunnel orchestrator uses
    pub fn new(
        settings: RelayServerSettings,
        transports: Vec<Arc<dyn RelayTransport>>,
        callbacks: Arc<CallbackRegistry>,
    ) -> Self {
        info!(
            "Loaded relay transports: {}",
            transports.iter().map(|t| t.name()).collect::<Vec<_>>().join(",")
        );
        Self {
            settings: RwLock::new(settings),
            transports,
            connecting: SingleFlight::new(),
            callbacks,
        }
    }

    pub fn settings(&self) -> RelayServerSettings {
        self.settings.read().clone()
    }

    pub fn set_settings(&self, settings: RelayServerSettings) {
        *self.settings.write() = settings;
    }

    pub fn is_connecting(&self, peer: &str) -> bool {
        self.connecting.contains(peer)
    }

    /// Reach `peer` through the configured relay.
    ///
    /// Returns `None` for a duplicate call, a disabled relay, no transport
    /// of the configured type, or a failed relay.
    pub async fn connect(
        &self,
        from_machine_id: &str,
        peer: &str,
        transaction_id: &str,
        node_id: Option<&str>,
    ) -> Option<Arc<dyn TunnelConnection>> {
        let Some(_guard) = self.connecting.try_acquire(peer) else {
            debug!("Relay to {} already in progress", peer);
            return None;
        };

        let settings = self.settings();
        if settings.disabled {
            debug!("Relay server disabled, not relaying to {}", peer);
            return None;
        }
        let Some(transport) = self
            .transports
            .iter()
            .find(|t| t.relay_type() == settings.relay_type)
        else {
            warn!("No relay transport of type {:?}", settings.relay_type);
            return None;
        };

        let info = RelayInfo {
            flow_id: 0,
            from_machine_id: from_machine_id.to_string(),
            from_machine_name: String::new(),
            remote_machine_id: peer.to_string(),
            remote_machine_name: String::new(),
            secret_key: settings.secret_key,
            transaction_id: transaction_id.to_string(),
            transport_name: transport.name().to_string(),
            ssl: settings.ssl,
            node_id: node_id.map(str::to_string),
        };
        debug!("Relay to {} via {} ({})", peer, transport.name(), transaction_id);

        match AssertUnwindSafe(transport.relay(&info)).catch_unwind().await {
            Ok(Ok(Some(connection))) => {
                info!("Relay to {} via {} established", peer, transport.name());
                self.callbacks.notify(&connection);
                Some(connection)
            }
            Ok(Ok(None)) => {
                error!("Relay to {} via {} failed", peer, transport.name());
                None
            }
            Ok(Err(e)) => {
                error!("Relay to {} via {} failed: {}", peer, transport.name(), e);
                None
            }
            Err(_) => {
                error!("Relay to {} via {} panicked", peer, transport.name());
                None
            }
        }
    }

    /// A peer asked the relay to reach us.
    ///
    /// Returns false when the request was dropped (duplicate or unknown
    /// transport) or the transport failed outright. `on_connected` runs with
    /// the outcome whenever a transport took the request.
    pub async fn on_begin<F>(&self, info: &RelayInfo, on_connected: F) -> bool
    where
        F: FnOnce(Option<Arc<dyn TunnelConnection>>) + Send,
    {
        let Some(_guard) = self.connecting.try_acquire(info.from_machine_id.as_str()) else {
            debug!("Relay from {} already in progress", info.from_machine_id);
            return false;
        };
        let Some(transport) = self.transports.iter().find(|t| t.name() == info.transport_name) else {
            warn!(
                "Relay from {} names unknown transport {}",
                info.from_machine_id, info.transport_name
            );
            return false;
        };

        match AssertUnwindSafe(transport.on_begin(info)).catch_unwind().await {
            Ok(Ok(connection)) => {
                match &connection {
                    Some(connection) => {
                        info!("Relay from {} via {} established", info.from_machine_id, transport.name());
                        self.callbacks.notify(connection);
                    }
                    None => error!("Relay from {} via {} failed", info.from_machine_id, transport.name()),
                }
                on_connected(connection);
                true
            }
            Ok(Err(e)) => {
                debug!("Relay from {} error: {}", info.from_machine_id, e);
                false
            }
            Err(_) => {
                error!("Relay from {} panicked", info.from_machine_id);
                false
            }
        }
    }
}
