//! Connected-callback registry
//!
//! Consumers register interest in a transaction id (the purpose of a
//! connection, e.g. "tuntap"). Every new connection is handed to the
//! global callbacks first and then to those of its own transaction, in
//! registration order.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use meshlink_core::GLOBAL_TRANSACTION;
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::TunnelConnection;

pub type ConnectedCallback = Arc<dyn Fn(&Arc<dyn TunnelConnection>) + Send + Sync>;

/// Handle for removing a registered callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: RwLock<HashMap<String, Vec<(CallbackId, ConnectedCallback)>>>,
    next_id: AtomicU64,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, transaction_id: &str, callback: F) -> CallbackId
    where
        F: Fn(&Arc<dyn TunnelConnection>) + Send + Sync + 'static,
    {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .write()
            .entry(transaction_id.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Returns false if the callback was not registered under `transaction_id`
    pub fn unregister(&self, transaction_id: &str, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.write();
        let Some(list) = callbacks.get_mut(transaction_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            callbacks.remove(transaction_id);
        }
        removed
    }

    /// Hand `connection` to every interested callback; returns how many ran.
    ///
    /// A panicking callback is logged and does not stop the others.
    pub fn notify(&self, connection: &Arc<dyn TunnelConnection>) -> usize {
        let targets: Vec<ConnectedCallback> = {
            let callbacks = self.callbacks.read();
            let mut targets: Vec<ConnectedCallback> = callbacks
                .get(GLOBAL_TRANSACTION)
                .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default();
            if connection.transaction_id() != GLOBAL_TRANSACTION {
                if let Some(list) = callbacks.get(connection.transaction_id()) {
                    targets.extend(list.iter().map(|(_, cb)| cb.clone()));
                }
            }
            targets
        };

        debug!(
            "Connection {} to {} ({}) -> {} callbacks",
            connection.id(),
            connection.remote_machine_id(),
            connection.transaction_id(),
            targets.len()
        );

        for callback in &targets {
            if catch_unwind(AssertUnwindSafe(|| callback(connection))).is_err() {
                error!(
                    "Connected callback panicked for {} ({})",
                    connection.remote_machine_id(),
                    connection.transaction_id()
                );
            }
        }
        targets.len()
    }

    pub fn len(&self, transaction_id: &str) -> usize {
        self.callbacks
            .read()
            .get(transaction_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}
