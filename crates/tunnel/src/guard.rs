//! Single-flight guard

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Set of keys with an operation in flight
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    inflight: Arc<DashMap<String, ()>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`, or `None` if someone already holds it.
    ///
    /// The key is released when the returned guard drops, so every exit
    /// path (including a panic or a cancelled task) frees it.
    pub fn try_acquire(&self, key: impl Into<String>) -> Option<FlightGuard> {
        let key = key.into();
        match self.inflight.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(FlightGuard {
                    key,
                    inflight: self.inflight.clone(),
                })
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inflight.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

#[derive(Debug)]
pub struct FlightGuard {
    key: String,
    inflight: Arc<DashMap<String, ()>>,
}

impl FlightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.inflight.remove(&self.key);
    }
}
