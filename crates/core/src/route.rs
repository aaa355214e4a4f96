//! IP to peer route table
//!
//! Peers advertise the subnets reachable through them. Lookups check host
//! entries first, then every known prefix length from most to least
//! specific. A prefix hit is cached as a host entry until the table is
//! replaced.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::MachineId;

/// One advertised network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub network: IpAddr,
    pub prefix_len: u8,
    pub peer: MachineId,
}

impl RouteEntry {
    pub fn new(network: IpAddr, prefix_len: u8, peer: impl Into<MachineId>) -> Self {
        Self {
            network,
            prefix_len,
            peer: peer.into(),
        }
    }

    /// Host route for a single address
    pub fn host(ip: IpAddr, peer: impl Into<MachineId>) -> Self {
        Self::new(ip, max_prefix(ip), peer)
    }

    fn is_valid(&self) -> bool {
        self.prefix_len <= max_prefix(self.network)
    }
}

fn max_prefix(ip: IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Zero every bit of `ip` past `prefix_len`
pub fn mask_ip(ip: IpAddr, prefix_len: u8) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let mask = match prefix_len {
                0 => 0,
                n if n >= 32 => u32::MAX,
                n => u32::MAX << (32 - n),
            };
            IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
        }
        IpAddr::V6(v6) => {
            let mask = match prefix_len {
                0 => 0,
                n if n >= 128 => u128::MAX,
                n => u128::MAX << (128 - n),
            };
            IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
        }
    }
}

/// One consistent generation of the table
#[derive(Debug, Default)]
struct Routes {
    /// Host routes and cached prefix resolutions
    hosts: HashMap<IpAddr, MachineId>,
    /// (masked network, prefix length) -> peer
    prefixes: HashMap<(IpAddr, u8), MachineId>,
    /// Prefix lengths in use, per family
    v4_lens: BTreeSet<u8>,
    v6_lens: BTreeSet<u8>,
    version: u64,
}

impl Routes {
    fn insert(&mut self, route: RouteEntry) -> bool {
        if !route.is_valid() {
            warn!(
                "Ignoring route {}/{} for {}: prefix too long",
                route.network, route.prefix_len, route.peer
            );
            return false;
        }
        if route.prefix_len == max_prefix(route.network) {
            self.hosts.insert(route.network, route.peer);
        } else {
            match route.network {
                IpAddr::V4(_) => self.v4_lens.insert(route.prefix_len),
                IpAddr::V6(_) => self.v6_lens.insert(route.prefix_len),
            };
            self.prefixes.insert(
                (mask_ip(route.network, route.prefix_len), route.prefix_len),
                route.peer,
            );
        }
        true
    }

    fn lookup_prefix(&self, ip: IpAddr) -> Option<MachineId> {
        let lens = match ip {
            IpAddr::V4(_) => &self.v4_lens,
            IpAddr::V6(_) => &self.v6_lens,
        };
        lens.iter()
            .rev()
            .find_map(|&len| self.prefixes.get(&(mask_ip(ip, len), len)).cloned())
    }
}

/// Readers always see either the old or the new generation, never a
/// half-built one; resolutions cached against a replaced generation are
/// discarded.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<Routes>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every route, dropping all cached resolutions
    pub fn set_routes(&self, routes: impl IntoIterator<Item = RouteEntry>) {
        let mut next = Routes::default();
        for route in routes {
            next.insert(route);
        }

        let mut current = self.routes.write();
        next.version = current.version + 1;
        *current = next;
    }

    /// Add a single route; host routes overwrite any cached resolution
    pub fn insert(&self, route: RouteEntry) {
        let mut routes = self.routes.write();
        if routes.insert(route) {
            routes.version += 1;
        }
    }

    /// Peer owning `ip`, if any
    pub fn resolve(&self, ip: IpAddr) -> Option<MachineId> {
        let (peer, version) = {
            let routes = self.routes.read();
            if let Some(peer) = routes.hosts.get(&ip) {
                return Some(peer.clone());
            }
            (routes.lookup_prefix(ip)?, routes.version)
        };

        let mut routes = self.routes.write();
        if routes.version == version {
            // keep an explicit host route if one raced in
            routes.hosts.entry(ip).or_insert_with(|| peer.clone());
        }
        Some(peer)
    }

    /// Drop every route and cached resolution pointing at `peer`
    pub fn remove_peer(&self, peer: &str) {
        let mut routes = self.routes.write();
        routes.hosts.retain(|_, owner| owner.as_str() != peer);
        routes.prefixes.retain(|_, owner| owner.as_str() != peer);
        routes.version += 1;
    }

    /// Bumped on every change to the configured routes
    pub fn version(&self) -> u64 {
        self.routes.read().version
    }

    pub fn is_empty(&self) -> bool {
        let routes = self.routes.read();
        routes.hosts.is_empty() && routes.prefixes.is_empty()
    }
}
