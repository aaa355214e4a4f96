//! Candidate endpoints for hole punching

use std::net::{IpAddr, SocketAddr};

use meshlink_core::WanEndpointInfo;

/// Addresses worth trying on `remote`, best guesses first.
///
/// Same public address on both sides means we share a LAN (or a public
/// IP), so the peer's private IPv4 addresses go first. The public address
/// follows at the mapped port, the mapped port + 1 for sequential
/// symmetric NATs, and the bound port for peers without NAT. IPv6 comes
/// last and only when we have IPv6 ourselves. Anything that would loop
/// back to our own bound socket is dropped.
pub fn candidate_endpoints(local: &WanEndpointInfo, remote: &WanEndpointInfo) -> Vec<SocketAddr> {
    let bound_port = remote.local.port();
    let mapped_port = remote.remote.port();
    let ports = [Some(bound_port), Some(mapped_port), mapped_port.checked_add(1)];

    let mut candidates = Vec::new();
    let push_all = |ip: IpAddr, candidates: &mut Vec<SocketAddr>| {
        for port in ports.iter().flatten() {
            candidates.push(SocketAddr::new(ip, *port));
        }
    };

    if local.remote.ip() == remote.remote.ip() {
        for ip in remote.local_ips.iter().filter(|ip| ip.is_ipv4()) {
            push_all(*ip, &mut candidates);
        }
    }

    let public = remote.remote.ip();
    candidates.push(SocketAddr::new(public, mapped_port));
    if let Some(next) = mapped_port.checked_add(1) {
        candidates.push(SocketAddr::new(public, next));
    }
    candidates.push(SocketAddr::new(public, bound_port));

    for ip in remote.local_ips.iter().filter(|ip| ip.is_ipv6()) {
        push_all(*ip, &mut candidates);
    }

    let has_v6 = local.has_ipv6();
    let own_port = local.local.port();
    candidates.retain(|ep| {
        if ep.is_ipv6() && !has_v6 {
            return false;
        }
        if ep.port() != own_port {
            return true;
        }
        let ip = ep.ip();
        !(ip.is_loopback() || ip == local.remote.ip() || local.local_ips.contains(&ip))
    });
    candidates
}
