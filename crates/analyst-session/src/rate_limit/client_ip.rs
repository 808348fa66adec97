//! Client address resolution behind reverse proxies.

use std::net::{IpAddr, SocketAddr};

use ipnetwork::IpNetwork;

use crate::SessionResult;
use crate::error::SessionError;

/// Set of reverse proxies whose `X-Forwarded-For` is honoured.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    networks: Vec<IpNetwork>,
}

impl TrustedProxies {
    /// Parses IP addresses and CIDR blocks.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` naming the first entry that is neither.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> SessionResult<Self> {
        let mut networks = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            let network = match entry.parse::<IpAddr>() {
                Ok(ip) => IpNetwork::from(ip),
                Err(_) => entry.parse::<IpNetwork>().map_err(|e| {
                    SessionError::configuration(format!("invalid trusted proxy '{entry}': {e}"))
                })?,
            };
            networks.push(network);
        }
        Ok(Self { networks })
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|net| net.contains(ip))
    }

    /// Returns the address a request should be attributed to.
    ///
    /// `X-Forwarded-For` is only read when the immediate peer is trusted.
    /// The chain is walked from the hop nearest to us outward and the first
    /// address not in the trust set wins; entries to its left were supplied
    /// by the client and are ignored. If every hop is trusted the leftmost
    /// one is used. An unparseable hop ends the walk at the peer address.
    pub fn resolve_client_ip(&self, peer: IpAddr, forwarded_for: Option<&str>) -> IpAddr {
        if !self.contains(peer) {
            return peer;
        }
        let Some(header) = forwarded_for else {
            return peer;
        };

        let mut leftmost = None;
        for hop in header.rsplit(',').map(str::trim).filter(|h| !h.is_empty()) {
            let Some(ip) = parse_hop(hop) else {
                tracing::debug!(hop = %hop, "unparseable X-Forwarded-For entry, using peer address");
                return peer;
            };
            if !self.contains(ip) {
                return ip;
            }
            leftmost = Some(ip);
        }

        leftmost.unwrap_or(peer)
    }
}

/// Accepts `addr`, `addr:port` and `[v6]:port`.
fn parse_hop(hop: &str) -> Option<IpAddr> {
    hop.parse::<IpAddr>()
        .ok()
        .or_else(|| hop.parse::<SocketAddr>().ok().map(|s| s.ip()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn proxies() -> TrustedProxies {
        TrustedProxies::parse(&["10.0.0.0/8", "192.0.2.1"]).unwrap()
    }

    #[test]
    fn test_parse_ip_and_cidr() {
        let trusted = proxies();
        assert!(trusted.contains(ip("10.20.30.40")));
        assert!(trusted.contains(ip("192.0.2.1")));
        assert!(!trusted.contains(ip("192.0.2.2")));
        assert!(TrustedProxies::parse(&["10.0.0.0/33"]).is_err());
        assert!(TrustedProxies::parse(&["proxy.internal"]).is_err());
    }

    #[test]
    fn test_untrusted_peer_ignores_header() {
        let resolved = proxies().resolve_client_ip(ip("203.0.113.5"), Some("198.51.100.1"));
        assert_eq!(resolved, ip("203.0.113.5"));
    }

    #[test]
    fn test_no_trusted_proxies_uses_peer() {
        let resolved =
            TrustedProxies::default().resolve_client_ip(ip("10.0.0.1"), Some("198.51.100.1"));
        assert_eq!(resolved, ip("10.0.0.1"));
    }

    #[test]
    fn test_trusted_peer_without_header_uses_peer() {
        assert_eq!(proxies().resolve_client_ip(ip("10.0.0.1"), None), ip("10.0.0.1"));
    }

    #[test]
    fn test_walks_past_trusted_hops() {
        let resolved =
            proxies().resolve_client_ip(ip("10.0.0.1"), Some("198.51.100.1, 10.1.1.1, 192.0.2.1"));
        assert_eq!(resolved, ip("198.51.100.1"));
    }

    #[test]
    fn test_spoofed_prefix_is_ignored() {
        // The client sent "1.2.3.4" itself; the proxy appended the real address.
        let resolved = proxies().resolve_client_ip(ip("10.0.0.1"), Some("1.2.3.4, 198.51.100.9"));
        assert_eq!(resolved, ip("198.51.100.9"));
    }

    #[test]
    fn test_all_trusted_uses_leftmost() {
        let resolved = proxies().resolve_client_ip(ip("10.0.0.1"), Some("10.0.0.7, 10.0.0.8"));
        assert_eq!(resolved, ip("10.0.0.7"));
    }

    #[test]
    fn test_garbage_hop_falls_back_to_peer() {
        let resolved = proxies().resolve_client_ip(ip("10.0.0.1"), Some("198.51.100.1, bogus"));
        assert_eq!(resolved, ip("10.0.0.1"));
    }

    #[test]
    fn test_hop_with_port() {
        let resolved = proxies().resolve_client_ip(ip("10.0.0.1"), Some("198.51.100.1:5443"));
        assert_eq!(resolved, ip("198.51.100.1"));
        let resolved = proxies().resolve_client_ip(ip("10.0.0.1"), Some("[2001:db8::1]:443"));
        assert_eq!(resolved, ip("2001:db8::1"));
    }
}
