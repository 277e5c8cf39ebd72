use actix_web::dev::ServiceRequest;
use actix_web::HttpMessage;
use ipnet::IpNet;
use std::net::IpAddr;

use crate::context::RequestContext;

/// Trusted-proxy aware client address resolution.
///
/// `X-Forwarded-For` is only consulted when the socket peer is a trusted
/// proxy. The header is then walked right to left, skipping further trusted
/// hops, so a client cannot spoof its address by prepending entries.
#[derive(Debug, Clone, Default)]
pub struct ClientIpResolver {
    trusted: Vec<IpNet>,
}

impl ClientIpResolver {
    /// Build from IP or CIDR strings. Invalid entries are logged and skipped.
    pub fn new<I, T>(trusted: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let trusted = trusted
            .into_iter()
            .filter_map(|entry| {
                let entry = entry.as_ref().trim();
                if entry.is_empty() {
                    return None;
                }
                let parsed = entry
                    .parse::<IpNet>()
                    .ok()
                    .or_else(|| entry.parse::<IpAddr>().ok().map(IpNet::from));
                if parsed.is_none() {
                    tracing::warn!(entry = %entry, "Ignoring invalid trusted proxy entry");
                }
                parsed
            })
            .collect();
        Self { trusted }
    }

    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.trusted.iter().any(|net| net.contains(ip))
    }

    pub fn resolve_from(&self, peer: Option<IpAddr>, forwarded_for: Option<&str>) -> Option<IpAddr> {
        let peer = peer?;
        if !self.is_trusted(&peer) {
            return Some(peer);
        }

        let Some(header) = forwarded_for else {
            return Some(peer);
        };

        let mut last = peer;
        for hop in header
            .split(',')
            .rev()
            .filter_map(|hop| hop.trim().parse::<IpAddr>().ok())
        {
            if !self.is_trusted(&hop) {
                return Some(hop);
            }
            last = hop;
        }
        Some(last)
    }

    pub fn resolve(&self, req: &ServiceRequest) -> Option<IpAddr> {
        let peer = req.peer_addr().map(|addr| addr.ip());
        let forwarded = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok());
        self.resolve_from(peer, forwarded)
    }
}

/// Rate limit principal: `user:<sub>` when authenticated, else `ip:<addr>`.
pub fn principal_for(req: &ServiceRequest, resolver: &ClientIpResolver) -> String {
    let user = req
        .extensions()
        .get::<RequestContext>()
        .and_then(|ctx| ctx.user_id().map(str::to_string));
    match user {
        Some(user_id) => format!("user:{user_id}"),
        None => match resolver.resolve(req) {
            Some(ip) => format!("ip:{ip}"),
            None => "ip:unknown".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_untrusted_peer_ignores_header() {
        let resolver = ClientIpResolver::new(["10.0.0.0/8"]);
        let resolved = resolver.resolve_from(Some(ip("203.0.113.7")), Some("1.2.3.4"));
        assert_eq!(resolved, Some(ip("203.0.113.7")));
    }

    #[test]
    fn test_trusted_peer_uses_rightmost_untrusted_hop() {
        let resolver = ClientIpResolver::new(["10.0.0.0/8", "192.168.1.10"]);
        let resolved = resolver.resolve_from(
            Some(ip("10.1.2.3")),
            Some("6.6.6.6, 198.51.100.20, 192.168.1.10"),
        );
        assert_eq!(resolved, Some(ip("198.51.100.20")));
    }

    #[test]
    fn test_trusted_peer_without_header() {
        let resolver = ClientIpResolver::new(["10.0.0.1"]);
        assert_eq!(
            resolver.resolve_from(Some(ip("10.0.0.1")), None),
            Some(ip("10.0.0.1"))
        );
    }

    #[test]
    fn test_all_hops_trusted_returns_leftmost() {
        let resolver = ClientIpResolver::new(["10.0.0.0/8"]);
        assert_eq!(
            resolver.resolve_from(Some(ip("10.0.0.1")), Some("10.0.0.5, 10.0.0.9")),
            Some(ip("10.0.0.5"))
        );
    }

    #[test]
    fn test_invalid_entries_are_skipped() {
        let resolver = ClientIpResolver::new(["not-an-ip", "", "127.0.0.1"]);
        assert!(resolver.is_trusted(&ip("127.0.0.1")));
        assert!(!resolver.is_trusted(&ip("127.0.0.2")));
    }

    #[test]
    fn test_principal_for_anonymous_request() {
        let req = TestRequest::default()
            .peer_addr("10.0.0.1:4000".parse().unwrap())
            .insert_header(("x-forwarded-for", "1.2.3.4"))
            .to_srv_request();
        assert_eq!(principal_for(&req, &ClientIpResolver::default()), "ip:10.0.0.1");
    }
}
