//! DNS-over-HTTPS resolver for identity-server and supplier hostnames.
//!
//! Identity URLs name their servers by hostname; the transports and the
//! identity-server client resolve those through DoH so a poisoned local
//! resolver cannot redirect identity fetches.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use hickory_resolver::{
    config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use tracing::{debug, info};

const DOH_CLOUDFLARE: &str = "1.1.1.1";
const DOH_GOOGLE: &str = "8.8.8.8";

/// Build a DoH resolver querying Cloudflare and Google upstreams, ignoring
/// the operating system's DNS configuration.
pub fn build_doh_resolver() -> TokioAsyncResolver {
    let cloudflare_addr: IpAddr = DOH_CLOUDFLARE
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)));
    let google_addr: IpAddr = DOH_GOOGLE
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));

    let cloudflare_ns = NameServerConfig {
        socket_addr: SocketAddr::new(cloudflare_addr, 443),
        protocol: Protocol::Https,
        tls_dns_name: Some("cloudflare-dns.com".to_string()),
        trust_negative_responses: false,
        tls_config: None,
        bind_addr: None,
    };

    let google_ns = NameServerConfig {
        socket_addr: SocketAddr::new(google_addr, 443),
        protocol: Protocol::Https,
        tls_dns_name: Some("dns.google".to_string()),
        trust_negative_responses: false,
        tls_config: None,
        bind_addr: None,
    };

    let mut resolver_config = ResolverConfig::new();
    resolver_config.add_name_server(cloudflare_ns);
    resolver_config.add_name_server(google_ns);

    let mut opts = ResolverOpts::default();
    opts.num_concurrent_reqs = 2;
    opts.cache_size = 256;
    opts.rotate = true;

    info!("built DoH resolver");

    TokioAsyncResolver::tokio(resolver_config, opts)
}

/// Resolve `host:port` to socket addresses, passing through anything that
/// already parses as an address.
pub async fn resolve_host(
    resolver: &TokioAsyncResolver,
    host: &str,
    port: u16,
) -> Vec<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return vec![SocketAddr::new(ip, port)];
    }
    match resolver.lookup_ip(host).await {
        Ok(lookup) => lookup
            .iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect(),
        Err(e) => {
            debug!(host = %host, error = %e, "dns lookup failed");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolver_construction_does_not_panic() {
        let _resolver = build_doh_resolver();
    }

    #[tokio::test]
    async fn literal_addresses_skip_dns() {
        let resolver = build_doh_resolver();
        let addrs = resolve_host(&resolver, "10.1.2.3", 7771).await;
        assert_eq!(addrs, vec!["10.1.2.3:7771".parse().unwrap()]);
    }
}
