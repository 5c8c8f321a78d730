use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use url::{Host, Url};

use crate::error::EgressError;

type Result<T> = std::result::Result<T, EgressError>;

// ===========================================================================
// Reserved address tables
// ===========================================================================

/// IPv4 ranges no request may reach: (network, prefix length, label).
const BLOCKED_V4: &[([u8; 4], u8, &str)] = &[
    ([0, 0, 0, 0], 8, "this-network"),
    ([10, 0, 0, 0], 8, "private"),
    ([127, 0, 0, 0], 8, "loopback"),
    ([169, 254, 0, 0], 16, "link-local/metadata"),
    ([172, 16, 0, 0], 12, "private"),
    ([192, 168, 0, 0], 16, "private"),
    ([224, 0, 0, 0], 4, "multicast"),
    ([240, 0, 0, 0], 4, "reserved"),
];

/// IPv6 ranges no request may reach.
const BLOCKED_V6: &[(u128, u8, &str)] = &[
    (0x0000_0000_0000_0000_0000_0000_0000_0001, 128, "loopback"),
    (0x0000_0000_0000_0000_0000_0000_0000_0000, 128, "unspecified"),
    (0xfc00_0000_0000_0000_0000_0000_0000_0000, 7, "unique-local"),
    (0xfe80_0000_0000_0000_0000_0000_0000_0000, 10, "link-local"),
];

/// Names refused before any DNS lookup.
const BLOCKED_HOSTNAMES: &[&str] = &[
    "localhost",
    "metadata",
    "metadata.google.internal",
    "metadata.goog",
    "metadata.azure.internal",
    "instance-data",
    "instance-data.ec2.internal",
];

/// Which label of the reserved table an address falls in, if any.
pub fn blocked_range(addr: IpAddr) -> Option<&'static str> {
    match addr {
        IpAddr::V4(v4) => blocked_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return blocked_v4(mapped);
            }
            blocked_v6(v6)
        }
    }
}

pub fn is_blocked_ip(addr: IpAddr) -> bool {
    blocked_range(addr).is_some()
}

fn blocked_v4(addr: Ipv4Addr) -> Option<&'static str> {
    let bits = u32::from(addr);
    BLOCKED_V4.iter().find_map(|(net, prefix, label)| {
        let mask = u32::MAX << (32 - u32::from(*prefix));
        (bits & mask == u32::from_be_bytes(*net) & mask).then_some(*label)
    })
}

fn blocked_v6(addr: Ipv6Addr) -> Option<&'static str> {
    let bits = u128::from(addr);
    BLOCKED_V6.iter().find_map(|(net, prefix, label)| {
        let mask = if *prefix == 128 {
            u128::MAX
        } else {
            !(u128::MAX >> u32::from(*prefix))
        };
        (bits & mask == net & mask).then_some(*label)
    })
}

// ===========================================================================
// DNS
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

/// DNS lookups used by the guard.  Swappable so tests can pin answers.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup(&self, host: &str, family: AddressFamily) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the system's `getaddrinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup(&self, host: &str, family: AddressFamily) -> std::io::Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await?
            .map(|sa| sa.ip())
            .filter(|ip| match family {
                AddressFamily::V4 => ip.is_ipv4(),
                AddressFamily::V6 => ip.is_ipv6(),
            })
            .collect();
        if addrs.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no {family:?} records for {host}"),
            ));
        }
        Ok(addrs)
    }
}

// ===========================================================================
// EgressGuard
// ===========================================================================

/// A URL that passed every check.  `resolved_address` is informational
/// only; the connection performs its own lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUrl {
    pub url: Url,
    pub resolved_address: Option<IpAddr>,
}

/// SSRF guard: classifies a URL's scheme, hostname and every resolved
/// address against the reserved tables.  Holds no mutable state.
#[derive(Clone)]
pub struct EgressGuard {
    blocked_exact: HashSet<String>,
    blocked_suffixes: Vec<String>,
    resolver: Arc<dyn Resolver>,
}

impl std::fmt::Debug for EgressGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgressGuard")
            .field("blocked_exact", &self.blocked_exact)
            .field("blocked_suffixes", &self.blocked_suffixes)
            .finish_non_exhaustive()
    }
}

impl Default for EgressGuard {
    fn default() -> Self {
        Self::new(Arc::new(SystemResolver), &[])
    }
}

impl EgressGuard {
    /// Build a guard with the built-in tables plus `extra_blocked`.
    /// Entries of the form `*.example` block every subdomain.
    pub fn new(resolver: Arc<dyn Resolver>, extra_blocked: &[String]) -> Self {
        let mut blocked_exact: HashSet<String> =
            BLOCKED_HOSTNAMES.iter().map(|h| h.to_string()).collect();
        let mut blocked_suffixes = vec![".localhost".to_string()];

        for entry in extra_blocked {
            let entry = entry.trim().trim_end_matches('.').to_ascii_lowercase();
            if let Some(domain) = entry.strip_prefix("*.") {
                blocked_suffixes.push(format!(".{domain}"));
            } else if !entry.is_empty() {
                blocked_exact.insert(entry);
            }
        }

        Self {
            blocked_exact,
            blocked_suffixes,
            resolver,
        }
    }

    /// Parse and validate a URL string.
    pub async fn validate(&self, raw: &str) -> Result<ValidatedUrl> {
        let url = Url::parse(raw.trim()).map_err(|e| {
            warn!(url = %raw, error = %e, "invalid URL rejected");
            EgressError::InvalidUrl(e.to_string())
        })?;
        self.validate_url(url).await
    }

    /// Validate an already-parsed URL (used for each redirect hop).
    pub async fn validate_url(&self, url: Url) -> Result<ValidatedUrl> {
        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                warn!(url = %url, scheme, "blocked protocol");
                return Err(EgressError::BlockedProtocol(scheme.to_string()));
            }
        }

        let host = match url.host() {
            Some(Host::Ipv4(v4)) => {
                return self.check_literal(&url, IpAddr::V4(v4));
            }
            Some(Host::Ipv6(v6)) => {
                return self.check_literal(&url, IpAddr::V6(v6));
            }
            Some(Host::Domain(d)) => d.trim_end_matches('.').to_ascii_lowercase(),
            None => return Err(EgressError::InvalidUrl(format!("URL has no host: {url}"))),
        };

        if self.is_blocked_hostname(&host) {
            warn!(url = %url, host = %host, "blocked hostname");
            return Err(EgressError::BlockedHostname(host));
        }

        let addrs = self.resolve(&host).await?;
        for addr in &addrs {
            if let Some(range) = blocked_range(*addr) {
                warn!(url = %url, host = %host, %addr, range, "hostname resolves to blocked address");
                return Err(EgressError::BlockedAddress {
                    host,
                    addr: *addr,
                    range,
                });
            }
        }

        debug!(host = %host, addrs = addrs.len(), "egress allowed");
        Ok(ValidatedUrl {
            url,
            resolved_address: addrs.first().copied(),
        })
    }

    pub fn is_blocked_hostname(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.blocked_exact.contains(&host)
            || self
                .blocked_suffixes
                .iter()
                .any(|suffix| host.ends_with(suffix.as_str()))
    }

    fn check_literal(&self, url: &Url, addr: IpAddr) -> Result<ValidatedUrl> {
        if let Some(range) = blocked_range(addr) {
            warn!(url = %url, %addr, range, "blocked literal address");
            return Err(EgressError::BlockedAddress {
                host: addr.to_string(),
                addr,
                range,
            });
        }
        Ok(ValidatedUrl {
            url: url.clone(),
            resolved_address: Some(addr),
        })
    }

    /// IPv4 first, IPv6 only if the IPv4 lookup fails.
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        match self.resolver.lookup(host, AddressFamily::V4).await {
            Ok(addrs) if !addrs.is_empty() => return Ok(addrs),
            Ok(_) => debug!(host, "no IPv4 records, trying IPv6"),
            Err(e) => debug!(host, error = %e, "IPv4 lookup failed, trying IPv6"),
        }
        match self.resolver.lookup(host, AddressFamily::V6).await {
            Ok(addrs) if !addrs.is_empty() => Ok(addrs),
            Ok(_) => Err(EgressError::DnsResolutionFailed(host.to_string())),
            Err(e) => {
                warn!(host, error = %e, "DNS resolution failed");
                Err(EgressError::DnsResolutionFailed(format!("{host}: {e}")))
            }
        }
    }
}

// ===========================================================================
// Test support
// ===========================================================================

/// Resolver answering from a fixed table.  Unknown names fail to resolve.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    records: std::collections::HashMap<String, Vec<IpAddr>>,
}

#[cfg(test)]
impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, host: &str, addrs: &[IpAddr]) -> Self {
        self.records.insert(host.to_ascii_lowercase(), addrs.to_vec());
        self
    }
}

#[cfg(test)]
#[async_trait]
impl Resolver for StaticResolver {
    async fn lookup(&self, host: &str, family: AddressFamily) -> std::io::Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = self
            .records
            .get(&host.to_ascii_lowercase())
            .into_iter()
            .flatten()
            .copied()
            .filter(|ip| match family {
                AddressFamily::V4 => ip.is_ipv4(),
                AddressFamily::V6 => ip.is_ipv6(),
            })
            .collect();
        if addrs.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no {family:?} records for {host}"),
            ));
        }
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn guard(resolver: StaticResolver) -> EgressGuard {
        EgressGuard::new(Arc::new(resolver), &[])
    }

    #[test]
    fn reserved_table_blocks_private_space() {
        for addr in [
            "127.0.0.1",
            "10.0.0.1",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "169.254.169.254",
            "0.0.0.1",
            "224.0.0.1",
            "240.0.0.1",
            "255.255.255.255",
            "::1",
            "fc00::1",
            "fd12:3456::1",
            "fe80::1",
            "::",
            "::ffff:127.0.0.1",
            "::ffff:169.254.169.254",
        ] {
            assert!(is_blocked_ip(ip(addr)), "{addr} should be blocked");
        }
    }

    #[test]
    fn reserved_table_allows_public_space() {
        for addr in [
            "8.8.8.8",
            "1.1.1.1",
            "172.15.0.1",
            "172.32.0.1",
            "11.0.0.1",
            "2001:4860:4860::8888",
            "::ffff:8.8.8.8",
        ] {
            assert!(!is_blocked_ip(ip(addr)), "{addr} should be allowed");
        }
    }

    #[test]
    fn range_labels() {
        assert_eq!(blocked_range(ip("169.254.169.254")), Some("link-local/metadata"));
        assert_eq!(blocked_range(ip("fe80::1")), Some("link-local"));
        assert_eq!(blocked_range(ip("9.9.9.9")), None);
    }

    #[tokio::test]
    async fn literal_addresses_classified_directly() {
        let g = guard(StaticResolver::new());
        for blocked in [
            "http://127.0.0.1/",
            "http://10.0.0.1/",
            "http://172.16.0.1/",
            "http://172.31.255.255/",
            "http://192.168.1.1/",
            "http://169.254.169.254/latest/meta-data/",
            "http://0.0.0.1/",
            "http://224.0.0.1/",
            "http://240.0.0.1/",
            "http://[::1]/",
            "http://[fc00::1]/",
            "http://[fe80::1]/",
        ] {
            let err = g.validate(blocked).await.unwrap_err();
            assert!(matches!(err, EgressError::BlockedAddress { .. }), "{blocked}: {err}");
        }
        for allowed in [
            "http://8.8.8.8/",
            "https://1.1.1.1/",
            "http://172.15.0.1/",
            "http://172.32.0.1/",
        ] {
            let ok = g.validate(allowed).await.unwrap();
            assert!(ok.resolved_address.is_some());
        }
    }

    #[tokio::test]
    async fn obfuscated_literals_are_normalized() {
        let g = guard(StaticResolver::new());
        // The URL parser folds these to 127.0.0.1.
        assert!(g.validate("http://0x7f.0.0.1/").await.is_err());
        assert!(g.validate("http://2130706433/").await.is_err());
        assert!(g.validate("http://[::ffff:7f00:1]/").await.is_err());
    }

    #[tokio::test]
    async fn scheme_and_parse_errors() {
        let g = guard(StaticResolver::new());
        assert!(matches!(g.validate("not a url").await, Err(EgressError::InvalidUrl(_))));
        assert!(matches!(g.validate("").await, Err(EgressError::InvalidUrl(_))));
        assert!(matches!(
            g.validate("file:///etc/passwd").await,
            Err(EgressError::BlockedProtocol(s)) if s == "file"
        ));
        assert!(matches!(g.validate("ftp://example.com/").await, Err(EgressError::BlockedProtocol(_))));
        assert!(matches!(g.validate("gopher://example.com/").await, Err(EgressError::BlockedProtocol(_))));
    }

    #[tokio::test]
    async fn static_hostnames_blocked_before_dns() {
        // The resolver would happily answer with a public address.
        let r = StaticResolver::new()
            .with("localhost", &[ip("8.8.8.8")])
            .with("metadata.google.internal", &[ip("8.8.8.8")]);
        let g = guard(r);
        for url in [
            "http://localhost/secret",
            "http://LOCALHOST:8080/",
            "http://api.localhost/",
            "http://localhost./",
            "http://metadata.google.internal/computeMetadata/v1/",
            "http://instance-data/latest/",
        ] {
            let err = g.validate(url).await.unwrap_err();
            assert!(matches!(err, EgressError::BlockedHostname(_)), "{url}: {err}");
        }
        let err = g.validate("http://localhost/secret").await.unwrap_err();
        assert!(err.to_string().contains("Blocked hostname"));
    }

    #[tokio::test]
    async fn every_resolved_address_is_checked() {
        let r = StaticResolver::new()
            .with("rebind.example", &[ip("93.184.216.34"), ip("127.0.0.1")])
            .with("safe.example", &[ip("93.184.216.34"), ip("93.184.216.35")]);
        let g = guard(r);
        let err = g.validate("http://rebind.example/").await.unwrap_err();
        assert!(matches!(err, EgressError::BlockedAddress { range: "loopback", .. }));

        let ok = g.validate("https://safe.example/page").await.unwrap();
        assert_eq!(ok.resolved_address, Some(ip("93.184.216.34")));
        assert_eq!(ok.url.as_str(), "https://safe.example/page");
    }

    #[tokio::test]
    async fn ipv6_fallback_when_ipv4_missing() {
        let r = StaticResolver::new()
            .with("v6only.example", &[ip("2001:db8::10")])
            .with("v6private.example", &[ip("fd00::1")]);
        let g = guard(r);
        let ok = g.validate("http://v6only.example/").await.unwrap();
        assert_eq!(ok.resolved_address, Some(ip("2001:db8::10")));
        assert!(g.validate("http://v6private.example/").await.is_err());
    }

    #[tokio::test]
    async fn unresolvable_host_fails_closed() {
        let g = guard(StaticResolver::new());
        assert!(matches!(
            g.validate("http://nowhere.example/").await,
            Err(EgressError::DnsResolutionFailed(_))
        ));
    }

    #[tokio::test]
    async fn configured_hostnames_extend_the_table() {
        let r = StaticResolver::new()
            .with("intranet.example", &[ip("8.8.8.8")])
            .with("wiki.corp.example", &[ip("8.8.8.8")])
            .with("corp.example.org", &[ip("8.8.8.8")]);
        let g = EgressGuard::new(
            Arc::new(r),
            &["Intranet.Example".to_string(), "*.corp.example".to_string()],
        );
        assert!(g.validate("http://intranet.example/").await.is_err());
        assert!(g.validate("http://wiki.corp.example/").await.is_err());
        assert!(g.validate("http://corp.example.org/").await.is_ok());
        // Built-ins still apply.
        assert!(g.is_blocked_hostname("localhost"));
    }
}
